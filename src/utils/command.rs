/// Subprocess execution for the external tool boundary (talosctl, helm, ssh)
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of a finished command.
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }

    /// Ok(stdout) on success, the stderr text as the error otherwise.
    pub fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{}", self.stderr.trim())
        }
    }
}

/// Builder for the external commands the engine shells out to.
pub struct CommandBuilder {
    command: Command,
    stdin_data: Option<Vec<u8>>,
    context_msg: Option<String>,
}

impl CommandBuilder {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut command = Command::new(program);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        Self {
            command,
            stdin_data: None,
            context_msg: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.command.env(key, val);
        self
    }

    /// Set KUBECONFIG for kubectl/helm invocations.
    pub fn kubeconfig(self, path: &Path) -> Self {
        self.env("KUBECONFIG", path)
    }

    /// Feed `data` to the child's stdin.
    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.command.stdin(Stdio::piped());
        self.stdin_data = Some(data.into());
        self
    }

    /// Context message used when spawning or waiting fails.
    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// Execute and return the raw captured output.
    pub async fn output(mut self) -> Result<CommandOutput> {
        let context_msg = self
            .context_msg
            .take()
            .unwrap_or_else(|| "command execution failed".to_string());

        let output = match self.stdin_data.take() {
            Some(data) => {
                let mut child = self.command.spawn().context(context_msg.clone())?;
                let mut stdin = child
                    .stdin
                    .take()
                    .context("child process has no stdin handle")?;
                stdin.write_all(&data).await.context(context_msg.clone())?;
                drop(stdin);
                child.wait_with_output().await.context(context_msg)?
            }
            None => self.command.output().await.context(context_msg)?,
        };

        Ok(CommandOutput::from_output(output))
    }

    /// Execute and return stdout on success, stderr as the error otherwise.
    pub async fn run(self) -> Result<String> {
        self.output().await?.into_result()
    }

    /// Execute for effect only.
    pub async fn run_silent(self) -> Result<()> {
        self.output().await?.into_result().map(|_| ())
    }
}

/// Verify an external tool is on PATH before starting any phase that needs
/// it; the error carries the install link.
pub async fn check_tool_installed(
    tool_name: &str,
    version_args: &[&str],
    install_url: &str,
) -> Result<()> {
    let output = CommandBuilder::new(tool_name).args(version_args).output().await;

    match output {
        Ok(out) if out.success => Ok(()),
        _ => anyhow::bail!(
            "{} is not installed or not in PATH. Please install from {}",
            tool_name,
            install_url
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_capture() {
        let output = CommandBuilder::new("echo")
            .arg("hello")
            .context("echo failed")
            .output()
            .await
            .unwrap();
        assert!(output.success);
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let result = CommandBuilder::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("boom"));
    }

    #[tokio::test]
    async fn test_stdin_data() {
        let output = CommandBuilder::new("cat")
            .stdin_data("piped input")
            .output()
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "piped input");
    }

    #[tokio::test]
    async fn test_env_passthrough() {
        let output = CommandBuilder::new("sh")
            .args(["-c", "echo $PROBE_VAR"])
            .env("PROBE_VAR", "probe_value")
            .output()
            .await
            .unwrap();
        assert!(output.stdout.contains("probe_value"));
    }
}
