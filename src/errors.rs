/// Typed failure kinds surfaced by the provisioning engine
use std::time::Duration;

/// Errors that must keep their identity across the engine so that phases,
/// conditions and exit codes can react to them. Everything else travels as
/// plain `anyhow` context chains.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The spec was rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A resource with our canonical name exists but carries foreign labels.
    /// Never auto-resolved; requires manual intervention.
    #[error("{kind} '{name}' exists but is not owned by cluster '{cluster}'")]
    OwnershipConflict {
        kind: &'static str,
        name: String,
        cluster: String,
    },

    /// The one-shot Talos bootstrap disagrees with our recorded state.
    #[error("bootstrap conflict on {node}: {reason}")]
    BootstrapConflict { node: String, reason: String },

    /// The rescue-boot snapshot build exceeded its ceiling.
    #[error("snapshot build timed out after {0:?}")]
    SnapshotBuildTimeout(Duration),

    /// A phase exceeded its configured ceiling.
    #[error("phase {phase} timed out after {timeout:?}")]
    PhaseTimeout { phase: String, timeout: Duration },

    /// The enclosing cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Condition / status reason for this error kind.
    pub fn reason(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "ValidationError",
            ProvisionError::OwnershipConflict { .. } => "OwnershipConflict",
            ProvisionError::BootstrapConflict { .. } => "BootstrapConflict",
            ProvisionError::SnapshotBuildTimeout(_) => "SnapshotBuildTimeout",
            ProvisionError::PhaseTimeout { .. } => "PhaseTimeout",
            ProvisionError::Cancelled => "Cancelled",
        }
    }
}

/// Status reason for an arbitrary error chain: the typed reason when one of
/// ours is inside, otherwise a generic reconcile failure.
pub fn reason_for(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<ProvisionError>()
        .map(ProvisionError::reason)
        .unwrap_or("ReconcileError")
}

/// True when the chain carries a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::Cancelled)
    )
}

/// True when the chain carries a validation rejection.
pub fn is_validation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::Validation(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        let err = ProvisionError::OwnershipConflict {
            kind: "network",
            name: "test-network".to_string(),
            cluster: "test".to_string(),
        };
        assert_eq!(err.reason(), "OwnershipConflict");

        let chain: anyhow::Error = anyhow::Error::new(err).context("reconcile failed");
        assert_eq!(reason_for(&chain), "OwnershipConflict");
    }

    #[test]
    fn test_generic_reason() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(reason_for(&err), "ReconcileError");
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn test_validation_detection() {
        let err: anyhow::Error = ProvisionError::Validation("bad cidr".to_string()).into();
        assert!(is_validation(&err));
    }
}
