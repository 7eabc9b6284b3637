/// The provisioning state machine
///
/// Re-entrant by construction: every reconcile walks the full step list in
/// order and executes only the steps whose postcondition is not yet met.
/// Already-satisfied steps answer from a handful of GETs and emit no events.
pub mod steps;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::crd::ProvisioningPhase;
use crate::errors::ProvisionError;
use crate::observe::{Event, Observer};
use crate::reconcile::State;
use crate::retry::{is_transient, RetryPolicy};

/// Per-phase ceilings.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub image: Duration,
    pub infrastructure: Duration,
    pub compute: Duration,
    pub bootstrap: Duration,
    pub lb_health: Duration,
    pub cni: Duration,
    pub addon: Duration,
    pub destroy: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            image: Duration::from_secs(20 * 60),
            infrastructure: Duration::from_secs(10 * 60),
            compute: Duration::from_secs(15 * 60),
            bootstrap: Duration::from_secs(15 * 60),
            lb_health: Duration::from_secs(10 * 60),
            cni: Duration::from_secs(5 * 60),
            addon: Duration::from_secs(10 * 60),
            destroy: Duration::from_secs(15 * 60),
        }
    }
}

impl Timeouts {
    /// Ceiling for one engine phase. The addons phase is bounded per addon
    /// inside the engine; the outer ceiling covers the whole catalogue.
    pub fn for_phase(&self, phase: ProvisioningPhase) -> Duration {
        match phase {
            ProvisioningPhase::Image => self.image,
            ProvisioningPhase::Infrastructure => self.infrastructure,
            ProvisioningPhase::Compute => self.compute,
            ProvisioningPhase::Bootstrap => self.bootstrap + self.lb_health,
            ProvisioningPhase::Cni => self.cni,
            ProvisioningPhase::Addons => self.addon * 10,
            ProvisioningPhase::Complete => Duration::from_secs(60),
        }
    }
}

/// One step of the machine. `is_complete` and `run` derive from the same
/// postcondition: `run` makes it true, `is_complete` observes it.
#[async_trait]
pub trait PhaseStep: Send + Sync {
    fn phase(&self) -> ProvisioningPhase;

    /// Check the postcondition, filling `state` with whatever the check had
    /// to look up anyway.
    async fn is_complete(&self, config: &Config, state: &mut State) -> Result<bool>;

    async fn run(
        &self,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()>;
}

/// Record of one executed phase.
#[derive(Debug, Clone)]
pub struct PhaseRun {
    pub phase: ProvisioningPhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: &'static str,
}

/// What a reconcile pass achieved.
pub struct EngineReport {
    /// Furthest phase whose postcondition held when the pass ended.
    pub reached: ProvisioningPhase,
    /// Phase that failed, if any.
    pub failed: Option<ProvisioningPhase>,
    pub runs: Vec<PhaseRun>,
    pub error: Option<anyhow::Error>,
}

impl EngineReport {
    pub fn is_complete(&self) -> bool {
        self.reached == ProvisioningPhase::Complete && self.error.is_none()
    }
}

pub struct PhaseEngine {
    steps: Vec<Box<dyn PhaseStep>>,
    retry: RetryPolicy,
    timeouts: Timeouts,
}

impl PhaseEngine {
    pub fn new(steps: Vec<Box<dyn PhaseStep>>, retry: RetryPolicy, timeouts: Timeouts) -> Self {
        Self {
            steps,
            retry,
            timeouts,
        }
    }

    /// One reconcile pass. Progress is monotone: phases execute in order and
    /// the pass stops at the first failure.
    pub async fn reconcile(
        &self,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> EngineReport {
        let mut report = EngineReport {
            reached: ProvisioningPhase::Image,
            failed: None,
            runs: Vec::new(),
            error: None,
        };

        for step in &self.steps {
            let phase = step.phase();

            if cancel.is_cancelled() {
                report.error = Some(ProvisionError::Cancelled.into());
                report.failed = Some(phase);
                return report;
            }

            match step.is_complete(config, state).await {
                Ok(true) => {
                    report.reached = phase;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    observer.event(Event::phase_failed(phase.as_str(), &err));
                    report.failed = Some(phase);
                    report.error = Some(err);
                    return report;
                }
            }

            observer.event(Event::phase_started(phase.as_str()));
            let started_at = Utc::now();

            let result = self.run_with_retry(step.as_ref(), config, state, cancel, observer).await;
            let completed_at = Utc::now();

            match result {
                Ok(()) => {
                    observer.event(Event::phase_completed(phase.as_str()));
                    report.runs.push(PhaseRun {
                        phase,
                        started_at,
                        completed_at,
                        outcome: "Completed",
                    });
                    report.reached = phase;
                }
                Err(err) => {
                    observer.event(Event::phase_failed(phase.as_str(), &err));
                    report.runs.push(PhaseRun {
                        phase,
                        started_at,
                        completed_at,
                        outcome: "Failed",
                    });
                    report.failed = Some(phase);
                    report.error = Some(err);
                    return report;
                }
            }
        }

        report.reached = ProvisioningPhase::Complete;
        report
    }

    async fn run_with_retry(
        &self,
        step: &dyn PhaseStep,
        config: &Config,
        state: &mut State,
        cancel: &CancellationToken,
        observer: &Arc<dyn Observer>,
    ) -> Result<()> {
        let phase = step.phase();
        let ceiling = self.timeouts.for_phase(phase);

        let attempts = async {
            let mut attempt = 1u32;
            loop {
                match step.run(config, state, cancel, observer).await {
                    Ok(()) => return Ok(()),
                    Err(err) if is_transient(&err) && attempt < self.retry.max_retries => {
                        warn!(
                            "{} phase attempt {}/{} failed, retrying in {}s: {:#}",
                            phase,
                            attempt,
                            self.retry.max_retries,
                            self.retry.delay.as_secs(),
                            err
                        );
                        attempt += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled.into()),
                            _ = tokio::time::sleep(self.retry.delay) => {}
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        match tokio::time::timeout(ceiling, attempts).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::PhaseTimeout {
                phase: phase.to_string(),
                timeout: ceiling,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::observe::{EventType, RecordingObserver};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Step driven by counters; completion flips after `run` succeeds.
    struct ScriptedStep {
        phase: ProvisioningPhase,
        complete: std::sync::atomic::AtomicBool,
        failures_left: AtomicU32,
        failure_message: &'static str,
        order_log: Arc<Mutex<Vec<ProvisioningPhase>>>,
    }

    impl ScriptedStep {
        fn new(
            phase: ProvisioningPhase,
            order_log: Arc<Mutex<Vec<ProvisioningPhase>>>,
        ) -> Box<Self> {
            Box::new(Self {
                phase,
                complete: false.into(),
                failures_left: AtomicU32::new(0),
                failure_message: "",
                order_log,
            })
        }

        fn failing(
            phase: ProvisioningPhase,
            failures: u32,
            message: &'static str,
            order_log: Arc<Mutex<Vec<ProvisioningPhase>>>,
        ) -> Box<Self> {
            Box::new(Self {
                phase,
                complete: false.into(),
                failures_left: AtomicU32::new(failures),
                failure_message: message,
                order_log,
            })
        }
    }

    #[async_trait]
    impl PhaseStep for ScriptedStep {
        fn phase(&self) -> ProvisioningPhase {
            self.phase
        }

        async fn is_complete(&self, _config: &Config, _state: &mut State) -> Result<bool> {
            Ok(self.complete.load(Ordering::SeqCst))
        }

        async fn run(
            &self,
            _config: &Config,
            _state: &mut State,
            _cancel: &CancellationToken,
            _observer: &Arc<dyn Observer>,
        ) -> Result<()> {
            self.order_log.lock().unwrap().push(self.phase);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("{}", self.failure_message);
            }
            self.complete.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(steps: Vec<Box<dyn PhaseStep>>) -> PhaseEngine {
        PhaseEngine::new(
            steps,
            RetryPolicy::new(3, Duration::from_millis(1)),
            Timeouts::default(),
        )
    }

    fn phases() -> [ProvisioningPhase; 3] {
        [
            ProvisioningPhase::Image,
            ProvisioningPhase::Infrastructure,
            ProvisioningPhase::Compute,
        ]
    }

    #[tokio::test]
    async fn test_phases_execute_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn PhaseStep>> = phases()
            .into_iter()
            .map(|p| ScriptedStep::new(p, order.clone()) as Box<dyn PhaseStep>)
            .collect();
        let engine = engine(steps);
        let recorder = RecordingObserver::new();
        let observer: Arc<dyn Observer> = recorder.clone();
        let mut state = State::default();
        let cancel = CancellationToken::new();

        let report = engine
            .reconcile(&test_config("test"), &mut state, &cancel, &observer)
            .await;

        assert!(report.is_complete());
        assert_eq!(order.lock().unwrap().clone(), phases().to_vec());
        // Started/Completed pairs for each executed phase.
        let types = recorder.types();
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == EventType::PhaseCompleted)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_reentry_noops_completed_phases() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn PhaseStep>> = phases()
            .into_iter()
            .map(|p| ScriptedStep::new(p, order.clone()) as Box<dyn PhaseStep>)
            .collect();
        let engine = engine(steps);
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let mut state = State::default();
        let cancel = CancellationToken::new();
        let config = test_config("test");

        engine.reconcile(&config, &mut state, &cancel, &observer).await;
        let first_pass = order.lock().unwrap().len();

        let recorder = RecordingObserver::new();
        let observer: Arc<dyn Observer> = recorder.clone();
        let report = engine.reconcile(&config, &mut state, &cancel, &observer).await;

        assert!(report.is_complete());
        assert_eq!(order.lock().unwrap().len(), first_pass);
        // Idempotent re-entry emits no phase events at all.
        assert!(recorder.types().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn PhaseStep>> = vec![ScriptedStep::failing(
            ProvisioningPhase::Image,
            2,
            "connection refused",
            order.clone(),
        )];
        let engine = engine(steps);
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let mut state = State::default();
        let cancel = CancellationToken::new();

        let report = engine
            .reconcile(&test_config("test"), &mut state, &cancel, &observer)
            .await;

        assert!(report.is_complete());
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_the_pass() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn PhaseStep>> = vec![
            ScriptedStep::new(ProvisioningPhase::Image, order.clone()),
            ScriptedStep::failing(
                ProvisioningPhase::Infrastructure,
                10,
                "name conflict",
                order.clone(),
            ),
            ScriptedStep::new(ProvisioningPhase::Compute, order.clone()),
        ];
        let engine = engine(steps);
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let mut state = State::default();
        let cancel = CancellationToken::new();

        let report = engine
            .reconcile(&test_config("test"), &mut state, &cancel, &observer)
            .await;

        assert_eq!(report.failed, Some(ProvisioningPhase::Infrastructure));
        assert!(report.error.is_some());
        // Compute never ran.
        assert_eq!(
            order.lock().unwrap().clone(),
            vec![ProvisioningPhase::Image, ProvisioningPhase::Infrastructure]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_running() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn PhaseStep>> =
            vec![ScriptedStep::new(ProvisioningPhase::Image, order.clone())];
        let engine = engine(steps);
        let observer: Arc<dyn Observer> = RecordingObserver::new();
        let mut state = State::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine
            .reconcile(&test_config("test"), &mut state, &cancel, &observer)
            .await;

        assert!(crate::errors::is_cancelled(report.error.as_ref().unwrap()));
        assert!(order.lock().unwrap().is_empty());
    }
}
