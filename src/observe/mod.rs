/// Event sink shared by the CLI and the operator
///
/// The engine reports progress through the `Observer` trait and never knows
/// which sink it is talking to: a line-oriented console, the structured log,
/// a bounded channel feeding a UI, or Kubernetes events (operator module).
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

/// Kind of a reported event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    ResourceCreated,
    ResourceFailed,
    ValidationError,
    Info,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PhaseStarted => "PhaseStarted",
            EventType::PhaseCompleted => "PhaseCompleted",
            EventType::PhaseFailed => "PhaseFailed",
            EventType::ResourceCreated => "ResourceCreated",
            EventType::ResourceFailed => "ResourceFailed",
            EventType::ValidationError => "ValidationError",
            EventType::Info => "Info",
        }
    }

    /// Failure events map to Warning-type Kubernetes events.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventType::PhaseFailed | EventType::ResourceFailed | EventType::ValidationError
        )
    }
}

/// One reported event.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub phase: Option<String>,
    pub resource: Option<String>,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            phase: None,
            resource: None,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn phase_started(phase: &str) -> Self {
        Self::new(EventType::PhaseStarted, format!("{} phase started", phase))
            .with_phase(phase)
    }

    pub fn phase_completed(phase: &str) -> Self {
        Self::new(EventType::PhaseCompleted, format!("{} phase completed", phase))
            .with_phase(phase)
    }

    pub fn phase_failed(phase: &str, err: &anyhow::Error) -> Self {
        Self::new(
            EventType::PhaseFailed,
            format!("{} phase failed: {:#}", phase, err),
        )
        .with_phase(phase)
    }

    pub fn resource_created(kind: &str, name: &str) -> Self {
        Self::new(EventType::ResourceCreated, format!("{} {} ready", kind, name))
            .with_resource(name)
    }

    pub fn resource_failed(kind: &str, name: &str, err: &anyhow::Error) -> Self {
        Self::new(
            EventType::ResourceFailed,
            format!("{} {} failed: {:#}", kind, name, err),
        )
        .with_resource(name)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventType::Info, message)
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }
}

/// The three-operation sink contract.
pub trait Observer: Send + Sync {
    fn event(&self, event: Event);

    fn progress(&self, phase: &str, current: u32, total: u32);
}

/// Derives child observers that stamp extra fields onto every event.
pub trait ObserverExt {
    fn with_fields(&self, fields: &[(&str, &str)]) -> Arc<dyn Observer>;
}

impl ObserverExt for Arc<dyn Observer> {
    fn with_fields(&self, fields: &[(&str, &str)]) -> Arc<dyn Observer> {
        Arc::new(ScopedObserver {
            inner: self.clone(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }
}

/// Child observer merging parent fields into every event it forwards.
struct ScopedObserver {
    inner: Arc<dyn Observer>,
    fields: BTreeMap<String, String>,
}

impl Observer for ScopedObserver {
    fn event(&self, mut event: Event) {
        for (key, value) in &self.fields {
            event
                .fields
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.inner.event(event);
    }

    fn progress(&self, phase: &str, current: u32, total: u32) {
        self.inner.progress(phase, current, total);
    }
}

/// Line-oriented sink for the CLI.
pub struct ConsoleObserver;

impl Observer for ConsoleObserver {
    fn event(&self, event: Event) {
        let marker = match event.event_type {
            EventType::PhaseCompleted | EventType::ResourceCreated => "✓",
            t if t.is_failure() => "✗",
            _ => "•",
        };
        println!("{} {}", marker, event.message);
    }

    fn progress(&self, phase: &str, current: u32, total: u32) {
        println!("  {} [{}/{}]", phase, current, total);
    }
}

/// Structured-log sink.
pub struct LogObserver;

impl Observer for LogObserver {
    fn event(&self, event: Event) {
        if event.event_type.is_failure() {
            warn!(
                event = event.event_type.as_str(),
                phase = event.phase.as_deref().unwrap_or(""),
                resource = event.resource.as_deref().unwrap_or(""),
                "{}",
                event.message
            );
        } else {
            info!(
                event = event.event_type.as_str(),
                phase = event.phase.as_deref().unwrap_or(""),
                resource = event.resource.as_deref().unwrap_or(""),
                "{}",
                event.message
            );
        }
    }

    fn progress(&self, phase: &str, current: u32, total: u32) {
        info!(phase, current, total, "progress");
    }
}

/// Message posted by the channel sink.
#[derive(Debug, Clone)]
pub enum UiMessage {
    Event(Event),
    Progress {
        phase: String,
        current: u32,
        total: u32,
    },
}

/// Sink posting to a bounded channel; a full channel drops messages rather
/// than blocking the engine.
pub struct ChannelObserver {
    sender: tokio::sync::mpsc::Sender<UiMessage>,
}

impl ChannelObserver {
    pub fn new(sender: tokio::sync::mpsc::Sender<UiMessage>) -> Self {
        Self { sender }
    }
}

impl Observer for ChannelObserver {
    fn event(&self, event: Event) {
        let _ = self.sender.try_send(UiMessage::Event(event));
    }

    fn progress(&self, phase: &str, current: u32, total: u32) {
        let _ = self.sender.try_send(UiMessage::Progress {
            phase: phase.to_string(),
            current,
            total,
        });
    }
}

/// Sink that records everything; test helper.
#[cfg(test)]
pub struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect()
    }
}

#[cfg(test)]
impl Observer for RecordingObserver {
    fn event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn progress(&self, _phase: &str, _current: u32, _total: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_fields_merges_into_events() {
        let recorder = RecordingObserver::new();
        let base: Arc<dyn Observer> = recorder.clone();
        let scoped = base.with_fields(&[("cluster", "test"), ("component", "network")]);

        scoped.event(Event::info("hello").with_field("component", "override"));

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fields.get("cluster").unwrap(), "test");
        // Event-local fields win over parent fields.
        assert_eq!(events[0].fields.get("component").unwrap(), "override");
    }

    #[test]
    fn test_channel_observer_drops_when_full() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let observer = ChannelObserver::new(tx);

        observer.event(Event::info("first"));
        observer.event(Event::info("second"));

        assert!(matches!(rx.try_recv(), Ok(UiMessage::Event(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failure_classification() {
        assert!(EventType::PhaseFailed.is_failure());
        assert!(EventType::ValidationError.is_failure());
        assert!(!EventType::PhaseCompleted.is_failure());
    }
}
