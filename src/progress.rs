// Progress channel
//
// Best-effort telemetry from the pipelines to whoever is watching (CLI progress bar,
// a websocket bridge, tests). Publishing never blocks and never fails the emitter.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Which pipeline an event (or guard slot) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Init,
    Download,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Init, JobKind::Download];

    /// Fixed outbound topic for this kind of event.
    pub fn topic(self) -> &'static str {
        match self {
            JobKind::Init => "/topic/progress-init",
            JobKind::Download => "/topic/progress-download",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            JobKind::Init => "initial setup",
            JobKind::Download => "app download",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: JobKind,
    pub percent: f64,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(kind: JobKind, percent: f64, message: impl Into<String>) -> Self {
        Self {
            kind,
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.percent >= 100.0
    }
}

/// Publish-only side of the progress channel.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Fan-out bus: every subscriber sees every event published after it subscribed.
///
/// Late subscribers get no replay. A slow subscriber lags (and loses events) instead of
/// holding up the pipeline.
#[derive(Clone, Debug)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressSink for ProgressBus {
    fn publish(&self, event: ProgressEvent) {
        log::debug!(
            "[PHASE: progress] [STEP: publish] topic={} percent={:.1} message={}",
            event.kind.topic(),
            event.percent,
            event.message
        );
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Binds a sink to one job kind so emitters only pass percent + message.
#[derive(Clone, Copy)]
pub struct Reporter<'a> {
    kind: JobKind,
    sink: &'a dyn ProgressSink,
}

impl<'a> Reporter<'a> {
    pub fn new(kind: JobKind, sink: &'a dyn ProgressSink) -> Self {
        Self { kind, sink }
    }

    pub fn report(&self, percent: f64, message: impl Into<String>) {
        self.sink
            .publish(ProgressEvent::new(self.kind, percent, message));
    }
}
