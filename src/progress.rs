//! Indexing progress reporting.
//!
//! The orchestrator publishes [`IndexProgress`] events through a
//! [`ProgressSink`]. Emission is cooperative: sinks must never block the
//! indexing loop, so the channel-backed sink drops events when its consumer
//! falls behind (the terminal `complete`/`error` event is what callers wait
//! for; intermediate ticks are advisory).

use tokio::sync::mpsc;

use crate::models::{IndexProgress, IndexStatus};

/// Consumer of indexing progress events.
pub trait ProgressSink: Send + Sync {
    /// Publish one event. Must not block.
    fn emit(&self, event: IndexProgress);
}

/// Discards all events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: IndexProgress) {}
}

/// Logs progress transitions via `tracing`.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: IndexProgress) {
        match event.status {
            IndexStatus::Error => tracing::warn!(message = %event.message, "indexing"),
            _ => tracing::debug!(
                status = ?event.status,
                progress = event.progress,
                message = %event.message,
                "indexing"
            ),
        }
    }
}

/// Forwards events into a bounded channel with drop-on-full semantics,
/// suitable for fan-out to a WebSocket.
pub struct ChannelSink {
    sender: mpsc::Sender<IndexProgress>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<IndexProgress>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: IndexProgress) {
        // Slow consumers miss intermediate ticks; the caller owns the
        // terminal notification.
        let _ = self.sender.try_send(event);
    }
}

/// Convenience constructor for an [`IndexProgress`] event.
pub fn event(
    status: IndexStatus,
    current_file: Option<String>,
    progress: f64,
    message: impl Into<String>,
) -> IndexProgress {
    IndexProgress {
        status,
        current_file,
        progress,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = ChannelSink::new(tx);

        sink.emit(event(IndexStatus::Scanning, None, 0.0, "scan"));
        sink.emit(event(IndexStatus::Indexing, Some("a.md".into()), 0.5, "a"));
        sink.emit(event(IndexStatus::Complete, None, 1.0, "done"));

        assert_eq!(rx.recv().await.unwrap().status, IndexStatus::Scanning);
        assert_eq!(rx.recv().await.unwrap().status, IndexStatus::Indexing);
        assert_eq!(rx.recv().await.unwrap().status, IndexStatus::Complete);
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);

        sink.emit(event(IndexStatus::Scanning, None, 0.0, "first"));
        sink.emit(event(IndexStatus::Indexing, None, 0.5, "dropped"));

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert!(rx.try_recv().is_err());
    }
}
