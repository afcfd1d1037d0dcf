//! Internal event broadcast: tokio::broadcast channel for pipeline events.
//!
//! The notification collaborator (console, chat transport, dashboard)
//! subscribes here; the engine itself only publishes. The terminal
//! `PipelineSummary` is the one structured summary operators key off.

use serde::Serialize;
use tokio::sync::broadcast;

/// Engine-wide events for alerting, logging, and monitoring.
#[derive(Debug, Clone, Serialize)]
pub enum EtlEvent {
    /// A stage began executing.
    StageStarted {
        pipeline: String,
        stage: String,
        start_date: u32,
        end_date: u32,
    },
    /// A stage finished cleanly.
    StageCompleted {
        pipeline: String,
        stage: String,
        duration_ms: u64,
        rows_written: u64,
        request_count: u32,
    },
    /// A stage failed; `downgraded` is true when a lenient policy let the
    /// pipeline continue.
    StageFailed {
        pipeline: String,
        stage: String,
        error: String,
        downgraded: bool,
    },
    /// A stage was skipped before execution (precondition or empty range).
    StageSkipped {
        pipeline: String,
        stage: String,
        reason: String,
    },
    /// A quality assertion produced a finding.
    QualityFinding {
        check: String,
        date: u32,
        severity: String,
        detail: String,
    },
    /// Terminal summary for one pipeline invocation.
    PipelineSummary {
        pipeline: String,
        ok: bool,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
    },
}

/// Central event bus for broadcasting events to all subscribers.
pub struct EventBus {
    tx: broadcast::Sender<EtlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all subscribers. Lagging or absent subscribers
    /// never block the pipeline.
    pub fn publish(&self, event: EtlEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EtlEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
