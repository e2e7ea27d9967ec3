// Copyright 2026 Lead Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Batch event bus.
//!
//! The orchestrator reports job lifecycle and running totals as
//! [`BatchEvent`] values on a `tokio::sync::broadcast` channel. The CLI
//! subscribes to draw progress; with no subscriber events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BatchEvent {
    /// The batch is about to run `pending` of `total` jobs.
    BatchStarted {
        total: usize,
        pending: usize,
        concurrency: usize,
    },
    /// A job was skipped because the ledger marks it done.
    JobSkipped { job: String },
    JobStarted { job: String, timestamp: String },
    JobCompleted {
        job: String,
        leads: u64,
        with_email: u64,
        with_phone: u64,
        anomalies: u64,
        elapsed_ms: u64,
    },
    JobFailed {
        job: String,
        error: String,
        timed_out: bool,
        elapsed_ms: u64,
    },
    /// Running totals after a job finished.
    Totals {
        finished: usize,
        total: usize,
        leads: u64,
        with_email: u64,
        with_phone: u64,
    },
}

impl BatchEvent {
    /// Job identifier, for job-scoped events.
    pub fn job(&self) -> Option<&str> {
        match self {
            Self::JobSkipped { job }
            | Self::JobStarted { job, .. }
            | Self::JobCompleted { job, .. }
            | Self::JobFailed { job, .. } => Some(job),
            Self::BatchStarted { .. } | Self::Totals { .. } => None,
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: BatchEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = BatchEvent::JobCompleted {
            job: "paris-bar".into(),
            leads: 462,
            with_email: 300,
            with_phone: 410,
            anomalies: 0,
            elapsed_ms: 1200,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"JobCompleted\""));
        let parsed: BatchEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.job(), Some("paris-bar"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(BatchEvent::JobSkipped { job: "x".into() });
    }

    #[test]
    fn test_subscribe_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(BatchEvent::Totals {
            finished: 1,
            total: 3,
            leads: 10,
            with_email: 2,
            with_phone: 5,
        });
        match rx.try_recv().unwrap() {
            BatchEvent::Totals { leads, .. } => assert_eq!(leads, 10),
            other => panic!("wrong event: {other:?}"),
        }
    }
}
