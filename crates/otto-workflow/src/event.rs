// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in a workflow instance's append-only event history.
///
/// Everything a workflow decides passes through here: a persistent sink can
/// feed recorded results back to reconstruct state, and the in-memory sink
/// gives tests a full audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventRecord {
    WorkflowStarted {
        workflow_type: String,
        input: Value,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: Value,
    },
    ActivityCompleted {
        event_id: u64,
        name: String,
        result: Value,
    },
    ActivityFailed {
        event_id: u64,
        name: String,
        kind: String,
        message: String,
    },
    TimerFired {
        event_id: u64,
        millis: u64,
    },
    SideEffect {
        event_id: u64,
        value: Value,
    },
    UpdateAccepted {
        name: String,
        input: Value,
    },
    SignalReceived {
        name: String,
        input: Value,
    },
    ChildWorkflowStarted {
        workflow_id: String,
        workflow_type: String,
    },
    ContinuedAsNew {
        snapshot: Value,
    },
    WorkflowCompleted {
        result: Value,
    },
    WorkflowFailed {
        message: String,
    },
}

/// Destination for event records.  Implementations must be cheap: the
/// workflow thread calls this synchronously.
pub trait HistorySink: Send + Sync {
    fn append(&self, workflow_id: &str, run_id: &str, event: &EventRecord);
}

/// Default sink: keeps each workflow's events in memory, keyed by
/// workflow id.  Continue-as-new runs share the same key.
#[derive(Default)]
pub struct InMemoryHistory {
    runs: Mutex<HashMap<String, Vec<EventRecord>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded for `workflow_id`, across every run.
    pub fn events(&self, workflow_id: &str) -> Vec<EventRecord> {
        self.runs
            .lock()
            .map(|runs| runs.get(workflow_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl HistorySink for InMemoryHistory {
    fn append(&self, workflow_id: &str, _run_id: &str, event: &EventRecord) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.entry(workflow_id.to_string())
                .or_default()
                .push(event.clone());
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn in_memory_sink_accumulates_per_workflow() {
        let sink = InMemoryHistory::new();
        sink.append(
            "wf-1",
            "wf-1#1",
            &EventRecord::WorkflowStarted {
                workflow_type: "t".into(),
                input: json!(null),
            },
        );
        sink.append(
            "wf-1",
            "wf-1#1",
            &EventRecord::TimerFired {
                event_id: 1,
                millis: 5,
            },
        );
        sink.append(
            "wf-2",
            "wf-2#1",
            &EventRecord::WorkflowCompleted { result: json!(1) },
        );
        assert_eq!(sink.events("wf-1").len(), 2);
        assert_eq!(sink.events("wf-2").len(), 1);
        assert!(sink.events("wf-3").is_empty());
    }

    #[test]
    fn event_records_serialize_with_type_tag() {
        let e = EventRecord::SideEffect {
            event_id: 7,
            value: json!(42),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "side_effect");
        assert_eq!(v["event_id"], 7);
    }
}
