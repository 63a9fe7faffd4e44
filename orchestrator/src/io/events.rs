//! Event channel: the wire-shaped events the core publishes to its host.
//!
//! Serialized names and payload keys are the external contract; the serde
//! renames below are normative, not cosmetic.

use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};

use crate::autobuild::StopReason;
use crate::core::plan::Plan;

/// Where a `run:output` line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
    System,
}

/// Autobuild phase reported by `autobuild:status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutobuildPhase {
    Planning,
    Running,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Event {
    #[serde(rename = "run:output")]
    RunOutput {
        #[serde(rename = "runId")]
        run_id: String,
        source: OutputSource,
        text: String,
    },
    #[serde(rename = "run:step")]
    RunStep {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "stepIndex")]
        step_index: usize,
        total: usize,
    },
    #[serde(rename = "run:decision")]
    RunDecision {
        #[serde(rename = "runId")]
        run_id: String,
        files: Vec<String>,
    },
    #[serde(rename = "run:cancelled")]
    RunCancelled {
        #[serde(rename = "runId")]
        run_id: String,
    },
    #[serde(rename = "run:done")]
    RunDone {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    #[serde(rename = "autobuild:status")]
    AutobuildStatus {
        iteration: u32,
        phase: AutobuildPhase,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    #[serde(rename = "autobuild:plan")]
    AutobuildPlan {
        iteration: u32,
        plan: Plan,
        plan_name: String,
    },
    #[serde(rename = "autobuild:done")]
    AutobuildDone {
        stop_reason: StopReason,
        iterations_run: u32,
    },
}

/// Consumer of core events. Implementations must be cheap and non-blocking;
/// emission happens on the run thread.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Sink forwarding events over an mpsc channel. A disconnected receiver is
/// tolerated; the run keeps going without an audience.
pub struct ChannelSink {
    sender: Sender<Event>,
}

impl ChannelSink {
    pub fn new(sender: Sender<Event>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_output_uses_wire_names() {
        let event = Event::RunOutput {
            run_id: "run-1".to_string(),
            source: OutputSource::Stdout,
            text: "hello\n".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "run:output");
        assert_eq!(json["payload"]["runId"], "run-1");
        assert_eq!(json["payload"]["source"], "stdout");
    }

    #[test]
    fn run_step_and_done_use_camel_case_payloads() {
        let step = serde_json::to_value(Event::RunStep {
            run_id: "r".to_string(),
            step_index: 2,
            total: 3,
        })
        .expect("serialize");
        assert_eq!(step["payload"]["stepIndex"], 2);

        let done = serde_json::to_value(Event::RunDone {
            run_id: "r".to_string(),
            exit_code: -1,
        })
        .expect("serialize");
        assert_eq!(done["event"], "run:done");
        assert_eq!(done["payload"]["exitCode"], -1);
    }

    #[test]
    fn autobuild_events_round_trip() {
        let event = Event::AutobuildStatus {
            iteration: 1,
            phase: AutobuildPhase::Planning,
            message: "Generating plan".to_string(),
            run_id: None,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("autobuild:status"));
        assert!(json.contains("planning"));
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sink = ChannelSink::new(tx);
        drop(rx);
        sink.emit(Event::RunCancelled {
            run_id: "r".to_string(),
        });
    }
}
