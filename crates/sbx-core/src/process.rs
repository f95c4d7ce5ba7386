use crate::TelemetryEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TERMINATION_EVENTS: &[&str] = &["PROCESS_TERMINATE", "PROCESS_EXIT", "PROCESS_END"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSummary {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub behaviors: Vec<String>,
}

/// Collapses a telemetry stream into one summary per process, in the order
/// each pid first appears.
pub fn derive_processes(events: &[TelemetryEvent]) -> Vec<ProcessSummary> {
    let mut summaries: Vec<ProcessSummary> = Vec::new();
    let mut slots: HashMap<u32, usize> = HashMap::new();

    for event in events {
        let slot = *slots.entry(event.process_id).or_insert_with(|| {
            summaries.push(ProcessSummary {
                pid: event.process_id,
                parent_pid: event.parent_process_id,
                name: event.process_name.clone(),
                status: "running".to_string(),
                behaviors: Vec::new(),
            });
            summaries.len() - 1
        });
        let summary = &mut summaries[slot];

        if summary.name.is_empty() && !event.process_name.is_empty() {
            summary.name = event.process_name.clone();
        }
        if summary.parent_pid == 0 && event.parent_process_id != 0 {
            summary.parent_pid = event.parent_process_id;
        }
        if is_termination(&event.event_type) {
            summary.status = "terminated".to_string();
        }
        if !summary.behaviors.iter().any(|b| b == &event.event_type) {
            summary.behaviors.push(event.event_type.clone());
        }
    }

    summaries
}

fn is_termination(event_type: &str) -> bool {
    TERMINATION_EVENTS
        .iter()
        .any(|kind| kind.eq_ignore_ascii_case(event_type))
}
