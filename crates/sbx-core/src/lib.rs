use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub mod correlation;
pub mod process;
pub mod report;
pub mod sse;

pub use correlation::{correlate, ProcessTechniqueIndex};
pub use process::{derive_processes, ProcessSummary};
pub use report::{decode_report, ReportError};
pub use sse::{ChatStreamEvent, DecodeReport, FrameError, SseFrameDecoder};

/// Technique records keyed by tactic/category name.
pub type MitreMatrix = BTreeMap<String, Vec<Technique>>;

/// One recorded action captured inside the sandbox. The backend returns these
/// in chronological order and callers keep that order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    #[serde(default)]
    pub id: Option<i64>,
    pub event_type: String,
    #[serde(deserialize_with = "deserialize_pid")]
    pub process_id: u32,
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub parent_process_id: u32,
    #[serde(default)]
    pub process_name: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub decoded_details: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digital_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisTask {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub verdict: Option<String>,
    #[serde(default)]
    pub risk_score: Option<i64>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl AnalysisTask {
    pub fn verdict_kind(&self) -> Option<Verdict> {
        self.verdict.as_deref().and_then(|raw| raw.parse().ok())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Verdict {
    Benign,
    Suspicious,
    Malicious,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Benign => "Benign",
            Verdict::Suspicious => "Suspicious",
            Verdict::Malicious => "Malicious",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "benign" | "clean" => Ok(Verdict::Benign),
            "suspicious" => Ok(Verdict::Suspicious),
            "malicious" => Ok(Verdict::Malicious),
            other => Err(format!("Unknown verdict: {other}")),
        }
    }
}

/// Aggregated AI output for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ForensicReport {
    #[serde(default, deserialize_with = "deserialize_verdict")]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub malware_family: Option<String>,
    #[serde(default, deserialize_with = "deserialize_score")]
    pub threat_score: i64,
    #[serde(default)]
    pub executive_summary: String,
    #[serde(default)]
    pub behavioral_timeline: Vec<TimelineEvent>,
    #[serde(default, deserialize_with = "deserialize_matrix")]
    pub mitre_matrix: Option<MitreMatrix>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Technique {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_evidence")]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEvent {
    #[serde(default)]
    pub timestamp_offset: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub event_description: String,
    #[serde(default)]
    pub technical_context: String,
    #[serde(default, deserialize_with = "deserialize_pid")]
    pub related_pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Body of `POST /vms/ai/chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_context: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
            task_id: None,
            page_context: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_page_context(mut self, context: impl Into<String>) -> Self {
        self.page_context = Some(context.into());
        self
    }
}

/// Body of `POST /vms/analysis/ai-insight`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsightRequest {
    pub processes: Vec<ProcessSummary>,
    pub events: Vec<TelemetryEvent>,
    pub mode: String,
}

/// Background task progress pushed over `/ws/progress`.
///
/// `percent` is expected in `0..=100` but is not clamped here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    pub stage: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub percent: i64,
    #[serde(default)]
    pub timestamp: i64,
}

impl ProgressEvent {
    pub fn percent_in_range(&self) -> bool {
        (0..=100).contains(&self.percent)
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

/// Accepts an id sent either as a JSON string or a number.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

// Negative or unparseable pids collapse to 0.
fn deserialize_pid<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let pid = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    Ok(pid.unwrap_or(0))
}

fn deserialize_score<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let score = match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse::<i64>().ok()
        }
        _ => None,
    };
    Ok(score.unwrap_or(0))
}

fn deserialize_verdict<'de, D>(deserializer: D) -> Result<Option<Verdict>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| value.parse().ok()))
}

// A technique that fails to decode is dropped on its own so the rest of the
// report survives. A matrix that is not an object counts as absent.
fn deserialize_matrix<'de, D>(deserializer: D) -> Result<Option<MitreMatrix>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Object(categories) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };
    let mut matrix = MitreMatrix::new();
    for (category, entries) in categories {
        let Value::Array(entries) = entries else {
            warn!(event = "mitre_category_skipped", category = %category);
            continue;
        };
        let techniques = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<Technique>(entry) {
                Ok(technique) => Some(technique),
                Err(err) => {
                    warn!(event = "mitre_technique_skipped", category = %category, error = %err);
                    None
                }
            })
            .collect();
        matrix.insert(category, techniques);
    }
    Ok(Some(matrix))
}

// Evidence arrives as a list of sentences or, occasionally, one bare string.
fn deserialize_evidence<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(line) => vec![line],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(line) => Some(line),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_accepts_numbers_and_unknown_fields_survive() {
        let task: AnalysisTask = serde_json::from_str(
            r#"{
                "id": 1712,
                "filename": "invoice.exe",
                "status": "Completed",
                "verdict": "malicious",
                "risk_score": 91,
                "created_at": 1707335222000,
                "ghidra_status": "done"
            }"#,
        )
        .expect("parse task");

        assert_eq!(task.id, "1712");
        assert_eq!(task.verdict_kind(), Some(Verdict::Malicious));
        assert_eq!(task.file_hash, None);
        assert_eq!(
            task.extra.get("ghidra_status"),
            Some(&Value::String("done".to_string()))
        );
    }

    #[test]
    fn report_tolerates_string_scores_and_odd_verdicts() {
        let report: ForensicReport = serde_json::from_str(
            r#"{
                "verdict": "Suspicious",
                "threat_score": "about 75/100",
                "executive_summary": "dropper",
                "behavioral_timeline": [
                    {"stage": "Execution", "event_description": "spawned cmd", "related_pid": "4120"}
                ],
                "mitre_matrix": {
                    "execution": [{"id": "T1059", "name": "Command Interpreter", "evidence": ["PID 4120 ran cmd.exe"]}]
                }
            }"#,
        )
        .expect("parse report");

        assert_eq!(report.verdict, Some(Verdict::Suspicious));
        assert_eq!(report.threat_score, 75);
        assert_eq!(report.behavioral_timeline[0].related_pid, 4120);
        let matrix = report.mitre_matrix.expect("matrix present");
        assert_eq!(matrix["execution"][0].status, "");

        let unknown: ForensicReport =
            serde_json::from_str(r#"{"verdict": "Unclear", "mitre_matrix": null}"#)
                .expect("parse sparse report");
        assert_eq!(unknown.verdict, None);
        assert!(unknown.mitre_matrix.is_none());
    }

    #[test]
    fn telemetry_negative_parent_pid_collapses_to_zero() {
        let event: TelemetryEvent = serde_json::from_str(
            r#"{"event_type":"PROCESS_CREATE","process_id":812,"parent_process_id":-1,
                "process_name":"a.exe","details":"","timestamp":5}"#,
        )
        .expect("parse event");
        assert_eq!(event.process_id, 812);
        assert_eq!(event.parent_process_id, 0);
    }

    #[test]
    fn chat_request_omits_absent_optionals() {
        let body = serde_json::to_value(ChatRequest::new("hi")).expect("encode");
        assert_eq!(body, serde_json::json!({"message": "hi", "history": []}));

        let body = serde_json::to_value(
            ChatRequest::new("hi")
                .with_task("t-1")
                .with_history(vec![ChatMessage::user("earlier")]),
        )
        .expect("encode");
        assert_eq!(body["task_id"], "t-1");
        assert_eq!(body["history"][0]["role"], "user");
    }

    #[test]
    fn progress_percent_is_not_clamped() {
        let event: ProgressEvent = serde_json::from_str(
            r#"{"task_id": 9, "stage": "ai_analysis", "percent": 150}"#,
        )
        .expect("parse progress");
        assert_eq!(event.task_id, "9");
        assert_eq!(event.percent, 150);
        assert!(!event.percent_in_range());
        assert_eq!(event.message, "");
    }
}
