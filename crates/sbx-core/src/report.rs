use crate::ForensicReport;
use serde_json::Value;
use thiserror::Error;

/// How many layers of string-wrapped JSON are peeled before giving up.
pub const MAX_UNWRAP_DEPTH: usize = 3;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("report is not a JSON object (found {0})")]
    NotAnObject(&'static str),
}

/// Parses a report body, unwrapping it when the backend stored the JSON as a
/// JSON string (sometimes more than once).
pub fn decode_report(body: &str) -> Result<ForensicReport, ReportError> {
    let value: Value = serde_json::from_str(body)?;
    decode_report_value(value)
}

pub fn decode_report_value(mut value: Value) -> Result<ForensicReport, ReportError> {
    for _ in 0..MAX_UNWRAP_DEPTH {
        match value {
            Value::String(inner) => value = serde_json::from_str(inner.trim())?,
            _ => break,
        }
    }
    if !value.is_object() {
        return Err(ReportError::NotAnObject(kind_name(&value)));
    }
    Ok(serde_json::from_value(value)?)
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{correlate, Verdict};

    const REPORT: &str = r#"{"verdict":"Malicious","threat_score":88,"mitre_matrix":{"execution":[{"id":"T1059","name":"Shell","evidence":["PID 5"]}]}}"#;

    #[test]
    fn plain_object_decodes() {
        let report = decode_report(REPORT).expect("decode");
        assert_eq!(report.verdict, Some(Verdict::Malicious));
        assert_eq!(report.threat_score, 88);
    }

    #[test]
    fn double_and_triple_encoded_bodies_are_unwrapped() {
        let once = serde_json::to_string(REPORT).expect("wrap once");
        let twice = serde_json::to_string(&once).expect("wrap twice");

        for body in [once, twice] {
            let report = decode_report(&body).expect("decode wrapped");
            assert_eq!(report.threat_score, 88);
            assert!(report.mitre_matrix.is_some());
        }
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(matches!(
            decode_report("[1,2,3]"),
            Err(ReportError::NotAnObject("array"))
        ));
        assert!(matches!(
            decode_report("\"plain words\""),
            Err(ReportError::Json(_))
        ));
        let four_deep = (0..4).fold(REPORT.to_string(), |acc, _| {
            serde_json::to_string(&acc).expect("wrap")
        });
        assert!(matches!(
            decode_report(&four_deep),
            Err(ReportError::NotAnObject("string"))
        ));
    }

    #[test]
    fn one_broken_technique_does_not_sink_the_report() {
        let body = r#"{
            "verdict": "Malicious",
            "threat_score": 70,
            "mitre_matrix": {
                "execution": [
                    {"id": "T1059", "evidence": ["PID 42 ran powershell"]},
                    {"name": "no id here", "evidence": ["PID 9 did something"]},
                    null
                ],
                "persistence": [
                    {"id": "T1547", "evidence": "PID 7 wrote Run key"},
                    {"id": "T1053", "evidence": ["PID 8 scheduled", 12, null]}
                ],
                "notes": "free text instead of a list"
            }
        }"#;

        let report = decode_report(body).expect("report survives");
        assert_eq!(report.verdict, Some(Verdict::Malicious));
        assert_eq!(report.threat_score, 70);

        let index = correlate(report.mitre_matrix.as_ref());
        assert!(index.contains(42, "T1059"));
        assert!(index.contains(7, "T1547"));
        assert!(index.contains(8, "T1053"));
        assert_eq!(index.techniques_for(9).count(), 0);
        assert_eq!(index.len(), 3);

        let matrix = report.mitre_matrix.expect("matrix");
        assert_eq!(matrix["execution"].len(), 1);
        assert!(!matrix.contains_key("notes"));
    }

    #[test]
    fn matrix_that_is_not_an_object_counts_as_absent() {
        let report = decode_report(r#"{"verdict":"Benign","mitre_matrix":"none"}"#).expect("report");
        assert!(report.mitre_matrix.is_none());
        assert!(correlate(report.mitre_matrix.as_ref()).is_empty());
    }
}
