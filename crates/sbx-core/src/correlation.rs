use crate::{MitreMatrix, Technique};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Technique ids keyed by the process id their evidence names.
///
/// Built once per report and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessTechniqueIndex {
    by_pid: BTreeMap<u32, BTreeSet<String>>,
}

impl ProcessTechniqueIndex {
    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn techniques_for(&self, pid: u32) -> impl Iterator<Item = &str> {
        self.by_pid
            .get(&pid)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    pub fn contains(&self, pid: u32, technique_id: &str) -> bool {
        self.by_pid
            .get(&pid)
            .is_some_and(|ids| ids.contains(technique_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &BTreeSet<String>)> {
        self.by_pid.iter().map(|(pid, ids)| (*pid, ids))
    }

    fn insert(&mut self, pid: u32, technique_id: &str) {
        self.by_pid
            .entry(pid)
            .or_default()
            .insert(technique_id.to_string());
    }
}

/// Maps every technique to the process ids its evidence mentions.
///
/// An absent or empty matrix yields an empty index.
pub fn correlate(matrix: Option<&MitreMatrix>) -> ProcessTechniqueIndex {
    let mut index = ProcessTechniqueIndex::default();
    let Some(matrix) = matrix else {
        return index;
    };

    for technique in matrix.values().flatten() {
        index_technique(&mut index, technique);
    }
    index
}

fn index_technique(index: &mut ProcessTechniqueIndex, technique: &Technique) {
    for evidence in &technique.evidence {
        for pid in extract_pids(evidence) {
            index.insert(pid, &technique.id);
        }
    }
}

/// Every `PID <digits>` mention in `text`, in order. Digit runs that do not
/// fit a u32 are skipped.
///
/// `PID` may close a longer word only when written in capitals
/// (`ParentPID`, `PPID`); a lowercase `pid` glued to letters, as in
/// `rapid 12`, is ordinary prose.
pub fn extract_pids(text: &str) -> Vec<u32> {
    pid_pattern()
        .captures_iter(text)
        .filter(|captures| {
            let token = &captures[1];
            let start = captures.get(1).map_or(0, |m| m.start());
            let glued = text[..start]
                .chars()
                .next_back()
                .is_some_and(char::is_alphabetic);
            !glued || token == "PID"
        })
        .filter_map(|captures| captures.get(2))
        .filter_map(|digits| digits.as_str().parse::<u32>().ok())
        .collect()
}

fn pid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)(PID)[\s:#=_\-]*([0-9]+)").expect("valid regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn technique(id: &str, evidence: &[&str]) -> Technique {
        Technique {
            id: id.to_string(),
            name: format!("{id} name"),
            evidence: evidence.iter().map(|e| e.to_string()).collect(),
            status: "detected".to_string(),
        }
    }

    fn matrix(entries: Vec<(&str, Vec<Technique>)>) -> MitreMatrix {
        entries
            .into_iter()
            .map(|(tactic, techniques)| (tactic.to_string(), techniques))
            .collect()
    }

    #[test]
    fn separator_variants_resolve_to_the_same_pid() {
        for text in [
            "Spawned by PID 42",
            "child pid:42 wrote a file",
            "PID   42 touched Run key",
            "Pid#42",
            "PID=42;",
            "ParentPID: 42 spawned",
            "parent_pid 42",
            "PPID 42",
            "spawned(pid-42)",
        ] {
            assert_eq!(extract_pids(text), vec![42], "{text}");
        }
    }

    #[test]
    fn text_without_a_pid_token_or_digits_yields_nothing() {
        for text in [
            "no process mentioned",
            "PID unknown",
            "PID: n/a",
            "rapid 12 response",
            "Rapid 12 response",
            "",
        ] {
            assert!(extract_pids(text).is_empty(), "{text}");
        }
    }

    #[test]
    fn multiple_mentions_in_one_string_each_associate() {
        let index = correlate(Some(&matrix(vec![(
            "execution",
            vec![technique("T1059", &["PID 10 launched PID 11 via cmd"])],
        )])));

        assert!(index.contains(10, "T1059"));
        assert!(index.contains(11, "T1059"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn technique_appears_once_per_pid() {
        let index = correlate(Some(&matrix(vec![
            (
                "persistence",
                vec![technique(
                    "T1547",
                    &["PID 7 wrote Run key", "pid: 7 verified persistence"],
                )],
            ),
            (
                "defense_evasion",
                vec![
                    technique("T1547", &["again PID 7"]),
                    technique("T1027", &["PID 7 unpacked payload"]),
                ],
            ),
        ])));

        let ids: Vec<&str> = index.techniques_for(7).collect();
        assert_eq!(ids, vec!["T1027", "T1547"]);
    }

    #[test]
    fn absent_empty_or_evidence_free_matrices_give_empty_index() {
        assert!(correlate(None).is_empty());
        assert!(correlate(Some(&MitreMatrix::new())).is_empty());

        let index = correlate(Some(&matrix(vec![
            ("discovery", vec![technique("T1082", &[])]),
            ("collection", vec![technique("T1005", &["read documents folder"])]),
            ("impact", vec![]),
        ])));
        assert!(index.is_empty());
        assert_eq!(index.techniques_for(1).count(), 0);
    }

    #[test]
    fn overflowing_pid_is_skipped_not_fatal() {
        let index = correlate(Some(&matrix(vec![(
            "execution",
            vec![technique(
                "T1106",
                &["PID 99999999999999999999 is bogus", "PID 300 is fine"],
            )],
        )])));

        let pids: Vec<u32> = index.iter().map(|(pid, _)| pid).collect();
        assert_eq!(pids, vec![300]);
    }
}
