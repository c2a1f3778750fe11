//! Append-only JSONL journal of plan writes.
//!
//! One line per committed change. `recover` replays the file into per-plan
//! history; unparseable lines are counted and skipped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::plan::{PlanId, PlanState, Timestamp};

#[derive(Debug)]
pub struct Journal {
    file: File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum JournalEntry {
    #[serde(rename = "created")]
    Created {
        ts: Timestamp,
        plan_id: PlanId,
        symbol: String,
        direction: String,
        revision: u64,
        params_hash: String,
    },
    #[serde(rename = "transition")]
    Transition {
        ts: Timestamp,
        plan_id: PlanId,
        from: PlanState,
        to: PlanState,
        revision: u64,
        reason: String,
    },
    #[serde(rename = "mutated")]
    Mutated {
        ts: Timestamp,
        plan_id: PlanId,
        kind: String,
        revision: u64,
        entry: f64,
        stop: f64,
        target: f64,
        #[serde(default)]
        anchor: Option<f64>,
    },
    #[serde(rename = "annotated")]
    Annotated {
        ts: Timestamp,
        plan_id: PlanId,
        revision: u64,
        label: String,
        reason: String,
    },
}

impl JournalEntry {
    pub fn plan_id(&self) -> PlanId {
        match self {
            JournalEntry::Created { plan_id, .. }
            | JournalEntry::Transition { plan_id, .. }
            | JournalEntry::Mutated { plan_id, .. }
            | JournalEntry::Annotated { plan_id, .. } => *plan_id,
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            JournalEntry::Created { revision, .. }
            | JournalEntry::Transition { revision, .. }
            | JournalEntry::Mutated { revision, .. }
            | JournalEntry::Annotated { revision, .. } => *revision,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanHistory {
    pub symbol: Option<String>,
    pub state: Option<PlanState>,
    pub revision: u64,
    /// (from, to, reason) in journal order.
    pub trail: Vec<(PlanState, PlanState, String)>,
    pub mutations: u32,
}

#[derive(Debug, Clone, Default)]
pub struct JournalRecovery {
    pub plans: HashMap<PlanId, PlanHistory>,
    pub malformed: usize,
}

impl JournalRecovery {
    /// Plans whose last journaled state is not terminal.
    pub fn open_plans(&self) -> Vec<PlanId> {
        let mut ids: Vec<PlanId> = self
            .plans
            .iter()
            .filter(|(_, h)| h.state.map(|s| !s.is_terminal()).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }

    pub fn replay(path: impl AsRef<Path>) -> std::io::Result<Vec<String>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(reader.lines().map_while(Result::ok).collect())
    }

    pub fn recover(path: impl AsRef<Path>) -> std::io::Result<JournalRecovery> {
        let mut out = JournalRecovery::default();
        for line in Self::replay(path)? {
            if line.trim().is_empty() {
                continue;
            }
            let entry = match serde_json::from_str::<JournalEntry>(&line) {
                Ok(e) => e,
                Err(_) => {
                    out.malformed += 1;
                    continue;
                }
            };
            let history = out.plans.entry(entry.plan_id()).or_default();
            history.revision = history.revision.max(entry.revision());
            match entry {
                JournalEntry::Created { symbol, .. } => {
                    history.symbol = Some(symbol);
                    history.state = Some(PlanState::Pending);
                }
                JournalEntry::Transition { from, to, reason, .. } => {
                    history.state = Some(to);
                    history.trail.push((from, to, reason));
                }
                JournalEntry::Mutated { .. } => history.mutations += 1,
                JournalEntry::Annotated { .. } => {}
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_recover_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let mut journal = Journal::open(&path).unwrap();

        journal
            .append(&JournalEntry::Created {
                ts: 1,
                plan_id: 1,
                symbol: "BTCUSDT".into(),
                direction: "long".into(),
                revision: 1,
                params_hash: "abc".into(),
            })
            .unwrap();
        journal
            .append(&JournalEntry::Mutated {
                ts: 2,
                plan_id: 1,
                kind: "reanchor".into(),
                revision: 2,
                entry: 90355.0,
                stop: 90255.0,
                target: 90555.0,
                anchor: Some(90365.0),
            })
            .unwrap();
        journal
            .append(&JournalEntry::Transition {
                ts: 3,
                plan_id: 1,
                from: PlanState::Pending,
                to: PlanState::Executed,
                revision: 3,
                reason: "filled".into(),
            })
            .unwrap();
        journal
            .append(&JournalEntry::Created {
                ts: 4,
                plan_id: 2,
                symbol: "ETHUSDT".into(),
                direction: "short".into(),
                revision: 1,
                params_hash: "def".into(),
            })
            .unwrap();

        let rec = Journal::recover(&path).unwrap();
        let h = &rec.plans[&1];
        assert_eq!(h.state, Some(PlanState::Executed));
        assert_eq!(h.revision, 3);
        assert_eq!(h.mutations, 1);
        assert_eq!(h.trail.len(), 1);
        assert_eq!(rec.open_plans(), vec![2]);
        assert_eq!(rec.malformed, 0);
    }

    #[test]
    fn test_recover_skips_torn_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(
            &path,
            "{\"operation\":\"annotated\",\"ts\":1,\"plan_id\":9,\"revision\":4,\"label\":\"cooldown\",\"reason\":\"x\"}\n{\"operation\":\"trans",
        )
        .unwrap();
        let rec = Journal::recover(&path).unwrap();
        assert_eq!(rec.malformed, 1);
        assert_eq!(rec.plans[&9].revision, 4);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let rec = Journal::recover("/nonexistent/planwarden/journal.jsonl").unwrap();
        assert!(rec.plans.is_empty());
    }
}
