use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use relay_types::{Run, Step};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistence serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Insert/update interface for run and step rows (§2, §6). Both operations
/// are upserts: a row that already exists by id is overwritten.
pub trait PersistenceAdapter: Send + Sync {
    fn put_run(&self, run: &Run) -> Result<(), PersistenceError>;
    fn put_step(&self, run_id: &str, step: &Step) -> Result<(), PersistenceError>;
    fn get_run(&self, run_id: &str) -> Result<Option<Run>, PersistenceError>;
    fn get_steps(&self, run_id: &str) -> Result<Vec<Step>, PersistenceError>;
}

/// Plain in-memory store, used by tests and by `--validate`/dry-run
/// invocations that never need a durable record.
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: Mutex<HashMap<String, Run>>,
    steps: Mutex<HashMap<String, HashMap<String, Step>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceAdapter for InMemoryPersistence {
    fn put_run(&self, run: &Run) -> Result<(), PersistenceError> {
        self.runs
            .lock()
            .expect("in-memory persistence lock poisoned")
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn put_step(&self, run_id: &str, step: &Step) -> Result<(), PersistenceError> {
        self.steps
            .lock()
            .expect("in-memory persistence lock poisoned")
            .entry(run_id.to_string())
            .or_default()
            .insert(step.id.clone(), step.clone());
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>, PersistenceError> {
        Ok(self
            .runs
            .lock()
            .expect("in-memory persistence lock poisoned")
            .get(run_id)
            .cloned())
    }

    fn get_steps(&self, run_id: &str) -> Result<Vec<Step>, PersistenceError> {
        Ok(self
            .steps
            .lock()
            .expect("in-memory persistence lock poisoned")
            .get(run_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// One line of the journal: `{"kind":"run","row":…}` or
/// `{"kind":"step","row":…}` (§6). The last record for a given id wins on
/// replay, so the journal never needs in-place rewriting.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalRecord {
    Run { row: Run },
    Step { run_id: String, row: Step },
}

/// Append-only JSONL journal under `.agent-relay/runs.jsonl` (§6). Every
/// `put_run`/`put_step` call appends one line; reads replay the whole file
/// and keep only the last record per id.
pub struct FilePersistence {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FilePersistence {
    pub fn open(base_dir: &Path) -> Result<Self, PersistenceError> {
        let dir = base_dir.join(".agent-relay");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("runs.jsonl");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn append(&self, record: &JournalRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .lock()
            .expect("journal file lock poisoned")
            .write_all(line.as_bytes())?;
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, PersistenceError> {
        let file = std::fs::File::open(&self.path)?;
        let reader = std::io::BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl PersistenceAdapter for FilePersistence {
    fn put_run(&self, run: &Run) -> Result<(), PersistenceError> {
        self.append(&JournalRecord::Run { row: run.clone() })
    }

    fn put_step(&self, run_id: &str, step: &Step) -> Result<(), PersistenceError> {
        self.append(&JournalRecord::Step {
            run_id: run_id.to_string(),
            row: step.clone(),
        })
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>, PersistenceError> {
        let mut last = None;
        for record in self.replay()? {
            if let JournalRecord::Run { row } = record {
                if row.id == run_id {
                    last = Some(row);
                }
            }
        }
        Ok(last)
    }

    fn get_steps(&self, run_id: &str) -> Result<Vec<Step>, PersistenceError> {
        let mut last: HashMap<String, Step> = HashMap::new();
        for record in self.replay()? {
            if let JournalRecord::Step { run_id: rid, row } = record {
                if rid == run_id {
                    last.insert(row.id.clone(), row);
                }
            }
        }
        Ok(last.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn in_memory_put_then_get_round_trips() {
        let store = InMemoryPersistence::new();
        let run = Run::new("r1", "demo", Utc::now());
        store.put_run(&run).unwrap();
        let fetched = store.get_run("r1").unwrap().unwrap();
        assert_eq!(fetched.id, "r1");
    }

    #[test]
    fn file_persistence_last_write_wins_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::open(dir.path()).unwrap();

        let mut run = Run::new("r1", "demo", Utc::now());
        store.put_run(&run).unwrap();
        run.status = relay_types::RunStatus::Completed;
        store.put_run(&run).unwrap();

        let fetched = store.get_run("r1").unwrap().unwrap();
        assert_eq!(fetched.status, relay_types::RunStatus::Completed);
    }

    #[test]
    fn file_persistence_steps_are_scoped_by_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::open(dir.path()).unwrap();

        let step = relay_types::Step::new("s1", relay_types::StepKind::Deterministic);
        store.put_step("r1", &step).unwrap();
        store.put_step("r2", &step).unwrap();

        assert_eq!(store.get_steps("r1").unwrap().len(), 1);
        assert_eq!(store.get_steps("r2").unwrap().len(), 1);
        assert_eq!(store.get_steps("r3").unwrap().len(), 0);
    }
}
