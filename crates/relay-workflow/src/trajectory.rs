use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use relay_types::StepFailureCategory;
use serde::{Deserialize, Serialize};

/// A single append-only entry in a run's trajectory (§4.10). Chapters mark
/// the planning phase, each parallel track, convergence points, and the
/// final retrospective; step entries record intent, progress, and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TrajectoryEntry {
    ChapterPlanning { run_id: String, at: DateTime<Utc> },
    ChapterTrack { run_id: String, wave: usize, step_ids: Vec<String>, at: DateTime<Utc> },
    ChapterConvergence { run_id: String, at: DateTime<Utc> },
    ChapterRetrospective { run_id: String, at: DateTime<Utc> },
    StepIntent { run_id: String, step_id: String, task: String, at: DateTime<Utc> },
    StepStarted { run_id: String, step_id: String, at: DateTime<Utc> },
    StepCompleted {
        run_id: String,
        step_id: String,
        last_line: String,
        at: DateTime<Utc>,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        category: StepFailureCategory,
        reason: String,
        at: DateTime<Utc>,
    },
    StepSkipped { run_id: String, step_id: String, reason: String, at: DateTime<Utc> },
    StepRetried { run_id: String, step_id: String, attempt: u32, at: DateTime<Utc> },
    Retrospective {
        run_id: String,
        confidence: f64,
        completed: usize,
        failed: usize,
        skipped: usize,
        at: DateTime<Utc>,
    },
}

/// Per-run tally the retrospective's confidence score is computed from
/// (§4.10): "a bounded linear combination of completion rate, first-attempt
/// success rate, and verification pass rate".
#[derive(Debug, Clone, Default)]
pub struct RunTally {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub first_attempt_successes: usize,
    pub verifications_attempted: usize,
    pub verifications_passed: usize,
}

impl RunTally {
    /// Weighted blend of three rates, each already in `[0, 1]`, clamped to
    /// `[0, 1]` for safety against a tally with zero steps.
    pub fn confidence(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        let completion_rate = self.completed as f64 / self.total_steps as f64;
        let first_attempt_rate = if self.completed == 0 {
            0.0
        } else {
            self.first_attempt_successes as f64 / self.completed as f64
        };
        let verification_rate = if self.verifications_attempted == 0 {
            1.0
        } else {
            self.verifications_passed as f64 / self.verifications_attempted as f64
        };

        let score = 0.5 * completion_rate + 0.25 * first_attempt_rate + 0.25 * verification_rate;
        score.clamp(0.0, 1.0)
    }
}

/// Appends [`TrajectoryEntry`] records as JSON lines to a per-run file under
/// `.agent-relay/trajectories/<run-id>.jsonl`, opened once at run start
/// (§4.10).
pub struct TrajectoryRecorder {
    file: std::fs::File,
    run_id: String,
}

impl TrajectoryRecorder {
    pub fn open(base_dir: &Path, run_id: &str) -> std::io::Result<Self> {
        let dir = base_dir.join(".agent-relay").join("trajectories");
        std::fs::create_dir_all(&dir)?;
        let path: PathBuf = dir.join(format!("{run_id}.jsonl"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file,
            run_id: run_id.to_string(),
        })
    }

    pub fn record(&mut self, entry: &TrajectoryEntry) {
        if let Ok(mut line) = serde_json::to_string(entry) {
            line.push('\n');
            let _ = self.file.write_all(line.as_bytes());
        }
    }

    pub fn planning(&mut self, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::ChapterPlanning {
            run_id: self.run_id.clone(),
            at,
        });
    }

    pub fn track(&mut self, wave: usize, step_ids: Vec<String>, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::ChapterTrack {
            run_id: self.run_id.clone(),
            wave,
            step_ids,
            at,
        });
    }

    pub fn convergence(&mut self, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::ChapterConvergence {
            run_id: self.run_id.clone(),
            at,
        });
    }

    pub fn step_intent(&mut self, step_id: &str, task: &str, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::StepIntent {
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            task: task.to_string(),
            at,
        });
    }

    pub fn step_started(&mut self, step_id: &str, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::StepStarted {
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            at,
        });
    }

    pub fn step_completed(&mut self, step_id: &str, output: &str, at: DateTime<Utc>) {
        let last_line = output
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .to_string();
        self.record(&TrajectoryEntry::StepCompleted {
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            last_line,
            at,
        });
    }

    pub fn step_failed(
        &mut self,
        step_id: &str,
        category: StepFailureCategory,
        reason: &str,
        at: DateTime<Utc>,
    ) {
        self.record(&TrajectoryEntry::StepFailed {
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            category,
            reason: reason.to_string(),
            at,
        });
    }

    pub fn step_skipped(&mut self, step_id: &str, reason: &str, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::StepSkipped {
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            reason: reason.to_string(),
            at,
        });
    }

    pub fn step_retried(&mut self, step_id: &str, attempt: u32, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::StepRetried {
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            attempt,
            at,
        });
    }

    pub fn retrospective(&mut self, tally: &RunTally, at: DateTime<Utc>) {
        self.record(&TrajectoryEntry::ChapterRetrospective {
            run_id: self.run_id.clone(),
            at,
        });
        self.record(&TrajectoryEntry::Retrospective {
            run_id: self.run_id.clone(),
            confidence: tally.confidence(),
            completed: tally.completed,
            failed: tally.failed,
            skipped: tally.skipped,
            at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_perfect_when_everything_succeeded_first_try() {
        let tally = RunTally {
            total_steps: 4,
            completed: 4,
            failed: 0,
            skipped: 0,
            first_attempt_successes: 4,
            verifications_attempted: 4,
            verifications_passed: 4,
        };
        assert_eq!(tally.confidence(), 1.0);
    }

    #[test]
    fn confidence_degrades_with_retries_and_failed_verifications() {
        let tally = RunTally {
            total_steps: 4,
            completed: 4,
            failed: 0,
            skipped: 0,
            first_attempt_successes: 2,
            verifications_attempted: 4,
            verifications_passed: 2,
        };
        let score = tally.confidence();
        assert!(score < 1.0 && score > 0.5);
    }

    #[test]
    fn empty_run_has_zero_confidence_not_nan() {
        let tally = RunTally::default();
        assert_eq!(tally.confidence(), 0.0);
    }

    #[test]
    fn recorder_appends_valid_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = TrajectoryRecorder::open(dir.path(), "run-1").unwrap();
        let now = Utc::now();
        recorder.planning(now);
        recorder.step_started("a", now);
        recorder.step_completed("a", "line one\nline two\n", now);

        let path = dir
            .path()
            .join(".agent-relay")
            .join("trajectories")
            .join("run-1.jsonl");
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let _: serde_json::Value = serde_json::from_str(line).unwrap();
        }
        assert!(contents.contains("line two"));
    }
}
