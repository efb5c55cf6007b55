use std::path::Path;

use crate::document::Verification;
use crate::executors::StepOutcome;

/// Result of checking a completed step's outcome against its declared
/// [`Verification`] (§4.8). A verification failure is folded into the
/// step's retry budget the same way an executor failure is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Passed,
    Failed { reason: String },
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        matches!(self, VerificationResult::Passed)
    }
}

/// Check `outcome` against `verification`, resolving `FileExists` paths
/// relative to `run_dir` when they aren't already absolute. `custom` is a
/// no-op that always passes — it is reserved for external validators this
/// runner doesn't itself implement (§4.8).
///
/// The `file_exists` safety net of §4.8 (a timed-out step whose file is
/// nonetheless present still succeeds) is handled by the scheduler before
/// this function is reached; by the time an outcome gets here it has
/// already been decided to attempt verification.
pub fn verify(verification: &Verification, outcome: &StepOutcome, run_dir: &Path) -> VerificationResult {
    let output = match outcome {
        StepOutcome::Success { output, .. } => output.as_str(),
        StepOutcome::Failure { message, .. } => {
            return VerificationResult::Failed {
                reason: message.clone(),
            };
        }
    };

    match verification {
        Verification::OutputContains { text } => {
            if output.contains(text.as_str()) {
                VerificationResult::Passed
            } else {
                VerificationResult::Failed {
                    reason: format!("output does not contain {text:?}"),
                }
            }
        }
        Verification::ExitCode => match outcome {
            StepOutcome::Success {
                exit_code: Some(0), ..
            } => VerificationResult::Passed,
            StepOutcome::Success { exit_code, .. } => VerificationResult::Failed {
                reason: format!("exit code {exit_code:?} was not 0"),
            },
            StepOutcome::Failure { .. } => unreachable!("handled above"),
        },
        Verification::FileExists { path } => {
            if file_exists_relative(path, run_dir) {
                VerificationResult::Passed
            } else {
                VerificationResult::Failed {
                    reason: format!("expected file {path} does not exist"),
                }
            }
        }
        Verification::Custom => VerificationResult::Passed,
    }
}

pub fn file_exists_relative(path: &str, run_dir: &Path) -> bool {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.exists()
    } else {
        run_dir.join(candidate).exists()
    }
}

/// Strip terminal escape sequences from captured output before it is used
/// for interpolation or verification (§4.8: "Output used for interpolation
/// is the step's captured output with terminal escape sequences stripped").
pub fn strip_escapes(raw: &str) -> String {
    let stripped = strip_ansi_escapes::strip(raw.as_bytes());
    String::from_utf8_lossy(&stripped).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn success(output: &str) -> StepOutcome {
        StepOutcome::Success {
            output: output.to_string(),
            exit_code: Some(0),
        }
    }

    #[test]
    fn output_contains_passes_on_substring_match() {
        let dir = tempdir().unwrap();
        let result = verify(
            &Verification::OutputContains { text: "hello".into() },
            &success("say hello world"),
            dir.path(),
        );
        assert!(result.passed());
    }

    #[test]
    fn output_contains_fails_without_a_match() {
        let dir = tempdir().unwrap();
        let result = verify(
            &Verification::OutputContains { text: "goodbye".into() },
            &success("say hello world"),
            dir.path(),
        );
        assert!(!result.passed());
    }

    #[test]
    fn exit_code_verification_requires_zero() {
        let dir = tempdir().unwrap();
        let nonzero = StepOutcome::Success {
            output: String::new(),
            exit_code: Some(1),
        };
        assert!(!verify(&Verification::ExitCode, &nonzero, dir.path()).passed());
        assert!(verify(&Verification::ExitCode, &success(""), dir.path()).passed());
    }

    #[test]
    fn file_exists_checks_relative_to_run_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let result = verify(
            &Verification::FileExists {
                path: "marker.txt".into(),
            },
            &success(""),
            dir.path(),
        );
        assert!(result.passed());
    }

    #[test]
    fn custom_verification_always_passes() {
        let dir = tempdir().unwrap();
        assert!(verify(&Verification::Custom, &success(""), dir.path()).passed());
    }

    #[test]
    fn strip_escapes_removes_ansi_codes() {
        let raw = "\x1b[31mred text\x1b[0m";
        assert_eq!(strip_escapes(raw), "red text");
    }
}
