use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use relay_types::StepKind;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("unsupported workflow document extension: {0}")]
    UnsupportedExtension(String),
    #[error("failed to read workflow document: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse yaml workflow document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse json workflow document: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the error strategy of §4.8 is applied once a step exhausts its
/// retry budget: `fail_fast` skips every transitive dependent, `continue`
/// skips only the direct dependents (open question resolved in
/// `DESIGN.md`: the scheduler implements the documented distinction
/// rather than the source's breadth-first walk for both).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    #[default]
    FailFast,
    Continue,
}

/// One of the four verification kinds a step's output is checked against
/// once its executor returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Verification {
    OutputContains { text: String },
    ExitCode,
    FileExists { path: String },
    Custom,
}

/// Idle-nudge configuration for an interactive step (§4.8). Present only on
/// `agent`/`worktree` steps; its absence means the scheduler falls back to
/// plain exit-waiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(with = "humantime_millis")]
    pub nudge_after: std::time::Duration,
    pub max_nudges: u32,
    #[serde(with = "humantime_millis")]
    pub escalate_after: std::time::Duration,
    /// A hub-style swarm worker to route the nudge through instead of
    /// injecting it directly into the idle worker.
    #[serde(default)]
    pub hub_worker: Option<String>,
}

/// Durations in workflow documents are written as plain milliseconds
/// (`nudge_after_ms: 100`), matching the integer-valued tunables elsewhere
/// in the document rather than a string-parsed humantime format.
mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// A single step as declared in a workflow document, before it becomes a
/// runtime [`relay_types::Step`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// The text to inject (for `agent`/`worktree`/`non_interactive` steps)
    /// or the shell command (for `deterministic` steps). May contain
    /// `{{name}}` variable references (first pass) and
    /// `{{steps.X.output}}` references (second pass).
    pub body: String,
    #[serde(default)]
    pub expected_echo: Option<String>,
    /// For `non_interactive` steps: the CLI name used to look up the
    /// one-shot invocation recipe in the fixed table of §4.9.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub verification: Option<Verification>,
    #[serde(default)]
    pub nudge: Option<NudgeConfig>,
    /// Whether a non-zero exit code fails the step. Defaults to `true`;
    /// only meaningful for `non_interactive` and `deterministic` steps.
    #[serde(default = "default_true")]
    pub check_exit_code: bool,
    /// Whether to capture the step's stdout as its output for downstream
    /// interpolation. Defaults to `true`.
    #[serde(default = "default_true")]
    pub capture_stdout: bool,
}

fn default_true() -> bool {
    true
}

/// A parsed workflow document: a name, its swarm pattern tag, caller-
/// supplied variables, and the set of steps that make up its DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default)]
    pub swarm_pattern: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    pub steps: Vec<StepSpec>,
}

impl WorkflowDocument {
    /// Parse a workflow document, sniffing the format from the file
    /// extension (`.yaml`/`.yml` as YAML, anything else as JSON).
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, path.extension().and_then(|e| e.to_str()))
    }

    pub fn parse(contents: &str, extension: Option<&str>) -> Result<Self, DocumentError> {
        match extension {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(contents)?),
            Some("json") => Ok(serde_json::from_str(contents)?),
            other => Err(DocumentError::UnsupportedExtension(
                other.unwrap_or("").to_string(),
            )),
        }
    }

    /// First interpolation pass: substitute `{{name}}` variable references
    /// in every step body from `self.vars`, leaving `{{steps.*}}`
    /// references untouched for the scheduler's lazy second pass.
    pub fn resolve_vars(&mut self) {
        for step in &mut self.steps {
            step.body = crate::interpolation::substitute_vars(&step.body, &self.vars);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_document() {
        let yaml = r#"
name: demo
steps:
  - id: a
    kind: deterministic
    body: "hello"
  - id: b
    kind: agent
    worker: w1
    depends_on: [a]
    body: "do the thing"
    expected_echo: "done"
"#;
        let doc: WorkflowDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.name, "demo");
        assert_eq!(doc.steps.len(), 2);
        assert_eq!(doc.steps[1].depends_on.len(), 1);
    }

    #[test]
    fn resolve_vars_substitutes_first_pass_only() {
        let yaml = r#"
name: demo
vars:
  widget: WIDGET
steps:
  - id: plan
    kind: deterministic
    body: "printf {{widget}}"
  - id: build
    kind: deterministic
    depends_on: [plan]
    body: "make-{{steps.plan.output}}"
"#;
        let mut doc: WorkflowDocument = serde_yaml::from_str(yaml).unwrap();
        doc.resolve_vars();
        assert_eq!(doc.steps[0].body, "printf WIDGET");
        assert_eq!(doc.steps[1].body, "make-{{steps.plan.output}}");
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = WorkflowDocument::parse("name: demo\nsteps: []", Some("toml")).unwrap_err();
        assert!(matches!(err, DocumentError::UnsupportedExtension(_)));
    }
}
