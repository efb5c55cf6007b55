use std::collections::{BTreeSet, HashMap};

use relay_types::{RunError, Step, StepStatus};

use crate::document::WorkflowDocument;

/// The in-memory DAG a [`crate::scheduler::Scheduler`] drives to
/// completion: one [`Step`] per declared `StepSpec`, keyed by name, plus
/// the pre-interpolation body text each step was declared with (the
/// scheduler re-resolves `{{steps.*}}` references against it immediately
/// before dispatch).
pub struct Dag {
    pub steps: HashMap<String, Step>,
    pub bodies: HashMap<String, String>,
    pub order: Vec<String>,
}

impl Dag {
    /// Build and validate a DAG from a parsed (and first-pass-interpolated)
    /// workflow document: rejects unknown dependencies and cycles before a
    /// run row is ever created (§7, Run errors).
    pub fn build(document: &WorkflowDocument) -> Result<Self, RunError> {
        let mut steps = HashMap::new();
        let mut bodies = HashMap::new();
        let known: BTreeSet<String> = document.steps.iter().map(|s| s.id.clone()).collect();

        for spec in &document.steps {
            for dep in &spec.depends_on {
                if !known.contains(dep) {
                    return Err(RunError::UnknownDependency {
                        step_id: spec.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            let mut step = Step::new(spec.id.clone(), spec.kind);
            step.worker = spec.worker.clone();
            step.depends_on = spec.depends_on.clone();
            steps.insert(spec.id.clone(), step);
            bodies.insert(spec.id.clone(), spec.body.clone());
        }

        let order = topological_order(&steps)?;

        Ok(Self {
            steps,
            bodies,
            order,
        })
    }

    /// Steps whose dependencies are all completed and who are themselves
    /// still `pending` — the next wave to dispatch.
    pub fn ready_steps(&self) -> Vec<String> {
        let completed: BTreeSet<String> = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect();

        self.order
            .iter()
            .filter(|id| self.steps[*id].is_ready(&completed))
            .cloned()
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.steps.values().all(|s| {
            matches!(
                s.status,
                StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
            )
        })
    }

    pub fn any_failed(&self) -> bool {
        self.steps.values().any(|s| s.status == StepStatus::Failed)
    }

    /// Direct dependents of `step_id` — steps that name it in `depends_on`.
    pub fn direct_dependents(&self, step_id: &str) -> Vec<String> {
        self.steps
            .values()
            .filter(|s| s.depends_on.contains(step_id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// All transitive dependents of `step_id`, via breadth-first walk of
    /// `direct_dependents`.
    pub fn transitive_dependents(&self, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut frontier = vec![step_id.to_string()];
        while let Some(current) = frontier.pop() {
            for dependent in self.direct_dependents(&current) {
                if seen.insert(dependent.clone()) {
                    frontier.push(dependent);
                }
            }
        }
        seen
    }
}

/// Kahn's algorithm; the ordering itself is never load-bearing for
/// scheduling (the ready-set recomputation is), but a cycle can only be
/// detected by confirming every node is eventually dequeued.
fn topological_order(steps: &HashMap<String, Step>) -> Result<Vec<String>, RunError> {
    let mut in_degree: HashMap<String, usize> = steps
        .keys()
        .map(|id| (id.clone(), 0))
        .collect();
    for step in steps.values() {
        *in_degree.get_mut(&step.id).unwrap() += step.depends_on.len();
    }

    let mut queue: std::collections::VecDeque<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        for step in steps.values() {
            if step.depends_on.contains(&id) {
                let degree = in_degree.get_mut(&step.id).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(step.id.clone());
                }
            }
        }
    }

    if order.len() != steps.len() {
        let stuck = steps
            .keys()
            .find(|id| !order.contains(id))
            .cloned()
            .unwrap_or_default();
        return Err(RunError::CyclicDependency { step_id: stuck });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ErrorStrategy, StepSpec};
    use relay_types::StepKind;
    use std::collections::BTreeSet as Set;

    fn doc(steps: Vec<StepSpec>) -> WorkflowDocument {
        WorkflowDocument {
            name: "t".into(),
            swarm_pattern: None,
            vars: Default::default(),
            max_concurrency: None,
            error_strategy: ErrorStrategy::FailFast,
            steps,
        }
    }

    fn step(id: &str, deps: &[&str]) -> StepSpec {
        StepSpec {
            id: id.into(),
            kind: StepKind::Deterministic,
            worker: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            body: "echo".into(),
            expected_echo: None,
            command: None,
            retries: 0,
            timeout_secs: None,
            verification: None,
            nudge: None,
            check_exit_code: true,
            capture_stdout: true,
        }
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let d = doc(vec![step("a", &["ghost"])]);
        let err = Dag::build(&d).unwrap_err();
        assert!(matches!(err, RunError::UnknownDependency { .. }));
    }

    #[test]
    fn cycle_is_rejected() {
        let d = doc(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = Dag::build(&d).unwrap_err();
        assert!(matches!(err, RunError::CyclicDependency { .. }));
    }

    #[test]
    fn three_node_fan_out_ready_set_and_dependents() {
        let d = doc(vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])]);
        let dag = Dag::build(&d).unwrap();
        assert_eq!(dag.ready_steps(), vec!["a".to_string()]);

        let dependents: Set<String> = dag.transitive_dependents("a");
        assert_eq!(dependents, Set::from(["b".to_string(), "c".to_string()]));
    }
}
