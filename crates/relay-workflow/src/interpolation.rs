use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("unresolved template reference {reference} in step {step_id}")]
    UnresolvedReference { step_id: String, reference: String },
}

/// Output values a completed step makes available to steps that depend on
/// it, keyed by field name (`"output"`, `"exit_code"`, and so on).
pub type StepOutputs = HashMap<String, String>;

/// First pass, run once at load time: substitutes plain `{{name}}` tokens
/// (no dot) from the caller-supplied variable map. Tokens that don't match
/// any entry in `vars` are left untouched — they may be `{{steps.*}}`
/// references meant for the second pass.
pub fn substitute_vars(template: &str, vars: &HashMap<String, String>) -> String {
    walk_tokens(template, |reference| {
        if reference.contains('.') {
            return None;
        }
        vars.get(reference).cloned()
    })
}

/// Second pass, run lazily immediately before each step is dispatched:
/// substitutes every `{{steps.X.field}}` reference with the matching value
/// from `outputs[X][field]`. A token that still doesn't resolve — because
/// it names a step that hasn't completed yet, or isn't a `steps.*`
/// reference at all — is a setup error.
pub fn interpolate(
    step_id: &str,
    template: &str,
    outputs: &HashMap<String, StepOutputs>,
) -> Result<String, InterpolationError> {
    let mut error = None;
    let result = walk_tokens(template, |reference| {
        match resolve_reference(reference, outputs) {
            Some(value) => Some(value),
            None => {
                error.get_or_insert_with(|| InterpolationError::UnresolvedReference {
                    step_id: step_id.to_string(),
                    reference: reference.to_string(),
                });
                None
            }
        }
    });

    match error {
        Some(err) => Err(err),
        None => Ok(result),
    }
}

fn resolve_reference(reference: &str, outputs: &HashMap<String, StepOutputs>) -> Option<String> {
    let rest = reference.strip_prefix("steps.")?;
    let (ref_step, field) = rest.split_once('.')?;
    outputs.get(ref_step)?.get(field).cloned()
}

/// Shared `{{...}}` scanner: calls `resolve` with the trimmed token text for
/// each `{{...}}` occurrence; a `None` leaves the token in place unchanged
/// so passes can be layered without clobbering each other's syntax.
fn walk_tokens(template: &str, mut resolve: impl FnMut(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let reference = after_open[..end].trim();
        match resolve(reference) {
            Some(value) => result.push_str(&value),
            None => result.push_str(&rest[start..start + 4 + end]),
        }
        rest = &after_open[end + 2..];
    }
    result.push_str(rest);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_a_single_step_reference() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "a".to_string(),
            HashMap::from([("output".to_string(), "42".to_string())]),
        );

        let result = interpolate("b", "value is {{steps.a.output}}", &outputs).unwrap();
        assert_eq!(result, "value is 42");
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let outputs = HashMap::new();
        let err = interpolate("b", "{{steps.a.output}}", &outputs).unwrap_err();
        assert!(matches!(err, InterpolationError::UnresolvedReference { .. }));
    }

    #[test]
    fn template_without_references_passes_through_unchanged() {
        let outputs = HashMap::new();
        assert_eq!(
            interpolate("a", "no templates here", &outputs).unwrap(),
            "no templates here"
        );
    }

    #[test]
    fn first_pass_substitutes_plain_variables_and_ignores_step_refs() {
        let vars = HashMap::from([("name".to_string(), "WIDGET".to_string())]);
        let result = substitute_vars("build {{name}} then {{steps.plan.output}}", &vars);
        assert_eq!(result, "build WIDGET then {{steps.plan.output}}");
    }

    #[test]
    fn make_widget_scenario_round_trips_through_both_passes() {
        let vars = HashMap::new();
        let first_pass = substitute_vars("make-{{steps.plan.output}}", &vars);

        let mut outputs = HashMap::new();
        outputs.insert(
            "plan".to_string(),
            HashMap::from([("output".to_string(), "WIDGET".to_string())]),
        );
        let second_pass = interpolate("build", &first_pass, &outputs).unwrap();
        assert_eq!(second_pass, "make-WIDGET");
    }
}
