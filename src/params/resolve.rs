use regex::Regex;
use tracing::info;

use crate::context::Environment;
use crate::diag::ValidationReport;
use crate::params::schema::{ParamSchema, ParamType};

/// Resolve the active values of the schema parameters against the run
/// environment, mutating it in place.
///
/// Required pass: an unset required parameter consults `on_empty`; a `$VAR`
/// assign copies another variable, a literal assign is used as-is, and the
/// declared fail/warn policy applies when the value is still empty.
/// Regex pass: defined values must fully match the parameter's pattern,
/// and `regex_replace` rewrites are applied to the environment.
pub fn resolve(schema: &[ParamSchema], env: &mut Environment) -> ValidationReport {
    let mut report = ValidationReport::default();

    for param in schema {
        if param.trim
            && let Some(value) = env.get(&param.name)
        {
            let trimmed = value.trim().to_string();
            env.insert(param.name.clone(), trimmed);
        }

        if param.required {
            resolve_required(param, env, &mut report);
        }

        let value = env.get(&param.name).cloned();

        if let (Some(pattern), Some(value)) = (&param.regex, &value) {
            // Patterns validated at schema time.
            let re = Regex::new(&format!("^(?:{pattern})$")).expect("schema regex must compile");
            if !re.is_match(value) {
                report.error(format!(
                    "{} parameter is incorrect due to regex mismatch.",
                    param.name
                ));
            }
        }

        if let (Some(replace), Some(value)) = (&param.regex_replace, &value) {
            let re = Regex::new(&replace.regex).expect("schema regex must compile");
            let to = replace.to.as_deref().unwrap_or("");
            let rewritten = re.replace_all(value, to).to_string();
            if param.ptype == ParamType::Password {
                info!(parameter = param.name.as_str(), "Applied regex_replace");
            } else {
                info!(
                    parameter = param.name.as_str(),
                    from = value.as_str(),
                    to = rewritten.as_str(),
                    "Applied regex_replace"
                );
            }
            env.insert(param.name.clone(), rewritten);
        }
    }

    report
}

fn resolve_required(param: &ParamSchema, env: &mut Environment, report: &mut ValidationReport) {
    let unset = env.get(&param.name).map(|v| v.is_empty()).unwrap_or(true);
    if !unset {
        return;
    }

    let on_empty = param.on_empty.clone().unwrap_or_default();

    if let Some(assign) = &on_empty.assign {
        let resolved = if let Some(var) = assign.strip_prefix('$') {
            let var = var.trim_start_matches('{').trim_end_matches('}');
            env.get(var).cloned()
        } else {
            Some(assign.clone())
        };
        if let Some(value) = resolved
            && !value.is_empty()
        {
            info!(
                parameter = param.name.as_str(),
                assign = assign.as_str(),
                "Assigned empty required parameter"
            );
            env.insert(param.name.clone(), value);
            return;
        }
    }

    if on_empty.warn {
        report.warning(format!(
            "Required parameter '{}' is empty and no assignment applied",
            param.name
        ));
    }
    if on_empty.fail {
        report.error(format!(
            "Required parameter '{}' is not defined for the current build",
            param.name
        ));
    }
}
