use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_yaml::Value;

use crate::coerce::coerce_to_string;

/// `$name` or `${name}` tokens. The braced arm captures everything up to
/// the closing brace so malformed names inside braces can be reported
/// instead of silently passed through.
static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(?:\{([^}]*)\}|([A-Za-z0-9_]+))").unwrap());

pub static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug)]
pub struct Expansion {
    /// Whether the input contained any variable tokens at all.
    pub had_vars: bool,
    /// False when any token was undefined or malformed.
    pub ok: bool,
    pub value: String,
    pub problems: Vec<String>,
}

/// Expand variable references in `s` against `extras` (the run built-ins,
/// consulted first) and then `env`. Undefined and malformed names
/// substitute the empty string so the surrounding pass can still complete,
/// but flip `ok` and carry a diagnostic.
pub fn expand(
    s: &str,
    env: &BTreeMap<String, String>,
    extras: &BTreeMap<String, String>,
) -> Expansion {
    let mut had_vars = false;
    let mut problems = Vec::new();

    let value = VAR_RE.replace_all(s, |caps: &Captures<'_>| {
        had_vars = true;
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        if !IDENT_RE.is_match(name) {
            problems.push(format!("Malformed variable reference '{}'", &caps[0]));
            return String::new();
        }
        if let Some(v) = extras.get(name).or_else(|| env.get(name)) {
            v.clone()
        } else {
            problems.push(format!("Undefined variable '{name}'"));
            String::new()
        }
    });

    Expansion {
        had_vars,
        ok: problems.is_empty(),
        value: value.into_owned(),
        problems,
    }
}

/// Expand a named subset of string-valued keys in a YAML mapping in place.
/// Non-string scalars are coerced to strings first. Returns `prev_ok`
/// AND'ed with the success of every expansion; problems are appended to
/// `problems`.
pub fn expand_keys(
    map: &mut serde_yaml::Mapping,
    keys: &[&str],
    env: &BTreeMap<String, String>,
    extras: &BTreeMap<String, String>,
    prev_ok: bool,
    problems: &mut Vec<String>,
) -> bool {
    let mut ok = prev_ok;
    for key in keys {
        let key_value = Value::String((*key).to_string());
        let Some(current) = map.get(&key_value) else {
            continue;
        };
        let Some(s) = coerce_to_string(current) else {
            continue;
        };
        let expansion = expand(&s, env, extras);
        if expansion.had_vars {
            if !expansion.ok {
                ok = false;
                problems.extend(
                    expansion
                        .problems
                        .iter()
                        .map(|p| format!("In key '{key}': {p}")),
                );
            }
            map.insert(key_value, Value::String(expansion.value));
        }
    }
    ok
}
