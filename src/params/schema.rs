use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::coerce::{coerce_to_bool, coerce_to_string, concat_string_or_list, is_list};
use crate::diag::ValidationReport;
use crate::template::IDENT_RE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Text,
    Password,
    Boolean,
    Choice,
}

impl ParamType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ParamType::String),
            "text" => Some(ParamType::Text),
            "password" => Some(ParamType::Password),
            "boolean" => Some(ParamType::Boolean),
            "choice" => Some(ParamType::Choice),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Text => "text",
            ParamType::Password => "password",
            ParamType::Boolean => "boolean",
            ParamType::Choice => "choice",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexReplace {
    pub regex: String,
    /// Replacement text; `None` erases every match.
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnEmpty {
    /// `$VAR` reference or literal fallback value.
    pub assign: Option<String>,
    pub fail: bool,
    pub warn: bool,
}

impl Default for OnEmpty {
    fn default() -> Self {
        Self {
            assign: None,
            fail: true,
            warn: false,
        }
    }
}

/// A validated build parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSchema {
    pub name: String,
    pub required: bool,
    pub ptype: ParamType,
    pub default: Option<String>,
    pub choices: Option<Vec<String>>,
    pub description: Option<String>,
    pub trim: bool,
    /// Full-match pattern; list form is concatenated at validation time.
    pub regex: Option<String>,
    pub regex_replace: Option<RegexReplace>,
    pub on_empty: Option<OnEmpty>,
}

impl ParamSchema {
    fn new(name: String, required: bool, ptype: ParamType) -> Self {
        Self {
            name,
            required,
            ptype,
            default: None,
            choices: None,
            description: None,
            trim: false,
            regex: None,
            regex_replace: None,
            on_empty: None,
        }
    }

    /// Render back to the YAML mapping form, with the auto-typed `type`
    /// key materialized. Feeding the result through the validator again
    /// yields an identical schema.
    pub fn to_declaration(&self) -> Value {
        let mut map = Mapping::new();
        map.insert("name".into(), Value::String(self.name.clone()));
        map.insert("type".into(), Value::String(self.ptype.to_string()));
        if let Some(default) = &self.default {
            let value = match self.ptype {
                ParamType::Boolean => Value::Bool(default == "true"),
                _ => Value::String(default.clone()),
            };
            map.insert("default".into(), value);
        }
        if let Some(choices) = &self.choices {
            map.insert(
                "choices".into(),
                Value::Sequence(choices.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(description) = &self.description {
            map.insert("description".into(), Value::String(description.clone()));
        }
        if self.trim {
            map.insert("trim".into(), Value::Bool(true));
        }
        if let Some(regex) = &self.regex {
            map.insert("regex".into(), Value::String(regex.clone()));
        }
        if let Some(replace) = &self.regex_replace {
            let mut inner = Mapping::new();
            inner.insert("regex".into(), Value::String(replace.regex.clone()));
            if let Some(to) = &replace.to {
                inner.insert("to".into(), Value::String(to.clone()));
            }
            map.insert("regex_replace".into(), Value::Mapping(inner));
        }
        if let Some(on_empty) = &self.on_empty {
            let mut inner = Mapping::new();
            if let Some(assign) = &on_empty.assign {
                inner.insert("assign".into(), Value::String(assign.clone()));
            }
            inner.insert("fail".into(), Value::Bool(on_empty.fail));
            inner.insert("warn".into(), Value::Bool(on_empty.warn));
            map.insert("on_empty".into(), Value::Mapping(inner));
        }
        Value::Mapping(map)
    }
}

/// The six parameters every pipeline carries. Users may re-declare them to
/// override defaults but cannot remove them.
pub fn builtin_parameters() -> Vec<ParamSchema> {
    let mut update = ParamSchema::new(
        "UPDATE_PARAMETERS".to_string(),
        false,
        ParamType::Boolean,
    );
    update.default = Some("false".to_string());
    update.description =
        Some("Re-install the build parameters from the settings file and stop.".to_string());

    let mut branch = ParamSchema::new(
        "SETTINGS_GIT_BRANCH".to_string(),
        false,
        ParamType::String,
    );
    branch.default = Some("main".to_string());
    branch.regex = Some(r"[A-Za-z0-9._/-]+".to_string());
    branch.description = Some("Branch of the settings repository to load.".to_string());

    let node_name = ParamSchema::new("NODE_NAME".to_string(), false, ParamType::String);

    let mut node_tag = ParamSchema::new("NODE_TAG".to_string(), false, ParamType::String);
    node_tag.default = Some("ansible210".to_string());

    let mut dry_run = ParamSchema::new("DRY_RUN".to_string(), false, ParamType::Boolean);
    dry_run.default = Some("false".to_string());

    let mut debug_mode = ParamSchema::new("DEBUG_MODE".to_string(), false, ParamType::Boolean);
    debug_mode.default = Some("false".to_string());

    vec![update, branch, node_name, node_tag, dry_run, debug_mode]
}

/// Overlay the built-in parameters with the user schema. A user
/// re-declaration replaces the built-in entry in place; new user
/// parameters follow the built-ins in declaration order.
pub fn merge_with_builtins(user: Vec<ParamSchema>) -> Vec<ParamSchema> {
    let mut merged = builtin_parameters();
    for param in user {
        if let Some(slot) = merged.iter_mut().find(|b| b.name == param.name) {
            *slot = param;
        } else {
            merged.push(param);
        }
    }
    merged
}

/// Validate the `parameters.required` and `parameters.optional` lists.
/// Every problem is reported; the returned schemas cover the parameters
/// that validated cleanly. The pass succeeds iff the report carries no
/// errors.
pub fn validate_schema(
    required: &[Value],
    optional: &[Value],
) -> (Vec<ParamSchema>, ValidationReport) {
    let mut report = ValidationReport::default();
    let mut schemas = Vec::new();
    let mut seen = BTreeSet::new();

    for (list, is_required) in [(required, true), (optional, false)] {
        for (idx, raw) in list.iter().enumerate() {
            let section = if is_required { "required" } else { "optional" };
            match validate_param(raw, is_required, &mut report) {
                Some(schema) => {
                    if !seen.insert(schema.name.clone()) {
                        report.error(format!(
                            "Duplicate parameter name '{}' in {} list",
                            schema.name, section
                        ));
                    } else {
                        schemas.push(schema);
                    }
                }
                None => report.debug(format!(
                    "Parameter {} #{} failed validation",
                    section,
                    idx + 1
                )),
            }
        }
    }

    (schemas, report)
}

fn validate_param(
    raw: &Value,
    required: bool,
    report: &mut ValidationReport,
) -> Option<ParamSchema> {
    let Value::Mapping(map) = raw else {
        report.error("Parameter entry is not a mapping");
        return None;
    };

    let name = match map.get("name").and_then(coerce_to_string) {
        Some(name) if IDENT_RE.is_match(&name) => name,
        Some(name) => {
            report.error(format!(
                "Parameter name '{name}' is not a valid shell identifier"
            ));
            return None;
        }
        None => {
            report.error("Parameter has no usable 'name' key");
            return None;
        }
    };

    let before = report.errors.len();

    let default = map.get("default");
    let choices = map.get("choices");

    let ptype = resolve_type(&name, map, default, choices, report)?;

    let mut schema = ParamSchema::new(name.clone(), required, ptype);

    if let Some(default) = default {
        if choices.is_some() {
            report.error(format!(
                "Parameter '{name}': 'default' and 'choices' keys are mutually exclusive"
            ));
        }
        match ptype {
            ParamType::Boolean => match coerce_to_bool(default) {
                Some(b) => schema.default = Some(b.to_string()),
                None => report.error(format!(
                    "Parameter '{name}': boolean parameter has non-boolean default"
                )),
            },
            _ => match coerce_to_string(default) {
                Some(s) => schema.default = Some(s),
                None => report.error(format!(
                    "Parameter '{name}': 'default' is not a scalar value"
                )),
            },
        }
    }

    if let Some(choices) = choices {
        if ptype != ParamType::Choice {
            report.error(format!(
                "Parameter '{name}': 'choices' key is only valid for choice parameters"
            ));
        }
        match choices {
            Value::Sequence(items) => {
                let mut collected = Vec::with_capacity(items.len());
                for item in items {
                    match coerce_to_string(item) {
                        Some(s) => collected.push(s),
                        None => report.error(format!(
                            "Parameter '{name}': choice entries must be scalar"
                        )),
                    }
                }
                schema.choices = Some(collected);
            }
            _ => report.error(format!("Parameter '{name}': 'choices' is not a list")),
        }
    } else if ptype == ParamType::Choice {
        report.error(format!(
            "Parameter '{name}': choice parameter has no 'choices' key"
        ));
    }

    if let Some(description) = map.get("description") {
        schema.description = coerce_to_string(description);
    }

    if let Some(trim) = map.get("trim") {
        match coerce_to_bool(trim) {
            Some(b) => schema.trim = b,
            None => report.error(format!("Parameter '{name}': 'trim' is not a boolean")),
        }
    }

    if let Some(regex) = map.get("regex") {
        match concat_string_or_list(regex) {
            Some(pattern) => {
                if let Err(err) = Regex::new(&pattern) {
                    report.error(format!("Parameter '{name}': invalid regex: {err}"));
                } else {
                    schema.regex = Some(pattern);
                }
            }
            None => report.error(format!(
                "Parameter '{name}': 'regex' must be a string or a list of strings"
            )),
        }
    }

    if let Some(replace) = map.get("regex_replace") {
        schema.regex_replace = validate_regex_replace(&name, replace, report);
    }

    if let Some(on_empty) = map.get("on_empty") {
        schema.on_empty = validate_on_empty(&name, on_empty, report);
    }

    (report.errors.len() == before).then_some(schema)
}

fn resolve_type(
    name: &str,
    map: &Mapping,
    default: Option<&Value>,
    choices: Option<&Value>,
    report: &mut ValidationReport,
) -> Option<ParamType> {
    if let Some(raw) = map.get("type") {
        let Some(s) = coerce_to_string(raw) else {
            report.error(format!("Parameter '{name}': 'type' is not a string"));
            return None;
        };
        match ParamType::parse(&s) {
            Some(t) => return Some(t),
            None => {
                report.error(format!("Parameter '{name}': unknown type '{s}'"));
                return None;
            }
        }
    }

    // Auto-typing: a boolean default or a choices list identifies the type
    // when the 'type' key was left out.
    if let Some(default) = default
        && matches!(default, Value::Bool(_))
    {
        report.warning(format!(
            "Parameter '{name}': 'type' key is not defined, but was detected by 'default' key: boolean"
        ));
        return Some(ParamType::Boolean);
    }
    if let Some(choices) = choices
        && is_list(choices)
    {
        report.warning(format!(
            "Parameter '{name}': 'type' key is not defined, but was detected by 'choices' key: choice"
        ));
        return Some(ParamType::Choice);
    }

    report.error(format!(
        "Parameter '{name}': 'type' key is missing and cannot be detected"
    ));
    None
}

fn validate_regex_replace(
    name: &str,
    raw: &Value,
    report: &mut ValidationReport,
) -> Option<RegexReplace> {
    let Value::Mapping(map) = raw else {
        report.error(format!("Parameter '{name}': 'regex_replace' is not a mapping"));
        return None;
    };
    let Some(pattern) = map.get("regex").and_then(coerce_to_string) else {
        report.error(format!(
            "Parameter '{name}': 'regex_replace' has no usable 'regex' key"
        ));
        return None;
    };
    if let Err(err) = Regex::new(&pattern) {
        report.error(format!(
            "Parameter '{name}': invalid regex_replace pattern: {err}"
        ));
        return None;
    }
    let to = map.get("to").and_then(coerce_to_string);
    Some(RegexReplace { regex: pattern, to })
}

fn validate_on_empty(name: &str, raw: &Value, report: &mut ValidationReport) -> Option<OnEmpty> {
    let Value::Mapping(map) = raw else {
        report.error(format!("Parameter '{name}': 'on_empty' is not a mapping"));
        return None;
    };

    let mut on_empty = OnEmpty::default();

    if let Some(assign) = map.get("assign") {
        match coerce_to_string(assign) {
            Some(s) => {
                if let Some(var) = s.strip_prefix('$') {
                    let var = var.trim_start_matches('{').trim_end_matches('}');
                    if !IDENT_RE.is_match(var) {
                        report.error(format!(
                            "Parameter '{name}': on_empty assign references invalid variable '{s}'"
                        ));
                        return None;
                    }
                }
                on_empty.assign = Some(s);
            }
            None => {
                report.error(format!(
                    "Parameter '{name}': on_empty 'assign' is not a scalar"
                ));
                return None;
            }
        }
    }

    if let Some(fail) = map.get("fail") {
        match coerce_to_bool(fail) {
            Some(b) => on_empty.fail = b,
            None => report.error(format!(
                "Parameter '{name}': on_empty 'fail' is not a boolean"
            )),
        }
    }
    if let Some(warn) = map.get("warn") {
        match coerce_to_bool(warn) {
            Some(b) => on_empty.warn = b,
            None => report.error(format!(
                "Parameter '{name}': on_empty 'warn' is not a boolean"
            )),
        }
    }

    Some(on_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(yaml: &str) -> Vec<Value> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn valid_string_parameter_passes() {
        let raw = params("[{name: TARGET, type: string, default: web}]");
        let (schemas, report) = validate_schema(&raw, &[]);
        assert!(report.is_ok());
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "TARGET");
        assert_eq!(schemas[0].ptype, ParamType::String);
        assert_eq!(schemas[0].default.as_deref(), Some("web"));
        assert!(schemas[0].required);
    }

    #[test]
    fn invalid_identifier_is_an_error() {
        let raw = params("[{name: \"2BAD-NAME\", type: string}]");
        let (schemas, report) = validate_schema(&raw, &[]);
        assert!(!report.is_ok());
        assert!(schemas.is_empty());
    }

    #[test]
    fn choices_auto_type_warns_and_infers() {
        let raw = params("[{name: FLAVOR, choices: [a, b]}]");
        let (schemas, report) = validate_schema(&raw, &[]);
        assert!(report.is_ok());
        assert_eq!(schemas[0].ptype, ParamType::Choice);
        assert!(report.warnings.iter().any(|w| {
            w.contains("type' key is not defined, but was detected by 'choices' key: choice")
        }));
    }

    #[test]
    fn boolean_default_auto_type_warns_and_infers() {
        let raw = params("[{name: VERBOSE, default: true}]");
        let (schemas, report) = validate_schema(&raw, &[]);
        assert!(report.is_ok());
        assert_eq!(schemas[0].ptype, ParamType::Boolean);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn missing_type_without_hint_is_an_error() {
        let raw = params("[{name: MYSTERY}]");
        let (_, report) = validate_schema(&raw, &[]);
        assert!(!report.is_ok());
    }

    #[test]
    fn default_and_choices_are_mutually_exclusive() {
        let raw = params("[{name: BOTH, type: choice, choices: [a], default: a}]");
        let (_, report) = validate_schema(&raw, &[]);
        assert!(!report.is_ok());
    }

    #[test]
    fn boolean_with_string_default_is_an_error() {
        let raw = params("[{name: FLAG, type: boolean, default: maybe}]");
        let (_, report) = validate_schema(&raw, &[]);
        assert!(!report.is_ok());
    }

    #[test]
    fn choice_without_choices_is_an_error() {
        let raw = params("[{name: PICK, type: choice}]");
        let (_, report) = validate_schema(&raw, &[]);
        assert!(!report.is_ok());
    }

    #[test]
    fn regex_list_concatenates() {
        let raw = params("[{name: VER, type: string, regex: [\"^v\", \"[0-9]+\", \"$\"]}]");
        let (schemas, report) = validate_schema(&raw, &[]);
        assert!(report.is_ok());
        assert_eq!(schemas[0].regex.as_deref(), Some("^v[0-9]+$"));
    }

    #[test]
    fn on_empty_invalid_assign_variable_is_an_error() {
        let raw = params("[{name: P, type: string, on_empty: {assign: \"$9bad\"}}]");
        let (_, report) = validate_schema(&raw, &[]);
        assert!(!report.is_ok());
    }

    #[test]
    fn duplicate_names_are_an_error() {
        let raw = params("[{name: DUP, type: string}, {name: DUP, type: string}]");
        let (schemas, report) = validate_schema(&raw, &[]);
        assert!(!report.is_ok());
        assert_eq!(schemas.len(), 1);
    }

    #[test]
    fn auto_typing_is_idempotent() {
        let raw = params("[{name: FLAVOR, choices: [a, b], trim: true}]");
        let (first, report) = validate_schema(&raw, &[]);
        assert!(report.is_ok());

        let declared: Vec<Value> = first.iter().map(ParamSchema::to_declaration).collect();
        let (second, report) = validate_schema(&declared, &[]);
        assert!(report.is_ok());
        assert!(report.warnings.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn builtins_cover_the_fixed_set() {
        let names: Vec<String> = builtin_parameters().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "UPDATE_PARAMETERS",
                "SETTINGS_GIT_BRANCH",
                "NODE_NAME",
                "NODE_TAG",
                "DRY_RUN",
                "DEBUG_MODE"
            ]
        );
    }

    #[test]
    fn user_redeclaration_overrides_builtin() {
        let mut custom = ParamSchema::new("NODE_TAG".to_string(), false, ParamType::String);
        custom.default = Some("podman".to_string());
        let merged = merge_with_builtins(vec![custom]);
        let node_tag = merged.iter().find(|p| p.name == "NODE_TAG").unwrap();
        assert_eq!(node_tag.default.as_deref(), Some("podman"));
        assert_eq!(merged.len(), builtin_parameters().len());
    }
}
