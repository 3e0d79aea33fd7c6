use serde_yaml::Value;

/// Render a YAML scalar as a string. Numeric and boolean scalars coerce;
/// maps, sequences and nulls do not.
pub fn coerce_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read a YAML scalar as a boolean. The strings "true"/"false" coerce,
/// case-insensitively, matching the loader's scalar rules.
pub fn coerce_to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn is_list(value: &Value) -> bool {
    value.is_sequence()
}

/// Flatten a string-or-list-of-strings node into one string. Sequences are
/// concatenated in order, which is how multi-line regex patterns are
/// assembled from the settings file.
pub fn concat_string_or_list(value: &Value) -> Option<String> {
    match value {
        Value::Sequence(items) => {
            let mut out = String::new();
            for item in items {
                out.push_str(&coerce_to_string(item)?);
            }
            Some(out)
        }
        other => coerce_to_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn numeric_scalars_coerce_to_string() {
        assert_eq!(coerce_to_string(&yaml("42")), Some("42".to_string()));
        assert_eq!(coerce_to_string(&yaml("4.5")), Some("4.5".to_string()));
        assert_eq!(coerce_to_string(&yaml("true")), Some("true".to_string()));
        assert_eq!(coerce_to_string(&yaml("[1, 2]")), None);
    }

    #[test]
    fn bool_strings_coerce() {
        assert_eq!(coerce_to_bool(&yaml("true")), Some(true));
        assert_eq!(coerce_to_bool(&yaml("\"False\"")), Some(false));
        assert_eq!(coerce_to_bool(&yaml("\"yes\"")), None);
        assert_eq!(coerce_to_bool(&yaml("1")), None);
    }

    #[test]
    fn regex_lists_concatenate_in_order() {
        let value = yaml("[\"^release-\", \"[0-9]+\", \"$\"]");
        assert_eq!(
            concat_string_or_list(&value),
            Some("^release-[0-9]+$".to_string())
        );
        assert_eq!(
            concat_string_or_list(&yaml("\"plain\"")),
            Some("plain".to_string())
        );
    }
}
