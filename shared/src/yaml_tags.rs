//! Resolution of the `!VAR` and `!ENV` custom YAML tags.
//!
//! `serde_yaml` has no hook for custom tag constructors (unlike PyYAML's
//! `add_constructor`), so this runs as an explicit pre-pass over the raw
//! `serde_yaml::Value` tree before the document is deserialized into the
//! configuration record: every `Value::Tagged` node carrying one of these two
//! tags is rewritten in place into the plain scalar it resolves to.

use regex::Regex;
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;

use crate::error::FlowError;

/// Walk `value` and resolve every `!VAR`/`!ENV` tagged node, using `vars` as the
/// substitution map for `!VAR`. Mutates nothing outside the tree; returns a new
/// value with every tag resolved.
pub fn resolve_tags(value: Value, vars: &HashMap<String, String>) -> Result<Value, FlowError> {
    match value {
        Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            let scalar = scalar_string(&tagged.value)?;
            match tag.as_str() {
                "!VAR" => Ok(Value::String(interpolate(&scalar, vars)?)),
                "!ENV" => Ok(Value::String(resolve_env(&scalar)?)),
                other => Err(FlowError::Config(format!("unknown YAML tag '{other}'"))),
            }
        }
        Value::Sequence(items) => {
            let resolved = items
                .into_iter()
                .map(|v| resolve_tags(v, vars))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Sequence(resolved))
        }
        Value::Mapping(map) => {
            let mut resolved = serde_yaml::Mapping::new();
            for (k, v) in map {
                let k = resolve_tags(k, vars)?;
                let v = resolve_tags(v, vars)?;
                resolved.insert(k, v);
            }
            Ok(Value::Mapping(resolved))
        }
        other => Ok(other),
    }
}

fn scalar_string(value: &Value) -> Result<String, FlowError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(FlowError::Config(format!(
            "expected a scalar under a !VAR/!ENV tag, found {other:?}"
        ))),
    }
}

/// Replace every `{NAME}` placeholder in `value` using `vars`. An unknown
/// variable is a configuration error, matching the original loader's
/// `ValueError("Unknown variable: ...")`.
fn interpolate(value: &str, vars: &HashMap<String, String>) -> Result<String, FlowError> {
    let placeholder = Regex::new(r"\{(\w+)\}").unwrap();
    let mut error = None;

    let result = placeholder.replace_all(value, |caps: &regex::Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(v) => v.clone(),
            None => {
                error = Some(name.to_string());
                String::new()
            }
        }
    });

    match error {
        Some(name) => Err(FlowError::Config(format!("unknown variable: {name}"))),
        None => Ok(result.into_owned()),
    }
}

/// `!ENV NAME` or `!ENV NAME default` — read `NAME` from the process
/// environment, falling back to `default` (the remainder of the scalar after
/// the first whitespace run) when unset.
fn resolve_env(spec: &str) -> Result<String, FlowError> {
    let mut parts = spec.splitn(2, char::is_whitespace);
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FlowError::Config("!ENV tag requires a variable name".to_string()))?;
    let default = parts.next().map(str::trim);

    match env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => default.map(str::to_string).ok_or_else(|| {
            FlowError::Config(format!("environment variable '{name}' is not set and no default was given"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_tag_interpolates_from_map() {
        let mut vars = HashMap::new();
        vars.insert("HOST".to_string(), "broker.local".to_string());
        let doc: Value = serde_yaml::from_str("server: !VAR '{HOST}'").unwrap();
        let resolved = resolve_tags(doc, &vars).unwrap();
        assert_eq!(resolved.get("server").unwrap().as_str(), Some("broker.local"));
    }

    #[test]
    fn var_tag_unknown_variable_is_config_error() {
        let vars = HashMap::new();
        let doc: Value = serde_yaml::from_str("server: !VAR '{HOST}'").unwrap();
        assert!(resolve_tags(doc, &vars).is_err());
    }

    #[test]
    fn env_tag_uses_default_when_unset() {
        let vars = HashMap::new();
        let doc: Value = serde_yaml::from_str("port: !ENV 'DEFINITELY_UNSET_VAR_XYZ 1883'").unwrap();
        let resolved = resolve_tags(doc, &vars).unwrap();
        assert_eq!(resolved.get("port").unwrap().as_str(), Some("1883"));
    }

    #[test]
    fn env_tag_without_default_and_unset_is_config_error() {
        let vars = HashMap::new();
        let doc: Value = serde_yaml::from_str("port: !ENV 'DEFINITELY_UNSET_VAR_XYZ'").unwrap();
        assert!(resolve_tags(doc, &vars).is_err());
    }
}
