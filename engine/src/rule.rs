//! Rule Engine: topic/regex/condition matching.
//!
//! Grounded on `original_source/mqtt_flow/core/mqtt_rule.py::is_rule_matched`,
//! replacing its unsafe `eval()` with [`shared::expr::eval_condition`].

use regex::Regex;
use serde_json::Value as Json;
use shared::config::RuleSpec;
use shared::expr::{eval_condition, Bindings};
use shared::topic::match_topic;
use tracing::warn;

pub struct Rule {
    pub rule_name: String,
    pub source_client_name: String,
    regex: Option<Regex>,
    topic: Option<String>,
    condition: Option<String>,
    pub task_name: String,
    pub queue_name: String,
}

impl Rule {
    pub fn from_spec(spec: &RuleSpec) -> Result<Self, shared::error::FlowError> {
        let regex = spec
            .regex
            .as_ref()
            .map(|r| Regex::new(r))
            .transpose()
            .map_err(|e| {
                shared::error::FlowError::Config(format!(
                    "rule '{}' has invalid regex: {e}",
                    spec.rule_name
                ))
            })?;

        Ok(Rule {
            rule_name: spec.rule_name.clone(),
            source_client_name: spec.source_client_name.clone(),
            regex,
            topic: spec.topic.clone(),
            condition: spec.condition.clone(),
            task_name: spec.task.name.clone(),
            queue_name: spec.task.queue_name.clone(),
        })
    }

    /// True iff the topic filter passes and, when a condition is set, it
    /// evaluates truthy. Condition evaluation errors are caught and reported
    /// as non-match.
    pub fn is_matched(&self, topic: &str, payload: &Json) -> bool {
        if !match_topic(topic, self.regex.as_ref(), self.topic.as_deref()) {
            return false;
        }

        if let Some(condition) = &self.condition {
            let bindings = Bindings { topic, payload };
            match eval_condition(condition, &bindings) {
                Ok(matched) => return matched,
                Err(e) => {
                    warn!(
                        rule = %self.rule_name,
                        condition = %condition,
                        error = %e,
                        "error evaluating rule condition"
                    );
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(regex: Option<&str>, topic: Option<&str>, condition: Option<&str>) -> Rule {
        let spec = RuleSpec {
            rule_name: "r".into(),
            source_client_name: "a".into(),
            regex: regex.map(String::from),
            topic: topic.map(String::from),
            condition: condition.map(String::from),
            task: shared::config::RuleTarget { name: "relay".into(), queue_name: "q".into() },
        };
        Rule::from_spec(&spec).unwrap()
    }

    #[test]
    fn regex_match_dispatches_relay() {
        let r = rule(Some("^sens/.*$"), None, None);
        assert!(r.is_matched("sens/temp", &json!("21")));
        assert!(!r.is_matched("other/temp", &json!("21")));
    }

    #[test]
    fn both_regex_and_topic_must_hold_when_both_set() {
        let r = rule(Some("^ctl/.*$"), Some("ctl/x"), None);
        assert!(r.is_matched("ctl/x", &json!(null)));
        assert!(!r.is_matched("ctl/y", &json!(null)));
    }

    #[test]
    fn condition_gate_filters_by_payload_field() {
        let r = rule(None, Some("ctl/x"), Some("payload.level > 5"));
        assert!(r.is_matched("ctl/x", &json!({"level": 6})));
        assert!(!r.is_matched("ctl/x", &json!({"level": 3})));
    }

    #[test]
    fn condition_error_is_non_match() {
        let r = rule(None, None, Some("payload.undef.attr"));
        assert!(!r.is_matched("t", &json!("a string payload")));
    }

    #[test]
    fn no_filter_is_trivially_true() {
        let r = rule(None, None, None);
        assert!(r.is_matched("anything", &json!(null)));
    }
}
