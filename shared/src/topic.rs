//! Topic formatter pipeline and topic-filter matching.
//!
//! Mirrors the `format_topic`/`match_topic` helpers the rule engine and the
//! persistence rewrite rely on: a topic formatter is an ordered edit applied
//! to a topic string, and exactly one branch fires per record.

use serde::{Deserialize, Serialize};

/// One edit step in a topic formatter pipeline.
///
/// Only the first matching branch fires, in the order: `prefix`, `suffix`,
/// `remove_prefix`, `remove_suffix`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicFormatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_suffix: Option<String>,
}

/// Apply an ordered pipeline of formatters to `topic`.
pub fn format_topic(topic: &str, formatters: &[TopicFormatter]) -> String {
    let mut topic = topic.to_string();

    for formatter in formatters {
        if let Some(prefix) = formatter.prefix.as_deref().filter(|p| !p.is_empty()) {
            topic = format!("{prefix}/{topic}");
        } else if let Some(suffix) = formatter.suffix.as_deref().filter(|s| !s.is_empty()) {
            topic = format!("{topic}/{suffix}");
        } else if let Some(remove_prefix) = formatter.remove_prefix.as_deref() {
            if !remove_prefix.is_empty() && topic.starts_with(remove_prefix) {
                topic = topic[remove_prefix.len()..].trim_start_matches('/').to_string();
            }
        } else if let Some(remove_suffix) = formatter.remove_suffix.as_deref() {
            if !remove_suffix.is_empty() && topic.ends_with(remove_suffix) {
                let end = topic.len() - remove_suffix.len();
                topic = topic[..end].trim_end_matches('/').to_string();
            }
        }
    }

    topic
}

/// Topic-filter test shared by rule matching and the rule-aware persistence rewrite:
/// if `regex` is given it must match (anchored at the start); if `topic` is given it
/// must equal exactly; if neither is given the filter is trivially true.
pub fn match_topic(source_topic: &str, regex: Option<&regex::Regex>, topic: Option<&str>) -> bool {
    if let Some(regex) = regex {
        if regex.find(source_topic).map(|m| m.start()) != Some(0) {
            return false;
        }
    }

    if let Some(topic) = topic {
        if topic != source_topic {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(prefix: Option<&str>, suffix: Option<&str>, rp: Option<&str>, rs: Option<&str>) -> TopicFormatter {
        TopicFormatter {
            prefix: prefix.map(String::from),
            suffix: suffix.map(String::from),
            remove_prefix: rp.map(String::from),
            remove_suffix: rs.map(String::from),
        }
    }

    #[test]
    fn relay_pipeline_strips_and_adds_prefix() {
        let pipeline = vec![
            fmt(None, None, Some("sens"), None),
            fmt(Some("out"), None, None, None),
        ];
        assert_eq!(format_topic("sens/temp", &pipeline), "out/temp");
    }

    #[test]
    fn prefix_and_suffix_are_separate_records() {
        let pipeline = vec![fmt(Some("a"), None, None, None), fmt(None, Some("b"), None, None)];
        assert_eq!(format_topic("x", &pipeline), "a/x/b");
    }

    #[test]
    fn remove_prefix_strips_leading_slash() {
        let pipeline = vec![fmt(None, None, Some("sens"), None)];
        assert_eq!(format_topic("sens/temp", &pipeline), "temp");
        assert_eq!(format_topic("other/temp", &pipeline), "other/temp");
    }

    #[test]
    fn remove_suffix_strips_trailing_slash() {
        let pipeline = vec![fmt(None, None, None, Some("raw"))];
        assert_eq!(format_topic("sens/temp/raw", &pipeline), "sens/temp");
    }

    #[test]
    fn round_trip_paired_prefix_remove_prefix() {
        let topic = "sens/temp";
        let forward = vec![fmt(Some("out"), None, None, None)];
        let inverse = vec![fmt(None, None, Some("out"), None)];
        let formatted = format_topic(topic, &forward);
        assert_eq!(format_topic(&formatted, &inverse), topic);
    }

    #[test]
    fn match_topic_requires_both_regex_and_exact_when_both_set() {
        let re = regex::Regex::new(r"^sens/.*$").unwrap();
        assert!(match_topic("sens/temp", Some(&re), Some("sens/temp")));
        assert!(!match_topic("sens/temp", Some(&re), Some("sens/other")));
    }

    #[test]
    fn match_topic_trivially_true_with_no_filter() {
        assert!(match_topic("anything", None, None));
    }
}
