//! Transition conditions.
//!
//! Each transition carries a `condition_config` tagged by `type`. Conditions
//! are evaluated against the flow scope and the contact's latest reply.

use crate::flows::context::{is_truthy, loosely_equal, Scope};
use crate::messages::inbound::InboundMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Condition attached to a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    /// Always matches.
    AlwaysTrue,
    /// Variable (dotted path) is present and truthy.
    VariableExists { variable_name: String },
    /// Variable is absent or falsy.
    VariableNotExists { variable_name: String },
    /// Variable's value equals the literal (compared as text).
    VariableEquals { variable_name: String, value: Value },
    /// Last interactive reply carried this button/row id.
    InteractiveReplyIdEquals { value: String },
    /// Last interactive reply id is one of the listed ids.
    InteractiveReplyIdIn { values: Vec<String> },
    /// Last free-text reply equals the value.
    UserReplyEquals {
        value: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Last free-text reply contains the keyword.
    UserReplyContainsKeyword {
        keyword: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Last free-text reply matches the regex.
    UserReplyMatchesRegex { regex: String },
    /// Any kind this engine does not know. Never matches.
    #[serde(other)]
    Unknown,
}

impl ConditionConfig {
    /// Condition kind as written in flow definitions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlwaysTrue => "always_true",
            Self::VariableExists { .. } => "variable_exists",
            Self::VariableNotExists { .. } => "variable_not_exists",
            Self::VariableEquals { .. } => "variable_equals",
            Self::InteractiveReplyIdEquals { .. } => "interactive_reply_id_equals",
            Self::InteractiveReplyIdIn { .. } => "interactive_reply_id_in",
            Self::UserReplyEquals { .. } => "user_reply_equals",
            Self::UserReplyContainsKeyword { .. } => "user_reply_contains_keyword",
            Self::UserReplyMatchesRegex { .. } => "user_reply_matches_regex",
            Self::Unknown => "unknown",
        }
    }
}

/// Evaluate a condition. Never fails; unknown kinds and bad regexes are
/// treated as non-matching.
pub fn evaluate(
    condition: &ConditionConfig,
    scope: &Scope<'_>,
    reply: Option<&InboundMessage>,
) -> bool {
    match condition {
        ConditionConfig::AlwaysTrue => true,
        ConditionConfig::VariableExists { variable_name } => {
            scope.lookup(variable_name).is_some_and(is_truthy)
        }
        ConditionConfig::VariableNotExists { variable_name } => {
            !scope.lookup(variable_name).is_some_and(is_truthy)
        }
        ConditionConfig::VariableEquals {
            variable_name,
            value,
        } => scope
            .lookup(variable_name)
            .is_some_and(|actual| loosely_equal(actual, value)),
        ConditionConfig::InteractiveReplyIdEquals { value } => reply
            .and_then(InboundMessage::interactive_id)
            .is_some_and(|id| id == value),
        ConditionConfig::InteractiveReplyIdIn { values } => reply
            .and_then(InboundMessage::interactive_id)
            .is_some_and(|id| values.iter().any(|v| v == id)),
        ConditionConfig::UserReplyEquals {
            value,
            case_sensitive,
        } => reply_text(reply).is_some_and(|text| {
            let text = text.trim();
            if *case_sensitive {
                text == value
            } else {
                text.to_lowercase() == value.to_lowercase()
            }
        }),
        ConditionConfig::UserReplyContainsKeyword {
            keyword,
            case_sensitive,
        } => reply_text(reply).is_some_and(|text| {
            if *case_sensitive {
                text.contains(keyword.as_str())
            } else {
                text.to_lowercase().contains(&keyword.to_lowercase())
            }
        }),
        ConditionConfig::UserReplyMatchesRegex { regex } => match regex::Regex::new(regex) {
            Ok(re) => reply_text(reply).is_some_and(|text| re.is_match(text)),
            Err(e) => {
                warn!(regex = %regex, error = %e, "invalid regex in transition condition");
                false
            }
        },
        ConditionConfig::Unknown => {
            warn!("unknown condition type in transition; treating as non-matching");
            false
        }
    }
}

fn reply_text(reply: Option<&InboundMessage>) -> Option<&str> {
    reply.and_then(InboundMessage::text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::context::Context;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap_or_default()
    }

    fn condition(value: Value) -> ConditionConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_always_true() {
        let vars = Context::new();
        assert!(evaluate(&ConditionConfig::AlwaysTrue, &Scope::new(&vars), None));
    }

    #[test]
    fn test_variable_exists_on_list_index() {
        let cond = condition(json!({"type": "variable_exists", "variable_name": "product_options.0"}));

        let empty = ctx(json!({"product_options": []}));
        assert!(!evaluate(&cond, &Scope::new(&empty), None));

        let filled = ctx(json!({"product_options": [{"sku": "A"}]}));
        assert!(evaluate(&cond, &Scope::new(&filled), None));
    }

    #[test]
    fn test_variable_exists_rejects_blank() {
        let cond = condition(json!({"type": "variable_exists", "variable_name": "business_type"}));
        assert!(!evaluate(&cond, &Scope::new(&ctx(json!({"business_type": ""}))), None));
        assert!(!evaluate(&cond, &Scope::new(&Context::new()), None));

        let not = condition(json!({"type": "variable_not_exists", "variable_name": "business_type"}));
        assert!(evaluate(&not, &Scope::new(&Context::new()), None));
    }

    #[test]
    fn test_variable_equals() {
        let vars = ctx(json!({"business_type": "retail", "count": 5}));
        let scope = Scope::new(&vars);
        let retail = condition(json!({"type": "variable_equals", "variable_name": "business_type", "value": "retail"}));
        let other = condition(json!({"type": "variable_equals", "variable_name": "business_type", "value": "other"}));
        let numeric = condition(json!({"type": "variable_equals", "variable_name": "count", "value": "5"}));
        assert!(evaluate(&retail, &scope, None));
        assert!(!evaluate(&other, &scope, None));
        assert!(evaluate(&numeric, &scope, None));
    }

    #[test]
    fn test_interactive_reply_id() {
        let vars = Context::new();
        let scope = Scope::new(&vars);
        let reply = InboundMessage::interactive("2637", "urgent_very", "Very Urgent");
        let cond = condition(json!({"type": "interactive_reply_id_equals", "value": "urgent_very"}));
        assert!(evaluate(&cond, &scope, Some(&reply)));
        assert!(!evaluate(&cond, &scope, Some(&InboundMessage::text_message("2637", "urgent_very"))));
        assert!(!evaluate(&cond, &scope, None));

        let any = condition(json!({"type": "interactive_reply_id_in", "values": ["a", "urgent_very"]}));
        assert!(evaluate(&any, &scope, Some(&reply)));
    }

    #[test]
    fn test_keyword_case_sensitivity() {
        let vars = Context::new();
        let scope = Scope::new(&vars);
        let reply = InboundMessage::text_message("2637", "I need a ZIMRA device");

        let insensitive = condition(json!({"type": "user_reply_contains_keyword", "keyword": "zimra"}));
        let sensitive = condition(json!({"type": "user_reply_contains_keyword", "keyword": "zimra", "case_sensitive": true}));
        assert!(evaluate(&insensitive, &scope, Some(&reply)));
        assert!(!evaluate(&sensitive, &scope, Some(&reply)));
    }

    #[test]
    fn test_reply_equals_and_regex() {
        let vars = Context::new();
        let scope = Scope::new(&vars);
        let reply = InboundMessage::text_message("2637", " Yes ");
        assert!(evaluate(&condition(json!({"type": "user_reply_equals", "value": "yes"})), &scope, Some(&reply)));
        assert!(evaluate(&condition(json!({"type": "user_reply_matches_regex", "regex": "(?i)^\\s*y"})), &scope, Some(&reply)));
        assert!(!evaluate(&condition(json!({"type": "user_reply_matches_regex", "regex": "("})), &scope, Some(&reply)));
    }

    #[test]
    fn test_unknown_kind_never_matches() {
        let cond = condition(json!({"type": "moon_is_full", "phase": 3}));
        assert_eq!(cond, ConditionConfig::Unknown);
        assert!(!evaluate(&cond, &Scope::new(&Context::new()), None));
    }
}
