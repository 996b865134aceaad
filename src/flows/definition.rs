//! Flow definition types.
//!
//! A flow is a named, versioned graph of steps. Definitions are plain data
//! loaded from JSON5 files; each step's `config` is decoded into a typed
//! configuration according to the step's `type`.

use crate::flows::condition::ConditionConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Errors raised while loading or validating flow definitions.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("flow '{flow}' v{version} is defined more than once")]
    DuplicateFlow { flow: String, version: u32 },
    #[error("flow '{flow}': step '{step}' is defined more than once")]
    DuplicateStep { flow: String, step: String },
    #[error("flow '{flow}': expected exactly one entry point, found {count}")]
    EntryPoint { flow: String, count: usize },
    #[error("flow '{flow}': step '{step}' transitions to unknown step '{target}'")]
    UnknownStep {
        flow: String,
        step: String,
        target: String,
    },
    #[error("flow '{flow}': step '{step}' references unknown flow '{target}'")]
    UnknownFlow {
        flow: String,
        step: String,
        target: String,
    },
    #[error("flow '{flow}': step '{step}' switches flow without a target_flow_name")]
    MissingFlowTarget { flow: String, step: String },
    #[error("flow '{flow}': step '{step}' is unreachable from the entry point")]
    Unreachable { flow: String, step: String },
    #[error("flow '{flow}': step '{step}' has no outgoing transitions")]
    DeadEnd { flow: String, step: String },
    #[error("flow '{flow}': step '{step}' has an invalid regex '{regex}': {reason}")]
    InvalidRegex {
        flow: String,
        step: String,
        regex: String,
        reason: String,
    },
}

/// A flow definition as written by authors.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Words that start this flow for a contact with no active flow.
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

/// One step of a flow.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct StepDefinition {
    pub name: String,
    pub is_entry_point: bool,
    pub kind: StepKind,
    /// Outgoing edges, in declaration order.
    pub transitions: Vec<Transition>,
}

impl StepDefinition {
    /// Step type as written in definitions.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Whether the step ends processing of its flow by itself.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            StepKind::EndFlow(_) | StepKind::SwitchFlow(_) | StepKind::HumanHandover(_)
        )
    }

    /// Transitions sorted by ascending priority, ties kept in declaration order.
    pub fn ordered_transitions(&self) -> Vec<&Transition> {
        let mut ordered: Vec<&Transition> = self.transitions.iter().collect();
        ordered.sort_by_key(|t| t.priority);
        ordered
    }
}

/// Typed step behaviour.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Emit a message and move on.
    SendMessage { message_config: Value },
    /// Emit a message and wait for a reply.
    Question(QuestionConfig),
    /// Run actions and move on.
    Action(ActionConfig),
    /// Park the contact for a human agent.
    HumanHandover(HandoverConfig),
    /// Finish the run.
    EndFlow(EndFlowConfig),
    /// Hand the contact to another flow.
    SwitchFlow(SwitchFlowConfig),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::Question(_) => "question",
            Self::Action(_) => "action",
            Self::HumanHandover(_) => "human_handover",
            Self::EndFlow(_) => "end_flow",
            Self::SwitchFlow(_) => "switch_flow",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    transitions: Vec<Transition>,
    #[serde(default)]
    is_entry_point: bool,
}

impl TryFrom<RawStep> for StepDefinition {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let config = match raw.config {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let decode_err = |e: serde_json::Error| format!("step '{}': invalid {} config: {e}", raw.name, raw.step_type);
        let kind = match raw.step_type.as_str() {
            "send_message" => {
                // accept both the bare message and a `message_config` wrapper
                let message_config = match config.get("message_config") {
                    Some(inner) if config.get("message_type").is_none() => inner.clone(),
                    _ => config,
                };
                if !message_config.is_object() {
                    return Err(format!("step '{}': send_message config must be a map", raw.name));
                }
                StepKind::SendMessage { message_config }
            }
            "question" => StepKind::Question(serde_json::from_value(config).map_err(decode_err)?),
            "action" => StepKind::Action(serde_json::from_value(config).map_err(decode_err)?),
            "human_handover" => {
                StepKind::HumanHandover(serde_json::from_value(config).map_err(decode_err)?)
            }
            "end_flow" => StepKind::EndFlow(serde_json::from_value(config).map_err(decode_err)?),
            "switch_flow" => {
                StepKind::SwitchFlow(serde_json::from_value(config).map_err(decode_err)?)
            }
            other => return Err(format!("step '{}': unknown step type '{other}'", raw.name)),
        };
        Ok(Self {
            name: raw.name,
            is_entry_point: raw.is_entry_point,
            kind,
            transitions: raw.transitions,
        })
    }
}

/// Conditional edge to another step.
#[derive(Debug, Clone, Deserialize)]
pub struct Transition {
    pub to_step: String,
    /// Lower is evaluated first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_condition")]
    pub condition_config: ConditionConfig,
}

fn default_condition() -> ConditionConfig {
    ConditionConfig::AlwaysTrue
}

/// `question` step configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionConfig {
    pub message_config: Value,
    pub reply_config: ReplyConfig,
    #[serde(default)]
    pub fallback_config: Option<FallbackConfig>,
}

impl QuestionConfig {
    /// Configured fallback, or the default re-prompt policy.
    pub fn fallback(&self) -> FallbackConfig {
        self.fallback_config.clone().unwrap_or_default()
    }
}

/// How a reply is validated and where it is stored.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyConfig {
    pub save_to_variable: String,
    #[serde(default)]
    pub expected_type: ExpectedType,
    #[serde(default)]
    pub validation_regex: Option<String>,
}

/// Reply kinds a question can expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedType {
    #[default]
    Text,
    Email,
    Number,
    InteractiveId,
    Image,
}

/// What happens once a question's retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    #[default]
    RePrompt,
    SwitchFlow,
    EndFlow,
}

/// Invalid-reply policy for a question step.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub action: FallbackAction,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub re_prompt_message_text: Option<String>,
    #[serde(default)]
    pub target_flow_name: Option<String>,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            action: FallbackAction::RePrompt,
            max_retries: default_max_retries(),
            re_prompt_message_text: None,
            target_flow_name: None,
        }
    }
}

/// `action` step configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionConfig {
    #[serde(default)]
    pub actions_to_run: Vec<ActionItem>,
}

/// `human_handover` step configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandoverConfig {
    #[serde(default)]
    pub pre_handover_message_text: Option<String>,
    #[serde(default)]
    pub notification_details: Option<String>,
}

/// `end_flow` step configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndFlowConfig {
    #[serde(default)]
    pub message_config: Option<Value>,
}

/// `switch_flow` step configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchFlowConfig {
    pub target_flow_name: String,
    #[serde(default)]
    pub initial_context_template: Option<Map<String, Value>>,
    /// Stored as `trigger_keyword` in the new flow's context.
    #[serde(default)]
    pub trigger_keyword_to_pass: Option<String>,
}

/// One entry of an `actions_to_run` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawActionItem")]
pub struct ActionItem {
    pub kind: ActionKind,
    /// Abort the remaining actions and terminate the flow when this fails.
    pub fatal: bool,
}

/// Typed action operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    SetContextVariable {
        variable_name: String,
        value_template: Value,
    },
    UpdateCustomerProfile {
        fields_to_update: Map<String, Value>,
    },
    UpdateContactField {
        field_path: String,
        value_template: Value,
    },
    QueryModel {
        app_label: String,
        model_name: String,
        variable_name: String,
        filters_template: Map<String, Value>,
        order_by: Vec<String>,
        limit: Option<usize>,
    },
    SendAdminNotification {
        message_template: String,
    },
    /// Dispatched through the action registry.
    Custom {
        action_type: String,
        params_template: Map<String, Value>,
    },
}

impl ActionKind {
    /// `action_type` as written in definitions.
    pub fn action_type(&self) -> &str {
        match self {
            Self::SetContextVariable { .. } => "set_context_variable",
            Self::UpdateCustomerProfile { .. } => "update_customer_profile",
            Self::UpdateContactField { .. } => "update_contact_field",
            Self::QueryModel { .. } => "query_model",
            Self::SendAdminNotification { .. } => "send_admin_notification",
            Self::Custom { action_type, .. } => action_type,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawActionItem {
    action_type: String,
    #[serde(default)]
    variable_name: Option<String>,
    #[serde(default)]
    value_template: Option<Value>,
    #[serde(default)]
    field_path: Option<String>,
    #[serde(default)]
    fields_to_update: Option<Map<String, Value>>,
    #[serde(default)]
    message_template: Option<String>,
    #[serde(default)]
    app_label: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    filters_template: Option<Map<String, Value>>,
    #[serde(default)]
    order_by: Option<Vec<String>>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    params_template: Option<Map<String, Value>>,
    #[serde(default)]
    fatal: bool,
}

impl TryFrom<RawActionItem> for ActionItem {
    type Error = String;

    fn try_from(raw: RawActionItem) -> Result<Self, Self::Error> {
        fn required<T>(field: Option<T>, action: &str, name: &str) -> Result<T, String> {
            field.ok_or_else(|| format!("{action} requires '{name}'"))
        }

        let action = raw.action_type.as_str();
        let kind = match action {
            "set_context_variable" => ActionKind::SetContextVariable {
                variable_name: required(raw.variable_name, action, "variable_name")?,
                value_template: raw.value_template.unwrap_or(Value::Null),
            },
            "update_customer_profile" => ActionKind::UpdateCustomerProfile {
                fields_to_update: required(raw.fields_to_update, action, "fields_to_update")?,
            },
            "update_contact_field" => ActionKind::UpdateContactField {
                field_path: required(raw.field_path, action, "field_path")?,
                value_template: raw.value_template.unwrap_or(Value::Null),
            },
            "query_model" => ActionKind::QueryModel {
                app_label: required(raw.app_label, action, "app_label")?,
                model_name: required(raw.model_name, action, "model_name")?,
                variable_name: required(raw.variable_name, action, "variable_name")?,
                filters_template: raw.filters_template.unwrap_or_default(),
                order_by: raw.order_by.unwrap_or_default(),
                limit: raw.limit,
            },
            "send_admin_notification" => ActionKind::SendAdminNotification {
                message_template: required(raw.message_template, action, "message_template")?,
            },
            "" => return Err("action_type must not be empty".into()),
            _ => ActionKind::Custom {
                action_type: raw.action_type,
                params_template: raw.params_template.unwrap_or_default(),
            },
        };
        Ok(Self {
            kind,
            fatal: raw.fatal,
        })
    }
}

/// Parse a JSON5 document holding one flow, a list of flows, or
/// `{ "flows": [...] }`.
pub fn parse_flows(source: &str, origin: &str) -> Result<Vec<FlowDefinition>, DefinitionError> {
    let parse_err = |message: String| DefinitionError::Parse {
        origin: origin.to_string(),
        message,
    };
    let value: Value = json5::from_str(source).map_err(|e| parse_err(e.to_string()))?;

    let decoded = match value {
        Value::Object(mut map) if map.contains_key("flows") => {
            let flows = map.remove("flows").unwrap_or_default();
            serde_json::from_value::<Vec<FlowDefinition>>(flows)
        }
        list @ Value::Array(_) => serde_json::from_value::<Vec<FlowDefinition>>(list),
        single => serde_json::from_value::<FlowDefinition>(single).map(|flow| vec![flow]),
    };
    decoded.map_err(|e| parse_err(e.to_string()))
}
