//! Step processing.
//!
//! The processor executes one step at a time and reports what the engine
//! should do next through a [`StepOutcome`]. Automatic steps (`send_message`,
//! `action`) pick their next step immediately; `question` suspends until a
//! reply arrives; `human_handover`, `end_flow` and `switch_flow` leave the
//! current run.

use crate::crm::models::Contact;
use crate::crm::notify::{AdminNotification, AdminNotifier, NotificationKind};
use crate::crm::store::CrmStore;
use crate::flows::actions::{ActionExecutor, ActionRegistry, ActionTarget};
use crate::flows::catalog::Flow;
use crate::flows::condition;
use crate::flows::context::{set_path, Context, Scope};
use crate::flows::definition::{
    ExpectedType, FallbackAction, QuestionConfig, ReplyConfig, StepDefinition, StepKind,
};
use crate::flows::state::ContactFlowState;
use crate::flows::template::{render_text, resolve_map, resolve_message};
use crate::messages::inbound::{InboundContent, InboundMessage, MediaKind};
use crate::messages::outbound::{MessagePayload, OutboundMessage};
use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[A-Za-z]{2,}$").ok());

/// Commas are only accepted as thousands separators.
static GROUPED_NUMBER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d{1,3}(,\d{3})+(\.\d+)?$").ok());

/// What the engine should do after a step ran.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Run the named step next, in the same pass.
    Continue(String),
    /// Stay on the current step until the contact replies.
    AwaitReply,
    /// Contact parked for a human agent.
    HandedOver,
    /// Run finished normally.
    Ended,
    /// Leave this flow for another one.
    SwitchFlow { target: String, context: Context },
    /// Configuration or policy failure; the run is dropped.
    Terminate(String),
}

/// Mutable state of one pass through the engine.
#[derive(Debug)]
pub struct Pass {
    pub state: ContactFlowState,
    pub contact: Contact,
    /// `contact`, `customer_profile` and `trigger_message`.
    pub facts: Context,
    /// Message that started this pass, if any.
    pub inbound: Option<InboundMessage>,
    pub messages: Vec<OutboundMessage>,
}

impl Pass {
    pub fn scope(&self) -> Scope<'_> {
        Scope::with_facts(&self.state.context, &self.facts)
    }
}

/// Executes steps against a pass.
pub struct StepProcessor<'a> {
    registry: &'a ActionRegistry,
    store: &'a dyn CrmStore,
    notifier: &'a dyn AdminNotifier,
}

impl<'a> StepProcessor<'a> {
    pub fn new(
        registry: &'a ActionRegistry,
        store: &'a dyn CrmStore,
        notifier: &'a dyn AdminNotifier,
    ) -> Self {
        Self {
            registry,
            store,
            notifier,
        }
    }

    /// Execute a step the contact just arrived at.
    pub async fn enter(&self, flow: &Flow, step: &StepDefinition, pass: &mut Pass) -> StepOutcome {
        debug!(
            contact = %pass.contact.whatsapp_id,
            flow = %flow.name(),
            step = %step.name,
            kind = step.type_name(),
            "entering step"
        );
        match &step.kind {
            StepKind::SendMessage { message_config } => {
                self.emit(flow, step, pass, message_config);
                select_next(flow, step, pass)
            }
            StepKind::Question(question) => {
                self.emit(flow, step, pass, &question.message_config);
                StepOutcome::AwaitReply
            }
            StepKind::Action(config) => {
                let executor = ActionExecutor::new(self.registry, self.store, self.notifier);
                let mut target = ActionTarget {
                    contact: &mut pass.contact,
                    context: &mut pass.state.context,
                    facts: &mut pass.facts,
                    flow_name: flow.name(),
                };
                let run = executor.run(&config.actions_to_run, &mut target).await;
                for payload in run.messages {
                    push(flow, step, pass, payload);
                }
                match run.aborted {
                    Some(e) => StepOutcome::Terminate(format!("fatal action failed in step '{}': {e}", step.name)),
                    None => select_next(flow, step, pass),
                }
            }
            StepKind::HumanHandover(config) => {
                if let Some(text) = &config.pre_handover_message_text {
                    let text = render_text(text, &pass.scope());
                    self.emit_text(flow, step, pass, text);
                }
                self.hand_over(flow, pass, config.notification_details.as_deref()).await;
                StepOutcome::HandedOver
            }
            StepKind::EndFlow(config) => {
                if let Some(message_config) = &config.message_config {
                    self.emit(flow, step, pass, message_config);
                }
                StepOutcome::Ended
            }
            StepKind::SwitchFlow(config) => {
                let scope = pass.scope();
                let mut context = config
                    .initial_context_template
                    .as_ref()
                    .map(|template| resolve_map(template, &scope))
                    .unwrap_or_default();
                if let Some(keyword) = &config.trigger_keyword_to_pass {
                    context.insert("trigger_keyword".into(), Value::String(render_text(keyword, &scope)));
                }
                StepOutcome::SwitchFlow {
                    target: config.target_flow_name.clone(),
                    context,
                }
            }
        }
    }

    /// Handle the pass's inbound message as the answer to a question step.
    pub async fn handle_reply(&self, flow: &Flow, step: &StepDefinition, pass: &mut Pass) -> StepOutcome {
        let StepKind::Question(question) = &step.kind else {
            return StepOutcome::Terminate(format!(
                "step '{}' is a {} step and cannot take a reply",
                step.name,
                step.type_name()
            ));
        };
        let Some(reply) = pass.inbound.as_ref() else {
            return StepOutcome::AwaitReply;
        };

        match validate_reply(&question.reply_config, reply) {
            Ok(value) => {
                debug!(
                    contact = %pass.contact.whatsapp_id,
                    flow = %flow.name(),
                    step = %step.name,
                    variable = %question.reply_config.save_to_variable,
                    "reply accepted"
                );
                set_path(&mut pass.state.context, &question.reply_config.save_to_variable, value);
                pass.state.retry_count = 0;
                select_next(flow, step, pass)
            }
            Err(reason) => self.reject_reply(flow, step, question, pass, &reason),
        }
    }

    fn reject_reply(
        &self,
        flow: &Flow,
        step: &StepDefinition,
        question: &QuestionConfig,
        pass: &mut Pass,
        reason: &str,
    ) -> StepOutcome {
        let fallback = question.fallback();
        pass.state.retry_count += 1;
        info!(
            contact = %pass.contact.whatsapp_id,
            flow = %flow.name(),
            step = %step.name,
            retry = pass.state.retry_count,
            max_retries = fallback.max_retries,
            reason = %reason,
            "invalid reply"
        );

        if pass.state.retry_count <= fallback.max_retries {
            match &fallback.re_prompt_message_text {
                Some(text) => {
                    let text = render_text(text, &pass.scope());
                    self.emit_text(flow, step, pass, text);
                }
                None => self.emit(flow, step, pass, &question.message_config),
            }
            return StepOutcome::AwaitReply;
        }

        warn!(
            contact = %pass.contact.whatsapp_id,
            flow = %flow.name(),
            step = %step.name,
            action = ?fallback.action,
            "retries exhausted; applying fallback"
        );
        match fallback.action {
            FallbackAction::SwitchFlow => match fallback.target_flow_name {
                Some(target) => StepOutcome::SwitchFlow {
                    target,
                    context: Context::new(),
                },
                None => StepOutcome::Terminate(format!(
                    "step '{}' falls back to switch_flow without a target_flow_name",
                    step.name
                )),
            },
            FallbackAction::EndFlow => StepOutcome::Ended,
            FallbackAction::RePrompt => StepOutcome::Terminate(format!(
                "retries exhausted on step '{}'",
                step.name
            )),
        }
    }

    async fn hand_over(&self, flow: &Flow, pass: &mut Pass, details: Option<&str>) {
        let contact_id = pass.contact.whatsapp_id.clone();
        match self
            .store
            .update_contact(
                &contact_id,
                Box::new(|contact: &mut Contact| {
                    contact.request_intervention();
                    Ok(())
                }),
            )
            .await
        {
            Ok(contact) => {
                if let Ok(value) = serde_json::to_value(&contact) {
                    pass.facts.insert("contact".into(), value);
                }
                pass.contact = contact;
            }
            Err(e) => {
                warn!(contact = %contact_id, error = %e, "failed to flag contact for intervention");
                pass.contact.request_intervention();
            }
        }

        let message = match details {
            Some(details) => render_text(details, &pass.scope()),
            None => format!(
                "Contact {} requires human assistance (flow '{}').",
                pass.contact.name.as_deref().unwrap_or(&contact_id),
                flow.name()
            ),
        };
        let notification = AdminNotification::new(NotificationKind::HumanHandover, &contact_id, message)
            .with_flow(flow.name());
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(contact = %contact_id, error = %e, "handover notification not delivered");
        }
    }

    /// Resolve and queue a message config. Invalid shapes are logged and
    /// skipped.
    fn emit(&self, flow: &Flow, step: &StepDefinition, pass: &mut Pass, config: &Value) {
        let resolved = resolve_message(config, &pass.scope());
        match MessagePayload::from_config(&resolved) {
            Ok(payload) => push(flow, step, pass, payload),
            Err(e) => warn!(
                contact = %pass.contact.whatsapp_id,
                flow = %flow.name(),
                step = %step.name,
                error = %e,
                "skipping invalid outbound message"
            ),
        }
    }

    fn emit_text(&self, flow: &Flow, step: &StepDefinition, pass: &mut Pass, text: String) {
        if text.trim().is_empty() {
            debug!(step = %step.name, "skipping empty text message");
            return;
        }
        push(flow, step, pass, MessagePayload::text(text));
    }
}

fn push(flow: &Flow, step: &StepDefinition, pass: &mut Pass, payload: MessagePayload) {
    let message = OutboundMessage::new(&pass.contact.whatsapp_id, payload).from_step(flow.name(), &step.name);
    pass.messages.push(message);
}

/// First satisfied transition in priority order, or a dead-end termination.
fn select_next(flow: &Flow, step: &StepDefinition, pass: &Pass) -> StepOutcome {
    let scope = pass.scope();
    let chosen = step
        .ordered_transitions()
        .into_iter()
        .find(|t| condition::evaluate(&t.condition_config, &scope, pass.inbound.as_ref()));
    match chosen {
        Some(transition) => StepOutcome::Continue(transition.to_step.clone()),
        None => {
            warn!(
                contact = %pass.contact.whatsapp_id,
                flow = %flow.name(),
                step = %step.name,
                transitions = step.transitions.len(),
                "dead end: no transition matched"
            );
            StepOutcome::Terminate(format!("no transition matched from step '{}'", step.name))
        }
    }
}

/// Validate a reply against a question's reply config.
///
/// Returns the value to store, or why the reply was rejected.
pub fn validate_reply(config: &ReplyConfig, reply: &InboundMessage) -> Result<Value, String> {
    let value = match config.expected_type {
        ExpectedType::Text => {
            let text = match &reply.content {
                InboundContent::Interactive { title, .. } => Some(title.as_str()),
                _ => reply.text(),
            };
            match text.map(str::trim).filter(|t| !t.is_empty()) {
                Some(text) => Value::String(text.to_string()),
                None => return Err("expected a text reply".into()),
            }
        }
        ExpectedType::Email => {
            let text = reply.text().map(str::trim).unwrap_or_default();
            let valid = EMAIL_RE.as_ref().is_some_and(|re| re.is_match(text));
            if !valid {
                return Err("expected an email address".into());
            }
            Value::String(text.to_string())
        }
        ExpectedType::Number => {
            let text = reply.text().map(str::trim).unwrap_or_default();
            let grouped = !text.contains(',')
                || GROUPED_NUMBER_RE.as_ref().is_some_and(|re| re.is_match(text));
            if !grouped {
                return Err(format!("expected a number, got '{text}'"));
            }
            let parsed: f64 = text
                .replace(',', "")
                .parse()
                .map_err(|_| format!("expected a number, got '{text}'"))?;
            number_value(parsed).ok_or_else(|| format!("expected a finite number, got '{text}'"))?
        }
        ExpectedType::InteractiveId => match reply.interactive_id() {
            Some(id) => Value::String(id.to_string()),
            None => return Err("expected a button or list selection".into()),
        },
        ExpectedType::Image => match &reply.content {
            InboundContent::Media {
                kind: MediaKind::Image,
                media_id,
                ..
            } => Value::String(media_id.clone()),
            _ => return Err("expected an image".into()),
        },
    };

    if let Some(pattern) = &config.validation_regex {
        let textual = reply
            .interactive_id()
            .or_else(|| reply.text())
            .map(str::trim)
            .unwrap_or_default();
        let re = Regex::new(pattern).map_err(|e| format!("invalid validation regex: {e}"))?;
        if !re.is_match(textual) {
            return Err(format!("reply does not match '{pattern}'"));
        }
    }
    Ok(value)
}

/// Integral values are stored as integers so they render without a
/// trailing `.0`.
fn number_value(n: f64) -> Option<Value> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Some(Value::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply_config(value: Value) -> ReplyConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_text_reply() {
        let config = reply_config(json!({"save_to_variable": "v"}));
        assert_eq!(
            validate_reply(&config, &InboundMessage::text_message("1", " Retail ")),
            Ok(json!("Retail"))
        );
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "   ")).is_err());
        assert_eq!(
            validate_reply(&config, &InboundMessage::interactive("1", "vat_yes", "Yes")),
            Ok(json!("Yes"))
        );
    }

    #[test]
    fn test_email_reply() {
        let config = reply_config(json!({"save_to_variable": "v", "expected_type": "email"}));
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "a@b.co")).is_ok());
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "not-an-email")).is_err());
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "a@b")).is_err());
    }

    #[test]
    fn test_number_reply() {
        let config = reply_config(json!({"save_to_variable": "v", "expected_type": "number"}));
        assert_eq!(validate_reply(&config, &InboundMessage::text_message("1", "1,500")), Ok(json!(1500)));
        assert_eq!(validate_reply(&config, &InboundMessage::text_message("1", "2.5")), Ok(json!(2.5)));
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "many")).is_err());
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "inf")).is_err());
        assert_eq!(validate_reply(&config, &InboundMessage::text_message("1", "12,345.50")), Ok(json!(12345.5)));
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "1,2,3")).is_err());
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "1500,")).is_err());
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "1,50")).is_err());
    }

    #[test]
    fn test_interactive_and_image_reply() {
        let interactive = reply_config(json!({"save_to_variable": "v", "expected_type": "interactive_id"}));
        assert_eq!(
            validate_reply(&interactive, &InboundMessage::interactive("1", "urgent_very", "Very Urgent")),
            Ok(json!("urgent_very"))
        );
        assert!(validate_reply(&interactive, &InboundMessage::text_message("1", "urgent_very")).is_err());

        let image = reply_config(json!({"save_to_variable": "v", "expected_type": "image"}));
        assert_eq!(
            validate_reply(&image, &InboundMessage::media("1", MediaKind::Image, "media-7")),
            Ok(json!("media-7"))
        );
        assert!(validate_reply(&image, &InboundMessage::media("1", MediaKind::Audio, "a")).is_err());
    }

    #[test]
    fn test_validation_regex() {
        let config = reply_config(json!({"save_to_variable": "tin", "validation_regex": "^\\d{10}$"}));
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "2000123456")).is_ok());
        assert!(validate_reply(&config, &InboundMessage::text_message("1", "12345")).is_err());
    }
}
