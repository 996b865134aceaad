//! Flow execution engine.
//!
//! Each inbound message runs one *pass* for its contact: load the contact's
//! flow state (or start a flow from a trigger keyword), feed the message to
//! the current step, then keep running automatic steps until the flow waits
//! for a reply, hands over to a human, ends, or is terminated. Passes for the
//! same contact are serialized; different contacts run in parallel.

use crate::crm::memory::InMemoryStore;
use crate::crm::models::{Contact, CustomerProfile};
use crate::crm::notify::{AdminNotifier, LogNotifier};
use crate::crm::store::{CrmStore, FlowStateStore, StoreError};
use crate::flows::actions::ActionRegistry;
use crate::flows::catalog::{Flow, FlowCatalog};
use crate::flows::context::Context;
use crate::flows::state::{ContactFlowState, ContactLocks, FlowStatus};
use crate::flows::steps::{Pass, StepOutcome, StepProcessor};
use crate::messages::inbound::{InboundContent, InboundMessage};
use crate::messages::outbound::OutboundMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default cap on steps run in one pass.
pub const DEFAULT_MAX_STEPS_PER_PASS: usize = 50;

/// Engine failures. Flow-level problems (dead ends, fatal actions, step
/// limits) are reported through [`PassStatus::Terminated`] instead.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("unknown or inactive flow: {0}")]
    UnknownFlow(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassStatus {
    /// No flow running and none triggered.
    NoFlow,
    /// Suspended on a question.
    AwaitingReply,
    /// Handed over to a human during this pass.
    HandedOver,
    /// Contact was already handed over; message ignored.
    Parked,
    /// Flow reached an end step.
    Completed,
    /// Flow dropped because of a configuration or policy failure.
    Terminated { reason: String },
}

/// Result of one pass.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub contact_id: String,
    /// Flow the contact is in (or was in) when the pass ended.
    pub flow_name: Option<String>,
    pub messages: Vec<OutboundMessage>,
    pub status: PassStatus,
}

impl PassOutcome {
    fn idle(contact_id: &str, status: PassStatus) -> Self {
        Self {
            contact_id: contact_id.to_string(),
            flow_name: None,
            messages: Vec::new(),
            status,
        }
    }
}

/// Conversational flow engine.
pub struct FlowEngine {
    catalog: Arc<FlowCatalog>,
    registry: Arc<ActionRegistry>,
    crm: Arc<dyn CrmStore>,
    states: Arc<dyn FlowStateStore>,
    notifier: Arc<dyn AdminNotifier>,
    locks: ContactLocks,
    max_steps_per_pass: usize,
    default_flow: Option<String>,
    /// Channel for sending outbound messages.
    outbound_tx: Option<mpsc::Sender<OutboundMessage>>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("flows", &self.catalog.len())
            .field("registry", &self.registry)
            .field("max_steps_per_pass", &self.max_steps_per_pass)
            .field("default_flow", &self.default_flow)
            .finish()
    }
}

impl FlowEngine {
    /// Create an engine with the built-in actions and a logging notifier.
    pub fn new(
        catalog: Arc<FlowCatalog>,
        crm: Arc<dyn CrmStore>,
        states: Arc<dyn FlowStateStore>,
    ) -> Self {
        Self {
            catalog,
            registry: Arc::new(ActionRegistry::with_builtins()),
            crm,
            states,
            notifier: Arc::new(LogNotifier),
            locks: ContactLocks::new(),
            max_steps_per_pass: DEFAULT_MAX_STEPS_PER_PASS,
            default_flow: None,
            outbound_tx: None,
        }
    }

    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the outbound message sender.
    pub fn with_outbound_sender(mut self, tx: mpsc::Sender<OutboundMessage>) -> Self {
        self.outbound_tx = Some(tx);
        self
    }

    pub fn with_max_steps_per_pass(mut self, max: usize) -> Self {
        self.max_steps_per_pass = max.max(1);
        self
    }

    /// Flow started for contacts seen for the first time when no trigger
    /// keyword matches.
    pub fn with_default_flow(mut self, flow_name: impl Into<String>) -> Self {
        self.default_flow = Some(flow_name.into());
        self
    }

    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    /// Current flow state of a contact.
    pub async fn current_state(&self, contact_id: &str) -> Result<Option<ContactFlowState>, FlowError> {
        Ok(self.states.load_state(contact_id).await?)
    }

    /// Process one inbound message.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<PassOutcome, FlowError> {
        let contact_id = message.contact_id.clone();
        let _guard = self.locks.acquire(&contact_id).await;

        let (contact, created) = self
            .crm
            .get_or_create_contact(&contact_id, message.contact_name.as_deref())
            .await?;
        if created {
            info!(contact = %contact_id, "new contact");
        }

        if let Some(state) = self.states.load_state(&contact_id).await? {
            match self.resume(state, contact.clone(), &message).await? {
                Some(outcome) => return self.deliver(outcome).await,
                None => debug!(contact = %contact_id, "stale flow state cleared"),
            }
        }

        let trigger_text = message
            .text()
            .map(str::to_string)
            .or_else(|| match &message.content {
                InboundContent::Interactive { title, .. } => Some(title.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let flow = match self.catalog.find_by_trigger(&trigger_text) {
            Some((flow, keyword)) => {
                info!(contact = %contact_id, flow = %flow.name(), keyword = %keyword, "flow triggered");
                flow
            }
            None => match self.default_flow.as_deref().filter(|_| created) {
                Some(name) => match self.catalog.get(name) {
                    Some(flow) => {
                        info!(contact = %contact_id, flow = %flow.name(), "starting default flow");
                        flow
                    }
                    None => {
                        warn!(contact = %contact_id, flow = %name, "default flow not loaded");
                        return Ok(PassOutcome::idle(&contact_id, PassStatus::NoFlow));
                    }
                },
                None => {
                    debug!(contact = %contact_id, "no active flow and no trigger matched");
                    return Ok(PassOutcome::idle(&contact_id, PassStatus::NoFlow));
                }
            },
        };

        let pass = self.open_pass(&flow, contact, Context::new(), Some(message)).await?;
        let entry = flow.entry_step().name.clone();
        let outcome = self.drive(flow, pass, StepOutcome::Continue(entry)).await?;
        self.deliver(outcome).await
    }

    /// Start `flow_name` for a contact, replacing any run in progress.
    pub async fn start_flow(
        &self,
        contact_id: &str,
        flow_name: &str,
        initial_context: Context,
    ) -> Result<PassOutcome, FlowError> {
        let _guard = self.locks.acquire(contact_id).await;
        let flow = self
            .catalog
            .get(flow_name)
            .ok_or_else(|| FlowError::UnknownFlow(flow_name.to_string()))?;
        let (contact, _) = self.crm.get_or_create_contact(contact_id, None).await?;

        if let Some(previous) = self.states.load_state(contact_id).await? {
            info!(
                contact = %contact_id,
                previous = %previous.flow_name,
                flow = %flow.name(),
                "replacing flow run"
            );
        }

        let pass = self.open_pass(&flow, contact, initial_context, None).await?;
        let entry = flow.entry_step().name.clone();
        let outcome = self.drive(flow, pass, StepOutcome::Continue(entry)).await?;
        self.deliver(outcome).await
    }

    /// Drop a contact's flow run. Returns whether one existed.
    pub async fn abandon(&self, contact_id: &str) -> Result<bool, FlowError> {
        let _guard = self.locks.acquire(contact_id).await;
        let removed = self.states.clear_state(contact_id).await?;
        if removed {
            info!(contact = %contact_id, "flow run abandoned");
        }
        Ok(removed)
    }

    /// Continue an existing run. `None` means the state pointed at a flow or
    /// step that no longer exists and was cleared.
    async fn resume(
        &self,
        state: ContactFlowState,
        contact: Contact,
        message: &InboundMessage,
    ) -> Result<Option<PassOutcome>, FlowError> {
        let contact_id = state.contact_id.clone();
        if state.status == FlowStatus::HandedOver {
            debug!(contact = %contact_id, flow = %state.flow_name, "contact handed over; ignoring message");
            let mut outcome = PassOutcome::idle(&contact_id, PassStatus::Parked);
            outcome.flow_name = Some(state.flow_name);
            return Ok(Some(outcome));
        }

        let flow = self.catalog.get_version(&state.flow_name, state.flow_version);
        let Some(flow) = flow.filter(|f| f.step(&state.current_step).is_some()) else {
            warn!(
                contact = %contact_id,
                flow = %state.flow_name,
                version = state.flow_version,
                step = %state.current_step,
                "flow state refers to a missing flow or step"
            );
            self.states.clear_state(&contact_id).await?;
            return Ok(None);
        };

        let facts = self.facts(&contact, Some(message)).await?;
        let mut pass = Pass {
            state,
            contact,
            facts,
            inbound: Some(message.clone()),
            messages: Vec::new(),
        };

        let first = {
            let processor = StepProcessor::new(&self.registry, self.crm.as_ref(), self.notifier.as_ref());
            let Some(step) = flow.step(&pass.state.current_step) else {
                return Ok(None);
            };
            match pass.state.status {
                FlowStatus::AwaitingReply => processor.handle_reply(&flow, step, &mut pass).await,
                // interrupted mid-pass: run the step again
                _ => processor.enter(&flow, step, &mut pass).await,
            }
        };
        self.drive(flow, pass, first).await.map(Some)
    }

    async fn open_pass(
        &self,
        flow: &Flow,
        contact: Contact,
        context: Context,
        inbound: Option<InboundMessage>,
    ) -> Result<Pass, FlowError> {
        let facts = self.facts(&contact, inbound.as_ref()).await?;
        let state = ContactFlowState::new(
            &contact.whatsapp_id,
            flow.name(),
            flow.version(),
            &flow.entry_step().name,
            context,
        );
        Ok(Pass {
            state,
            contact,
            facts,
            inbound,
            messages: Vec::new(),
        })
    }

    /// Read-only values templates and conditions see next to flow variables.
    async fn facts(&self, contact: &Contact, inbound: Option<&InboundMessage>) -> Result<Context, FlowError> {
        let mut facts = Context::new();
        facts.insert(
            "contact".into(),
            serde_json::to_value(contact).map_err(StoreError::from)?,
        );
        let profile = self.crm.get_profile(&contact.whatsapp_id).await?;
        let profile = profile.unwrap_or_else(|| CustomerProfile::new(&contact.whatsapp_id));
        facts.insert(
            "customer_profile".into(),
            serde_json::to_value(&profile).map_err(StoreError::from)?,
        );
        facts.insert(
            "trigger_message".into(),
            inbound.map(InboundMessage::facts).unwrap_or(Value::Null),
        );
        Ok(facts)
    }

    /// Run steps from `outcome` until the pass settles, then persist.
    async fn drive(
        &self,
        mut flow: Arc<Flow>,
        mut pass: Pass,
        mut outcome: StepOutcome,
    ) -> Result<PassOutcome, FlowError> {
        let processor = StepProcessor::new(&self.registry, self.crm.as_ref(), self.notifier.as_ref());
        let contact_id = pass.contact.whatsapp_id.clone();
        let mut steps_run = 0usize;

        let status = loop {
            match outcome {
                StepOutcome::Continue(next) => {
                    steps_run += 1;
                    if steps_run > self.max_steps_per_pass {
                        outcome = StepOutcome::Terminate(format!(
                            "more than {} steps in one pass (cycle at '{next}')",
                            self.max_steps_per_pass
                        ));
                        continue;
                    }
                    let Some(step) = flow.step(&next) else {
                        outcome = StepOutcome::Terminate(format!("unknown step '{next}'"));
                        continue;
                    };
                    pass.state.advance_to(next.as_str());
                    outcome = processor.enter(&flow, step, &mut pass).await;
                }
                StepOutcome::AwaitReply => {
                    pass.state.status = FlowStatus::AwaitingReply;
                    pass.state.touch();
                    self.states.save_state(&pass.state).await?;
                    debug!(
                        contact = %contact_id,
                        flow = %flow.name(),
                        step = %pass.state.current_step,
                        retry = pass.state.retry_count,
                        "awaiting reply"
                    );
                    break PassStatus::AwaitingReply;
                }
                StepOutcome::HandedOver => {
                    pass.state.status = FlowStatus::HandedOver;
                    pass.state.touch();
                    self.states.save_state(&pass.state).await?;
                    info!(contact = %contact_id, flow = %flow.name(), "handed over to a human agent");
                    break PassStatus::HandedOver;
                }
                StepOutcome::Ended => {
                    self.states.clear_state(&contact_id).await?;
                    info!(contact = %contact_id, flow = %flow.name(), "flow completed");
                    break PassStatus::Completed;
                }
                StepOutcome::SwitchFlow { target, context } => {
                    let Some(next_flow) = self.catalog.get(&target) else {
                        outcome = StepOutcome::Terminate(format!("switch target '{target}' is not loaded"));
                        continue;
                    };
                    info!(
                        contact = %contact_id,
                        from = %flow.name(),
                        to = %next_flow.name(),
                        "switching flow"
                    );
                    let entry = next_flow.entry_step().name.clone();
                    pass.state = ContactFlowState::new(
                        &contact_id,
                        next_flow.name(),
                        next_flow.version(),
                        &entry,
                        context,
                    );
                    flow = next_flow;
                    outcome = StepOutcome::Continue(entry);
                }
                StepOutcome::Terminate(reason) => {
                    self.states.clear_state(&contact_id).await?;
                    error!(
                        contact = %contact_id,
                        flow = %flow.name(),
                        step = %pass.state.current_step,
                        reason = %reason,
                        "flow terminated"
                    );
                    break PassStatus::Terminated { reason };
                }
            }
        };

        Ok(PassOutcome {
            contact_id,
            flow_name: Some(flow.name().to_string()),
            messages: pass.messages,
            status,
        })
    }

    /// Push the pass's messages to the outbound channel, if any.
    async fn deliver(&self, outcome: PassOutcome) -> Result<PassOutcome, FlowError> {
        if let Some(tx) = &self.outbound_tx {
            for message in &outcome.messages {
                if let Err(e) = tx.send(message.clone()).await {
                    error!(contact = %outcome.contact_id, "Failed to send outbound message: {}", e);
                    break;
                }
            }
        }
        Ok(outcome)
    }
}

/// Create an engine backed by a single in-memory store.
pub fn create_engine(catalog: FlowCatalog, store: Arc<InMemoryStore>) -> FlowEngine {
    FlowEngine::new(Arc::new(catalog), store.clone(), store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::definition::parse_flows;
    use serde_json::json;

    fn catalog(source: &str) -> FlowCatalog {
        FlowCatalog::from_definitions(parse_flows(source, "test").unwrap()).unwrap()
    }

    const GREETING: &str = r#"{
        name: "greeting",
        trigger_keywords: ["hi"],
        steps: [
            { name: "ask", is_entry_point: true, type: "question",
              config: { message_config: { message_type: "text", text: { body: "Your name?" } },
                        reply_config: { save_to_variable: "name" } },
              transitions: [{ to_step: "bye" }] },
            { name: "bye", type: "end_flow",
              config: { message_config: { message_type: "text", text: { body: "Bye {{ name }}" } } } }
        ]
    }"#;

    fn texts(outcome: &PassOutcome) -> Vec<String> {
        outcome.messages.iter().map(|m| m.payload.preview()).collect()
    }

    #[tokio::test]
    async fn test_no_trigger_is_noop() {
        let store = Arc::new(InMemoryStore::new());
        let engine = create_engine(catalog(GREETING), store.clone());
        let outcome = engine
            .handle_inbound(InboundMessage::text_message("2637", "good morning"))
            .await
            .unwrap();
        assert_eq!(outcome.status, PassStatus::NoFlow);
        assert!(outcome.messages.is_empty());
        assert!(store.get_contact("2637").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_question_then_end() {
        let store = Arc::new(InMemoryStore::new());
        let engine = create_engine(catalog(GREETING), store.clone());

        let first = engine.handle_inbound(InboundMessage::text_message("2637", "Hi there")).await.unwrap();
        assert_eq!(first.status, PassStatus::AwaitingReply);
        assert_eq!(texts(&first), vec!["Your name?"]);

        let second = engine.handle_inbound(InboundMessage::text_message("2637", "Tariro")).await.unwrap();
        assert_eq!(second.status, PassStatus::Completed);
        assert_eq!(texts(&second), vec!["Bye Tariro"]);
        assert!(engine.current_state("2637").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outbound_sender_receives_messages() {
        let store = Arc::new(InMemoryStore::new());
        let (tx, mut rx) = mpsc::channel(8);
        let engine = create_engine(catalog(GREETING), store).with_outbound_sender(tx);
        engine.handle_inbound(InboundMessage::text_message("2637", "hi")).await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.contact_id, "2637");
        assert_eq!(sent.step_name.as_deref(), Some("ask"));
    }

    #[tokio::test]
    async fn test_start_flow_and_abandon() {
        let store = Arc::new(InMemoryStore::new());
        let engine = create_engine(catalog(GREETING), store);
        let mut context = Context::new();
        context.insert("source".into(), json!("operator"));

        let outcome = engine.start_flow("2637", "greeting", context).await.unwrap();
        assert_eq!(outcome.status, PassStatus::AwaitingReply);
        let state = engine.current_state("2637").await.unwrap().unwrap();
        assert_eq!(state.context["source"], "operator");

        assert!(engine.abandon("2637").await.unwrap());
        assert!(!engine.abandon("2637").await.unwrap());
        assert!(matches!(
            engine.start_flow("2637", "missing", Context::new()).await,
            Err(FlowError::UnknownFlow(_))
        ));
    }

    #[tokio::test]
    async fn test_default_flow_only_for_new_contacts() {
        let store = Arc::new(InMemoryStore::new());
        store.get_or_create_contact("old", None).await.unwrap();
        let engine = create_engine(catalog(GREETING), store).with_default_flow("greeting");

        let fresh = engine.handle_inbound(InboundMessage::text_message("new", "hello")).await.unwrap();
        assert_eq!(fresh.status, PassStatus::AwaitingReply);

        let known = engine.handle_inbound(InboundMessage::text_message("old", "hello")).await.unwrap();
        assert_eq!(known.status, PassStatus::NoFlow);
    }

    #[tokio::test]
    async fn test_stale_state_is_cleared() {
        let store = Arc::new(InMemoryStore::new());
        let stale = ContactFlowState::new("2637", "retired", 1, "somewhere", Context::new());
        store.save_state(&stale).await.unwrap();
        let engine = create_engine(catalog(GREETING), store.clone());

        let outcome = engine.handle_inbound(InboundMessage::text_message("2637", "hi")).await.unwrap();
        assert_eq!(outcome.flow_name.as_deref(), Some("greeting"));
        let state = store.load_state("2637").await.unwrap().unwrap();
        assert_eq!(state.flow_name, "greeting");
    }
}
