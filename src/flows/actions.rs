//! Action execution and the action registry.
//!
//! `action` steps run an ordered list of [`ActionItem`]s. Each item sees the
//! context writes of the items before it. Failures are logged and skipped
//! unless the item is marked `fatal`, in which case the rest of the list is
//! abandoned and the caller terminates the flow.
//!
//! Action types without a dedicated variant are looked up in an
//! [`ActionRegistry`] built at startup. Handlers receive the contact, the
//! mutable flow context, the resolved parameters and the CRM store, and may
//! return messages to send.

use crate::crm::models::{Contact, CustomerProfile};
use crate::crm::notify::{AdminNotification, AdminNotifier, NotificationKind};
use crate::crm::store::{CrmStore, RecordQuery, StoreError};
use crate::flows::context::{display, set_path, Context, Scope};
use crate::flows::definition::{ActionItem, ActionKind};
use crate::flows::template::{render_text, resolve_map, resolve_value};
use crate::messages::outbound::MessagePayload;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collection opportunities are written to.
pub const OPPORTUNITY_COLLECTION: &str = "customer_data.Opportunity";

/// Collection `create_opportunity` resolves product SKUs against.
pub const PRODUCT_COLLECTION: &str = "products_and_services.SoftwareProduct";

/// Action failures.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unregistered action type: {0}")]
    Unregistered(String),
    #[error("invalid parameters for {action}: {reason}")]
    InvalidParams { action: String, reason: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ActionError {
    pub fn invalid(action: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            action: action.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error points at the flow definition rather than data.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Unregistered(_) | Self::InvalidParams { .. })
    }
}

/// What a handler gets to work with.
pub struct ActionInvocation<'a> {
    pub contact: &'a Contact,
    pub context: &'a mut Context,
    pub store: &'a dyn CrmStore,
}

/// A registered custom action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(
        &self,
        invocation: &mut ActionInvocation<'_>,
        params: &Map<String, Value>,
    ) -> Result<Vec<MessagePayload>, ActionError>;
}

type SyncAction =
    dyn Fn(&Contact, &mut Context, &Map<String, Value>) -> Result<Vec<MessagePayload>, ActionError>
        + Send
        + Sync;

/// Adapter for plain closures that only need the contact and context.
pub struct FnHandler(Box<SyncAction>);

impl FnHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Contact, &mut Context, &Map<String, Value>) -> Result<Vec<MessagePayload>, ActionError>
            + Send
            + Sync
            + 'static,
    {
        Self(Box::new(f))
    }
}

#[async_trait]
impl ActionHandler for FnHandler {
    async fn run(
        &self,
        invocation: &mut ActionInvocation<'_>,
        params: &Map<String, Value>,
    ) -> Result<Vec<MessagePayload>, ActionError> {
        (self.0)(invocation.contact, invocation.context, params)
    }
}

/// Named custom action handlers.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `update_lead_score` and `create_opportunity`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("update_lead_score", UpdateLeadScore);
        registry.register("create_opportunity", CreateOpportunity);
        registry
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, action_type: impl Into<String>, handler: impl ActionHandler + 'static) {
        let action_type = action_type.into();
        if self
            .handlers
            .insert(action_type.clone(), Arc::new(handler))
            .is_some()
        {
            warn!(action_type = %action_type, "replaced existing action handler");
        } else {
            debug!(action_type = %action_type, "registered action handler");
        }
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Registered action types, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Result of running an action list.
#[derive(Debug, Default)]
pub struct ActionRun {
    /// Messages emitted by handlers, in order.
    pub messages: Vec<MessagePayload>,
    /// Set when a `fatal` action failed and the list was abandoned.
    pub aborted: Option<ActionError>,
}

/// Run state an action list works on. The `contact` and `customer_profile`
/// entries of `facts` are refreshed after every write.
pub struct ActionTarget<'a> {
    pub contact: &'a mut Contact,
    pub context: &'a mut Context,
    pub facts: &'a mut Context,
    pub flow_name: &'a str,
}

/// Runs action lists against the CRM store.
pub struct ActionExecutor<'a> {
    registry: &'a ActionRegistry,
    store: &'a dyn CrmStore,
    notifier: &'a dyn AdminNotifier,
}

impl<'a> ActionExecutor<'a> {
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

    /// Run `items` in order.
    pub async fn run(&self, items: &[ActionItem], target: &mut ActionTarget<'_>) -> ActionRun {
        let mut run = ActionRun::default();
        for (position, item) in items.iter().enumerate() {
            let action_type = item.kind.action_type().to_string();
            match self.run_one(&item.kind, target).await {
                Ok(mut messages) => {
                    debug!(
                        contact = %target.contact.whatsapp_id,
                        flow = %target.flow_name,
                        action = %action_type,
                        messages = messages.len(),
                        "action completed"
                    );
                    run.messages.append(&mut messages);
                }
                Err(e) if item.fatal => {
                    warn!(
                        contact = %target.contact.whatsapp_id,
                        flow = %target.flow_name,
                        action = %action_type,
                        position,
                        error = %e,
                        "fatal action failed; abandoning remaining actions"
                    );
                    run.aborted = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        contact = %target.contact.whatsapp_id,
                        flow = %target.flow_name,
                        action = %action_type,
                        position,
                        configuration = e.is_configuration(),
                        error = %e,
                        "action failed; skipping"
                    );
                }
            }
        }
        run
    }

    async fn run_one(
        &self,
        kind: &ActionKind,
        target: &mut ActionTarget<'_>,
    ) -> Result<Vec<MessagePayload>, ActionError> {
        let contact_id = target.contact.whatsapp_id.clone();
        match kind {
            ActionKind::SetContextVariable {
                variable_name,
                value_template,
            } => {
                let value = resolve_value(value_template, &Scope::with_facts(target.context, target.facts));
                set_path(target.context, variable_name, value);
                Ok(Vec::new())
            }
            ActionKind::UpdateCustomerProfile { fields_to_update } => {
                let fields = resolve_map(fields_to_update, &Scope::with_facts(target.context, target.facts));
                let profile = self
                    .store
                    .update_profile(
                        &contact_id,
                        Box::new(move |profile: &mut CustomerProfile| {
                            fields
                                .into_iter()
                                .try_for_each(|(path, value)| profile.set_field(&path, value))
                        }),
                    )
                    .await?;
                target
                    .facts
                    .insert("customer_profile".into(), serde_json::to_value(&profile).map_err(StoreError::from)?);
                Ok(Vec::new())
            }
            ActionKind::UpdateContactField {
                field_path,
                value_template,
            } => {
                let value = resolve_value(value_template, &Scope::with_facts(target.context, target.facts));
                let path = field_path.clone();
                let contact = self
                    .store
                    .update_contact(&contact_id, Box::new(move |contact: &mut Contact| contact.set_field(&path, value)))
                    .await?;
                target
                    .facts
                    .insert("contact".into(), serde_json::to_value(&contact).map_err(StoreError::from)?);
                *target.contact = contact;
                Ok(Vec::new())
            }
            ActionKind::QueryModel {
                app_label,
                model_name,
                variable_name,
                filters_template,
                order_by,
                limit,
            } => {
                let query = RecordQuery {
                    filters: resolve_map(filters_template, &Scope::with_facts(target.context, target.facts)),
                    order_by: order_by.clone(),
                    limit: *limit,
                };
                let collection = format!("{app_label}.{model_name}");
                let records = self.store.query(&collection, &query).await?;
                debug!(collection = %collection, results = records.len(), "query_model");
                set_path(
                    target.context,
                    variable_name,
                    Value::Array(records.into_iter().map(Value::Object).collect()),
                );
                Ok(Vec::new())
            }
            ActionKind::SendAdminNotification { message_template } => {
                let message = render_text(message_template, &Scope::with_facts(target.context, target.facts));
                let notification = AdminNotification::new(NotificationKind::FlowAction, &contact_id, message)
                    .with_flow(target.flow_name);
                // fire-and-forget: a failed notification never fails the action
                if let Err(e) = self.notifier.notify(notification).await {
                    warn!(contact = %contact_id, error = %e, "admin notification not delivered");
                }
                Ok(Vec::new())
            }
            ActionKind::Custom {
                action_type,
                params_template,
            } => {
                let handler = self
                    .registry
                    .get(action_type)
                    .ok_or_else(|| ActionError::Unregistered(action_type.clone()))?;
                let params = resolve_map(params_template, &Scope::with_facts(target.context, target.facts));
                let messages = {
                    let mut invocation = ActionInvocation {
                        contact: &*target.contact,
                        context: &mut *target.context,
                        store: self.store,
                    };
                    handler.run(&mut invocation, &params).await?
                };
                // handlers may have written the profile
                if let Some(profile) = self.store.get_profile(&contact_id).await? {
                    target
                        .facts
                        .insert("customer_profile".into(), serde_json::to_value(&profile).map_err(StoreError::from)?);
                }
                Ok(messages)
            }
        }
    }
}

/// Adds `score_to_add` (integer, may be negative) to the profile's lead score.
pub struct UpdateLeadScore;

#[async_trait]
impl ActionHandler for UpdateLeadScore {
    async fn run(
        &self,
        invocation: &mut ActionInvocation<'_>,
        params: &Map<String, Value>,
    ) -> Result<Vec<MessagePayload>, ActionError> {
        let contact_id = invocation.contact.whatsapp_id.clone();
        let Some(score) = params.get("score_to_add").map_or(Some(0), Value::as_i64) else {
            warn!(contact = %contact_id, "lead scoring skipped: score_to_add is not an integer");
            return Ok(Vec::new());
        };
        let reason = params
            .get("reason")
            .map(display)
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "Score updated by flow".to_string());

        let profile = invocation
            .store
            .update_profile(
                &contact_id,
                Box::new(move |profile: &mut CustomerProfile| {
                    profile.lead_score = profile.lead_score.saturating_add(score);
                    Ok(())
                }),
            )
            .await?;
        info!(
            contact = %contact_id,
            delta = score,
            lead_score = profile.lead_score,
            reason = %reason,
            "lead score updated"
        );
        Ok(Vec::new())
    }
}

/// Records a sales opportunity for the contact.
///
/// Params: `name` (required), `stage` (default `prospecting`),
/// `software_product_sku`, `description`, `confirmation_text`.
pub struct CreateOpportunity;

#[async_trait]
impl ActionHandler for CreateOpportunity {
    async fn run(
        &self,
        invocation: &mut ActionInvocation<'_>,
        params: &Map<String, Value>,
    ) -> Result<Vec<MessagePayload>, ActionError> {
        let text = |key: &str| {
            params
                .get(key)
                .map(display)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let name = text("name").ok_or_else(|| ActionError::invalid("create_opportunity", "missing 'name'"))?;
        let contact_id = invocation.contact.whatsapp_id.clone();

        let mut record = Map::new();
        record.insert("name".into(), json!(name));
        record.insert("stage".into(), json!(text("stage").unwrap_or_else(|| "prospecting".into())));
        record.insert("contact_id".into(), json!(contact_id));
        record.insert("description".into(), json!(text("description")));
        record.insert("created_at".into(), json!(chrono::Utc::now().to_rfc3339()));

        if let Some(sku) = text("software_product_sku") {
            let mut filters = Map::new();
            filters.insert("sku".into(), json!(sku));
            let query = RecordQuery {
                filters,
                order_by: Vec::new(),
                limit: Some(1),
            };
            match invocation.store.query(PRODUCT_COLLECTION, &query).await?.into_iter().next() {
                Some(product) => {
                    record.insert("product_id".into(), product.get("id").cloned().unwrap_or(Value::Null));
                    record.insert("amount".into(), product.get("price").cloned().unwrap_or(Value::Null));
                }
                None => warn!(contact = %contact_id, sku = %sku, "opportunity product not found"),
            }
        }

        let stored = invocation.store.create_record(OPPORTUNITY_COLLECTION, record).await?;
        info!(
            contact = %contact_id,
            opportunity = %stored.get("id").map(crate::flows::context::display).unwrap_or_default(),
            "opportunity created"
        );
        invocation
            .context
            .insert("opportunity_id".into(), stored.get("id").cloned().unwrap_or(Value::Null));

        Ok(text("confirmation_text").map(MessagePayload::text).into_iter().collect())
    }
}
