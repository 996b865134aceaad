//! Conversational flow system
//!
//! Flows are declarative step graphs loaded from JSON5. A contact enters a
//! flow through a trigger keyword, answers questions, and is routed between
//! steps by prioritized, conditional transitions while actions write CRM data.
//!
//! # Example flow
//!
//! ```json5
//! {
//!   name: "lead_generation",
//!   trigger_keywords: ["demo", "pricing"],
//!   steps: [
//!     {
//!       name: "ask_name", is_entry_point: true, type: "question",
//!       config: {
//!         message_config: { message_type: "text", text: { body: "What's your name?" } },
//!         reply_config: { save_to_variable: "first_name", expected_type: "text" },
//!       },
//!       transitions: [{ to_step: "save", condition_config: { type: "variable_exists", variable_name: "first_name" } }],
//!     },
//!     {
//!       name: "save", type: "action",
//!       config: { actions_to_run: [
//!         { action_type: "update_customer_profile", fields_to_update: { first_name: "{{ first_name }}" } },
//!       ] },
//!       transitions: [{ to_step: "done" }],
//!     },
//!     {
//!       name: "done", type: "end_flow",
//!       config: { message_config: { message_type: "text", text: { body: "Thanks {{ first_name }}!" } } },
//!     },
//!   ],
//! }
//! ```

pub mod actions;
pub mod catalog;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod state;
pub mod steps;
pub mod template;

pub use actions::{ActionError, ActionHandler, ActionInvocation, ActionRegistry, FnHandler};
pub use catalog::{Flow, FlowCatalog};
pub use condition::ConditionConfig;
pub use context::{Context, Scope};
pub use definition::{parse_flows, DefinitionError, FlowDefinition, StepDefinition, StepKind};
pub use engine::{create_engine, FlowEngine, FlowError, PassOutcome, PassStatus};
pub use state::{ContactFlowState, FlowStatus};
pub use steps::StepOutcome;
