//! CRM data boundary
//!
//! Records the flow engine reads and writes, the store traits it depends on,
//! an in-memory implementation, and the operator notification channel.

pub mod memory;
pub mod models;
pub mod notify;
pub mod store;

pub use memory::InMemoryStore;
pub use models::{Contact, CustomerProfile, LeadStatus, Record};
pub use notify::{AdminNotification, AdminNotifier, ChannelNotifier, LogNotifier, NotificationKind, NotifyError};
pub use store::{CrmStore, FlowStateStore, RecordQuery, StoreError};
