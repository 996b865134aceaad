//! Per-contact flow cursor and per-contact serialization.

use crate::flows::context::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Where a contact's flow run is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Executing automatic steps.
    #[default]
    Active,
    /// Suspended on a question step.
    AwaitingReply,
    /// Parked for a human agent.
    HandedOver,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::AwaitingReply => write!(f, "awaiting_reply"),
            Self::HandedOver => write!(f, "handed_over"),
        }
    }
}

/// Mutable cursor of one contact inside one flow run.
///
/// The context is owned by the state and lives exactly as long as the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactFlowState {
    pub contact_id: String,
    pub flow_name: String,
    pub flow_version: u32,
    pub current_step: String,
    #[serde(default)]
    pub context: Context,
    /// Invalid replies received for the current step.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: FlowStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl ContactFlowState {
    /// Fresh state positioned on `entry_step`.
    pub fn new(
        contact_id: impl Into<String>,
        flow_name: impl Into<String>,
        flow_version: u32,
        entry_step: impl Into<String>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            contact_id: contact_id.into(),
            flow_name: flow_name.into(),
            flow_version,
            current_step: entry_step.into(),
            context,
            retry_count: 0,
            status: FlowStatus::Active,
            started_at: now,
            last_updated_at: now,
        }
    }

    /// Move to another step, resetting the retry counter.
    pub fn advance_to(&mut self, step: impl Into<String>) {
        self.current_step = step.into();
        self.retry_count = 0;
        self.status = FlowStatus::Active;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// Keyed async mutexes serializing passes per contact.
///
/// Each entry counts the callers holding or waiting on it and is dropped when
/// the last one leaves, including callers cancelled while still queued.
#[derive(Debug, Default)]
pub struct ContactLocks {
    locks: Mutex<HashMap<String, LockEntry>>,
}

#[derive(Debug)]
struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `contact_id`.
    pub async fn acquire(&self, contact_id: &str) -> ContactGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            let entry = locks.entry(contact_id.to_string()).or_insert_with(|| LockEntry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                users: 0,
            });
            entry.users += 1;
            entry.lock.clone()
        };
        // registered before waiting so a cancelled wait still releases the entry
        let mut held = ContactGuard {
            owner: self,
            contact_id: contact_id.to_string(),
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    fn release(&self, contact_id: &str) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get_mut(contact_id) {
            entry.users = entry.users.saturating_sub(1);
            if entry.users == 0 {
                locks.remove(contact_id);
            }
        }
    }

    /// Number of contacts with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one contact; released on drop.
pub struct ContactGuard<'a> {
    owner: &'a ContactLocks,
    contact_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for ContactGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner.release(&self.contact_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_advance_resets_retries() {
        let mut state = ContactFlowState::new("2637", "f", 1, "ask", Context::new());
        state.retry_count = 2;
        state.status = FlowStatus::AwaitingReply;
        state.advance_to("next");
        assert_eq!(state.current_step, "next");
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.status, FlowStatus::Active);
    }

    #[test]
    fn test_state_serde_shape() {
        let state = ContactFlowState::new("2637", "f", 2, "ask", Context::new());
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "active");
        assert_eq!(value["flow_version"], 2);
    }

    #[tokio::test]
    async fn test_lock_entry_removed_after_release() {
        let locks = ContactLocks::new();
        {
            let _guard = locks.acquire("2637").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_contact_is_serialized() {
        let locks = Arc::new(ContactLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("2637").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_entry() {
        let locks = Arc::new(ContactLocks::new());
        let holder = locks.acquire("2637").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("2637").await;
            })
        };
        // let the waiter queue behind the holder
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.len(), 1);

        drop(holder);
        waiter.abort();
        let _ = waiter.await;
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_waiter_releases_entry() {
        let locks = ContactLocks::new();
        {
            let _holder = locks.acquire("2637").await;
            let waited = tokio::time::timeout(Duration::from_millis(10), locks.acquire("2637")).await;
            assert!(waited.is_err());
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_contacts_do_not_block() {
        let locks = ContactLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("b")).await;
        assert!(b.is_ok());
    }
}
