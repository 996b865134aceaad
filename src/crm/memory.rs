//! In-memory store
//!
//! Backs tests and the CLI simulator. Every read-modify-write happens under a
//! single write lock, which gives the get-or-create and update operations the
//! atomicity the engine relies on.

use super::models::{Contact, CustomerProfile, Record};
use super::store::{
    ContactUpdate, CrmStore, FlowStateStore, ProfileUpdate, RecordQuery, StoreError,
};
use crate::flows::state::ContactFlowState;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
struct Tables {
    contacts: HashMap<String, Contact>,
    profiles: HashMap<String, CustomerProfile>,
    collections: HashMap<String, Vec<Record>>,
    states: HashMap<String, ContactFlowState>,
}

/// Store holding everything in process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    /// Reject queries on collections never seeded or written
    strict_collections: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail queries against unknown collections instead of returning nothing
    pub fn with_strict_collections(mut self) -> Self {
        self.strict_collections = true;
        self
    }

    /// Seed a collection
    pub fn with_records(self, collection: impl Into<String>, records: Vec<Record>) -> Self {
        self.tables
            .write()
            .collections
            .entry(collection.into())
            .or_default()
            .extend(records.into_iter().map(with_id));
        self
    }

    /// Seed collections from a JSON5 file of the form
    /// `{ "products_and_services.Product": [ {...}, ... ] }`
    pub fn load_seed_file(&self, path: &Path) -> Result<usize, StoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Backend(format!("{}: {e}", path.display())))?;
        let seed: HashMap<String, Vec<Value>> = json5::from_str(&content)
            .map_err(|e| StoreError::Backend(format!("{}: {e}", path.display())))?;

        let mut parsed: Vec<(String, Vec<Record>)> = Vec::with_capacity(seed.len());
        for (collection, rows) in seed {
            let records = rows
                .into_iter()
                .map(|row| match row {
                    Value::Object(record) => Ok(with_id(record)),
                    other => Err(StoreError::InvalidValue {
                        field: collection.clone(),
                        reason: format!("seed rows must be objects, got {other}"),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            parsed.push((collection, records));
        }

        let count = parsed.iter().map(|(_, records)| records.len()).sum();
        let mut tables = self.tables.write();
        for (collection, records) in parsed {
            tables.collections.entry(collection).or_default().extend(records);
        }
        Ok(count)
    }

    /// Snapshot of a collection
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.tables
            .read()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

fn with_id(mut record: Record) -> Record {
    if !record.contains_key("id") {
        record.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
    }
    record
}

#[async_trait]
impl CrmStore for InMemoryStore {
    async fn get_or_create_contact(
        &self,
        whatsapp_id: &str,
        name: Option<&str>,
    ) -> Result<(Contact, bool), StoreError> {
        let mut tables = self.tables.write();
        if let Some(contact) = tables.contacts.get_mut(whatsapp_id) {
            contact.last_seen = chrono::Utc::now();
            if contact.name.is_none() {
                contact.name = name.map(str::to_string);
            }
            return Ok((contact.clone(), false));
        }
        let mut contact = Contact::new(whatsapp_id);
        contact.name = name.map(str::to_string);
        tables.contacts.insert(whatsapp_id.to_string(), contact.clone());
        Ok((contact, true))
    }

    async fn get_contact(&self, whatsapp_id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(self.tables.read().contacts.get(whatsapp_id).cloned())
    }

    async fn update_contact(
        &self,
        whatsapp_id: &str,
        update: ContactUpdate,
    ) -> Result<Contact, StoreError> {
        let mut tables = self.tables.write();
        let current = tables
            .contacts
            .get(whatsapp_id)
            .ok_or_else(|| StoreError::ContactNotFound(whatsapp_id.to_string()))?;
        // work on a copy so a failed update leaves the row untouched
        let mut updated = current.clone();
        update(&mut updated)?;
        tables.contacts.insert(whatsapp_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn get_profile(&self, whatsapp_id: &str) -> Result<Option<CustomerProfile>, StoreError> {
        Ok(self.tables.read().profiles.get(whatsapp_id).cloned())
    }

    async fn get_or_create_profile(
        &self,
        whatsapp_id: &str,
    ) -> Result<(CustomerProfile, bool), StoreError> {
        let mut tables = self.tables.write();
        if let Some(profile) = tables.profiles.get(whatsapp_id) {
            return Ok((profile.clone(), false));
        }
        let profile = CustomerProfile::new(whatsapp_id);
        tables.profiles.insert(whatsapp_id.to_string(), profile.clone());
        Ok((profile, true))
    }

    async fn update_profile(
        &self,
        whatsapp_id: &str,
        update: ProfileUpdate,
    ) -> Result<CustomerProfile, StoreError> {
        let mut tables = self.tables.write();
        let mut updated = tables
            .profiles
            .get(whatsapp_id)
            .cloned()
            .unwrap_or_else(|| CustomerProfile::new(whatsapp_id));
        update(&mut updated)?;
        tables.profiles.insert(whatsapp_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn query(&self, collection: &str, query: &RecordQuery) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables.read();
        match tables.collections.get(collection) {
            Some(records) => query.apply(records),
            None if self.strict_collections => {
                Err(StoreError::UnknownCollection(collection.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn create_record(&self, collection: &str, record: Record) -> Result<Record, StoreError> {
        let record = with_id(record);
        self.tables
            .write()
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl FlowStateStore for InMemoryStore {
    async fn load_state(&self, contact_id: &str) -> Result<Option<ContactFlowState>, StoreError> {
        Ok(self.tables.read().states.get(contact_id).cloned())
    }

    async fn save_state(&self, state: &ContactFlowState) -> Result<(), StoreError> {
        self.tables
            .write()
            .states
            .insert(state.contact_id.clone(), state.clone());
        Ok(())
    }

    async fn clear_state(&self, contact_id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.write().states.remove(contact_id).is_some())
    }
}
