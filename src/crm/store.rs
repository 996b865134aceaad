//! Data-access boundary
//!
//! The engine only needs get / get-or-create / update / query operations over
//! contacts, profiles, generic records and flow states. Storage engines plug in
//! behind [`CrmStore`] and [`FlowStateStore`].

use super::models::{Contact, CustomerProfile, Record};
use crate::flows::context::{display, loosely_equal, lookup_in};
use crate::flows::state::ContactFlowState;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("contact not found: {0}")]
    ContactNotFound(String),
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("field is read-only: {0}")]
    ReadOnlyField(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("invalid filter {filter}: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Read-modify-write closure for a contact
pub type ContactUpdate = Box<dyn FnOnce(&mut Contact) -> Result<(), StoreError> + Send>;

/// Read-modify-write closure for a profile
pub type ProfileUpdate = Box<dyn FnOnce(&mut CustomerProfile) -> Result<(), StoreError> + Send>;

/// Filter/order/limit query over a record collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// Lookup filters such as `{"sku__iexact": "POS-1", "price__lte": 200}`
    pub filters: Map<String, Value>,
    /// Fields to order by; a `-` prefix sorts descending
    pub order_by: Vec<String>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    /// Records that satisfy the query, ordered and limited
    pub fn apply<'r>(&self, records: impl IntoIterator<Item = &'r Record>) -> Result<Vec<Record>, StoreError> {
        let filters: Vec<Filter> = self
            .filters
            .iter()
            .map(|(key, value)| Filter::parse(key, value))
            .collect::<Result<_, _>>()?;

        let mut matched: Vec<Record> = records
            .into_iter()
            .filter(|record| filters.iter().all(|f| f.matches(record)))
            .cloned()
            .collect();

        if !self.order_by.is_empty() {
            matched.sort_by(|a, b| {
                for key in &self.order_by {
                    let (field, descending) = match key.strip_prefix('-') {
                        Some(field) => (field, true),
                        None => (key.as_str(), false),
                    };
                    let path = field.replace("__", ".");
                    let ord = compare_values(
                        record_field(a, &path).unwrap_or(&Value::Null),
                        record_field(b, &path).unwrap_or(&Value::Null),
                    );
                    let ord = if descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    IsNull,
}

impl Lookup {
    fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "exact" => Self::Exact,
            "iexact" => Self::IExact,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "startswith" => Self::StartsWith,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "in" => Self::In,
            "isnull" => Self::IsNull,
            _ => return None,
        })
    }
}

#[derive(Debug)]
struct Filter<'q> {
    path: String,
    lookup: Lookup,
    value: &'q Value,
}

impl<'q> Filter<'q> {
    fn parse(key: &str, value: &'q Value) -> Result<Self, StoreError> {
        let (field, lookup) = match key.rsplit_once("__") {
            Some((field, suffix)) => match Lookup::from_suffix(suffix) {
                Some(lookup) => (field, lookup),
                None => (key, Lookup::Exact),
            },
            None => (key, Lookup::Exact),
        };
        if field.is_empty() {
            return Err(StoreError::InvalidFilter {
                filter: key.to_string(),
                reason: "empty field name".into(),
            });
        }
        if lookup == Lookup::In && !value.is_array() {
            return Err(StoreError::InvalidFilter {
                filter: key.to_string(),
                reason: "`in` expects a list".into(),
            });
        }
        Ok(Self {
            path: field.replace("__", "."),
            lookup,
            value,
        })
    }

    fn matches(&self, record: &Record) -> bool {
        let actual = record_field(record, &self.path);
        if self.lookup == Lookup::IsNull {
            let is_null = actual.is_none_or(Value::is_null);
            return self.value.as_bool().unwrap_or(true) == is_null;
        }
        let Some(actual) = actual else {
            return false;
        };
        match self.lookup {
            Lookup::Exact => loosely_equal(actual, self.value),
            Lookup::IExact => display(actual).to_lowercase() == display(self.value).to_lowercase(),
            Lookup::Contains => display(actual).contains(&display(self.value)),
            Lookup::IContains => display(actual)
                .to_lowercase()
                .contains(&display(self.value).to_lowercase()),
            Lookup::StartsWith => display(actual).starts_with(&display(self.value)),
            Lookup::Gt => compare_values(actual, self.value) == Ordering::Greater,
            Lookup::Gte => compare_values(actual, self.value) != Ordering::Less,
            Lookup::Lt => compare_values(actual, self.value) == Ordering::Less,
            Lookup::Lte => compare_values(actual, self.value) != Ordering::Greater,
            Lookup::In => self
                .value
                .as_array()
                .is_some_and(|options| options.iter().any(|v| loosely_equal(actual, v))),
            Lookup::IsNull => false,
        }
    }
}

fn record_field<'r>(record: &'r Record, path: &str) -> Option<&'r Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = record.get(head)?;
    match rest {
        Some(rest) => lookup_in(value, rest),
        None => Some(value),
    }
}

/// Order values: null first, then numbers numerically, then everything else
/// by display text. Numeric strings compare as numbers.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => display(a).cmp(&display(b)),
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Contacts, profiles and generic records
#[async_trait]
pub trait CrmStore: Send + Sync {
    /// Fetch or create a contact. The flag is true when the contact was created.
    async fn get_or_create_contact(
        &self,
        whatsapp_id: &str,
        name: Option<&str>,
    ) -> Result<(Contact, bool), StoreError>;

    async fn get_contact(&self, whatsapp_id: &str) -> Result<Option<Contact>, StoreError>;

    /// Atomically modify a contact and return the stored result
    async fn update_contact(
        &self,
        whatsapp_id: &str,
        update: ContactUpdate,
    ) -> Result<Contact, StoreError>;

    async fn get_profile(&self, whatsapp_id: &str) -> Result<Option<CustomerProfile>, StoreError>;

    /// Fetch or create the contact's profile. The flag is true on creation.
    async fn get_or_create_profile(
        &self,
        whatsapp_id: &str,
    ) -> Result<(CustomerProfile, bool), StoreError>;

    /// Atomically get-or-create then modify a profile
    async fn update_profile(
        &self,
        whatsapp_id: &str,
        update: ProfileUpdate,
    ) -> Result<CustomerProfile, StoreError>;

    /// Query a collection (`app_label.ModelName`). Zero matches is `Ok(vec![])`.
    async fn query(&self, collection: &str, query: &RecordQuery) -> Result<Vec<Record>, StoreError>;

    /// Insert a record, assigning an `id` when absent. Returns the stored record.
    async fn create_record(&self, collection: &str, record: Record) -> Result<Record, StoreError>;
}

/// Per-contact flow cursor persistence
#[async_trait]
pub trait FlowStateStore: Send + Sync {
    async fn load_state(&self, contact_id: &str) -> Result<Option<ContactFlowState>, StoreError>;

    async fn save_state(&self, state: &ContactFlowState) -> Result<(), StoreError>;

    /// Remove the contact's state. Returns whether one existed.
    async fn clear_state(&self, contact_id: &str) -> Result<bool, StoreError>;
}
