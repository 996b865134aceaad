//! CRM records touched by flows
//!
//! Contacts and customer profiles are typed. Everything else (products,
//! services, opportunities) lives in generic [`Record`] collections addressed
//! as `app_label.ModelName`.

use super::store::StoreError;
use crate::flows::context::{display, set_path, Context};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A generic catalog record
pub type Record = Map<String, Value>;

/// A WhatsApp contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// WhatsApp id (phone number)
    pub whatsapp_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub needs_human_intervention: bool,
    #[serde(default)]
    pub intervention_requested_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Contact {
    pub fn new(whatsapp_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            whatsapp_id: whatsapp_id.into(),
            name: None,
            needs_human_intervention: false,
            intervention_requested_at: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Flag the contact for a human agent
    pub fn request_intervention(&mut self) {
        self.needs_human_intervention = true;
        self.intervention_requested_at = Some(Utc::now());
    }

    /// Write a field by dotted path. Unknown fields are rejected.
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<(), StoreError> {
        if top_level(path) == "whatsapp_id" {
            return Err(StoreError::ReadOnlyField(path.to_string()));
        }
        *self = patch(self, path, value, None)?;
        Ok(())
    }
}

/// Sales pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    New,
    Contacted,
    Qualified,
    ProposalSent,
    Negotiation,
    Won,
    Lost,
    OnHold,
}

/// Customer profile, one per contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub whatsapp_id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub address_line_1: Option<String>,
    #[serde(default)]
    pub address_line_2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state_province: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub lead_status: LeadStatus,
    #[serde(default)]
    pub potential_value: Option<f64>,
    #[serde(default)]
    pub acquisition_source: Option<String>,
    #[serde(default)]
    pub lead_score: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub custom_attributes: Context,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const PROFILE_READ_ONLY: &[&str] = &["whatsapp_id", "created_at", "updated_at"];

impl CustomerProfile {
    pub fn new(whatsapp_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            whatsapp_id: whatsapp_id.into(),
            first_name: None,
            last_name: None,
            email: None,
            company: None,
            role: None,
            address_line_1: None,
            address_line_2: None,
            city: None,
            state_province: None,
            postal_code: None,
            country: None,
            lead_status: LeadStatus::New,
            potential_value: None,
            acquisition_source: None,
            lead_score: 0,
            tags: Vec::new(),
            notes: None,
            custom_attributes: Context::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Write a field by dotted path.
    ///
    /// Paths whose first segment is not a profile field are stored under
    /// `custom_attributes`.
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<(), StoreError> {
        if PROFILE_READ_ONLY.contains(&top_level(path)) {
            return Err(StoreError::ReadOnlyField(path.to_string()));
        }
        let mut updated: Self = patch(self, path, value, Some("custom_attributes"))?;
        updated.updated_at = Utc::now();
        *self = updated;
        Ok(())
    }
}

fn top_level(path: &str) -> &str {
    path.split('.').next().unwrap_or_default().trim()
}

/// Apply a dotted-path write through the record's serde form.
///
/// The result must still deserialize into `T`, so a write that breaks the
/// record's shape (e.g. text into `lead_score`) is rejected.
fn patch<T>(record: &T, path: &str, value: Value, overflow: Option<&str>) -> Result<T, StoreError>
where
    T: Serialize + DeserializeOwned,
{
    let Value::Object(mut fields) = serde_json::to_value(record)? else {
        return Err(StoreError::Backend("record did not serialize to a map".into()));
    };
    let head = top_level(path);
    if head.is_empty() {
        return Err(StoreError::UnknownField(path.to_string()));
    }
    let target = if fields.contains_key(head) {
        path.to_string()
    } else {
        match overflow {
            Some(bucket) => format!("{bucket}.{path}"),
            None => return Err(StoreError::UnknownField(path.to_string())),
        }
    };
    let retry = coerced(&value).map(|alt| (fields.clone(), alt));
    set_path(&mut fields, &target, value);
    match serde_json::from_value(Value::Object(fields)) {
        Ok(updated) => Ok(updated),
        Err(first) => {
            // templates produce loosely typed scalars: "15" for a number
            // field, 5 for a text field
            if let Some((mut fields, alt)) = retry {
                set_path(&mut fields, &target, alt);
                if let Ok(updated) = serde_json::from_value(Value::Object(fields)) {
                    return Ok(updated);
                }
            }
            Err(StoreError::InvalidValue {
                field: path.to_string(),
                reason: first.to_string(),
            })
        }
    }
}

/// The other scalar reading of a value, if it has one.
fn coerced(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) | Value::Bool(_) => Some(Value::String(display(value))),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(Value::from(i))
            } else if let Ok(f) = s.parse::<f64>() {
                serde_json::Number::from_f64(f).map(Value::Number)
            } else {
                s.parse::<bool>().ok().map(Value::Bool)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_set_known_field() {
        let mut profile = CustomerProfile::new("2637");
        profile.set_field("notes", json!("5")).unwrap();
        profile.set_field("lead_status", json!("qualified")).unwrap();
        assert_eq!(profile.notes.as_deref(), Some("5"));
        assert_eq!(profile.lead_status, LeadStatus::Qualified);
    }

    #[test]
    fn test_profile_unknown_field_goes_to_custom_attributes() {
        let mut profile = CustomerProfile::new("2637");
        profile.set_field("business.tin", json!("200123")).unwrap();
        assert_eq!(profile.custom_attributes["business"]["tin"], "200123");
    }

    #[test]
    fn test_profile_rejects_bad_type_and_read_only() {
        let mut profile = CustomerProfile::new("2637");
        assert!(matches!(
            profile.set_field("lead_score", json!("lots")),
            Err(StoreError::InvalidValue { .. })
        ));
        assert_eq!(profile.lead_score, 0);
        assert!(matches!(
            profile.set_field("whatsapp_id", json!("x")),
            Err(StoreError::ReadOnlyField(_))
        ));
    }

    #[test]
    fn test_profile_coerces_scalars() {
        let mut profile = CustomerProfile::new("2637");
        profile.set_field("notes", json!(5)).unwrap();
        profile.set_field("lead_score", json!("15")).unwrap();
        assert_eq!(profile.notes.as_deref(), Some("5"));
        assert_eq!(profile.lead_score, 15);
    }

    #[test]
    fn test_contact_set_field() {
        let mut contact = Contact::new("2637");
        contact.set_field("name", json!("Tariro")).unwrap();
        assert_eq!(contact.name.as_deref(), Some("Tariro"));
        assert!(matches!(
            contact.set_field("favourite_colour", json!("blue")),
            Err(StoreError::UnknownField(_))
        ));
    }
}
