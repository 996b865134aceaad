//! Outbound message shapes
//!
//! The engine never talks to the WhatsApp transport directly. Every message a
//! flow wants to send is resolved from its `message_config`, validated into a
//! [`MessagePayload`], and handed to the delivery collaborator wrapped in an
//! [`OutboundMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Max buttons on an interactive button message
pub const MAX_BUTTONS: usize = 3;

/// Max rows across all sections of an interactive list
pub const MAX_LIST_ROWS: usize = 10;

/// Unique identifier for an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from validating a resolved message config
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("message config does not match any payload shape: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

impl PayloadError {
    fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            kind,
            reason: reason.into(),
        }
    }
}

/// Text body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub body: String,
    #[serde(default)]
    pub preview_url: bool,
}

/// Media reference. At least one of `id` or `link` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MediaContent {
    fn has_source(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        set(&self.id) || set(&self.link)
    }
}

/// Interactive message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveKind {
    Button,
    List,
}

/// Text wrapper used by interactive body and footer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveText {
    pub text: String,
}

/// Reply button
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

/// Button wrapper (`{"type": "reply", "reply": {...}}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveButton {
    #[serde(rename = "type", default = "default_button_type")]
    pub kind: String,
    pub reply: ReplyButton,
}

fn default_button_type() -> String {
    "reply".to_string()
}

/// Row of an interactive list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Section of an interactive list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub rows: Vec<ListRow>,
}

/// Interactive action block: buttons for `button`, sections for `list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractiveAction {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<InteractiveButton>,
    /// Label of the list-opening button
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<ListSection>,
}

/// Interactive header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<MediaContent>,
}

/// Interactive button or list message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveContent {
    #[serde(rename = "type")]
    pub kind: InteractiveKind,
    pub body: InteractiveText,
    pub action: InteractiveAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<InteractiveHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<InteractiveText>,
}

/// Template language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLanguage {
    pub code: String,
}

/// Pre-approved template message. Components pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateContent {
    pub name: String,
    pub language: TemplateLanguage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Value>,
}

/// Location pin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationContent {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A validated message, in the shape the delivery collaborator expects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text { text: TextContent },
    Image { image: MediaContent },
    Document { document: MediaContent },
    Audio { audio: MediaContent },
    Video { video: MediaContent },
    Sticker { sticker: MediaContent },
    Interactive { interactive: InteractiveContent },
    Template { template: TemplateContent },
    /// Contact cards, passed through as provider objects
    Contacts { contacts: Vec<Value> },
    Location { location: LocationContent },
}

impl MessagePayload {
    /// Plain text payload
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text {
            text: TextContent {
                body: body.into(),
                preview_url: false,
            },
        }
    }

    /// Parse and validate a resolved `message_config`
    pub fn from_config(config: &Value) -> Result<Self, PayloadError> {
        let payload: Self = serde_json::from_value(config.clone())?;
        payload.validate()?;
        Ok(payload)
    }

    /// Message type label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Document { .. } => "document",
            Self::Audio { .. } => "audio",
            Self::Video { .. } => "video",
            Self::Sticker { .. } => "sticker",
            Self::Interactive { .. } => "interactive",
            Self::Template { .. } => "template",
            Self::Contacts { .. } => "contacts",
            Self::Location { .. } => "location",
        }
    }

    /// Best-effort human readable text, for logs and the CLI simulator
    pub fn preview(&self) -> String {
        match self {
            Self::Text { text } => text.body.clone(),
            Self::Image { image: m }
            | Self::Document { document: m }
            | Self::Audio { audio: m }
            | Self::Video { video: m }
            | Self::Sticker { sticker: m } => {
                let source = m.id.as_deref().or(m.link.as_deref()).unwrap_or_default();
                match &m.caption {
                    Some(caption) => format!("[{}: {}] {}", self.kind(), source, caption),
                    None => format!("[{}: {}]", self.kind(), source),
                }
            }
            Self::Interactive { interactive } => {
                let mut out = interactive.body.text.clone();
                for button in &interactive.action.buttons {
                    out.push_str(&format!("\n  [#{}] {}", button.reply.id, button.reply.title));
                }
                for row in interactive.action.sections.iter().flat_map(|s| &s.rows) {
                    out.push_str(&format!("\n  [#{}] {}", row.id, row.title));
                }
                out
            }
            Self::Template { template } => format!("[template: {}]", template.name),
            Self::Contacts { contacts } => format!("[{} contact card(s)]", contacts.len()),
            Self::Location { location } => format!(
                "[location: {}, {}]",
                location.latitude, location.longitude
            ),
        }
    }

    /// Check provider-level constraints the type system can't express
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            Self::Text { text } => {
                if text.body.trim().is_empty() {
                    return Err(PayloadError::invalid("text", "empty body"));
                }
            }
            Self::Image { image: m }
            | Self::Document { document: m }
            | Self::Audio { audio: m }
            | Self::Video { video: m }
            | Self::Sticker { sticker: m } => {
                if !m.has_source() {
                    return Err(PayloadError::invalid(self.kind(), "media needs an id or a link"));
                }
            }
            Self::Interactive { interactive } => validate_interactive(interactive)?,
            Self::Template { template } => {
                if template.name.trim().is_empty() {
                    return Err(PayloadError::invalid("template", "missing template name"));
                }
            }
            Self::Contacts { contacts } => {
                if contacts.is_empty() {
                    return Err(PayloadError::invalid("contacts", "no contact cards"));
                }
            }
            Self::Location { location } => {
                if !(-90.0..=90.0).contains(&location.latitude)
                    || !(-180.0..=180.0).contains(&location.longitude)
                {
                    return Err(PayloadError::invalid("location", "coordinates out of range"));
                }
            }
        }
        Ok(())
    }
}

fn validate_interactive(interactive: &InteractiveContent) -> Result<(), PayloadError> {
    if interactive.body.text.trim().is_empty() {
        return Err(PayloadError::invalid("interactive", "empty body text"));
    }
    match interactive.kind {
        InteractiveKind::Button => {
            let count = interactive.action.buttons.len();
            if count == 0 || count > MAX_BUTTONS {
                return Err(PayloadError::invalid(
                    "interactive",
                    format!("button message needs 1-{MAX_BUTTONS} buttons, got {count}"),
                ));
            }
        }
        InteractiveKind::List => {
            if interactive
                .action
                .button
                .as_deref()
                .is_none_or(|b| b.trim().is_empty())
            {
                return Err(PayloadError::invalid("interactive", "list message needs a button label"));
            }
            let rows: usize = interactive.action.sections.iter().map(|s| s.rows.len()).sum();
            if rows == 0 || rows > MAX_LIST_ROWS {
                return Err(PayloadError::invalid(
                    "interactive",
                    format!("list message needs 1-{MAX_LIST_ROWS} rows, got {rows}"),
                ));
            }
        }
    }
    Ok(())
}

/// A message the engine asks the delivery collaborator to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    /// Recipient contact (WhatsApp id)
    pub contact_id: String,
    pub payload: MessagePayload,
    /// Flow that produced the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_name: Option<String>,
    /// Step that produced the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl OutboundMessage {
    /// Create a new outbound message
    pub fn new(contact_id: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: MessageId::new(),
            contact_id: contact_id.into(),
            payload,
            flow_name: None,
            step_name: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Tag the message with the flow step it came from
    pub fn from_step(mut self, flow_name: impl Into<String>, step_name: impl Into<String>) -> Self {
        self.flow_name = Some(flow_name.into());
        self.step_name = Some(step_name.into());
        self
    }
}
