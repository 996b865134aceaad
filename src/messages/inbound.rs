//! Inbound messages
//!
//! Messages received from a contact, as handed to the flow engine by the
//! transport layer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of media attached to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Document,
    Audio,
    Video,
    Sticker,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Document => write!(f, "document"),
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Sticker => write!(f, "sticker"),
        }
    }
}

/// Content of an inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundContent {
    /// Free text
    Text { body: String },
    /// Button or list-row selection
    Interactive {
        /// Stable id of the selected button/row
        id: String,
        /// Title shown to the user
        #[serde(default)]
        title: String,
    },
    /// Media upload
    Media {
        kind: MediaKind,
        /// Provider media id
        media_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Shared location
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

/// A message from a contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider message id
    pub id: String,
    /// Contact identity (WhatsApp id / phone number)
    pub contact_id: String,
    /// Display name from the contact's WhatsApp profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    /// Message content
    pub content: InboundContent,
    /// When the message was received
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl InboundMessage {
    /// Create an inbound message with a generated id
    pub fn new(contact_id: impl Into<String>, content: InboundContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            contact_id: contact_id.into(),
            contact_name: None,
            content,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Free-text message
    pub fn text_message(contact_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(contact_id, InboundContent::Text { body: body.into() })
    }

    /// Interactive reply
    pub fn interactive(
        contact_id: impl Into<String>,
        id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self::new(
            contact_id,
            InboundContent::Interactive {
                id: id.into(),
                title: title.into(),
            },
        )
    }

    /// Media message
    pub fn media(contact_id: impl Into<String>, kind: MediaKind, media_id: impl Into<String>) -> Self {
        Self::new(
            contact_id,
            InboundContent::Media {
                kind,
                media_id: media_id.into(),
                caption: None,
                mime_type: None,
            },
        )
    }

    /// Set the sender's display name
    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = Some(name.into());
        self
    }

    /// Short message type label
    pub fn message_type(&self) -> &'static str {
        match &self.content {
            InboundContent::Text { .. } => "text",
            InboundContent::Interactive { .. } => "interactive",
            InboundContent::Media { kind, .. } => match kind {
                MediaKind::Image => "image",
                MediaKind::Document => "document",
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
                MediaKind::Sticker => "sticker",
            },
            InboundContent::Location { .. } => "location",
        }
    }

    /// Textual content: text body or media caption
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            InboundContent::Text { body } => Some(body),
            InboundContent::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }

    /// Id of the selected button/row, for interactive replies
    pub fn interactive_id(&self) -> Option<&str> {
        match &self.content {
            InboundContent::Interactive { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Read-only facts exposed to templates as `trigger_message`
    pub fn facts(&self) -> Value {
        let (reply_id, reply_title) = match &self.content {
            InboundContent::Interactive { id, title } => (Some(id.as_str()), Some(title.as_str())),
            _ => (None, None),
        };
        let media_id = match &self.content {
            InboundContent::Media { media_id, .. } => Some(media_id.as_str()),
            _ => None,
        };
        json!({
            "id": self.id,
            "message_type": self.message_type(),
            "text_content": self.text().unwrap_or_default(),
            "interactive_reply_id": reply_id,
            "interactive_reply_title": reply_title,
            "media_id": media_id,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}
