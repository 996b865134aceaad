//! Message shapes exchanged with the transport layer
//!
//! `inbound` holds what a contact sent; `outbound` holds what the engine
//! wants delivered back.

pub mod inbound;
pub mod outbound;

pub use inbound::{InboundContent, InboundMessage, MediaKind};
pub use outbound::{MessagePayload, OutboundMessage, PayloadError};
