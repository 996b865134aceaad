//! wacrm library
//!
//! Conversational flow engine for a WhatsApp CRM: declarative step graphs,
//! template-interpolated messages, and actions against CRM data.

pub mod cli;
pub mod config;
pub mod crm;
pub mod flows;
pub mod logging;
pub mod messages;
