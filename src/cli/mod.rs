//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `validate <path>` -- load flow definitions and report graph errors
//! - `simulate` -- chat with the flows from the terminal against an
//!   in-memory store
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// WhatsApp CRM conversational flow engine.
#[derive(Parser, Debug)]
#[command(
    name = "wacrm",
    version = env!("CARGO_PKG_VERSION"),
    about = "wacrm: declarative conversational flows for a WhatsApp CRM"
)]
pub struct Cli {
    /// Configuration file (default: $WACRM_CONFIG_PATH or the user config dir).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load flow definitions and report validation errors.
    Validate {
        /// Flow file or directory of .json5/.json files.
        path: PathBuf,
    },

    /// Run a conversation from stdin. Lines starting with `#` are sent as
    /// interactive replies (`#urgent_very`), `/quit` exits.
    Simulate {
        /// Flow file or directory (default: engine.flowsPath from config).
        #[arg(short, long)]
        flows: Option<PathBuf>,

        /// WhatsApp id of the simulated contact.
        #[arg(long, default_value = "263770000000")]
        contact: String,

        /// Display name of the simulated contact.
        #[arg(long)]
        name: Option<String>,

        /// Seed records for query_model (default: store.seedPath from config).
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Print version, build date, and git commit information.
    Version,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

use crate::config::AppConfig;
use crate::crm::{AdminNotification, ChannelNotifier, InMemoryStore};
use crate::flows::{create_engine, DefinitionError, FlowCatalog, FlowEngine, FlowError, PassStatus, StepKind};
use crate::messages::InboundMessage;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Run the `validate <path>` subcommand.
pub fn handle_validate(path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = load_catalog(path)?;
    println!("{} flow version(s) in {}", catalog.len(), path.display());
    for flow in catalog.all() {
        let definition = flow.definition();
        println!(
            "  {} v{}{}: {} step(s), entry '{}', triggers [{}]",
            flow.name(),
            flow.version(),
            if flow.is_active() { "" } else { " (inactive)" },
            definition.steps.len(),
            flow.entry_step().name,
            definition.trigger_keywords.join(", ")
        );
        let switches: Vec<&str> = definition
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::SwitchFlow(config) => Some(config.target_flow_name.as_str()),
                _ => None,
            })
            .collect();
        if !switches.is_empty() {
            println!("    switches to: {}", switches.join(", "));
        }
    }
    Ok(())
}

/// Run the `simulate` subcommand.
pub async fn handle_simulate(
    config: &AppConfig,
    flows: Option<PathBuf>,
    contact: &str,
    name: Option<String>,
    seed: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let flows_path = flows.unwrap_or_else(|| config.engine.flows_path.clone());
    let catalog = load_catalog(&flows_path)?;

    let mut store = InMemoryStore::new();
    if config.store.strict_collections {
        store = store.with_strict_collections();
    }
    if let Some(seed) = seed.or_else(|| config.store.seed_path.clone()) {
        let count = store.load_seed_file(&seed)?;
        println!("Seeded {} record(s) from {}", count, seed.display());
    }

    let (admin_tx, mut admin_rx) = mpsc::channel::<AdminNotification>(64);
    tokio::spawn(async move {
        while let Some(notification) = admin_rx.recv().await {
            println!("[admin] {}", notification.message);
        }
    });

    let engine = build_engine(config, catalog, Arc::new(store))?
        .with_notifier(Arc::new(ChannelNotifier::new(admin_tx)));

    println!(
        "Simulating contact {} with {} flow(s). Type a message, '#id' for a button reply, '/quit' to exit.",
        contact,
        engine.catalog().len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let message = match line.strip_prefix('#') {
            Some(id) => InboundMessage::interactive(contact, id, id),
            None => InboundMessage::text_message(contact, line),
        };
        let message = match &name {
            Some(name) => message.with_contact_name(name.as_str()),
            None => message,
        };

        let outcome = engine.handle_inbound(message).await?;
        for message in &outcome.messages {
            println!("bot> {}", message.payload.preview());
        }
        match &outcome.status {
            PassStatus::AwaitingReply => {}
            PassStatus::NoFlow => println!("   (no flow matched)"),
            PassStatus::Parked => println!("   (waiting for a human agent)"),
            PassStatus::HandedOver => println!("   (handed over to a human agent)"),
            PassStatus::Completed => println!("   (flow completed)"),
            PassStatus::Terminated { reason } => println!("   (flow terminated: {})", reason),
        }
    }
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("wacrm {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("WACRM_BUILD_DATE"));
    println!("  Git commit: {}", env!("WACRM_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Every definition error of a failed load, one per line.
#[derive(Debug)]
pub struct FlowLoadError(pub Vec<DefinitionError>);

impl std::fmt::Display for FlowLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} flow definition error(s):", self.0.len())?;
        for error in &self.0 {
            writeln!(f, "  - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FlowLoadError {}

fn load_catalog(path: &std::path::Path) -> Result<FlowCatalog, FlowLoadError> {
    FlowCatalog::load_path(path).map_err(FlowLoadError)
}

/// Engine configured from the `engine` section.
pub fn build_engine(
    config: &AppConfig,
    catalog: FlowCatalog,
    store: Arc<InMemoryStore>,
) -> Result<FlowEngine, FlowError> {
    if let Some(flow) = &config.engine.default_flow {
        if catalog.get(flow).is_none() {
            return Err(FlowError::UnknownFlow(flow.clone()));
        }
    }
    let engine = create_engine(catalog, store).with_max_steps_per_pass(config.engine.max_steps_per_pass);
    Ok(match &config.engine.default_flow {
        Some(flow) => engine.with_default_flow(flow.as_str()),
        None => engine,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["wacrm"]).is_err());
    }

    #[test]
    fn test_cli_version_subcommand() {
        let cli = Cli::try_parse_from(["wacrm", "version"]).unwrap();
        assert!(matches!(cli.command, Command::Version));
    }

    #[test]
    fn test_cli_validate() {
        let cli = Cli::try_parse_from(["wacrm", "validate", "flows/"]).unwrap();
        match cli.command {
            Command::Validate { ref path } => assert_eq!(path, &PathBuf::from("flows/")),
            other => panic!("Expected Validate, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_simulate_defaults() {
        let cli = Cli::try_parse_from(["wacrm", "simulate"]).unwrap();
        match cli.command {
            Command::Simulate {
                flows,
                contact,
                name,
                seed,
            } => {
                assert!(flows.is_none());
                assert_eq!(contact, "263770000000");
                assert!(name.is_none());
                assert!(seed.is_none());
            }
            other => panic!("Expected Simulate, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_global_config_flag() {
        let cli = Cli::try_parse_from([
            "wacrm", "simulate", "--flows", "flows", "--contact", "2637", "--config", "wacrm.json5",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("wacrm.json5")));
        assert!(matches!(cli.command, Command::Simulate { ref contact, .. } if contact == "2637"));
    }

    #[test]
    fn test_validate_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("broken.json5"),
            r#"{ name: "broken", steps: [{ name: "a", type: "send_message", config: { message_type: "text", text: { body: "x" } }, transitions: [{ to_step: "nowhere" }] }] }"#,
        )
        .unwrap();
        let err = handle_validate(dir.path()).unwrap_err();
        assert!(err.to_string().contains("flow definition error"));
    }

    #[test]
    fn test_build_engine_applies_settings() {
        let catalog = FlowCatalog::from_definitions(
            crate::flows::parse_flows(
                r#"{ name: "welcome", steps: [{ name: "end", is_entry_point: true, type: "end_flow" }] }"#,
                "test",
            )
            .unwrap(),
        )
        .unwrap();
        let mut config = AppConfig::default();
        config.engine.default_flow = Some("welcome".into());
        let engine = build_engine(&config, catalog, Arc::new(InMemoryStore::new())).unwrap();
        let debug = format!("{:?}", engine);
        assert!(debug.contains("welcome"));
    }

    #[test]
    fn test_build_engine_rejects_unknown_default_flow() {
        let mut config = AppConfig::default();
        config.engine.default_flow = Some("welcome".into());
        let err = build_engine(&config, FlowCatalog::new(), Arc::new(InMemoryStore::new())).unwrap_err();
        assert!(matches!(err, FlowError::UnknownFlow(name) if name == "welcome"));
    }
}
