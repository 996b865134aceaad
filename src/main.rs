use clap::Parser;
use wacrm::cli::{self, Cli, Command};
use wacrm::config;
use wacrm::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Version => {
            cli::handle_version();
            Ok(())
        }
        Command::Validate { path } => {
            let cfg = config::load_config(cli.config.as_deref())?;
            logging::init_tracing(&cfg.logging)?;
            cli::handle_validate(&path)
        }
        Command::Simulate {
            flows,
            contact,
            name,
            seed,
        } => {
            let cfg = config::load_config(cli.config.as_deref())?;
            logging::init_tracing(&cfg.logging)?;
            cli::handle_simulate(&cfg, flows, &contact, name, seed).await
        }
    }
}
