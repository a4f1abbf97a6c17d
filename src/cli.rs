//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::classifier::CostTracker;
use crate::config::Config;
use crate::context::AppContext;
use crate::error::Result;
use crate::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "inbox-triage")]
#[command(version)]
#[command(about = "Classifies Gmail threads with a language model and applies triage labels", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the scheduled trigger and the OAuth sign-in routes
    Serve {
        /// Address to bind, overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one batch over every mailbox with stored credentials
    Run,

    /// Process a single mailbox
    Process {
        /// Mailbox address
        #[arg(long)]
        email: String,
    },

    /// Show stored credentials without secrets
    Inspect,

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute a parsed command
pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::InitConfig { force } => {
            if cli.config.exists() && !force {
                return Err(crate::error::TriageError::ConfigError(format!(
                    "{} already exists, pass --force to overwrite",
                    cli.config.display()
                )));
            }
            Config::create_example(&cli.config).await?;
            println!("Wrote default configuration to {}", cli.config.display());
            Ok(())
        }

        Commands::Inspect => {
            let config = Config::load(&cli.config).await?;
            let store = AppContext::open_store(&config)?;
            let credentials = AppContext::credential_store(&config, store)?;
            print_json(&credentials.overview().await?)
        }

        Commands::Run => {
            let context = AppContext::from_config(Config::load(&cli.config).await?)?;
            let report = context.pipeline.process_all().await?;
            print_json(&report)
        }

        Commands::Process { email } => {
            let context = AppContext::from_config(Config::load(&cli.config).await?)?;
            let cost = CostTracker::new();
            let report = context.pipeline.process_mailbox(&email, &cost).await;
            info!("Classifier cost for {}: ${:.4}", email, cost.total());
            print_json(&report)
        }

        Commands::Serve { bind } => {
            let context = AppContext::from_config(Config::load(&cli.config).await?)?;
            Config::require(&context.config.server.cron_secret, "CRON_SECRET")?;
            let bind = bind.unwrap_or_else(|| context.config.server.bind.clone());
            server::serve(Arc::new(AppState::from_context(&context)), &bind).await
        }
    }
}
