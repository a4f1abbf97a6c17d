use anyhow::Result;
use clap::Parser;
use inbox_triage::cli::{self, Cli};
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Exit with proper code on error
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        eprintln!("\nFor help, run: inbox-triage --help");
        process::exit(1);
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "inbox_triage=debug,info"
    } else {
        "inbox_triage=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    tracing::debug!("Parsed arguments: {:?}", cli);
    cli::execute(cli).await?;
    Ok(())
}
