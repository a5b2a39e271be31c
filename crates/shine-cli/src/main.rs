use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shine_core::{calculate, ServiceAttributes};
use shine_lifecycle::ShineConfig;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "shine-cli")]
#[command(about = "Quotes, service agreements and invoices for Shine Cleaning")]
struct Cli {
    /// Repeat for more detail (-v, -vv, -vvv). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply the Postgres schema.
    Migrate,
    /// Price a booking read as JSON from a file, or stdin when omitted or `-`.
    Quote { input: Option<PathBuf> },
    /// Render a stored contract to PDF.
    Render {
        contract_id: Uuid,
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Settle payment attempts whose outcome is unknown.
    Reconcile,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn read_input(input: Option<PathBuf>) -> Result<String> {
    match input {
        Some(path) if path.to_str() != Some("-") => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        _ => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading booking from stdin")?;
            Ok(text)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = ShineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let engine = shine_lifecycle::engine_from_config(&config).await?;
            shine_web::serve(engine, port.unwrap_or(config.web_port)).await?;
        }
        Commands::Migrate => {
            shine_lifecycle::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Quote { input } => {
            let text = read_input(input).await?;
            let attrs: ServiceAttributes = serde_json::from_str(&text).context("parsing booking attributes")?;
            let rules = config.load_pricing_rules()?;
            let breakdown = calculate(&rules, &attrs)?;
            println!("{}", serde_json::to_string_pretty(&breakdown)?);
        }
        Commands::Render { contract_id, out } => {
            let engine = shine_lifecycle::engine_from_config(&config).await?;
            let rendered = engine.contracts.render_pdf(contract_id).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(format!("{}.pdf", rendered.contract.contract_number)));
            tokio::fs::write(&path, &rendered.bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!(
                "rendered {} ({} bytes) to {}",
                rendered.contract.contract_number,
                rendered.bytes.len(),
                path.display()
            );
        }
        Commands::Reconcile => {
            let engine = shine_lifecycle::engine_from_config(&config).await?;
            let report = engine.reconcile_ambiguous().await?;
            println!(
                "reconcile complete: examined={} resolved={} reopened={} unresolved={}",
                report.examined,
                report.resolved,
                report.reopened,
                report.unresolved.len()
            );
            for number in &report.unresolved {
                println!("  unresolved: {number}");
            }
        }
    }

    Ok(())
}
