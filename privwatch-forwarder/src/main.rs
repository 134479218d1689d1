//! privwatch-forwarder: ships alerts from the local outbox to the cloud
//! collector. Runs as its own process next to the detector daemon.

mod config;
mod ingest;
mod outbox;
mod sync;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::ForwarderConfig;
use ingest::IngestClient;

#[derive(Parser, Debug)]
#[command(
    name = "privwatch-forwarder",
    version,
    about = "Forward privwatch alerts to the cloud collector"
)]
struct Cli {
    /// Run first-time interactive setup
    #[arg(long)]
    setup: bool,

    /// Show config and sync state
    #[arg(long)]
    status: bool,

    /// Forwarder config file
    #[arg(long, default_value = "forwarder.config.json")]
    config: PathBuf,

    /// Detector database path
    #[arg(long, default_value = "data/database/detector.db")]
    db: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let result = if cli.setup {
        setup(&cli.config)
    } else if cli.status {
        status(&cli.config)
    } else {
        sync::run(&cli.config, &cli.db).map_err(Into::into)
    };

    if let Err(error) = result {
        eprintln!("Error: {:#}", error);
        process::exit(1);
    }
}

/// Interactive first-time setup: prompt, verify credentials with an empty
/// batch, persist the config.
fn setup(config_path: &Path) -> anyhow::Result<()> {
    println!();
    println!("{}", "=".repeat(60));
    println!("  PRIVWATCH FORWARDER SETUP");
    println!("{}", "=".repeat(60));
    println!();

    let vercel_url = prompt("Collector URL (e.g. https://your-app.vercel.app): ")?
        .trim_end_matches('/')
        .to_string();
    let api_key = prompt("API key (from the collector registration page): ")?;
    let machine_name = prompt("Machine name for this host (e.g. lab-01): ")?;

    if vercel_url.is_empty() || api_key.is_empty() || machine_name.is_empty() {
        anyhow::bail!("all fields are required");
    }

    println!("\nTesting connection...");
    let client = ingest::HttpIngest::new(&vercel_url, &api_key)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    client
        .post(&[])
        .map_err(|e| anyhow::anyhow!("connection test failed: {}", e))?;
    println!("[OK] Connection successful!\n");

    let config = ForwarderConfig {
        vercel_url,
        api_key,
        machine_name,
        last_synced_id: 0,
        last_sync_time: None,
    };
    config.save(config_path)?;

    println!("Config saved: {}", config_path.display());
    println!("\nSetup complete. Start the service to begin forwarding.");
    Ok(())
}

fn status(config_path: &Path) -> anyhow::Result<()> {
    match ForwarderConfig::load(config_path)? {
        None => {
            println!("[NOT CONFIGURED] Run: privwatch-forwarder --setup");
        }
        Some(config) => {
            println!();
            println!("Config: {}", config_path.display());
            println!("  Collector URL:  {}", config.vercel_url);
            println!("  Machine:        {}", config.machine_name);
            println!("  API key prefix: {}...", config.api_key_prefix());
            println!("  Last synced ID: {}", config.last_synced_id);
            println!(
                "  Last sync:      {}",
                config.last_sync_time.as_deref().unwrap_or("never")
            );
            println!();
        }
    }
    Ok(())
}

fn prompt(message: &str) -> anyhow::Result<String> {
    print!("{}", message);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
