use anyhow::Context;
use clap::{Parser, Subcommand};
use smartoilgauge_bridge::config_entry::{entry_path, setup_entry, ConfigEntry, EntrySetupError};
use smartoilgauge_bridge::config_flow::{Credentials, FlowResult, SetupFlow, TankOption};
use smartoilgauge_bridge::tank_coordinator::UPDATE_INTERVAL;
use smartoilgauge_bridge::{HomeAssistantAPI, SmartOilGaugeClient};
use std::env;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SETUP_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Publishes Smart Oil Gauge tank readings to Home Assistant
#[derive(Parser, Debug)]
#[command(version, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll the cloud and publish sensors until Ctrl-C (default)
    Run,
    /// Validate credentials, pick tanks and save the config entry
    Setup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Setup => setup().await,
    }
}

async fn run() -> anyhow::Result<()> {
    tracing::info!("Starting Smart Oil Gauge bridge");
    let path = entry_path();
    let entry = ConfigEntry::load(&path).with_context(|| {
        format!(
            "No usable config entry at {}, run `smartoilgauge setup` first",
            path.display()
        )
    })?;

    // Keep setting the entry up until the cloud is reachable
    let loaded = loop {
        let api = SmartOilGaugeClient::new(&entry.client_id, &entry.client_secret)?;
        match setup_entry(&entry, api).await {
            Ok(loaded) => break loaded,
            Err(EntrySetupError::AuthFailed(e)) => {
                return Err(e.context(
                    "Smart Oil Gauge rejected the stored credentials, run `smartoilgauge setup` again",
                ));
            }
            Err(EntrySetupError::NotReady(e)) => {
                tracing::warn!(
                    "Smart Oil Gauge not ready: {e:#}. Retrying in {}s",
                    SETUP_RETRY_INTERVAL.as_secs()
                );
                tokio::time::sleep(SETUP_RETRY_INTERVAL).await;
            }
        }
    };

    let running = loaded.start(HomeAssistantAPI::new(), UPDATE_INTERVAL);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    running.unload();
    Ok(())
}

async fn setup() -> anyhow::Result<()> {
    let path = entry_path();
    let env_credentials = match (env::var("SOG_CLIENT_ID"), env::var("SOG_CLIENT_SECRET")) {
        (Ok(client_id), Ok(client_secret)) => Some(Credentials {
            client_id,
            client_secret,
        }),
        _ => None,
    };

    let mut flow = SetupFlow::new();
    let mut result = flow.start();
    loop {
        result = match result {
            FlowResult::AskCredentials { error } => {
                if let Some(error) = error {
                    println!("{error}");
                    if env_credentials.is_some() {
                        anyhow::bail!("Setup failed: {} ({})", error, error.key());
                    }
                }
                let credentials = match &env_credentials {
                    Some(credentials) => credentials.clone(),
                    None => Credentials {
                        client_id: prompt("Client ID")?,
                        client_secret: prompt("Client secret")?,
                    },
                };
                flow.step_user(credentials).await
            }
            FlowResult::SelectTanks {
                options,
                default,
                error,
            } => {
                if let Some(error) = error {
                    println!("{error}");
                }
                let selection = prompt_selection(&options, default)?;
                flow.step_devices(selection)
            }
            FlowResult::CreateEntry(entry) => {
                entry.save(&path)?;
                println!(
                    "Saved `{}` with {} tank(s) to {}",
                    entry.title,
                    entry.sensors.len(),
                    path.display()
                );
                return Ok(());
            }
        };
    }
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        anyhow::bail!("No input for {label}");
    }
    Ok(line.trim().to_string())
}

/// Lists the tanks and reads a comma separated list of numbers. Empty input keeps the default.
fn prompt_selection(options: &[TankOption], default: Vec<String>) -> anyhow::Result<Vec<String>> {
    println!("Tanks on this account:");
    for (index, option) in options.iter().enumerate() {
        println!("  {}) {} [{}]", index + 1, option.name, option.key);
    }
    let answer = prompt("Tanks to enable (e.g. 1,3; empty for all)")?;
    if answer.is_empty() {
        return Ok(default);
    }

    let selection = answer
        .split(',')
        .map(|part| {
            let part = part.trim();
            match part.parse::<usize>() {
                Ok(number) if (1..=options.len()).contains(&number) => {
                    options[number - 1].key.clone()
                }
                // Anything else is taken as a tank key and validated by the flow
                _ => part.to_string(),
            }
        })
        .collect();
    Ok(selection)
}
