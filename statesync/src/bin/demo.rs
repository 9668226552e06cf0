//! Statesync demo binary
//!
//! Runs an authority holding a todo list and a number of tab proxies on an
//! in-process hub. Every proxy sends a few mutations; the run ends once all
//! replicas have converged on the authority's state.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use statesync::transport::memory::Hub;
use statesync::{Proxy, ReducerStore, ReplicationSettings, StoreWrapper, StrategyKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "statesync-demo")]
#[command(about = "Replicates a todo list from an authority to several proxies")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Channel name
    #[arg(long)]
    channel: Option<String>,

    /// Diff strategy (shallow or deep)
    #[arg(short, long)]
    strategy: Option<StrategyKind>,

    /// Number of proxies
    #[arg(short, long)]
    proxies: Option<u32>,

    /// Mutations sent by each proxy
    #[arg(short, long)]
    mutations: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable JSON logging
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Subcommand)]
enum Commands {
    /// Run the replication demo
    Run,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "debug,statesync=trace"
    } else {
        "info,statesync=debug"
    };

    if cli.json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(filter))
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(filter))
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    info!("Starting statesync demo v{}", env!("CARGO_PKG_VERSION"));

    let command = cli.command.clone().unwrap_or(Commands::Run);
    match command {
        Commands::Run => run(load_settings(cli)?).await,
        Commands::GenerateConfig { output } => generate_config(output),
    }
}

fn load_settings(cli: Cli) -> anyhow::Result<ReplicationSettings> {
    let mut settings = match cli.config {
        Some(path) if path.exists() => {
            info!("Loading configuration from {:?}", path);
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<ReplicationSettings>(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        Some(path) => {
            warn!("Configuration file {:?} not found, using defaults", path);
            ReplicationSettings::default()
        }
        None => {
            info!("No configuration file specified, using defaults");
            ReplicationSettings::default()
        }
    };

    if let Some(channel) = cli.channel {
        settings.channel_name = channel;
    }
    if let Some(strategy) = cli.strategy {
        settings.strategy = strategy;
    }
    if let Some(proxies) = cli.proxies {
        settings.proxies = proxies;
    }
    if let Some(mutations) = cli.mutations {
        settings.mutations = mutations;
    }

    settings.validate()?;

    info!("Replication settings:");
    info!("  Channel: {}", settings.channel_name);
    info!("  Strategy: {}", settings.strategy);
    info!("  Proxies: {}", settings.proxies);
    info!("  Mutations per proxy: {}", settings.mutations);

    Ok(settings)
}

fn todo_reducer(state: &Value, action: &Value) -> anyhow::Result<Value> {
    let mut next = state.clone();
    match action["type"].as_str() {
        Some("ADD_TODO") => {
            let text = action["payload"]["text"]
                .as_str()
                .context("ADD_TODO requires payload.text")?;
            if let Some(todos) = next["todos"].as_array_mut() {
                todos.push(json!({ "text": text, "done": false }));
            }
        }
        Some("TOGGLE_TODO") => {
            let index = action["payload"]["index"]
                .as_u64()
                .context("TOGGLE_TODO requires payload.index")?;
            let Some(todo) = next["todos"].get_mut(index as usize) else {
                bail!("no todo at index {index}");
            };
            let done = todo["done"].as_bool().unwrap_or(false);
            todo["done"] = json!(!done);
        }
        _ => return Ok(next),
    }
    next["revision"] = json!(next["revision"].as_u64().unwrap_or(0) + 1);
    Ok(next)
}

async fn run(settings: ReplicationSettings) -> anyhow::Result<()> {
    let hub = Hub::new();

    // The authority listens before anything else happens.
    let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));

    let mut proxies = Vec::new();
    for tab in 0..settings.proxies {
        let proxy = Proxy::connect(Arc::new(hub.tab_endpoint(tab)), settings.proxy_config())?;
        let reader = proxy.downgrade();
        proxy.observe(move || {
            let Some(reader) = reader.upgrade() else {
                return;
            };
            let revision = reader.read_with(|state| state["revision"].clone());
            tracing::debug!(tab, %revision, "Replica changed");
        });
        proxies.push(proxy);
    }

    let store = Arc::new(ReducerStore::new(
        json!({ "todos": [], "revision": 0 }),
        todo_reducer,
    ));
    let authority = wrapper.wrap(store, settings.authority_config())?;

    for proxy in &proxies {
        tokio::time::timeout(Duration::from_secs(5), proxy.ready())
            .await
            .context("Proxy did not become ready")?;
    }
    info!("All proxies are ready");

    let mut tasks = Vec::new();
    for (tab, proxy) in proxies.iter().cloned().enumerate() {
        let mutations = settings.mutations;
        tasks.push(tokio::spawn(async move {
            for n in 0..mutations {
                let text = format!("tab {tab} todo {n}");
                proxy
                    .mutate(json!({ "type": "ADD_TODO", "payload": { "text": text } }))
                    .await?;
            }
            if let Err(error) = proxy
                .mutate(json!({ "type": "TOGGLE_TODO", "payload": { "index": 10_000 } }))
                .await
            {
                info!(tab, "Rejected mutation surfaced to the proxy: {}", error.to_string().trim());
            }
            Ok::<_, statesync::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let expected = authority.state();
    for _ in 0..100 {
        if proxies.iter().all(|proxy| proxy.read() == expected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let converged = proxies.iter().filter(|proxy| proxy.read() == expected).count();
    let metrics = authority.metrics();
    info!(
        converged,
        proxies = proxies.len(),
        todos = expected["todos"].as_array().map(Vec::len).unwrap_or(0),
        "Replication finished"
    );
    info!("Authority metrics: {}", serde_json::to_string(&metrics)?);

    if converged != proxies.len() {
        bail!("{} of {} proxies did not converge", proxies.len() - converged, proxies.len());
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = ReplicationSettings::default();
    let settings_toml = toml::to_string_pretty(&settings)?;

    match output {
        Some(path) => {
            std::fs::write(&path, settings_toml)?;
            info!("Generated configuration file: {:?}", path);
        }
        None => {
            println!("{}", settings_toml);
        }
    }

    Ok(())
}
