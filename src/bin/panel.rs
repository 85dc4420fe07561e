#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use panel_harness::gateway::ModelBinding;
use panel_harness::registry::{
    new_assistant, AssistantRole, AssistantStore, SystemPrompt, SETTING_NUM_OUTPUTS,
    SETTING_NUM_OUTPUTS_TO_SHOW, SETTING_SELECTION_ALGORITHM,
};
use panel_harness::{router, AppState, ClientRegistry, SessionRecorder};

#[derive(Parser)]
#[command(name = "panel", version, about = "Panel harness server and tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the panel API
    Serve {
        #[arg(long, default_value = "127.0.0.1:8600")]
        addr: SocketAddr,
        #[arg(long, default_value = "panel.db")]
        db: PathBuf,
    },
    /// Load assistants and system prompts from a JSON file
    SeedAssistants {
        #[arg(long, default_value = "panel.db")]
        db: PathBuf,
        #[arg(long)]
        file: PathBuf,
    },
    /// Show or change runtime settings
    Settings {
        #[arg(long, default_value = "panel.db")]
        db: PathBuf,
        /// key=value pairs, e.g. --set selection_algorithm=unique_model
        #[arg(long = "set")]
        set: Vec<String>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedFile {
    #[serde(default)]
    system_prompts: Vec<SeedPrompt>,
    #[serde(default)]
    assistants: Vec<SeedAssistant>,
}

#[derive(Deserialize)]
struct SeedPrompt {
    id: Uuid,
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedAssistant {
    name: String,
    role: AssistantRole,
    candidate_models: Vec<ModelBinding>,
    system_prompt_id: Uuid,
    #[serde(default)]
    active: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, db } => serve(addr, db).await,
        Commands::SeedAssistants { db, file } => seed_assistants(db, file).await,
        Commands::Settings { db, set } => settings(db, set).await,
    }
}

async fn serve(addr: SocketAddr, db: PathBuf) -> Result<()> {
    let store = AssistantStore::new(&db).context("open assistant store")?;
    let recorder = SessionRecorder::new(&db).context("open session recorder")?;
    let clients = ClientRegistry::from_env();

    let state = AppState {
        store,
        recorder,
        clients,
    };

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(addr).await.context("bind address")?;
    info!("panel listening on http://{addr}");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}

async fn seed_assistants(db: PathBuf, file: PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("read seed file {}", file.display()))?;
    let seed: SeedFile = serde_json::from_str(&content).context("parse seed file")?;

    let store = AssistantStore::new(&db).context("open assistant store")?;

    for prompt in &seed.system_prompts {
        store
            .upsert_system_prompt(&SystemPrompt {
                id: prompt.id,
                text: prompt.text.clone(),
            })
            .await?;
    }

    for assistant in seed.assistants {
        let record = new_assistant(
            assistant.name,
            assistant.role,
            assistant.candidate_models,
            assistant.system_prompt_id,
            assistant.active,
        );
        info!(name = %record.name, id = %record.id, "seeded assistant");
        store.upsert_assistant(&record).await?;
    }

    Ok(())
}

async fn settings(db: PathBuf, set: Vec<String>) -> Result<()> {
    const KNOWN_KEYS: &[&str] = &[
        SETTING_NUM_OUTPUTS,
        SETTING_NUM_OUTPUTS_TO_SHOW,
        SETTING_SELECTION_ALGORITHM,
    ];

    let store = AssistantStore::new(&db).context("open assistant store")?;

    for pair in set {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected key=value, got {pair:?}");
        };
        if !KNOWN_KEYS.contains(&key) {
            bail!("unknown setting {key:?}; known: {KNOWN_KEYS:?}");
        }
        store.set_setting(key, value).await?;
    }

    let current = store.settings().await?;
    println!("{}: {}", SETTING_NUM_OUTPUTS, current.num_outputs);
    println!(
        "{}: {}",
        SETTING_NUM_OUTPUTS_TO_SHOW, current.num_outputs_to_show
    );
    println!(
        "{}: {}",
        SETTING_SELECTION_ALGORITHM,
        current.selection_algorithm.as_str()
    );

    Ok(())
}
