//! Docent application binary - composition root.
//!
//! Ties together all Docent crates into a single executable:
//! 1. Parse CLI flags and load configuration from TOML
//! 2. Open the session store
//! 3. Build the embedding, generation and extraction backends
//! 4. Start the axum REST API server

mod cli;

use std::sync::Arc;

use clap::Parser;

use docent_api::state::AppState;
use docent_chat::{
    ChatCoordinator, DocumentExtractor, GenerationEngine, OllamaGeneration, PdfExtractor,
    ScriptedGeneration, SessionRegistry,
};
use docent_core::config::DocentConfig;
use docent_storage::SessionStore;
use docent_vector::{DynEmbeddingService, MockEmbedding, OllamaEmbedding};

use cli::CliArgs;

/// Reply streamed by the `--mock` engine.
const MOCK_ANSWER: &[&str] = &[
    "This is a practice answer. ",
    "Start the server without --mock ",
    "to talk to a real model.",
];

type Backends = (Arc<dyn DynEmbeddingService>, Arc<dyn GenerationEngine>);

fn build_backends(config: &DocentConfig, mock: bool) -> Result<Backends, Box<dyn std::error::Error>> {
    if mock {
        tracing::warn!("Running with mock embeddings and canned answers");
        return Ok((
            Arc::new(MockEmbedding::new()),
            Arc::new(ScriptedGeneration::new(MOCK_ANSWER.iter().copied())),
        ));
    }

    let embedder = OllamaEmbedding::new(&config.embedding)?;
    let engine = OllamaGeneration::new(&config.generation)?;
    tracing::info!(
        embedding_model = %config.embedding.model,
        generation_model = %config.generation.model,
        "Ollama backends configured"
    );
    Ok((Arc::new(embedder), Arc::new(engine)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. Loaded before tracing so the configured level applies.
    let config_file = args.resolve_config_path();
    let (mut config, load_error) = match DocentConfig::load(&config_file) {
        Ok(config) => (config, None),
        Err(e) => (DocentConfig::default(), Some(e)),
    };
    args.apply(&mut config);

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Docent v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        Some(e) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Configuration not loaded; using defaults"
        ),
    }

    // Storage.
    let data_dir = cli::expand_home(&config.general.data_dir);
    let store = match SessionStore::open(&data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(path = %data_dir.display(), error = %e, "Failed to open session store");
            return Err(e.into());
        }
    };
    tracing::info!(
        path = %store.path().display(),
        sessions = store.len(),
        "Session store opened"
    );

    // Chat pipeline.
    let (embedder, engine) = build_backends(&config, args.mock)?;
    let extractor: Arc<dyn DocumentExtractor> = Arc::new(PdfExtractor::new());
    let registry = Arc::new(SessionRegistry::new(store));
    let coordinator = ChatCoordinator::new(&config, registry, embedder, engine, extractor);

    let state = AppState::new(config.clone(), coordinator);

    // === API server ===

    if let Err(e) = docent_api::start_server(&config, state).await {
        tracing::error!(
            port = config.general.port,
            error = %e,
            "API server failed - is another instance running?"
        );
        tracing::error!("Try: docent --port {}", config.general.port.saturating_add(1));
        return Err(e.into());
    }

    Ok(())
}
