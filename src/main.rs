use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

use parley::config::{self, Config};
use parley::embedder::SharedEmbedder;
use parley::generation::GenerationService;
use parley::llm::{GenerationLease, LocalRuntimeModel};
use parley::progress::LogSink;
use parley::server::AppState;
use parley::tool_script::LuaTool;
use parley::tools::ToolRegistry;
use parley::vector_store::VectorStore;
use parley::{catalog, db, indexer, migrate, reindexer, server, settings, tool_script};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley — a local-first conversational AI runtime",
    version
)]
struct Cli {
    /// Configuration preset: development, production, or testing
    #[arg(long, global = true, default_value = "development", env = "PARLEY_CONFIG")]
    config_name: String,

    /// Optional configuration file overriding the preset
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the databases
    Init,

    /// Start the HTTP/WebSocket server and background reindexer
    Serve,

    /// Run a full index of one directory
    Index {
        /// Directory id
        directory_id: String,
    },

    /// Run change detection for one directory and print the counts
    Scan {
        /// Directory id
        directory_id: String,
    },

    /// Print aggregate index statistics
    Stats,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cfg = match config::resolve_config(&cli.config_name, cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli.command, cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(command: Commands, cfg: Config) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            let pool = db::connect_catalog(&cfg).await?;
            let vpool = db::connect_vectors(&cfg).await?;
            migrate::run_catalog_migrations(&pool).await?;
            migrate::run_vector_migrations(&vpool).await?;
            println!("Databases initialized successfully.");
        }
        Commands::Serve => {
            serve(cfg).await?;
        }
        Commands::Index { directory_id } => {
            let (state, _shutdown) = build_state(&cfg).await?;
            let stats = indexer::index_directory(
                &state.pool,
                &state.store,
                &state.embedder,
                &directory_id,
                &LogSink,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Scan { directory_id } => {
            let (state, _shutdown) = build_state(&cfg).await?;
            let directory = catalog::get_directory(&state.pool, &directory_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Directory not found: {}", directory_id))?;
            let (changes, errors) = indexer::scan_changes(&state.pool, &directory).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "new": changes.new.len(),
                    "modified": changes.modified.len(),
                    "deleted": changes.deleted.len(),
                    "unchanged": changes.unchanged.len(),
                    "errors": errors,
                }))?
            );
        }
        Commands::Stats => {
            let (state, _shutdown) = build_state(&cfg).await?;
            let aggregate = catalog::aggregate_stats(&state.pool).await?;
            let embeddings = state.store.count().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "total_directories": aggregate.total_directories,
                    "total_files": aggregate.total_files,
                    "indexed_files": aggregate.indexed_files,
                    "total_chunks": aggregate.total_chunks,
                    "total_embeddings": embeddings,
                }))?
            );
        }
    }
    Ok(())
}

async fn build_state(cfg: &Config) -> anyhow::Result<(AppState, watch::Sender<bool>)> {
    let pool = db::connect_catalog(cfg).await?;
    let vpool = db::connect_vectors(cfg).await?;
    migrate::run_catalog_migrations(&pool).await?;
    migrate::run_vector_migrations(&vpool).await?;

    let store = VectorStore::new(vpool);
    let rag = settings::rag_settings(&pool).await?;
    let embedder = Arc::new(SharedEmbedder::new(&rag.embedding_model));

    let mut registry = ToolRegistry::with_builtins(cfg.tools.system_roots.clone());
    for definition in tool_script::load_tool_definitions(cfg)? {
        registry.register(Arc::new(LuaTool::new(definition)))?;
    }

    let model = LocalRuntimeModel::new(&cfg.model)?;
    let generation = Arc::new(GenerationService {
        pool: pool.clone(),
        store: store.clone(),
        embedder: Arc::clone(&embedder),
        model: Arc::new(model),
        lease: GenerationLease::new(),
    });

    let (shutdown_tx, _) = watch::channel(false);

    Ok((
        AppState {
            pool,
            store,
            embedder,
            generation,
            registry: Arc::new(registry),
        },
        shutdown_tx,
    ))
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    let (state, shutdown_tx) = build_state(&cfg).await?;

    let reindexer_handle = tokio::spawn(reindexer::run(
        state.pool.clone(),
        state.store.clone(),
        Arc::clone(&state.embedder),
        shutdown_tx.subscribe(),
    ));

    let server_shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };

    server::run_server(state, &cfg, server_shutdown).await?;

    // Stop background work; indexing is cancelled between directories.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), reindexer_handle).await;

    Ok(())
}
