mod server;

use aigate::{BatchConfig, Engine, EngineConfig};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "aigate-proxy", version, about = "Multi-provider LLM API gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8787")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Client API key; empty disables auth (env: AIGATE_PROXY_API_KEY)
        #[arg(long, env = "AIGATE_PROXY_API_KEY", default_value = "")]
        api_key: String,

        /// Global per-request budget in seconds
        #[arg(long, default_value = "300")]
        request_timeout: u64,

        /// Data directory (default: ~/.aigate)
        #[arg(long)]
        state_dir: Option<std::path::PathBuf>,

        /// Only expose these models (comma-separated provider/model ids)
        #[arg(long, value_delimiter = ',')]
        models: Option<Vec<String>>,
    },

    /// List the model catalog and exit
    Models,

    /// List discovered credentials per provider and exit
    Credentials,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { port, host, api_key, request_timeout, state_dir, models } => {
            serve(port, host, api_key, request_timeout, state_dir, models).await
        }
        Commands::Models => {
            let engine = Engine::new(EngineConfig::default())?;
            for (full_id, def) in engine.models() {
                println!("{full_id}\tcontext={}\tmax_out={}", def.context_window, def.max_tokens);
            }
            Ok(())
        }
        Commands::Credentials => {
            let engine = Engine::new(EngineConfig::default())?;
            for tag in engine.provider_tags() {
                let ids = engine.store().list(&tag);
                println!("{tag}: {} credential(s)", ids.len());
                for id in ids {
                    let label = engine
                        .store()
                        .load(&id)
                        .map(|r| r.display_label())
                        .unwrap_or_else(|| id.clone());
                    println!("  {label}");
                }
            }
            Ok(())
        }
    }
}

async fn serve(
    port: u16,
    host: String,
    api_key: String,
    request_timeout: u64,
    state_dir: Option<std::path::PathBuf>,
    models: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let engine = Engine::new(EngineConfig {
        state_root: state_dir,
        secure_files: true,
        batch: BatchConfig::default(),
    })?;

    for tag in engine.provider_tags() {
        let count = engine.store().list(&tag).len();
        tracing::info!(provider = %tag, credentials = count, "provider ready");
    }

    let state = Arc::new(server::AppState::new(
        engine,
        api_key,
        models,
        Duration::from_secs(request_timeout),
    ));
    let app = server::router(Arc::clone(&state));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("aigate proxy listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drained: flush usage state and any buffered writes before exit.
    let pending = state.engine.shutdown();
    if pending > 0 {
        tracing::error!(pending, "state writes still pending at exit");
        std::process::exit(1);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining");
}
