//! Routa server binary

use anyhow::{Context, Result};
use clap::Parser;
use routa_core::{CoreConfig, SessionStore, Storage};
use routa_server::{build_cors, router, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "routa-server", version, about = "Agent session protocol server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ROUTA_LISTEN", default_value = "127.0.0.1:3210")]
    listen: SocketAddr,

    /// Directory for the session database (overrides ROUTA_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep sessions in memory only
    #[arg(long)]
    in_memory: bool,

    /// Allowed CORS origin; repeat for several, `*` for any
    #[arg(long = "allow-origin")]
    allow_origin: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = CoreConfig::from_env();
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let store: Arc<dyn SessionStore> = if args.in_memory {
        info!("Using in-memory session store");
        Arc::new(Storage::in_memory().context("failed to open in-memory store")?)
    } else {
        let storage = Storage::new_with_path(&config.data_dir)
            .with_context(|| format!("failed to open store in {}", config.data_dir.display()))?;
        info!("Session store at {}", storage.db_path().display());
        Arc::new(storage)
    };

    let state = AppState::new(config, store);
    let app = router(Arc::clone(&state), build_cors(&args.allow_origin)?);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("routa-server listening on http://{}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    state.service.shutdown().await;
    Ok(())
}
