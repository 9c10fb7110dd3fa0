mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use common::{Analyzer, ItemIndex, StageContext};
use std::{env, path::PathBuf};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::worker::{WorkerState, DEFAULT_WORKER_CONCURRENCY};

#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "Réplica que ejecuta shards de reportes")]
struct Args {
    /// Directorio de configuración (stopwords.txt)
    #[arg(long, default_value = "./conf")]
    conf: PathBuf,

    /// Directorio del índice de items (items.jsonl)
    #[arg(long)]
    index: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:8081")]
    listen: String,

    /// Shards en paralelo (default: WORKER_CONCURRENCY o 2)
    #[arg(long)]
    concurrency: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let max_concurrency: u32 = args.concurrency.unwrap_or_else(|| {
        env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
    });

    // Nombre de host (solo para info)
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let analyzer = Analyzer::load(&args.conf)
        .with_context(|| format!("no se pudieron leer las stopwords de {}", args.conf.display()))?;
    let index = match &args.index {
        Some(dir) => ItemIndex::open(dir).with_context(|| format!("índice inválido en {}", dir.display()))?,
        None => ItemIndex::default(),
    };
    info!("índice con {} items", index.len());

    let state = WorkerState::new(StageContext::new(analyzer, index), hostname, max_concurrency);

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", args.listen))?;

    worker::serve(listener, state, shutdown_signal()).await
}

/// Espera Ctrl-C o SIGTERM. Los shards en curso terminan antes de salir.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("no se pudo instalar el handler de Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("no se pudo instalar el handler de SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C recibido, apagando"),
        _ = terminate => info!("SIGTERM recibido, apagando"),
    }
}
