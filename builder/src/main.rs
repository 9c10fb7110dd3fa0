mod config;
mod handlers;
mod remote;
mod state;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{
    Analyzer, BuilderOptions, ItemIndex, LocalExecutor, LoopOptions, RemoteExecutor, ReplicationScheme,
    ReportBuilder, ReportPlan, SingleHostScheme, StageContext, StaticReplicationScheme,
};

use crate::config::BuilderConfig;
use crate::remote::HttpExecutor;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "builder")]
#[command(about = "Construye los reportes por generación y sus rollups")]
struct Args {
    /// Directorio de configuración (reportbuild.json, stopwords.txt)
    #[arg(long, default_value = "./conf")]
    conf: PathBuf,

    /// Directorio del índice de items (items.jsonl)
    #[arg(long)]
    index: Option<PathBuf>,

    /// Directorio base de artefactos
    #[arg(long)]
    artifacts: PathBuf,

    /// Corre pasadas para siempre en vez de una sola
    #[arg(long = "loop")]
    run_loop: bool,

    #[arg(long, default_value = "info")]
    loglevel: String,

    /// Dirección para la API de estado, ej: 0.0.0.0:8080
    #[arg(long)]
    listen: Option<String>,

    /// Instante de referencia fijo (segundos unix) para una pasada única
    #[arg(long)]
    at: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.loglevel);

    // 1) configuración + overrides de entorno
    let mut config = BuilderConfig::load(&args.conf)?;
    config.apply_env();

    // 2) analyzer e índice
    let analyzer = Analyzer::load(&args.conf)
        .with_context(|| format!("no se pudieron leer las stopwords de {}", args.conf.display()))?;
    let index = match &args.index {
        Some(dir) => ItemIndex::open(dir).with_context(|| format!("índice inválido en {}", dir.display()))?,
        None => ItemIndex::default(),
    };
    info!("índice con {} items", index.len());

    // 3) plan (valida las ventanas antes de cualquier pasada)
    let plan = ReportPlan::new(&args.artifacts, config.plan.clone())?;

    // 4) réplicas: workers remotos o este mismo proceso
    let (replication, remote): (Arc<dyn ReplicationScheme>, Arc<dyn RemoteExecutor>) = if config.is_local() {
        info!("sin workers configurados: modo local");
        (
            Arc::new(SingleHostScheme::local()),
            Arc::new(LocalExecutor::new(StageContext::new(analyzer, index))),
        )
    } else {
        info!(
            "workers: {:?} (replication_factor={})",
            config.workers, config.replication_factor
        );
        (
            Arc::new(StaticReplicationScheme::from_addrs(
                config.workers.clone(),
                config.replication_factor,
            )),
            Arc::new(HttpExecutor::new(config.request_timeout())?),
        )
    };

    let builder = ReportBuilder::new(
        plan,
        replication,
        remote,
        BuilderOptions {
            max_concurrency: config.max_concurrency,
            settle_secs: config.plan.settle_secs,
        },
    );

    // 5) señales -> canal de apagado
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // 6) API de estado opcional
    let state = AppState::new(args.artifacts.to_string_lossy().to_string());
    if let Some(addr) = &args.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("no se pudo escuchar en {}", addr))?;
        info!("builder escuchando en {}", listener.local_addr()?);

        let app = handlers::build_router(state.clone());
        let mut server_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = res {
                error!("error en la API de estado: {}", e);
            }
        });
    }

    // 7) una pasada o loop
    if args.run_loop {
        if args.at.is_some() {
            warn!("--at se ignora en modo loop");
        }
        let options = LoopOptions {
            interval: config.loop_interval(),
            retry_interval: config.retry_interval(),
        };
        builder
            .build_loop(options, shutdown_rx, |report| state.record(report))
            .await?;
        info!("builder detenido");
    } else {
        let report = builder.build_pass(args.at).await?;
        state.record(&report);
        if !report.failures.is_empty() {
            return Err(common::BuildError::PassFailed {
                failures: report.failures,
            }
            .into());
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "builder={lvl},common={lvl},tower_http={lvl}",
            lvl = level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Espera Ctrl-C o SIGTERM.
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
        _ = ctrl_c => info!("Ctrl-C recibido, terminando tras la pasada en curso"),
        _ = terminate => info!("SIGTERM recibido, terminando tras la pasada en curso"),
    }
}
