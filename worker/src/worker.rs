use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{run_shard_request, ErrorResponse, ShardRequest, ShardResponse, StageContext, WorkerStatus};
use std::{
    sync::{Arc, Mutex},
    time::Instant,
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::{net::TcpListener, sync::Semaphore};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const DEFAULT_WORKER_CONCURRENCY: u32 = 2;

#[derive(Clone)]
pub struct WorkerState {
    pub ctx: StageContext,
    pub hostname: String,
    pub max_concurrency: u32,
    // un permiso por shard en ejecución
    pub permits: Arc<Semaphore>,
    pub metrics: Arc<Mutex<ShardMetrics>>,
    // System para leer CPU y memoria
    pub sys: Arc<Mutex<System>>,
}

#[derive(Debug, Clone, Default)]
pub struct ShardMetrics {
    pub active: u32,
    pub executed: u64,
    pub failed: u64,
    pub total_ms: u64,
}

impl WorkerState {
    pub fn new(ctx: StageContext, hostname: String, max_concurrency: u32) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            ctx,
            hostname,
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency as usize)),
            metrics: Arc::new(Mutex::new(ShardMetrics::default())),
            sys: Arc::new(Mutex::new(System::new_all())),
        }
    }
}

pub fn build_router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(status))
        .route("/api/v1/shards/execute", post(execute_shard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Levanta el servidor del worker hasta que `shutdown` termine.
pub async fn serve<F>(listener: TcpListener, state: WorkerState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    info!(
        "worker {} escuchando en {} (concurrency={})",
        state.hostname,
        listener.local_addr()?,
        state.max_concurrency
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("worker detenido");
    Ok(())
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Estado del worker con CPU/MEM
async fn status(State(state): State<WorkerState>) -> Json<WorkerStatus> {
    let (cpu_percent, mem_bytes) = match state.sys.lock() {
        Ok(mut sys) => {
            sys.refresh_cpu();
            sys.refresh_memory();
            (Some(sys.global_cpu_info().cpu_usage()), Some(sys.used_memory()))
        }
        Err(_) => (None, None),
    };

    let m = state
        .metrics
        .lock()
        .map(|m| m.clone())
        .unwrap_or_default();

    let avg_shard_ms = if m.executed > 0 {
        Some(m.total_ms as f64 / m.executed as f64)
    } else {
        None
    };

    Json(WorkerStatus {
        hostname: state.hostname.clone(),
        max_concurrency: state.max_concurrency,
        active_shards: m.active,
        shards_executed: m.executed,
        shards_failed: m.failed,
        avg_shard_ms,
        cpu_percent,
        mem_bytes,
    })
}

// Ejecuta un shard: espera un permiso libre y corre el stage en un hilo de bloqueo
async fn execute_shard(
    State(state): State<WorkerState>,
    Json(req): Json<ShardRequest>,
) -> Result<Json<ShardResponse>, (StatusCode, Json<ErrorResponse>)> {
    let _permit = state
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| error_response("semáforo cerrado".to_string()))?;

    if let Ok(mut m) = state.metrics.lock() {
        m.active += 1;
    }

    info!(
        "ejecutando {} ({} entradas) -> {}",
        req.shard,
        req.inputs.len(),
        req.destination
    );

    let label = req.shard.clone();
    let ctx = state.ctx.clone();
    let started = Instant::now();
    let handle = tokio::task::spawn_blocking(move || run_shard_request(&ctx, &req));
    let result = handle.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let outcome = match result {
        Ok(Ok(resp)) => {
            info!("terminé {} correctamente ({} filas, {} ms)", label, resp.rows, elapsed_ms);
            Ok(Json(resp))
        }
        Ok(Err(e)) => {
            warn!("error procesando {}: {}", label, e);
            Err(error_response(e.to_string()))
        }
        Err(e) => {
            warn!("panic o join error en {}: {:?}", label, e);
            Err(error_response(format!("panic o join error: {}", e)))
        }
    };

    if let Ok(mut m) = state.metrics.lock() {
        m.active = m.active.saturating_sub(1);
        m.total_ms += elapsed_ms;
        if outcome.is_ok() {
            m.executed += 1;
        } else {
            m.failed += 1;
        }
    }

    outcome
}

fn error_response(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::report::CtrCounter;
    use common::table::{TableReader, TableWriter};
    use common::{Stage, StageKind, TimeRange};
    use http_body_util::BodyExt;
    use std::{env, fs, path::PathBuf};
    use tower::ServiceExt;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("worker_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn state() -> WorkerState {
        WorkerState::new(StageContext::default(), "test-host".to_string(), 2)
    }

    fn merge_request(inputs: Vec<String>, dest: String) -> ShardRequest {
        let range = TimeRange::bucket(1, 3600);
        let stage = Stage::new(StageKind::CtrCounterMerge, inputs.clone(), dest.clone(), range, 3600).unwrap();
        ShardRequest {
            shard: "merge#0".to_string(),
            stage,
            inputs,
            destination: dest,
        }
    }

    async fn post_json(app: Router, uri: &str, body: &impl serde::Serialize) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_status(app: Router) -> WorkerStatus {
        let resp = app
            .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn execute_escribe_el_sink_y_cuenta_el_shard() {
        let tmp = temp_dir("execute_ok");
        let a = tmp.join("a.jsonl");
        let b = tmp.join("b.jsonl");
        let out = tmp.join("out.jsonl");

        for (path, views) in [(&a, 2), (&b, 3)] {
            let mut w = TableWriter::create(path, TimeRange::bucket(1, 3600)).unwrap();
            w.write("queries", &CtrCounter { views, clicks: 1 }).unwrap();
            w.finish().unwrap();
        }

        let st = state();
        let req = merge_request(
            vec![a.to_string_lossy().to_string(), b.to_string_lossy().to_string()],
            out.to_string_lossy().to_string(),
        );
        let (status, body) = post_json(build_router(st.clone()), "/api/v1/shards/execute", &req).await;

        assert_eq!(status, StatusCode::OK);
        let resp: ShardResponse = serde_json::from_value(body).unwrap();
        assert_eq!(resp.rows, 1);
        assert_eq!(resp.location, out.to_string_lossy());

        let row = TableReader::open(&out).unwrap().next().unwrap().unwrap();
        assert_eq!(row.value, serde_json::json!({"views": 5, "clicks": 2}));

        let s = get_status(build_router(st)).await;
        assert_eq!(s.hostname, "test-host");
        assert_eq!(s.shards_executed, 1);
        assert_eq!(s.shards_failed, 0);
        assert_eq!(s.active_shards, 0);
    }

    #[tokio::test]
    async fn execute_devuelve_500_con_el_error() {
        let tmp = temp_dir("execute_err");
        let st = state();
        let req = merge_request(
            vec![tmp.join("no_existe.jsonl").to_string_lossy().to_string()],
            tmp.join("out.jsonl").to_string_lossy().to_string(),
        );

        let (status, body) = post_json(build_router(st.clone()), "/api/v1/shards/execute", &req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("no_existe.jsonl"));
        assert!(!tmp.join("out.jsonl").exists());

        let s = get_status(build_router(st)).await;
        assert_eq!(s.shards_failed, 1);
        assert!(s.avg_shard_ms.is_none());
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let resp = build_router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
