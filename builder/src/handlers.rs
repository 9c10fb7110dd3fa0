use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use common::{ArtifactList, BuildReport, ErrorResponse};
use glob::glob;
use std::path::Path;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/passes/last", get(last_pass))
        .route("/api/v1/artifacts", get(list_artifacts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Reporte de la última pasada terminada
async fn last_pass(
    State(state): State<AppState>,
) -> Result<Json<BuildReport>, (StatusCode, Json<ErrorResponse>)> {
    let last = state
        .last_pass
        .lock()
        .map_err(|_| internal("lock last_pass"))?
        .clone();

    match last {
        Some(report) => Ok(Json(report)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "todavía no terminó ninguna pasada".to_string(),
            }),
        )),
    }
}

// Lista los artefactos publicados (*.jsonl del directorio de salida)
async fn list_artifacts(
    State(state): State<AppState>,
) -> Result<Json<ArtifactList>, (StatusCode, Json<ErrorResponse>)> {
    let pattern = Path::new(&state.artifacts_dir).join("*.jsonl");
    let pattern = pattern.to_string_lossy();

    let entries = glob(&pattern).map_err(|e| internal(&format!("patrón inválido {}: {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
            Ok(_) => {}
            Err(e) => warn!("no se pudo leer {}: {}", e.path().display(), e),
        }
    }
    files.sort();

    Ok(Json(ArtifactList {
        dir: state.artifacts_dir.clone(),
        files,
    }))
}

fn internal(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}
