use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::stage::{Stage, StageContext};

/* --------- Protocolo builder -> worker --------- */

/// Pedido de ejecución de un shard: qué stage correr, con qué entradas
/// (ya resueltas y ordenadas) y dónde dejar la salida.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRequest {
    /// Etiqueta del shard ("<tarea>#<id>"), sólo para logs
    pub shard: String,
    pub stage: Stage,
    pub inputs: Vec<String>,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardResponse {
    /// Ruta de la tabla publicada
    pub location: String,
    /// Filas escritas
    pub rows: u64,
}

/// Cuerpo de las respuestas de error de worker y builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Estado de un worker (GET /api/v1/health).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerStatus {
    pub hostname: String,
    pub max_concurrency: u32,
    pub active_shards: u32,
    pub shards_executed: u64,
    pub shards_failed: u64,
    pub avg_shard_ms: Option<f64>,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}

/// Ejecuta un pedido localmente (bloqueante). Es lo que corre el worker y
/// también el modo local del builder.
pub fn run_shard_request(ctx: &StageContext, req: &ShardRequest) -> Result<ShardResponse, StageError> {
    let rows = req.stage.run(ctx, &req.inputs, &req.destination)?;
    Ok(ShardResponse {
        location: req.destination.clone(),
        rows,
    })
}
