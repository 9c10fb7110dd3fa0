use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageFailure;
use crate::generation::MICROS_PER_SECOND;

pub type PassId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassStatus {
    Running,
    Failed,
    Succeeded,
}

/// Resumen de una pasada de construcción.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub id: PassId,
    pub status: PassStatus,

    /// Instante contra el que se calcularon las generaciones
    pub reference_time: DateTime<Utc>,

    /// -------- Métricas de la pasada --------
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_stages: u32,
    /// Sinks escritos en esta pasada
    pub built: Vec<String>,
    /// Stages cuyo sink ya estaba publicado
    pub up_to_date: u32,
    /// Stages diferidos o sin entradas
    pub absent: u32,
    pub failures: Vec<StageFailure>,
    /// Stages que no corrieron por un fallo aguas arriba
    pub blocked: Vec<String>,
    pub rows_written: u64,
}

impl BuildReport {
    pub fn new(reference_micros: u64) -> Self {
        let secs = (reference_micros / MICROS_PER_SECOND) as i64;
        let reference_time = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: PassStatus::Running,
            reference_time,
            started_at: Utc::now(),
            finished_at: None,
            total_stages: 0,
            built: Vec::new(),
            up_to_date: 0,
            absent: 0,
            failures: Vec::new(),
            blocked: Vec::new(),
            rows_written: 0,
        }
    }

    /// Cierra la pasada: FAILED si algún stage falló.
    pub fn finish(&mut self) {
        self.status = if self.failures.is_empty() {
            PassStatus::Succeeded
        } else {
            PassStatus::Failed
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status == PassStatus::Succeeded
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|f| (f - self.started_at).num_milliseconds())
    }
}
