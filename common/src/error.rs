use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errores de configuración: se detectan al armar el plan, antes de cualquier pasada.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ventana de {0}s inválida (debe ser > 0)")]
    ZeroWindow(&'static str),

    #[error("ventana de {name} de {secs}s fuera de rango (desborda los microsegundos)")]
    WindowOverflow { name: &'static str, secs: u64 },

    #[error("la ventana gruesa ({coarse}s) no es múltiplo de la fina ({fine}s)")]
    WindowNotMultiple { fine: u64, coarse: u64 },

    #[error("el stage {stage} tiene un rango [{start},{end}) no alineado a {window_secs}s")]
    Misaligned {
        stage: String,
        start: u64,
        end: u64,
        window_secs: u64,
    },

    #[error("sink duplicado en el plan: {0}")]
    DuplicateSink(String),

    #[error("ciclo de dependencias entre stages (pasa por {0})")]
    Cycle(String),
}

/// Errores de lectura/escritura de tablas.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("error de IO en {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("JSON inválido en {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("tabla {0} sin encabezado")]
    MissingHeader(String),

    #[error("clave fuera de orden en {path}: {key:?} después de {prev:?}")]
    Unsorted {
        path: String,
        prev: String,
        key: String,
    },
}

impl TableError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        TableError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<String>, source: serde_json::Error) -> Self {
        TableError::Json {
            path: path.into(),
            source,
        }
    }
}

/// Errores dentro del cuerpo de un stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("valor inválido para la clave {key:?} en {path}: {message}")]
    InvalidValue {
        path: String,
        key: String,
        message: String,
    },
}

/// Errores de ejecución de un shard.
///
/// `Remote` es recuperable (se prueba la siguiente réplica); `Exhausted`
/// agrupa los errores de todas las réplicas y es fatal para el shard en esta pasada.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("{host}: {message}")]
    Remote { host: String, message: String },

    #[error("execute falló para {task}: {}", errors.join(", "))]
    Exhausted { task: String, errors: Vec<String> },

    #[error("no hay réplicas para {task}")]
    NoReplicas { task: String },

    #[error("error interno: {0}")]
    Internal(String),
}

/// Fallo de un stage dentro de una pasada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("la pasada falló en {} stage(s): {}", failures.len(), describe(failures))]
    PassFailed { failures: Vec<StageFailure> },
}

fn describe(failures: &[StageFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.stage, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_concatena_todos_los_mensajes() {
        let err = ExecutionError::Exhausted {
            task: "ctr_stats.1".to_string(),
            errors: vec!["h1: caído".to_string(), "h2: timeout".to_string()],
        };

        let msg = err.to_string();
        assert!(msg.contains("ctr_stats.1"));
        assert!(msg.contains("h1: caído, h2: timeout"));
    }

    #[test]
    fn pass_failed_nombra_los_stages() {
        let err = BuildError::PassFailed {
            failures: vec![StageFailure {
                stage: "a.jsonl".to_string(),
                error: "boom".to_string(),
            }],
        };

        assert!(err.to_string().contains("a.jsonl (boom)"));
    }
}
