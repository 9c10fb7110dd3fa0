use std::{env, fs, io, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use common::PlanConfig;

pub const CONFIG_FILE: &str = "reportbuild.json";

const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_LOOP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Configuración del builder (`<conf>/reportbuild.json`). Todo tiene default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Ventanas, cliente y parámetros de los reportes
    #[serde(flatten)]
    pub plan: PlanConfig,

    /// URLs base de los workers. Vacío = modo local
    pub workers: Vec<String>,
    /// Réplicas candidatas por shard (0 = todas)
    pub replication_factor: usize,
    pub max_concurrency: usize,
    pub loop_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            plan: PlanConfig::default(),
            workers: Vec::new(),
            replication_factor: 0,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            loop_interval_secs: DEFAULT_LOOP_INTERVAL_SECS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl BuilderConfig {
    /// Lee `<conf_dir>/reportbuild.json`; si no existe usa los defaults.
    pub fn load(conf_dir: &Path) -> Result<Self> {
        let path = conf_dir.join(CONFIG_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("no se pudo leer {}", path.display())),
        };

        serde_json::from_str(&content).with_context(|| format!("config inválida en {}", path.display()))
    }

    /// Overrides por entorno: WORKER_URLS (separadas por coma) y BUILDER_CONCURRENCY.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            env::var("WORKER_URLS").ok(),
            env::var("BUILDER_CONCURRENCY").ok(),
        );
    }

    fn apply_overrides(&mut self, worker_urls: Option<String>, concurrency: Option<String>) {
        if let Some(urls) = worker_urls {
            self.workers = urls
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(n) = concurrency.and_then(|s| s.parse::<usize>().ok()) {
            self.max_concurrency = n.max(1);
        }
    }

    pub fn is_local(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
