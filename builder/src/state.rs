// builder/src/state.rs

use common::BuildReport;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct AppState {
    /// Directorio donde quedan los artefactos publicados
    pub artifacts_dir: String,
    // última pasada terminada
    pub last_pass: Arc<Mutex<Option<BuildReport>>>,
}

impl AppState {
    pub fn new(artifacts_dir: impl Into<String>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            last_pass: Arc::new(Mutex::new(None)),
        }
    }

    /// Registra una pasada terminada.
    pub fn record(&self, report: &BuildReport) {
        if let Ok(mut last) = self.last_pass.lock() {
            *last = Some(report.clone());
        }
    }
}
