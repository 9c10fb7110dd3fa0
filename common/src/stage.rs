use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analyzer::{Analyzer, ItemIndex};
use crate::error::{ConfigError, StageError};
use crate::generation::TimeRange;
use crate::report;

/// Tipos de stage soportados. Se serializa con `"op"` como etiqueta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StageKind {
    CtrByPosition,
    CtrStats,
    CtrBySearchQuery,
    CtrBySearchTermCrossCategory { field: String },
    CtrCounterMerge,
    RelatedTerms { limit: usize },
    TermInfoMerge { limit: usize },
}

impl StageKind {
    /// `true` para los stages que combinan salidas de otros stages.
    pub fn is_rollup(&self) -> bool {
        matches!(
            self,
            StageKind::CtrCounterMerge | StageKind::RelatedTerms { .. } | StageKind::TermInfoMerge { .. }
        )
    }
}

/// Handles externos que necesitan los cuerpos de los stages.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub analyzer: Arc<Analyzer>,
    pub index: Arc<ItemIndex>,
}

impl StageContext {
    pub fn new(analyzer: Analyzer, index: ItemIndex) -> Self {
        Self {
            analyzer: Arc::new(analyzer),
            index: Arc::new(index),
        }
    }
}

/// Un paso de agregación: fuentes, sink y rango [start, end).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub sources: Vec<String>,
    pub sink: String,
    pub range: TimeRange,
}

impl Stage {
    /// Crea un stage validando que el rango esté alineado a `window_secs`.
    pub fn new(
        kind: StageKind,
        sources: Vec<String>,
        sink: impl Into<String>,
        range: TimeRange,
        window_secs: u64,
    ) -> Result<Self, ConfigError> {
        let sink = sink.into();
        if !range.is_aligned(window_secs) {
            return Err(ConfigError::Misaligned {
                stage: sink,
                start: range.start,
                end: range.end,
                window_secs,
            });
        }

        Ok(Self {
            kind,
            sources,
            sink,
            range,
        })
    }

    /// Nombre corto para logs: el nombre de archivo del sink.
    pub fn name(&self) -> String {
        Path::new(&self.sink)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.sink.clone())
    }

    /// El sink ya fue publicado para este rango (re-ejecución idempotente).
    pub fn is_published(&self) -> bool {
        Path::new(&self.sink).is_file()
    }

    /// Ejecuta el cuerpo del stage sobre `inputs` (ya resueltas y ordenadas)
    /// y escribe la tabla en `dest`. Devuelve la cantidad de filas escritas.
    pub fn run(&self, ctx: &StageContext, inputs: &[String], dest: &str) -> Result<u64, StageError> {
        match &self.kind {
            StageKind::CtrByPosition => report::ctr_by_position(inputs, dest, self.range),
            StageKind::CtrStats => report::ctr_stats(inputs, dest, self.range),
            StageKind::CtrBySearchQuery => {
                report::ctr_by_search_query(inputs, dest, self.range, &ctx.analyzer)
            }
            StageKind::CtrBySearchTermCrossCategory { field } => {
                report::ctr_by_search_term_cross_category(
                    inputs,
                    dest,
                    self.range,
                    field,
                    &ctx.analyzer,
                    &ctx.index,
                )
            }
            StageKind::CtrCounterMerge => report::ctr_counter_merge(inputs, dest, self.range),
            StageKind::RelatedTerms { limit } => {
                report::related_terms(inputs, dest, self.range, *limit)
            }
            StageKind::TermInfoMerge { limit } => {
                report::term_info_merge(inputs, dest, self.range, *limit)
            }
        }
    }
}
