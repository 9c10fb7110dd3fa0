use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::generation::{generations, secs_to_micros, Generation, TimeRange, SECONDS_PER_DAY, SECONDS_PER_HOUR};
use crate::rollup::{trailing, RollupGraph};
use crate::stage::{Stage, StageKind};

pub const JOINED_QUERIES: &str = "joined_queries";
pub const CTR_BY_POSITION: &str = "ctr_by_position";
pub const CTR_STATS: &str = "ctr_stats";
pub const CTR_BY_SEARCHQUERY: &str = "ctr_by_searchquery";
pub const CTR_STATS_DAILY: &str = "ctr_stats_daily";
pub const CTR_BY_POSITION_DAILY: &str = "ctr_by_position_daily";
pub const RELATED_TERMS: &str = "related_terms";

/// Margen por defecto tras el cierre de un bucket: da tiempo a que lleguen
/// las joined queries tardías antes de publicar hojas y rollups.
pub const DEFAULT_SETTLE_SECS: u64 = SECONDS_PER_HOUR;

/// Parámetros del plan de reportes. Todos tienen default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Prefijo de todos los archivos del cliente
    pub customer: String,
    /// Ventana de los reportes hoja (default 4h)
    pub leaf_window_secs: u64,
    /// Ventana de los rollups (default 1 día)
    pub rollup_window_secs: u64,
    /// Cuánto hacia atrás se generan buckets (default 60 días)
    pub lookback_secs: u64,
    /// Días del rollup acumulado de términos relacionados (default 30)
    pub trailing_days: u64,
    /// Margen tras el cierre de un bucket antes de construirlo
    pub settle_secs: u64,
    pub related_terms_limit: usize,
    /// Campo del índice de items para el cruce término x categoría
    pub cross_category_field: String,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            customer: "default".to_string(),
            leaf_window_secs: 4 * SECONDS_PER_HOUR,
            rollup_window_secs: SECONDS_PER_DAY,
            lookback_secs: 60 * SECONDS_PER_DAY,
            trailing_days: 30,
            settle_secs: DEFAULT_SETTLE_SECS,
            related_terms_limit: 50,
            cross_category_field: "category1".to_string(),
        }
    }
}

/// Conjunto de reportes a construir: hojas cada `leaf_window` sobre las
/// joined queries y rollups diarios / acumulados encima de ellas.
#[derive(Debug, Clone)]
pub struct ReportPlan {
    dir: PathBuf,
    config: PlanConfig,
    daily: RollupGraph,
}

impl ReportPlan {
    /// Valida las ventanas: la del rollup tiene que ser múltiplo de la hoja.
    pub fn new(artifacts_dir: impl AsRef<Path>, config: PlanConfig) -> Result<Self, ConfigError> {
        let daily = RollupGraph::new(config.leaf_window_secs, config.rollup_window_secs)?;
        if config.lookback_secs == 0 {
            return Err(ConfigError::ZeroWindow("lookback"));
        }
        if secs_to_micros(config.lookback_secs).is_none() {
            return Err(ConfigError::WindowOverflow {
                name: "lookback",
                secs: config.lookback_secs,
            });
        }
        if config.trailing_days == 0 {
            return Err(ConfigError::ZeroWindow("trailing_days"));
        }

        Ok(Self {
            dir: artifacts_dir.as_ref().to_path_buf(),
            config,
            daily,
        })
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.dir
    }

    /// Ruta de un artefacto: `<dir>/<customer>_<report>.<generation>.jsonl`.
    pub fn artifact(&self, report: &str, g: Generation) -> String {
        self.dir
            .join(format!("{}_{}.{}.jsonl", self.config.customer, report, g))
            .to_string_lossy()
            .to_string()
    }

    pub fn cross_category_report(&self) -> String {
        format!("ctr_by_searchterm_cross_{}", self.config.cross_category_field)
    }

    pub fn trailing_report(&self) -> String {
        format!("{}_{}d", RELATED_TERMS, self.config.trailing_days)
    }

    /// Todos los stages que corresponden al instante `now_secs`
    /// (`None` = reloj de pared).
    pub fn stages_at(&self, now_secs: Option<u64>) -> Result<Vec<Stage>, ConfigError> {
        let mut stages = Vec::new();
        let leaf = self.config.leaf_window_secs;
        let rollup = self.config.rollup_window_secs;

        /* ---------- reportes hoja ---------- */
        for g in generations(leaf, self.config.lookback_secs, now_secs) {
            let source = vec![self.artifact(JOINED_QUERIES, g)];
            let range = TimeRange::bucket(g, leaf);

            let leaf_reports = [
                (StageKind::CtrByPosition, CTR_BY_POSITION.to_string()),
                (StageKind::CtrStats, CTR_STATS.to_string()),
                (StageKind::CtrBySearchQuery, CTR_BY_SEARCHQUERY.to_string()),
                (
                    StageKind::CtrBySearchTermCrossCategory {
                        field: self.config.cross_category_field.clone(),
                    },
                    self.cross_category_report(),
                ),
            ];

            for (kind, report) in leaf_reports {
                stages.push(Stage::new(
                    kind,
                    source.clone(),
                    self.artifact(&report, g),
                    range,
                    leaf,
                )?);
            }
        }

        /* ---------- rollups diarios ---------- */
        let limit = self.config.related_terms_limit;
        for day in generations(rollup, self.config.lookback_secs, now_secs) {
            let children = self.daily.children(day);
            let range = TimeRange::bucket(day, rollup);
            let from = |report: &str| -> Vec<String> {
                children.iter().map(|g| self.artifact(report, *g)).collect()
            };

            stages.push(Stage::new(
                StageKind::CtrCounterMerge,
                from(CTR_STATS),
                self.artifact(CTR_STATS_DAILY, day),
                range,
                rollup,
            )?);

            stages.push(Stage::new(
                StageKind::CtrCounterMerge,
                from(CTR_BY_POSITION),
                self.artifact(CTR_BY_POSITION_DAILY, day),
                range,
                rollup,
            )?);

            stages.push(Stage::new(
                StageKind::RelatedTerms { limit },
                from(CTR_BY_SEARCHQUERY),
                self.artifact(RELATED_TERMS, day),
                range,
                rollup,
            )?);

            // acumulado de los últimos N días (incluye `day`)
            let days = trailing(rollup, self.config.trailing_days, day);
            stages.push(Stage::new(
                StageKind::TermInfoMerge { limit },
                days.iter().map(|d| self.artifact(RELATED_TERMS, *d)).collect(),
                self.artifact(&self.trailing_report(), day),
                TimeRange::buckets_ending_at(day, self.config.trailing_days, rollup),
                rollup,
            )?);
        }

        Ok(stages)
    }
}
