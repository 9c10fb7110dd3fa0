use std::collections::BTreeSet;

use crate::error::ConfigError;
use crate::generation::{generations, secs_to_micros, Generation};

/// Relación de contención entre dos ventanas (ej: 4h -> 1 día).
///
/// No guarda aristas: las dependencias de un bucket grueso se recalculan
/// a partir del id y de la razón entre ventanas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupGraph {
    fine_secs: u64,
    coarse_secs: u64,
}

impl RollupGraph {
    pub fn new(fine_secs: u64, coarse_secs: u64) -> Result<Self, ConfigError> {
        if fine_secs == 0 {
            return Err(ConfigError::ZeroWindow("fine"));
        }
        if coarse_secs == 0 {
            return Err(ConfigError::ZeroWindow("coarse"));
        }
        if secs_to_micros(fine_secs).is_none() {
            return Err(ConfigError::WindowOverflow {
                name: "fine",
                secs: fine_secs,
            });
        }
        if secs_to_micros(coarse_secs).is_none() {
            return Err(ConfigError::WindowOverflow {
                name: "coarse",
                secs: coarse_secs,
            });
        }
        if coarse_secs % fine_secs != 0 {
            return Err(ConfigError::WindowNotMultiple {
                fine: fine_secs,
                coarse: coarse_secs,
            });
        }

        Ok(Self {
            fine_secs,
            coarse_secs,
        })
    }

    pub fn fine_secs(&self) -> u64 {
        self.fine_secs
    }

    pub fn coarse_secs(&self) -> u64 {
        self.coarse_secs
    }

    /// Cantidad de buckets finos por bucket grueso.
    pub fn ratio(&self) -> u64 {
        self.coarse_secs / self.fine_secs
    }

    /// Buckets finos contenidos en el bucket grueso `coarse`.
    ///
    /// Se ancla en el borde de cierre del bucket grueso, así el resultado es
    /// exactamente `{D*r, ..., D*r + r - 1}`.
    pub fn children(&self, coarse: Generation) -> BTreeSet<Generation> {
        generations(
            self.fine_secs,
            self.coarse_secs,
            Some(coarse.saturating_add(1).saturating_mul(self.coarse_secs)),
        )
    }

    /// Bucket grueso que contiene al bucket fino `fine`.
    pub fn parent(&self, fine: Generation) -> Generation {
        fine / self.ratio()
    }
}

/// Los `count` buckets de `window_secs` que terminan en `last` (inclusive).
pub fn trailing(window_secs: u64, count: u64, last: Generation) -> BTreeSet<Generation> {
    generations(
        window_secs,
        count.saturating_mul(window_secs),
        Some(last.saturating_add(1).saturating_mul(window_secs)),
    )
}
