use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MICROS_PER_SECOND: u64 = 1_000_000;
pub const SECONDS_PER_HOUR: u64 = 3_600;
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Id de bucket: floor(timestamp / ventana).
pub type Generation = u64;

/// `secs` en microsegundos, o `None` si no entra en un u64.
pub fn secs_to_micros(secs: u64) -> Option<u64> {
    secs.checked_mul(MICROS_PER_SECOND)
}

/// Reloj de pared en microsegundos.
pub fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Generaciones de tamaño `window_secs` que caen dentro de los últimos
/// `range_secs` antes de `now_secs`.
///
/// - `now_secs` = `None` o `Some(0)` => se usa el reloj de pared.
/// - El offset arranca en 1µs (no en 0) y avanza de a una ventana mientras
///   sea menor que el rango; cada paso aporta `(now - i) / window`.
/// - El resultado es un conjunto: dos offsets pueden caer en el mismo bucket.
pub fn generations(window_secs: u64, range_secs: u64, now_secs: Option<u64>) -> BTreeSet<Generation> {
    let mut out = BTreeSet::new();
    if window_secs == 0 {
        return out;
    }

    let now = match now_secs {
        Some(s) if s > 0 => s.saturating_mul(MICROS_PER_SECOND),
        _ => now_micros(),
    };
    let window = window_secs.saturating_mul(MICROS_PER_SECOND);
    let range = range_secs.saturating_mul(MICROS_PER_SECOND);

    let mut i: u64 = 1;
    while i < range {
        // antes de la época no hay buckets
        let Some(t) = now.checked_sub(i) else {
            break;
        };
        out.insert(t / window);
        i = match i.checked_add(window) {
            Some(next) => next,
            None => break,
        };
    }

    out
}

/// Intervalo semiabierto [start, end) en microsegundos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: u64,
    pub end: u64,
}

impl TimeRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Rango cubierto por el bucket `g` de una ventana de `window_secs`.
    /// Satura en `u64::MAX` en vez de desbordar.
    pub fn bucket(g: Generation, window_secs: u64) -> Self {
        let window = window_secs.saturating_mul(MICROS_PER_SECOND);
        Self {
            start: g.saturating_mul(window),
            end: g.saturating_add(1).saturating_mul(window),
        }
    }

    /// Rango de `count` buckets consecutivos que terminan en `last` (inclusive).
    pub fn buckets_ending_at(last: Generation, count: u64, window_secs: u64) -> Self {
        let window = window_secs.saturating_mul(MICROS_PER_SECOND);
        let end = last.saturating_add(1);
        let first = end.saturating_sub(count);
        Self {
            start: first.saturating_mul(window),
            end: end.saturating_mul(window),
        }
    }

    pub fn is_aligned(&self, window_secs: u64) -> bool {
        let Some(window) = window_secs.checked_mul(MICROS_PER_SECOND) else {
            return false;
        };
        window > 0 && self.start < self.end && self.start % window == 0 && self.end % window == 0
    }

    pub fn contains(&self, ts_micros: u64) -> bool {
        self.start <= ts_micros && ts_micros < self.end
    }

    /// Un rango está cerrado cuando su fin (más el margen de asentamiento) ya pasó.
    pub fn is_closed(&self, now_micros: u64, settle_secs: u64) -> bool {
        self.end.saturating_add(settle_secs.saturating_mul(MICROS_PER_SECOND)) <= now_micros
    }
}

fn render(ts_micros: u64) -> String {
    DateTime::<Utc>::from_timestamp((ts_micros / MICROS_PER_SECOND) as i64, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts_micros.to_string())
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", render(self.start), render(self.end))
    }
}
