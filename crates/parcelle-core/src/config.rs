//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! store_timeout_ms = 2000
//!
//! [context]
//! cache_ttl_days = 30
//! max_flags = 5
//! report_radius_m = 100.0
//!
//! [calc]
//! indice_u_max = 2.0
//! emprise_max_max = 1.0
//!
//! [quality]
//! direct = 1.0
//! derived = 0.8
//! estimated = 0.5
//! missing = 0.0
//! ```
//!
//! Every key is optional; absent keys take the defaults shown above.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calc::CalcPolicy;
use crate::evidence::QualityWeights;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Cached flags older than this are recomputed.
    pub cache_ttl_days: u32,
    /// Cap on returned flags and summary lines.
    pub max_flags: usize,
    /// Non-intersecting features within this distance are reported.
    pub report_radius_m: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            cache_ttl_days: 30,
            max_flags: 5,
            report_radius_m: 100.0,
        }
    }
}

impl ContextConfig {
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_ttl_days))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub context: ContextConfig,
    pub calc: CalcPolicy,
    pub quality: QualityWeights,
    /// Upper bound on each store call. `None` leaves calls unbounded.
    pub store_timeout_ms: Option<u64>,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.max_flags == 0 {
            return Err(ConfigError::Invalid("context.max_flags must be at least 1".into()));
        }
        if !(self.context.report_radius_m >= 0.0) {
            return Err(ConfigError::Invalid(
                "context.report_radius_m must be non-negative".into(),
            ));
        }
        if !(self.calc.indice_u_max > 0.0) || !(self.calc.emprise_max_max > 0.0) {
            return Err(ConfigError::Invalid("calc bounds must be positive".into()));
        }
        let q = &self.quality;
        for (name, w) in [
            ("direct", q.direct),
            ("derived", q.derived),
            ("estimated", q.estimated),
            ("missing", q.missing),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(ConfigError::Invalid(format!(
                    "quality.{name} must be within [0, 1], got {w}"
                )));
            }
        }
        if self.store_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("store_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_ms.map(Duration::from_millis)
    }
}
