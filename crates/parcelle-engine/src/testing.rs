//! Test fixtures: geometry helpers and a store that fails or never answers.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use geo::{LineString, MultiPolygon, Polygon};
use parcelle_core::{
    AnalysisQuality, CachedContext, ContextLayer, EvidenceItem, LayerFeature, LayerHit,
    ParcelGeometry, RegulationSource, RuleRow, Zone,
};
use parcelle_store::{ContextStore, EvidenceStore, RuleStore, SourceStore, StoreError, ZoneStore};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn square(x: f64, y: f64, side: f64) -> Polygon<f64> {
    Polygon::new(
        LineString::from(vec![
            (x, y),
            (x + side, y),
            (x + side, y + side),
            (x, y + side),
            (x, y),
        ]),
        vec![],
    )
}

pub fn square_mp(x: f64, y: f64, side: f64) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![square(x, y, side)])
}

/// A 10 m × 10 m zone with its lower-left corner at `(x, 0)`.
pub fn zone(id: &str, code: &str, x: f64) -> Zone {
    Zone {
        id: id.into(),
        code_norm: code.into(),
        geometry: square_mp(x, 0.0, 10.0),
        commune_id: "6002".into(),
    }
}

enum Mode {
    Fail,
    Stall,
}

/// Every call either errors immediately or hangs forever.
pub struct Faulty {
    mode: Mode,
}

impl Faulty {
    pub fn failing() -> Self {
        Self { mode: Mode::Fail }
    }

    pub fn stalled() -> Self {
        Self { mode: Mode::Stall }
    }

    async fn fault<T>(&self, op: &str) -> Result<T, StoreError> {
        match self.mode {
            Mode::Fail => Err(StoreError::Other(format!("{op}: backend unavailable"))),
            Mode::Stall => std::future::pending().await,
        }
    }
}

#[async_trait]
impl RuleStore for Faulty {
    async fn insert_rules(&self, _: &[RuleRow]) -> Result<usize, StoreError> {
        self.fault("insert_rules").await
    }

    async fn rules_for_zone(&self, _: &str, _: NaiveDate) -> Result<Vec<RuleRow>, StoreError> {
        self.fault("rules_for_zone").await
    }

    async fn rule_count(&self) -> Result<usize, StoreError> {
        self.fault("rule_count").await
    }
}

#[async_trait]
impl ZoneStore for Faulty {
    async fn insert_zone(&self, _: &Zone) -> Result<(), StoreError> {
        self.fault("insert_zone").await
    }

    async fn zone(&self, _: &str) -> Result<Option<Zone>, StoreError> {
        self.fault("zone").await
    }

    async fn zones_intersecting(&self, _: &ParcelGeometry) -> Result<Vec<Zone>, StoreError> {
        self.fault("zones_intersecting").await
    }
}

#[async_trait]
impl SourceStore for Faulty {
    async fn insert_source(&self, _: &RegulationSource) -> Result<(), StoreError> {
        self.fault("insert_source").await
    }

    async fn source(&self, _: &str) -> Result<Option<RegulationSource>, StoreError> {
        self.fault("source").await
    }
}

#[async_trait]
impl ContextStore for Faulty {
    async fn register_layer(&self, _: &ContextLayer, _: &[LayerFeature]) -> Result<(), StoreError> {
        self.fault("register_layer").await
    }

    async fn layers(&self) -> Result<Vec<ContextLayer>, StoreError> {
        self.fault("layers").await
    }

    async fn layer_hits(
        &self,
        _: &str,
        _: &ParcelGeometry,
        _: f64,
    ) -> Result<Vec<LayerHit>, StoreError> {
        self.fault("layer_hits").await
    }

    async fn cached_context(
        &self,
        _: &str,
        _: DateTime<Utc>,
    ) -> Result<Vec<CachedContext>, StoreError> {
        self.fault("cached_context").await
    }

    async fn write_context(&self, _: &[CachedContext]) -> Result<(), StoreError> {
        self.fault("write_context").await
    }

    async fn purge_context(&self, _: Option<DateTime<Utc>>) -> Result<usize, StoreError> {
        self.fault("purge_context").await
    }
}

#[async_trait]
impl EvidenceStore for Faulty {
    async fn record_evidence(&self, _: &[EvidenceItem]) -> Result<usize, StoreError> {
        self.fault("record_evidence").await
    }

    async fn evidence_for(&self, _: &str) -> Result<Vec<EvidenceItem>, StoreError> {
        self.fault("evidence_for").await
    }

    async fn upsert_quality(&self, _: &AnalysisQuality) -> Result<(), StoreError> {
        self.fault("upsert_quality").await
    }

    async fn quality_for(
        &self,
        _: &str,
        _: NaiveDate,
    ) -> Result<Option<AnalysisQuality>, StoreError> {
        self.fault("quality_for").await
    }
}
