//! The store interface the engine reads from and writes to.
//!
//! Uniqueness is the store's job: rule inserts are insert-or-ignore on
//! `(zone_id, field, level, validity_from)`, cache and evidence writes are
//! insert-or-replace on their keys. Callers never need an in-process lock.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parcelle_core::{
    AnalysisQuality, CachedContext, ContextLayer, EvidenceItem, LayerFeature, LayerHit,
    ParcelGeometry, RegulationSource, RuleRow, Zone,
};

use crate::StoreError;

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert rows, ignoring existing keys. Returns the number of rows
    /// actually written.
    async fn insert_rules(&self, rows: &[RuleRow]) -> Result<usize, StoreError>;

    /// Rows of `zone_id` applicable on `on`.
    async fn rules_for_zone(&self, zone_id: &str, on: NaiveDate)
    -> Result<Vec<RuleRow>, StoreError>;

    async fn rule_count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait ZoneStore: Send + Sync {
    /// Insert or replace a zone.
    async fn insert_zone(&self, zone: &Zone) -> Result<(), StoreError>;

    async fn zone(&self, id: &str) -> Result<Option<Zone>, StoreError>;

    /// Zones whose geometry intersects `geom`, ordered by id.
    async fn zones_intersecting(&self, geom: &ParcelGeometry) -> Result<Vec<Zone>, StoreError>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn insert_source(&self, source: &RegulationSource) -> Result<(), StoreError>;

    async fn source(&self, id: &str) -> Result<Option<RegulationSource>, StoreError>;
}

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Register (or replace) a layer together with its feature set.
    async fn register_layer(
        &self,
        layer: &ContextLayer,
        features: &[LayerFeature],
    ) -> Result<(), StoreError>;

    /// Registered layers, ordered by id.
    async fn layers(&self) -> Result<Vec<ContextLayer>, StoreError>;

    /// Features of `layer_id` intersecting `geom` or lying within `radius_m`.
    async fn layer_hits(
        &self,
        layer_id: &str,
        geom: &ParcelGeometry,
        radius_m: f64,
    ) -> Result<Vec<LayerHit>, StoreError>;

    /// Cache rows of `parcel_id` computed at or after `fresh_since`.
    async fn cached_context(
        &self,
        parcel_id: &str,
        fresh_since: DateTime<Utc>,
    ) -> Result<Vec<CachedContext>, StoreError>;

    /// Upsert cache rows on `(parcel_id, layer_id)`.
    async fn write_context(&self, rows: &[CachedContext]) -> Result<(), StoreError>;

    /// Delete cache rows computed before `older_than`; `None` deletes all.
    async fn purge_context(&self, older_than: Option<DateTime<Utc>>) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Upsert items on `(parcel_id, ref_type, field, source_path)`.
    async fn record_evidence(&self, items: &[EvidenceItem]) -> Result<usize, StoreError>;

    async fn evidence_for(&self, parcel_id: &str) -> Result<Vec<EvidenceItem>, StoreError>;

    /// Upsert on `(parcel_id, calc_date)`.
    async fn upsert_quality(&self, quality: &AnalysisQuality) -> Result<(), StoreError>;

    async fn quality_for(
        &self,
        parcel_id: &str,
        calc_date: NaiveDate,
    ) -> Result<Option<AnalysisQuality>, StoreError>;
}

/// Everything the engine needs from a backend.
pub trait Store: RuleStore + ZoneStore + SourceStore + ContextStore + EvidenceStore {}

impl<T> Store for T where T: RuleStore + ZoneStore + SourceStore + ContextStore + EvidenceStore {}
