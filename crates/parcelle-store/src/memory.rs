//! In-process store over ordered maps.
//!
//! Keys mirror the persisted unique constraints, so insert-or-ignore and
//! insert-or-replace behave exactly as they do in DuckDB.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parcelle_core::evidence::EvidenceKey;
use parcelle_core::rule::RuleKey;
use parcelle_core::{
    AnalysisQuality, CachedContext, ContextLayer, EvidenceItem, LayerFeature, LayerHit,
    ParcelGeometry, RegulationSource, RuleRow, Zone,
};
use tracing::debug;

use crate::StoreError;
use crate::interface::{ContextStore, EvidenceStore, RuleStore, SourceStore, ZoneStore};

#[derive(Default)]
struct Tables {
    rules: BTreeMap<RuleKey, RuleRow>,
    zones: BTreeMap<String, Zone>,
    sources: BTreeMap<String, RegulationSource>,
    layers: BTreeMap<String, ContextLayer>,
    features: BTreeMap<String, Vec<LayerFeature>>,
    context: BTreeMap<(String, String), CachedContext>,
    evidence: BTreeMap<EvidenceKey, EvidenceItem>,
    quality: BTreeMap<(String, NaiveDate), AnalysisQuality>,
}

/// A [`Store`](crate::Store) held entirely in memory. Cheap to create; used
/// as the default backend and as the test fixture.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|e| StoreError::Other(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|e| StoreError::Other(format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn insert_rules(&self, rows: &[RuleRow]) -> Result<usize, StoreError> {
        let mut t = self.write()?;
        let mut inserted = 0;
        for row in rows {
            if let std::collections::btree_map::Entry::Vacant(slot) = t.rules.entry(row.key()) {
                slot.insert(row.clone());
                inserted += 1;
            }
        }
        debug!(offered = rows.len(), inserted, "memory: insert rules");
        Ok(inserted)
    }

    async fn rules_for_zone(
        &self,
        zone_id: &str,
        on: NaiveDate,
    ) -> Result<Vec<RuleRow>, StoreError> {
        let t = self.read()?;
        Ok(t.rules
            .values()
            .filter(|r| r.zone_id == zone_id && r.is_applicable(on))
            .cloned()
            .collect())
    }

    async fn rule_count(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.rules.len())
    }
}

#[async_trait]
impl ZoneStore for MemoryStore {
    async fn insert_zone(&self, zone: &Zone) -> Result<(), StoreError> {
        self.write()?.zones.insert(zone.id.clone(), zone.clone());
        Ok(())
    }

    async fn zone(&self, id: &str) -> Result<Option<Zone>, StoreError> {
        Ok(self.read()?.zones.get(id).cloned())
    }

    async fn zones_intersecting(&self, geom: &ParcelGeometry) -> Result<Vec<Zone>, StoreError> {
        let t = self.read()?;
        Ok(t.zones
            .values()
            .filter(|z| geom.intersects(&z.geometry))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn insert_source(&self, source: &RegulationSource) -> Result<(), StoreError> {
        self.write()?
            .sources
            .insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn source(&self, id: &str) -> Result<Option<RegulationSource>, StoreError> {
        Ok(self.read()?.sources.get(id).cloned())
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn register_layer(
        &self,
        layer: &ContextLayer,
        features: &[LayerFeature],
    ) -> Result<(), StoreError> {
        let mut t = self.write()?;
        t.layers.insert(layer.id.clone(), layer.clone());
        t.features.insert(layer.id.clone(), features.to_vec());
        Ok(())
    }

    async fn layers(&self) -> Result<Vec<ContextLayer>, StoreError> {
        Ok(self.read()?.layers.values().cloned().collect())
    }

    async fn layer_hits(
        &self,
        layer_id: &str,
        geom: &ParcelGeometry,
        radius_m: f64,
    ) -> Result<Vec<LayerHit>, StoreError> {
        let t = self.read()?;
        if !t.layers.contains_key(layer_id) {
            return Err(StoreError::NotFound(format!("context layer {layer_id}")));
        }
        let Some(window) = geom.bbox().map(|b| b.expand(radius_m)) else {
            return Ok(Vec::new());
        };
        let features = t.features.get(layer_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(features
            .iter()
            .filter(|f| f.bbox().is_some_and(|b| b.overlaps(&window)))
            .filter_map(|f| f.hit_test(geom, radius_m))
            .collect())
    }

    async fn cached_context(
        &self,
        parcel_id: &str,
        fresh_since: DateTime<Utc>,
    ) -> Result<Vec<CachedContext>, StoreError> {
        let t = self.read()?;
        Ok(t.context
            .values()
            .filter(|c| c.parcel_id == parcel_id && c.computed_at >= fresh_since)
            .cloned()
            .collect())
    }

    async fn write_context(&self, rows: &[CachedContext]) -> Result<(), StoreError> {
        let mut t = self.write()?;
        for row in rows {
            t.context
                .insert((row.parcel_id.clone(), row.layer_id.clone()), row.clone());
        }
        Ok(())
    }

    async fn purge_context(&self, older_than: Option<DateTime<Utc>>) -> Result<usize, StoreError> {
        let mut t = self.write()?;
        let before = t.context.len();
        match older_than {
            Some(cutoff) => t.context.retain(|_, c| c.computed_at >= cutoff),
            None => t.context.clear(),
        }
        Ok(before - t.context.len())
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn record_evidence(&self, items: &[EvidenceItem]) -> Result<usize, StoreError> {
        let mut t = self.write()?;
        let mut written = std::collections::BTreeSet::new();
        for item in items {
            let key = item.key();
            t.evidence.insert(key.clone(), item.clone());
            written.insert(key);
        }
        Ok(written.len())
    }

    async fn evidence_for(&self, parcel_id: &str) -> Result<Vec<EvidenceItem>, StoreError> {
        let t = self.read()?;
        Ok(t.evidence
            .values()
            .filter(|e| e.parcel_id == parcel_id)
            .cloned()
            .collect())
    }

    async fn upsert_quality(&self, quality: &AnalysisQuality) -> Result<(), StoreError> {
        self.write()?.quality.insert(
            (quality.parcel_id.clone(), quality.calc_date),
            quality.clone(),
        );
        Ok(())
    }

    async fn quality_for(
        &self,
        parcel_id: &str,
        calc_date: NaiveDate,
    ) -> Result<Option<AnalysisQuality>, StoreError> {
        Ok(self
            .read()?
            .quality
            .get(&(parcel_id.to_string(), calc_date))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use geo::{LineString, MultiPolygon, Polygon};
    use parcelle_core::{LayerCheck, RefType, Reliability, RuleLevel, SeverityRule};

    use super::*;

    fn square(x: f64, y: f64, side: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![Polygon::new(
            LineString::from(vec![
                (x, y),
                (x + side, y),
                (x + side, y + side),
                (x, y + side),
                (x, y),
            ]),
            vec![],
        )])
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn rules() -> Vec<RuleRow> {
        vec![
            RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 15.0, day(2020, 1, 1)),
            RuleRow::new("z1", RuleLevel::Level1, "h_max_m", 12.0, day(2020, 1, 1)),
            RuleRow::new("z1", RuleLevel::Level3, "indice_u", 0.5, day(2020, 1, 1)),
        ]
    }

    #[tokio::test]
    async fn insert_rules_is_idempotent() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_rules(&rules()).await.unwrap(), 3);
        assert_eq!(store.insert_rules(&rules()).await.unwrap(), 0);
        assert_eq!(store.rule_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_key_keeps_first_value() {
        let store = MemoryStore::new();
        let first = RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 15.0, day(2020, 1, 1))
            .with_description("original");
        let second = RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 99.0, day(2020, 1, 1))
            .with_description("rewrite");
        store.insert_rules(&[first.clone()]).await.unwrap();
        store.insert_rules(&[second]).await.unwrap();
        let rows = store.rules_for_zone("z1", day(2025, 1, 1)).await.unwrap();
        assert_eq!(rows, vec![first]);
    }

    #[tokio::test]
    async fn concurrent_batches_do_not_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert_rules(&rules()).await.unwrap()
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 3);
        assert_eq!(store.rule_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rules_filtered_by_validity() {
        let store = MemoryStore::new();
        store
            .insert_rules(&[
                RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 15.0, day(2030, 1, 1)),
                RuleRow::new("z1", RuleLevel::Level3, "indice_u", 0.5, day(2020, 1, 1))
                    .valid_until(day(2021, 1, 1)),
                RuleRow::new("z2", RuleLevel::Level3, "indice_u", 0.6, day(2020, 1, 1)),
            ])
            .await
            .unwrap();
        assert!(store.rules_for_zone("z1", day(2025, 1, 1)).await.unwrap().is_empty());
        assert_eq!(store.rules_for_zone("z2", day(2025, 1, 1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zones_intersecting_uses_geometry() {
        let store = MemoryStore::new();
        for (id, x) in [("b", 10.0), ("a", 0.0), ("c", 100.0)] {
            store
                .insert_zone(&Zone {
                    id: id.into(),
                    code_norm: id.to_uppercase(),
                    geometry: square(x, 0.0, 10.0),
                    commune_id: "6002".into(),
                })
                .await
                .unwrap();
        }
        let parcel = ParcelGeometry::from(square(5.0, 2.0, 10.0));
        let ids: Vec<String> = store
            .zones_intersecting(&parcel)
            .await
            .unwrap()
            .into_iter()
            .map(|z| z.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn layer_hits_within_radius() {
        let store = MemoryStore::new();
        let layer = ContextLayer {
            id: "risk".into(),
            name: "risk_nat".into(),
            check: LayerCheck::Intersect,
            severity: SeverityRule::DangerMap,
            source: "VS/dangers".into(),
        };
        let feature = |x: f64, color: &str| LayerFeature {
            layer_id: "risk".into(),
            geometry: square(x, 0.0, 10.0),
            value_num: None,
            value_text: Some(color.into()),
        };
        store
            .register_layer(
                &layer,
                &[feature(0.0, "rouge"), feature(40.0, "jaune"), feature(500.0, "bleu")],
            )
            .await
            .unwrap();

        let parcel = ParcelGeometry::from(square(5.0, 0.0, 10.0));
        let hits = store.layer_hits("risk", &parcel, 100.0).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].intersects);
        assert_eq!(hits[1].distance_m, Some(25.0));

        let err = store.layer_hits("nope", &parcel, 100.0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn context_cache_replace_and_purge() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let row = |layer: &str, at: DateTime<Utc>, severity: u8| CachedContext {
            parcel_id: "p1".into(),
            layer_id: layer.into(),
            layer_name: layer.into(),
            intersects: true,
            severity,
            value_num: None,
            value_text: None,
            distance_m: None,
            message: String::new(),
            computed_at: at,
        };
        store
            .write_context(&[row("a", now - Duration::days(40), 1), row("b", now, 2)])
            .await
            .unwrap();
        store.write_context(&[row("b", now, 3)]).await.unwrap();

        let fresh = store
            .cached_context("p1", now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].severity, 3);

        assert_eq!(store.purge_context(Some(now - Duration::days(30))).await.unwrap(), 1);
        assert_eq!(store.purge_context(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn evidence_and_quality_upsert() {
        let store = MemoryStore::new();
        let item = EvidenceItem {
            parcel_id: "p1".into(),
            ref_type: RefType::Calculation,
            field: "su_m2".into(),
            value_num: Some(500.0),
            value_text: None,
            reliability: Reliability::Derived,
            source_path: "calc/su_m2".into(),
            comment: "Surface utile calculée".into(),
            metadata: serde_json::json!({}),
            inserted_by: "test".into(),
        };
        store.record_evidence(&[item.clone()]).await.unwrap();
        let updated = EvidenceItem {
            value_num: Some(510.0),
            ..item
        };
        store.record_evidence(&[updated]).await.unwrap();
        let all = store.evidence_for("p1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value_num, Some(510.0));

        let mut q = AnalysisQuality::from_items(
            "p1",
            day(2025, 6, 1),
            &all,
            &Default::default(),
        );
        store.upsert_quality(&q).await.unwrap();
        q.score_global = 0.5;
        store.upsert_quality(&q).await.unwrap();
        let got = store.quality_for("p1", day(2025, 6, 1)).await.unwrap().unwrap();
        assert_eq!(got.score_global, 0.5);
        assert!(store.quality_for("p1", day(2025, 6, 2)).await.unwrap().is_none());
    }
}
