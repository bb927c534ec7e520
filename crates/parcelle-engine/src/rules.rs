//! Rule ingestion and resolution against the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::future::try_join_all;
use parcelle_core::{ConsolidatedRule, ParcelGeometry, RuleLevel, RuleRow, consolidate};
use parcelle_store::{RuleStore, ZoneStore};
use tracing::{debug, info};

use crate::EngineError;
use crate::bounded::bounded;

/// Resolves regulation rows into one winning value per field.
///
/// Stateless over the store: any number of resolvers may share one store and
/// run concurrently.
pub struct RuleResolver<S: ?Sized> {
    store: Arc<S>,
    timeout: Option<Duration>,
}

impl<S: ?Sized> Clone for RuleResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timeout: self.timeout,
        }
    }
}

impl<S> RuleResolver<S>
where
    S: RuleStore + ZoneStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    /// Bound every store call made by this resolver.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Insert one row. Returns `false` when the key already existed.
    pub async fn insert_rule(&self, row: &RuleRow) -> Result<bool, EngineError> {
        Ok(self.insert_rules_batch(std::slice::from_ref(row)).await? == 1)
    }

    /// Insert rows with insert-or-ignore semantics. Existing keys keep their
    /// first-written value; the return value counts new rows only.
    pub async fn insert_rules_batch(&self, rows: &[RuleRow]) -> Result<usize, EngineError> {
        let inserted = bounded("insert_rules", self.timeout, self.store.insert_rules(rows)).await?;
        info!(
            offered = rows.len(),
            inserted,
            skipped = rows.len() - inserted,
            "rule batch ingested"
        );
        Ok(inserted)
    }

    /// Consolidated rules of a zone, as of today (UTC).
    pub async fn resolve_rules_by_zone(
        &self,
        zone_id: &str,
    ) -> Result<Vec<ConsolidatedRule>, EngineError> {
        self.resolve_rules_by_zone_at(zone_id, today()).await
    }

    pub async fn resolve_rules_by_zone_at(
        &self,
        zone_id: &str,
        on: NaiveDate,
    ) -> Result<Vec<ConsolidatedRule>, EngineError> {
        let zone = bounded("zone", self.timeout, self.store.zone(zone_id)).await?;
        let zone_code = zone.map(|z| z.code_norm).unwrap_or_default();
        self.resolve_zone(zone_id, &zone_code, on).await
    }

    async fn resolve_zone(
        &self,
        zone_id: &str,
        zone_code: &str,
        on: NaiveDate,
    ) -> Result<Vec<ConsolidatedRule>, EngineError> {
        let rows = bounded(
            "rules_for_zone",
            self.timeout,
            self.store.rules_for_zone(zone_id, on),
        )
        .await?;
        let rules = consolidate(zone_id, zone_code, &rows, on);
        debug!(zone_id, rows = rows.len(), fields = rules.len(), "zone resolved");
        Ok(rules)
    }

    /// Consolidated rules of every zone the parcel intersects, as of today.
    ///
    /// Zones are resolved independently and concatenated in zone id order;
    /// a field defined by two zones appears twice, once per zone.
    pub async fn resolve_rules_by_parcel_geom(
        &self,
        geom: &ParcelGeometry,
    ) -> Result<Vec<ConsolidatedRule>, EngineError> {
        self.resolve_rules_by_parcel_geom_at(geom, today()).await
    }

    pub async fn resolve_rules_by_parcel_geom_at(
        &self,
        geom: &ParcelGeometry,
        on: NaiveDate,
    ) -> Result<Vec<ConsolidatedRule>, EngineError> {
        let zones = bounded(
            "zones_intersecting",
            self.timeout,
            self.store.zones_intersecting(geom),
        )
        .await?;
        let per_zone = try_join_all(
            zones
                .iter()
                .map(|z| self.resolve_zone(&z.id, &z.code_norm, on)),
        )
        .await?;
        let rules: Vec<ConsolidatedRule> = per_zone.into_iter().flatten().collect();
        info!(zones = zones.len(), rules = rules.len(), "parcel rules resolved");
        Ok(rules)
    }

    /// Alias of [`resolve_rules_by_parcel_geom`](Self::resolve_rules_by_parcel_geom).
    pub async fn resolve_rules_by_zone_geom(
        &self,
        geom: &ParcelGeometry,
    ) -> Result<Vec<ConsolidatedRule>, EngineError> {
        self.resolve_rules_by_parcel_geom(geom).await
    }

    pub async fn get_rule(
        &self,
        zone_id: &str,
        field: &str,
    ) -> Result<Option<ConsolidatedRule>, EngineError> {
        Ok(self
            .resolve_rules_by_zone(zone_id)
            .await?
            .into_iter()
            .find(|r| r.field == field))
    }

    /// Winning value of `field` read as a number; numeric text is accepted.
    pub async fn get_numeric_rule(
        &self,
        zone_id: &str,
        field: &str,
    ) -> Result<Option<f64>, EngineError> {
        Ok(self
            .get_rule(zone_id, field)
            .await?
            .and_then(|r| r.value.as_f64()))
    }

    /// Consolidated rules whose winning row sits at `level`.
    pub async fn get_rules_by_level(
        &self,
        zone_id: &str,
        level: RuleLevel,
    ) -> Result<Vec<ConsolidatedRule>, EngineError> {
        Ok(self
            .resolve_rules_by_zone(zone_id)
            .await?
            .into_iter()
            .filter(|r| r.level == level)
            .collect())
    }
}

/// Calendar date on the same UTC clock as context and quality timestamps.
pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Faulty, day, init_tracing, square, zone};
    use parcelle_core::RuleValue;
    use parcelle_store::{MemoryStore, StoreError};

    fn resolver() -> (Arc<MemoryStore>, RuleResolver<MemoryStore>) {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), RuleResolver::new(store))
    }

    fn on() -> NaiveDate {
        day(2025, 6, 1)
    }

    #[tokio::test]
    async fn servitude_override_with_decision_log() {
        let (store, rules) = resolver();
        store.insert_zone(&zone("z1", "R2", 0.0)).await.unwrap();
        rules
            .insert_rules_batch(&[
                RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 15.0, day(2020, 1, 1)),
                RuleRow::new("z1", RuleLevel::Level1, "h_max_m", 12.0, day(2020, 1, 1))
                    .with_description("Servitude de hauteur"),
            ])
            .await
            .unwrap();

        let out = rules.resolve_rules_by_zone_at("z1", on()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, RuleValue::Number(12.0));
        assert_eq!(out[0].zone_code, "R2");
        assert_eq!(out[0].overridden.len(), 1);
        assert_eq!(out[0].overridden[0].level, RuleLevel::Level3);
        assert_eq!(out[0].overridden[0].value, RuleValue::Number(15.0));
    }

    #[tokio::test]
    async fn batch_insert_is_idempotent() {
        let (store, rules) = resolver();
        let batch = vec![
            RuleRow::new("z1", RuleLevel::Level3, "indice_u", 0.5, day(2020, 1, 1)),
            RuleRow::new("z1", RuleLevel::Level4, "recul_min_m", 3.0, day(2020, 1, 1)),
        ];
        assert_eq!(rules.insert_rules_batch(&batch).await.unwrap(), 2);
        assert_eq!(rules.insert_rules_batch(&batch).await.unwrap(), 0);
        assert_eq!(store.rule_count().await.unwrap(), 2);
        assert!(!rules.insert_rule(&batch[0]).await.unwrap());
    }

    #[tokio::test]
    async fn parcel_spanning_two_zones_keeps_both_values() {
        let (store, rules) = resolver();
        store.insert_zone(&zone("a", "R1", 0.0)).await.unwrap();
        store.insert_zone(&zone("b", "R3", 10.0)).await.unwrap();
        rules
            .insert_rules_batch(&[
                RuleRow::new("a", RuleLevel::Level3, "h_max_m", 10.0, day(2020, 1, 1)),
                RuleRow::new("b", RuleLevel::Level3, "h_max_m", 15.0, day(2020, 1, 1)),
            ])
            .await
            .unwrap();

        let parcel = ParcelGeometry::from(square(5.0, 2.0, 10.0));
        let out = rules.resolve_rules_by_parcel_geom_at(&parcel, on()).await.unwrap();
        let h: Vec<(&str, &str, f64)> = out
            .iter()
            .filter(|r| r.field == "h_max_m")
            .map(|r| (r.zone_id.as_str(), r.zone_code.as_str(), r.value.as_number().unwrap()))
            .collect();
        assert_eq!(h, vec![("a", "R1", 10.0), ("b", "R3", 15.0)]);
    }

    #[tokio::test]
    async fn parcel_outside_every_zone_is_empty() {
        let (store, rules) = resolver();
        store.insert_zone(&zone("a", "R1", 0.0)).await.unwrap();
        let parcel = ParcelGeometry::from(square(500.0, 500.0, 10.0));
        assert!(rules.resolve_rules_by_parcel_geom(&parcel).await.unwrap().is_empty());
        assert!(rules.resolve_rules_by_zone("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_helpers() {
        let (_store, rules) = resolver();
        rules
            .insert_rules_batch(&[
                RuleRow::new("z1", RuleLevel::Level3, "indice_u", "0,6", day(2020, 1, 1)),
                RuleRow::new("z1", RuleLevel::Level4, "recul_min_m", 3.0, day(2020, 1, 1)),
                RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 9.0, day(2020, 1, 1)),
            ])
            .await
            .unwrap();

        assert_eq!(rules.get_numeric_rule("z1", "indice_u").await.unwrap(), Some(0.6));
        assert!(rules.get_rule("z1", "ibus").await.unwrap().is_none());
        let level3 = rules.get_rules_by_level("z1", RuleLevel::Level3).await.unwrap();
        let fields: Vec<&str> = level3.iter().map(|r| r.field.as_str()).collect();
        assert_eq!(fields, vec!["h_max_m", "indice_u"]);
    }

    #[tokio::test]
    async fn today_follows_the_utc_calendar() {
        let (_, rules) = resolver();
        let utc_today = Utc::now().date_naive();
        let yesterday = utc_today.pred_opt().unwrap();
        rules
            .insert_rules_batch(&[
                RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 9.0, utc_today)
                    .valid_until(utc_today),
                RuleRow::new("z1", RuleLevel::Level3, "indice_u", 0.5, yesterday)
                    .valid_until(yesterday),
            ])
            .await
            .unwrap();

        assert_eq!(today(), utc_today);
        let out = rules.resolve_rules_by_zone("z1").await.unwrap();
        let fields: Vec<&str> = out.iter().map(|r| r.field.as_str()).collect();
        assert_eq!(fields, vec!["h_max_m"]);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        init_tracing();
        let rules = RuleResolver::new(Arc::new(Faulty::failing()));
        let err = rules.resolve_rules_by_zone("z1").await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Other(_))));
    }

    #[tokio::test]
    async fn stalled_store_times_out() {
        init_tracing();
        let rules = RuleResolver::new(Arc::new(Faulty::stalled()))
            .with_timeout(Some(Duration::from_millis(20)));
        let err = rules
            .insert_rules_batch(&[RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 9.0, on())])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { operation: "insert_rules", .. }));
    }
}
