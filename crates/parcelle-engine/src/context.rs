//! Context resolution: parcel × registered layers → severity-ranked flags,
//! cached per `(parcel, layer)` for a configurable number of days.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use parcelle_core::config::ContextConfig;
use parcelle_core::context::sort_flags;
use parcelle_core::{CachedContext, ContextFlag, ContextLayer, ParcelGeometry};
use parcelle_store::{ContextStore, StoreError};
use tracing::{debug, info, warn};

use crate::EngineError;
use crate::bounded::bounded;

pub struct ContextResolver<S: ?Sized> {
    store: Arc<S>,
    config: ContextConfig,
    timeout: Option<Duration>,
}

impl<S: ?Sized> Clone for ContextResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S> ContextResolver<S>
where
    S: ContextStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: ContextConfig) -> Self {
        Self {
            store,
            config,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn get_context_for_parcel(
        &self,
        parcel_id: &str,
        geom: &ParcelGeometry,
    ) -> Result<Vec<ContextFlag>, EngineError> {
        self.get_context_for_parcel_at(parcel_id, geom, Utc::now())
            .await
    }

    /// Flags for a parcel as seen at `now`.
    ///
    /// A cache row younger than the TTL short-circuits layer evaluation.
    /// Otherwise every layer is queried concurrently, one cache row per layer
    /// is written, and the top `max_flags` flags are returned, most severe
    /// first.
    pub async fn get_context_for_parcel_at(
        &self,
        parcel_id: &str,
        geom: &ParcelGeometry,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContextFlag>, EngineError> {
        let ttl = self.config.cache_ttl();
        let cached = bounded(
            "cached_context",
            self.timeout,
            self.store.cached_context(parcel_id, now - ttl),
        )
        .await?;
        if !cached.is_empty() {
            debug!(parcel_id, rows = cached.len(), "context served from cache");
            let flags = cached.iter().map(CachedContext::to_flag).collect();
            return Ok(self.rank(flags));
        }

        let layers = bounded("layers", self.timeout, self.store.layers()).await?;
        let evaluated = try_join_all(layers.iter().map(|layer| self.evaluate(layer, geom))).await?;

        let rows: Vec<CachedContext> = evaluated
            .iter()
            .filter_map(|(layer, flag)| {
                let layer = (*layer)?;
                Some(CachedContext::from_flag(parcel_id, layer, flag.as_ref(), now))
            })
            .collect();
        bounded("write_context", self.timeout, self.store.write_context(&rows)).await?;

        let flags: Vec<ContextFlag> = evaluated.into_iter().filter_map(|(_, f)| f).collect();
        info!(
            parcel_id,
            layers = layers.len(),
            flags = flags.len(),
            "context computed"
        );
        Ok(self.rank(flags))
    }

    /// Query one layer. A layer that vanished from the store between listing
    /// and probing is skipped; any other store failure aborts the request.
    async fn evaluate<'a>(
        &self,
        layer: &'a ContextLayer,
        geom: &ParcelGeometry,
    ) -> Result<(Option<&'a ContextLayer>, Option<ContextFlag>), EngineError> {
        let radius = layer.check.radius(self.config.report_radius_m);
        let queried = bounded(
            "layer_hits",
            self.timeout,
            self.store.layer_hits(&layer.id, geom, radius),
        )
        .await;
        let hits = match queried {
            Ok(hits) => hits,
            Err(EngineError::Store(StoreError::NotFound(what))) => {
                warn!(layer = %layer.name, %what, "layer skipped");
                return Ok((None, None));
            }
            Err(e) => return Err(e),
        };
        let flag = ContextFlag::evaluate(layer, &hits);
        debug!(
            layer = %layer.name,
            hits = hits.len(),
            severity = flag.as_ref().map(|f| f.severity),
            "layer evaluated"
        );
        Ok((Some(layer), flag))
    }

    fn rank(&self, flags: Vec<ContextFlag>) -> Vec<ContextFlag> {
        let mut flags: Vec<ContextFlag> =
            flags.into_iter().filter(ContextFlag::is_relevant).collect();
        sort_flags(&mut flags);
        flags.truncate(self.config.max_flags);
        flags
    }

    /// Delete cache rows older than `max_age_days`; `0` deletes every row.
    pub async fn clean_context_cache(&self, max_age_days: u32) -> Result<usize, EngineError> {
        self.clean_context_cache_at(max_age_days, Utc::now()).await
    }

    pub async fn clean_context_cache_at(
        &self,
        max_age_days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let cutoff =
            (max_age_days > 0).then(|| now - chrono::Duration::days(i64::from(max_age_days)));
        let deleted =
            bounded("purge_context", self.timeout, self.store.purge_context(cutoff)).await?;
        info!(max_age_days, deleted, "context cache cleaned");
        Ok(deleted)
    }
}

/// Display lines for the `limit` most severe flags, severity descending then
/// layer name ascending.
pub fn summarize_context(flags: &[ContextFlag], limit: usize) -> Vec<String> {
    let mut sorted = flags.to_vec();
    sort_flags(&mut sorted);
    sorted.iter().take(limit).map(display_line).collect()
}

fn display_line(flag: &ContextFlag) -> String {
    if !flag.message.is_empty() {
        return flag.message.clone();
    }
    match flag.distance {
        Some(d) if !flag.intersects => format!("Contrainte {} à {}m", flag.layer, d.round()),
        _ => format!("Contrainte {}", flag.layer),
    }
}
