//! DuckDB storage layer.
//!
//! Tables are created from the Arrow definitions in
//! [`parcelle_core::tables`], each with its unique key as primary key, so
//! `INSERT OR IGNORE` / `INSERT OR REPLACE` enforce the idempotence rules
//! without any application lock. Reads go through `query_arrow` and decode
//! the resulting RecordBatches.
//!
//! DuckDB calls block, so every store operation runs on the blocking pool
//! and the returned future yields until it completes. A caller-side timeout
//! can therefore expire while a query is still running.
//!
//! Geometries are stored as serde JSON text with their bounding box. The
//! bounding box prefilters in SQL; the exact predicate runs in Rust.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::{Connection, ToSql, params};
use geo::MultiPolygon;
use parcelle_core::{
    AnalysisQuality, BBox, CachedContext, ContextLayer, EvidenceItem, GeometryError, LayerFeature,
    LayerHit, ParcelGeometry, RefType, RegulationSource, Reliability, RuleLevel, RuleRow,
    RuleValue, Zone, tables,
};
use tracing::{debug, info, warn};

use crate::StoreError;
use crate::interface::{ContextStore, EvidenceStore, RuleStore, SourceStore, ZoneStore};

/// DuckDB-backed [`Store`](crate::Store).
///
/// Supports both in-memory (ephemeral) and persistent (file-backed) modes.
/// Use [`open`](Self::open) for in-memory and [`open_persistent`](Self::open_persistent)
/// for a database that survives process restarts. The schema is created on
/// open if absent.
pub struct DuckStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckStore {
    /// Open an in-memory DuckDB database.
    pub fn open() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open or create a persistent DuckDB database at the given path.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        let defs = tables::all();
        let ddl = defs
            .iter()
            .map(|t| t.create_sql())
            .collect::<Vec<_>>()
            .join(";\n");
        conn.execute_batch(&ddl)?;
        info!(tables = defs.len(), "duckdb schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Other(format!("mutex poisoned: {e}")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Other(format!("duckdb task join failed: {e}")))?
    }
}

fn query(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<RecordBatch>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let batches: Vec<RecordBatch> = stmt.query_arrow(params)?.collect();
    Ok(batches)
}

fn count_table(conn: &Connection, table: &str) -> Result<usize, StoreError> {
    let sql = format!("SELECT count(*)::BIGINT AS cnt FROM {table}");
    let batches = query(conn, &sql, &[])?;
    let batch = batches
        .first()
        .ok_or_else(|| StoreError::Other(format!("no count for {table}")))?;
    let col = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StoreError::Other("count column not i64".into()))?;
    Ok(col.value(0) as usize)
}

// ── Column decoding ──

fn column(batch: &RecordBatch, name: &str, dt: &DataType) -> Result<ArrayRef, StoreError> {
    let raw = batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::Other(format!("missing column {name}")))?;
    if raw.data_type() == dt {
        return Ok(raw.clone());
    }
    Ok(cast(raw, dt)?)
}

fn values<A, T>(
    batch: &RecordBatch,
    name: &str,
    dt: DataType,
    get: impl Fn(&A, usize) -> T,
) -> Result<Vec<Option<T>>, StoreError>
where
    A: Array + 'static,
{
    let arr = column(batch, name, &dt)?;
    let arr = arr
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| StoreError::Other(format!("column {name} is not {dt}")))?;
    Ok((0..arr.len())
        .map(|i| arr.is_valid(i).then(|| get(arr, i)))
        .collect())
}

fn strings(batch: &RecordBatch, name: &str) -> Result<Vec<Option<String>>, StoreError> {
    values::<StringArray, _>(batch, name, DataType::Utf8, |a, i| a.value(i).to_string())
}

fn floats(batch: &RecordBatch, name: &str) -> Result<Vec<Option<f64>>, StoreError> {
    values::<Float64Array, _>(batch, name, DataType::Float64, |a, i| a.value(i))
}

fn ints(batch: &RecordBatch, name: &str) -> Result<Vec<Option<i32>>, StoreError> {
    values::<Int32Array, _>(batch, name, DataType::Int32, |a, i| a.value(i))
}

fn longs(batch: &RecordBatch, name: &str) -> Result<Vec<Option<i64>>, StoreError> {
    values::<Int64Array, _>(batch, name, DataType::Int64, |a, i| a.value(i))
}

fn bools(batch: &RecordBatch, name: &str) -> Result<Vec<Option<bool>>, StoreError> {
    values::<BooleanArray, _>(batch, name, DataType::Boolean, |a, i| a.value(i))
}

fn dates(batch: &RecordBatch, name: &str) -> Result<Vec<Option<NaiveDate>>, StoreError> {
    let raw = values::<Date32Array, _>(batch, name, DataType::Date32, |a, i| a.value_as_date(i))?;
    Ok(raw.into_iter().map(Option::flatten).collect())
}

fn required<T>(value: Option<T>, column: &str) -> Result<T, StoreError> {
    value.ok_or_else(|| StoreError::Other(format!("unexpected NULL in {column}")))
}

fn bbox_of(geometry: &MultiPolygon<f64>) -> Result<BBox, StoreError> {
    BBox::of(geometry).ok_or(StoreError::Geometry(GeometryError::Empty))
}

fn decode_rules(batches: &[RecordBatch]) -> Result<Vec<RuleRow>, StoreError> {
    let mut out = Vec::new();
    for batch in batches {
        let mut zone_id = strings(batch, "zone_id")?;
        let level = ints(batch, "level")?;
        let mut field = strings(batch, "field")?;
        let value_num = floats(batch, "value_num")?;
        let mut value_text = strings(batch, "value_text")?;
        let value_json = strings(batch, "value_json")?;
        let mut description = strings(batch, "description")?;
        let mut source_id = strings(batch, "source_id")?;
        let validity_from = dates(batch, "validity_from")?;
        let validity_to = dates(batch, "validity_to")?;

        for i in 0..batch.num_rows() {
            let level_n = required(level[i], "level")?;
            let level = RuleLevel::from_i32(level_n)
                .ok_or_else(|| StoreError::Other(format!("invalid rule level {level_n}")))?;
            let Some(value) =
                RuleValue::from_columns(
                    value_num[i],
                    value_text[i].take(),
                    value_json[i].as_deref(),
                )?
            else {
                warn!(field = field[i].as_deref().unwrap_or(""), "rule row without value, skipped");
                continue;
            };
            out.push(RuleRow {
                zone_id: required(zone_id[i].take(), "zone_id")?,
                level,
                field: required(field[i].take(), "field")?,
                value,
                description: description[i].take(),
                source_id: source_id[i].take(),
                validity_from: required(validity_from[i], "validity_from")?,
                validity_to: validity_to[i],
            });
        }
    }
    Ok(out)
}

fn decode_zones(batches: &[RecordBatch]) -> Result<Vec<Zone>, StoreError> {
    let mut out = Vec::new();
    for batch in batches {
        let mut id = strings(batch, "id")?;
        let mut code_norm = strings(batch, "code_norm")?;
        let mut commune_id = strings(batch, "commune_id")?;
        let geometry = strings(batch, "geometry")?;
        for i in 0..batch.num_rows() {
            let raw = required(geometry[i].as_deref(), "geometry")?;
            out.push(Zone {
                id: required(id[i].take(), "id")?,
                code_norm: required(code_norm[i].take(), "code_norm")?,
                geometry: serde_json::from_str(raw)?,
                commune_id: required(commune_id[i].take(), "commune_id")?,
            });
        }
    }
    Ok(out)
}

fn decode_context(batches: &[RecordBatch]) -> Result<Vec<CachedContext>, StoreError> {
    let mut out = Vec::new();
    for batch in batches {
        let mut parcel_id = strings(batch, "parcel_id")?;
        let mut layer_id = strings(batch, "layer_id")?;
        let mut layer_name = strings(batch, "layer_name")?;
        let intersects = bools(batch, "intersects")?;
        let severity = ints(batch, "severity")?;
        let value_num = floats(batch, "value_num")?;
        let mut value_text = strings(batch, "value_text")?;
        let distance_m = floats(batch, "distance_m")?;
        let mut message = strings(batch, "message")?;
        let computed_at = longs(batch, "computed_at")?;
        for i in 0..batch.num_rows() {
            let ms = required(computed_at[i], "computed_at")?;
            let computed_at = DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| StoreError::Other(format!("computed_at out of range: {ms}")))?;
            out.push(CachedContext {
                parcel_id: required(parcel_id[i].take(), "parcel_id")?,
                layer_id: required(layer_id[i].take(), "layer_id")?,
                layer_name: required(layer_name[i].take(), "layer_name")?,
                intersects: required(intersects[i], "intersects")?,
                severity: required(severity[i], "severity")?.clamp(1, 3) as u8,
                value_num: value_num[i],
                value_text: value_text[i].take(),
                distance_m: distance_m[i],
                message: required(message[i].take(), "message")?,
                computed_at,
            });
        }
    }
    Ok(out)
}

fn decode_evidence(batches: &[RecordBatch]) -> Result<Vec<EvidenceItem>, StoreError> {
    let mut out = Vec::new();
    for batch in batches {
        let mut parcel_id = strings(batch, "parcel_id")?;
        let ref_type = strings(batch, "ref_type")?;
        let mut field = strings(batch, "field")?;
        let mut source_path = strings(batch, "source_path")?;
        let value_num = floats(batch, "value_num")?;
        let mut value_text = strings(batch, "value_text")?;
        let reliability = strings(batch, "reliability")?;
        let mut comment = strings(batch, "comment")?;
        let metadata = strings(batch, "metadata")?;
        let mut inserted_by = strings(batch, "inserted_by")?;
        for i in 0..batch.num_rows() {
            let rt = required(ref_type[i].as_deref(), "ref_type")?;
            let rel = required(reliability[i].as_deref(), "reliability")?;
            out.push(EvidenceItem {
                parcel_id: required(parcel_id[i].take(), "parcel_id")?,
                ref_type: RefType::parse(rt)
                    .ok_or_else(|| StoreError::Other(format!("invalid ref_type {rt}")))?,
                field: required(field[i].take(), "field")?,
                value_num: value_num[i],
                value_text: value_text[i].take(),
                reliability: Reliability::parse(rel)
                    .ok_or_else(|| StoreError::Other(format!("invalid reliability {rel}")))?,
                source_path: required(source_path[i].take(), "source_path")?,
                comment: required(comment[i].take(), "comment")?,
                metadata: serde_json::from_str(required(metadata[i].as_deref(), "metadata")?)?,
                inserted_by: required(inserted_by[i].take(), "inserted_by")?,
            });
        }
    }
    Ok(out)
}

fn decode_quality(batches: &[RecordBatch]) -> Result<Vec<AnalysisQuality>, StoreError> {
    let mut out = Vec::new();
    for batch in batches {
        let mut parcel_id = strings(batch, "parcel_id")?;
        let calc_date = dates(batch, "calc_date")?;
        let score_global = floats(batch, "score_global")?;
        let score_calculations = floats(batch, "score_calculations")?;
        let counts: Vec<Vec<Option<i32>>> = [
            "total_fields",
            "direct_count",
            "derived_count",
            "estimated_count",
            "missing_count",
        ]
        .iter()
        .map(|c| ints(batch, c))
        .collect::<Result<_, _>>()?;
        let details = strings(batch, "details")?;
        for i in 0..batch.num_rows() {
            let count = |c: usize| required(counts[c][i], "count").map(|n| n.max(0) as usize);
            out.push(AnalysisQuality {
                parcel_id: required(parcel_id[i].take(), "parcel_id")?,
                calc_date: required(calc_date[i], "calc_date")?,
                score_global: required(score_global[i], "score_global")?,
                score_calculations: required(score_calculations[i], "score_calculations")?,
                total_fields: count(0)?,
                direct_count: count(1)?,
                derived_count: count(2)?,
                estimated_count: count(3)?,
                missing_count: count(4)?,
                details: serde_json::from_str(required(details[i].as_deref(), "details")?)?,
            });
        }
    }
    Ok(out)
}

// ── Store traits ──

#[async_trait]
impl RuleStore for DuckStore {
    async fn insert_rules(&self, rows: &[RuleRow]) -> Result<usize, StoreError> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO rule_definitions
                     (zone_id, level, field, value_num, value_text, value_json,
                      description, source_id, validity_from, validity_to)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?::DATE, ?::DATE)",
                )?;
                for row in &rows {
                    let (num, text, json) = row.value.to_columns()?;
                    inserted += stmt.execute(params![
                        row.zone_id,
                        row.level.as_i32(),
                        row.field,
                        num,
                        text,
                        json,
                        row.description,
                        row.source_id,
                        row.validity_from.to_string(),
                        row.validity_to.map(|d| d.to_string()),
                    ])?;
                }
            }
            tx.commit()?;
            debug!(offered = rows.len(), inserted, "duckdb: insert rules");
            Ok(inserted)
        })
        .await
    }

    async fn rules_for_zone(
        &self,
        zone_id: &str,
        on: NaiveDate,
    ) -> Result<Vec<RuleRow>, StoreError> {
        let zone_id = zone_id.to_string();
        let on = on.to_string();
        self.with_conn(move |conn| {
            let batches = query(
                conn,
                "SELECT * FROM rule_definitions
                 WHERE zone_id = ?
                   AND validity_from <= ?::DATE
                   AND (validity_to IS NULL OR validity_to >= ?::DATE)
                 ORDER BY field, level, validity_from",
                params![zone_id, on, on],
            )?;
            decode_rules(&batches)
        })
        .await
    }

    async fn rule_count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| count_table(conn, "rule_definitions"))
            .await
    }
}

#[async_trait]
impl ZoneStore for DuckStore {
    async fn insert_zone(&self, zone: &Zone) -> Result<(), StoreError> {
        let b = bbox_of(&zone.geometry)?;
        let geometry = serde_json::to_string(&zone.geometry)?;
        let zone = zone.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO zones
                 (id, code_norm, commune_id, geometry, xmin, ymin, xmax, ymax)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    zone.id,
                    zone.code_norm,
                    zone.commune_id,
                    geometry,
                    b.xmin,
                    b.ymin,
                    b.xmax,
                    b.ymax
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn zone(&self, id: &str) -> Result<Option<Zone>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let batches = query(conn, "SELECT * FROM zones WHERE id = ?", params![id])?;
            Ok(decode_zones(&batches)?.into_iter().next())
        })
        .await
    }

    async fn zones_intersecting(&self, geom: &ParcelGeometry) -> Result<Vec<Zone>, StoreError> {
        let Some(b) = geom.bbox() else {
            return Ok(Vec::new());
        };
        let candidates = self
            .with_conn(move |conn| {
                let batches = query(
                    conn,
                    "SELECT * FROM zones
                     WHERE xmin <= ? AND xmax >= ? AND ymin <= ? AND ymax >= ?
                     ORDER BY id",
                    params![b.xmax, b.xmin, b.ymax, b.ymin],
                )?;
                decode_zones(&batches)
            })
            .await?;
        let total = candidates.len();
        let zones: Vec<Zone> = candidates
            .into_iter()
            .filter(|z| geom.intersects(&z.geometry))
            .collect();
        debug!(candidates = total, matched = zones.len(), "duckdb: zones intersecting");
        Ok(zones)
    }
}

#[async_trait]
impl SourceStore for DuckStore {
    async fn insert_source(&self, source: &RegulationSource) -> Result<(), StoreError> {
        let source = source.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO regulation_sources
                 (id, pdf_path, article_ref, ocr_confidence)
                 VALUES (?, ?, ?, ?)",
                params![source.id, source.pdf_path, source.article_ref, source.ocr_confidence],
            )?;
            Ok(())
        })
        .await
    }

    async fn source(&self, id: &str) -> Result<Option<RegulationSource>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let batches = query(
                conn,
                "SELECT * FROM regulation_sources WHERE id = ?",
                params![id],
            )?;
            for batch in &batches {
                if batch.num_rows() == 0 {
                    continue;
                }
                let mut ids = strings(batch, "id")?;
                let mut pdf_path = strings(batch, "pdf_path")?;
                let mut article_ref = strings(batch, "article_ref")?;
                let ocr_confidence = floats(batch, "ocr_confidence")?;
                return Ok(Some(RegulationSource {
                    id: required(ids[0].take(), "id")?,
                    pdf_path: required(pdf_path[0].take(), "pdf_path")?,
                    article_ref: article_ref[0].take(),
                    ocr_confidence: ocr_confidence[0],
                }));
            }
            Ok(None)
        })
        .await
    }
}

#[async_trait]
impl ContextStore for DuckStore {
    async fn register_layer(
        &self,
        layer: &ContextLayer,
        features: &[LayerFeature],
    ) -> Result<(), StoreError> {
        let definition = serde_json::to_string(layer)?;
        let mut encoded = Vec::with_capacity(features.len());
        for f in features {
            encoded.push((
                serde_json::to_string(&f.geometry)?,
                bbox_of(&f.geometry)?,
                f.value_num,
                f.value_text.clone(),
            ));
        }
        let layer = layer.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO context_layers (id, name, definition) VALUES (?, ?, ?)",
                params![layer.id, layer.name, definition],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO layer_features
                     (layer_id, seq, geometry, value_num, value_text, xmin, ymin, xmax, ymax)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for (seq, (geometry, b, value_num, value_text)) in encoded.iter().enumerate() {
                    stmt.execute(params![
                        layer.id,
                        seq as i32,
                        geometry,
                        value_num,
                        value_text,
                        b.xmin,
                        b.ymin,
                        b.xmax,
                        b.ymax,
                    ])?;
                }
            }
            // Drop features left over from a larger previous registration.
            tx.execute(
                "DELETE FROM layer_features WHERE layer_id = ? AND seq >= ?",
                params![layer.id, encoded.len() as i32],
            )?;
            tx.commit()?;
            info!(layer = %layer.name, features = encoded.len(), "registered context layer");
            Ok(())
        })
        .await
    }

    async fn layers(&self) -> Result<Vec<ContextLayer>, StoreError> {
        self.with_conn(|conn| {
            let batches = query(conn, "SELECT definition FROM context_layers ORDER BY id", &[])?;
            let mut out = Vec::new();
            for batch in &batches {
                for def in strings(batch, "definition")? {
                    out.push(serde_json::from_str(&required(def, "definition")?)?);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn layer_hits(
        &self,
        layer_id: &str,
        geom: &ParcelGeometry,
        radius_m: f64,
    ) -> Result<Vec<LayerHit>, StoreError> {
        let layer_id = layer_id.to_string();
        let geom = geom.clone();
        self.with_conn(move |conn| {
            let known = query(
                conn,
                "SELECT id FROM context_layers WHERE id = ?",
                params![layer_id],
            )?;
            if known.iter().all(|b| b.num_rows() == 0) {
                return Err(StoreError::NotFound(format!("context layer {layer_id}")));
            }
            let Some(w) = geom.bbox().map(|b| b.expand(radius_m)) else {
                return Ok(Vec::new());
            };
            let batches = query(
                conn,
                "SELECT geometry, value_num, value_text FROM layer_features
                 WHERE layer_id = ? AND xmin <= ? AND xmax >= ? AND ymin <= ? AND ymax >= ?
                 ORDER BY seq",
                params![layer_id, w.xmax, w.xmin, w.ymax, w.ymin],
            )?;
            let mut hits = Vec::new();
            for batch in &batches {
                let geometry = strings(batch, "geometry")?;
                let value_num = floats(batch, "value_num")?;
                let mut value_text = strings(batch, "value_text")?;
                for i in 0..batch.num_rows() {
                    let raw = required(geometry[i].as_deref(), "geometry")?;
                    let feature = LayerFeature {
                        layer_id: layer_id.clone(),
                        geometry: serde_json::from_str(raw)?,
                        value_num: value_num[i],
                        value_text: value_text[i].take(),
                    };
                    hits.extend(feature.hit_test(&geom, radius_m));
                }
            }
            Ok(hits)
        })
        .await
    }

    async fn cached_context(
        &self,
        parcel_id: &str,
        fresh_since: DateTime<Utc>,
    ) -> Result<Vec<CachedContext>, StoreError> {
        let parcel_id = parcel_id.to_string();
        let since = fresh_since.timestamp_millis();
        self.with_conn(move |conn| {
            let batches = query(
                conn,
                "SELECT * FROM parcel_context WHERE parcel_id = ? AND computed_at >= ?
                 ORDER BY layer_id",
                params![parcel_id, since],
            )?;
            decode_context(&batches)
        })
        .await
    }

    async fn write_context(&self, rows: &[CachedContext]) -> Result<(), StoreError> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO parcel_context
                     (parcel_id, layer_id, layer_name, intersects, severity, value_num,
                      value_text, distance_m, message, computed_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for r in &rows {
                    stmt.execute(params![
                        r.parcel_id,
                        r.layer_id,
                        r.layer_name,
                        r.intersects,
                        i32::from(r.severity),
                        r.value_num,
                        r.value_text,
                        r.distance_m,
                        r.message,
                        r.computed_at.timestamp_millis(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_context(&self, older_than: Option<DateTime<Utc>>) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let deleted = match older_than {
                Some(cutoff) => conn.execute(
                    "DELETE FROM parcel_context WHERE computed_at < ?",
                    params![cutoff.timestamp_millis()],
                )?,
                None => conn.execute("DELETE FROM parcel_context", [])?,
            };
            Ok(deleted)
        })
        .await
    }
}

#[async_trait]
impl EvidenceStore for DuckStore {
    async fn record_evidence(&self, items: &[EvidenceItem]) -> Result<usize, StoreError> {
        // One write per key, last item wins.
        let unique: BTreeMap<_, &EvidenceItem> = items.iter().map(|i| (i.key(), i)).collect();
        let mut encoded = Vec::with_capacity(unique.len());
        for item in unique.into_values() {
            let metadata = serde_json::to_string(&item.metadata)?;
            encoded.push((item.clone(), metadata));
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO evidence_items
                     (parcel_id, ref_type, field, source_path, value_num, value_text,
                      reliability, comment, metadata, inserted_by)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for (item, metadata) in &encoded {
                    stmt.execute(params![
                        item.parcel_id,
                        item.ref_type.as_str(),
                        item.field,
                        item.source_path,
                        item.value_num,
                        item.value_text,
                        item.reliability.as_str(),
                        item.comment,
                        metadata,
                        item.inserted_by,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(encoded.len())
        })
        .await
    }

    async fn evidence_for(&self, parcel_id: &str) -> Result<Vec<EvidenceItem>, StoreError> {
        let parcel_id = parcel_id.to_string();
        self.with_conn(move |conn| {
            let batches = query(
                conn,
                "SELECT * FROM evidence_items WHERE parcel_id = ?
                 ORDER BY ref_type, field, source_path",
                params![parcel_id],
            )?;
            decode_evidence(&batches)
        })
        .await
    }

    async fn upsert_quality(&self, q: &AnalysisQuality) -> Result<(), StoreError> {
        let details = serde_json::to_string(&q.details)?;
        let q = q.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO analysis_quality
                 (parcel_id, calc_date, score_global, score_calculations, total_fields,
                  direct_count, derived_count, estimated_count, missing_count, details)
                 VALUES (?, ?::DATE, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    q.parcel_id,
                    q.calc_date.to_string(),
                    q.score_global,
                    q.score_calculations,
                    q.total_fields as i32,
                    q.direct_count as i32,
                    q.derived_count as i32,
                    q.estimated_count as i32,
                    q.missing_count as i32,
                    details,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn quality_for(
        &self,
        parcel_id: &str,
        calc_date: NaiveDate,
    ) -> Result<Option<AnalysisQuality>, StoreError> {
        let parcel_id = parcel_id.to_string();
        let calc_date = calc_date.to_string();
        self.with_conn(move |conn| {
            let batches = query(
                conn,
                "SELECT * FROM analysis_quality WHERE parcel_id = ? AND calc_date = ?::DATE",
                params![parcel_id, calc_date],
            )?;
            Ok(decode_quality(&batches)?.into_iter().next())
        })
        .await
    }
}
