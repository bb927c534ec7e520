//! Evidence ledger: provenance for every value handed out, and the
//! per-parcel quality score derived from it.
//!
//! | ref_type | source_path | reliability |
//! |---|---|---|
//! | regulation (winner) | `LEVELn/zone_code/field` | direct for LEVEL1–3, derived for LEVEL4 |
//! | regulation (overridden) | `LEVELn/zone_code/field/overridden/i` | derived |
//! | context | `layer.source/layer.id` | inherent to the layer's severity rule |
//! | calculation | `calc/field` | derived, estimated for storeys, missing when absent |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use geo::Geometry;
use parcelle_core::{
    AnalysisQuality, CalcResult, ConsolidatedRule, ContextFlag, ContextLayer, EngineConfig,
    EvidenceItem, ParcelGeometry, RefType, RegulationSource, Reliability, RuleLevel, RuleValue,
    compute_build_indicators_with,
};
use parcelle_store::Store;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::EngineError;
use crate::bounded::bounded;
use crate::context::ContextResolver;
use crate::rules::RuleResolver;

const BY_RULES: &str = "rule_resolver";
const BY_CONTEXT: &str = "context_resolver";
const BY_CALCULATOR: &str = "build_calculator";

/// Everything produced by one parcel analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParcelAnalysis {
    pub parcel_id: String,
    pub area_m2: f64,
    pub rules: Vec<ConsolidatedRule>,
    /// Zone whose rules fed the calculator.
    pub primary_zone: Option<String>,
    pub context: Vec<ContextFlag>,
    pub calculation: CalcResult,
    pub evidence: Vec<EvidenceItem>,
    pub quality: AnalysisQuality,
}

pub struct EvidenceLedger<S: ?Sized> {
    store: Arc<S>,
    rules: RuleResolver<S>,
    context: ContextResolver<S>,
    config: EngineConfig,
}

impl<S> EvidenceLedger<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let timeout = config.store_timeout();
        Self {
            rules: RuleResolver::new(Arc::clone(&store)).with_timeout(timeout),
            context: ContextResolver::new(Arc::clone(&store), config.context.clone())
                .with_timeout(timeout),
            store,
            config,
        }
    }

    pub fn rules(&self) -> &RuleResolver<S> {
        &self.rules
    }

    pub fn context(&self) -> &ContextResolver<S> {
        &self.context
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.store_timeout()
    }

    /// Full pipeline for one parcel: rules, context, calculation, evidence,
    /// quality. `area_m2` defaults to the planar area of `geometry`.
    pub async fn analyze_parcel(
        &self,
        parcel_id: &str,
        geometry: Geometry<f64>,
        area_m2: Option<f64>,
    ) -> Result<ParcelAnalysis, EngineError> {
        let geom = ParcelGeometry::try_from(geometry)?;
        self.analyze_parcel_at(parcel_id, &geom, area_m2, Utc::now())
            .await
    }

    pub async fn analyze_parcel_at(
        &self,
        parcel_id: &str,
        geom: &ParcelGeometry,
        area_m2: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<ParcelAnalysis, EngineError> {
        let today = now.date_naive();
        let area = area_m2.unwrap_or_else(|| geom.area_m2());

        let rules = self.rules.resolve_rules_by_parcel_geom_at(geom, today).await?;
        let context = self
            .context
            .get_context_for_parcel_at(parcel_id, geom, now)
            .await?;

        let primary_zone = primary_zone(&rules);
        let calc_input: Vec<ConsolidatedRule> = rules
            .iter()
            .filter(|r| primary_zone.as_deref() == Some(r.zone_id.as_str()))
            .cloned()
            .collect();
        let calculation = compute_build_indicators_with(area, &calc_input, &self.config.calc);

        let mut evidence = self.record_rules(parcel_id, &rules).await?;
        evidence.extend(self.record_context(parcel_id, &context).await?);
        evidence.extend(self.record_calculation(parcel_id, &calculation).await?);

        let quality =
            AnalysisQuality::from_items(parcel_id, today, &evidence, &self.config.quality);
        bounded("upsert_quality", self.timeout(), self.store.upsert_quality(&quality)).await?;

        info!(
            parcel_id,
            area_m2 = area,
            rules = rules.len(),
            flags = context.len(),
            evidence = evidence.len(),
            score = quality.score_global,
            "parcel analysed"
        );
        Ok(ParcelAnalysis {
            parcel_id: parcel_id.to_string(),
            area_m2: area,
            rules,
            primary_zone,
            context,
            calculation,
            evidence,
            quality,
        })
    }

    /// Record regulation evidence for consolidated rules, enriched with the
    /// article reference and OCR confidence of their source document.
    pub async fn record_rules(
        &self,
        parcel_id: &str,
        rules: &[ConsolidatedRule],
    ) -> Result<Vec<EvidenceItem>, EngineError> {
        let mut sources = BTreeMap::new();
        let ids = rules
            .iter()
            .filter_map(|r| r.source_id.as_deref())
            .chain(
                rules
                    .iter()
                    .flat_map(|r| r.overridden.iter().filter_map(|o| o.source_id.as_deref())),
            );
        for id in ids {
            if sources.contains_key(id) {
                continue;
            }
            if let Some(src) = bounded("source", self.timeout(), self.store.source(id)).await? {
                sources.insert(id.to_string(), src);
            }
        }
        let items = regulation_evidence(parcel_id, rules, &sources);
        self.persist(items).await
    }

    pub async fn record_context(
        &self,
        parcel_id: &str,
        flags: &[ContextFlag],
    ) -> Result<Vec<EvidenceItem>, EngineError> {
        if flags.is_empty() {
            return Ok(Vec::new());
        }
        let layers = bounded("layers", self.timeout(), self.store.layers()).await?;
        let items = context_evidence(parcel_id, flags, &layers);
        self.persist(items).await
    }

    pub async fn record_calculation(
        &self,
        parcel_id: &str,
        result: &CalcResult,
    ) -> Result<Vec<EvidenceItem>, EngineError> {
        self.persist(calculation_evidence(parcel_id, result)).await
    }

    /// Rescore a parcel from its full stored evidence trail.
    pub async fn refresh_quality(
        &self,
        parcel_id: &str,
        calc_date: NaiveDate,
    ) -> Result<AnalysisQuality, EngineError> {
        let items =
            bounded("evidence_for", self.timeout(), self.store.evidence_for(parcel_id)).await?;
        let quality =
            AnalysisQuality::from_items(parcel_id, calc_date, &items, &self.config.quality);
        bounded("upsert_quality", self.timeout(), self.store.upsert_quality(&quality)).await?;
        Ok(quality)
    }

    async fn persist(&self, items: Vec<EvidenceItem>) -> Result<Vec<EvidenceItem>, EngineError> {
        if items.is_empty() {
            return Ok(items);
        }
        let written = bounded(
            "record_evidence",
            self.timeout(),
            self.store.record_evidence(&items),
        )
        .await?;
        debug!(items = items.len(), written, "evidence recorded");
        Ok(items)
    }
}

/// The zone contributing the most consolidated rules; ties go to the zone
/// listed first.
fn primary_zone(rules: &[ConsolidatedRule]) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for r in rules {
        match counts.iter_mut().find(|(z, _)| *z == r.zone_id) {
            Some((_, n)) => *n += 1,
            None => counts.push((r.zone_id.as_str(), 1)),
        }
    }
    counts
        .iter()
        .fold(None::<(&str, usize)>, |best, &(z, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((z, n)),
        })
        .map(|(z, _)| z.to_string())
}

fn level_reliability(level: RuleLevel) -> Reliability {
    match level {
        RuleLevel::Level4 => Reliability::Derived,
        _ => Reliability::Direct,
    }
}

/// `(value_num, value_text)` for an evidence row; structured values are
/// kept as JSON text.
fn value_columns(value: &RuleValue) -> (Option<f64>, Option<String>) {
    match value {
        RuleValue::Number(n) => (Some(*n), None),
        RuleValue::Text(t) => (None, Some(t.clone())),
        other => (None, serde_json::to_string(other).ok()),
    }
}

fn source_metadata(
    meta: &mut Map<String, Value>,
    source_id: Option<&str>,
    sources: &BTreeMap<String, RegulationSource>,
) {
    let Some(id) = source_id else {
        return;
    };
    meta.insert("source_id".into(), json!(id));
    if let Some(src) = sources.get(id) {
        if let Some(article) = &src.article_ref {
            meta.insert("article_ref".into(), json!(article));
        }
        if let Some(conf) = src.ocr_confidence {
            meta.insert("ocr_confidence".into(), json!(conf));
        }
        meta.insert("pdf_path".into(), json!(src.pdf_path));
    }
}

pub fn regulation_evidence(
    parcel_id: &str,
    rules: &[ConsolidatedRule],
    sources: &BTreeMap<String, RegulationSource>,
) -> Vec<EvidenceItem> {
    let mut items = Vec::new();
    for rule in rules {
        let code = if rule.zone_code.is_empty() {
            rule.zone_id.as_str()
        } else {
            rule.zone_code.as_str()
        };
        let path = format!("{}/{code}/{}", rule.level, rule.field);

        let (value_num, value_text) = value_columns(&rule.value);
        let mut meta = Map::new();
        meta.insert("zone_id".into(), json!(rule.zone_id));
        meta.insert("level".into(), json!(rule.level));
        source_metadata(&mut meta, rule.source_id.as_deref(), sources);
        items.push(EvidenceItem {
            parcel_id: parcel_id.to_string(),
            ref_type: RefType::Regulation,
            field: rule.field.clone(),
            value_num,
            value_text,
            reliability: level_reliability(rule.level),
            source_path: path.clone(),
            comment: rule
                .description
                .clone()
                .unwrap_or_else(|| format!("{}: {}", rule.level, rule.field)),
            metadata: Value::Object(meta),
            inserted_by: BY_RULES.to_string(),
        });

        for (i, o) in rule.overridden.iter().enumerate() {
            let (value_num, value_text) = value_columns(&o.value);
            let mut meta = Map::new();
            meta.insert("zone_id".into(), json!(rule.zone_id));
            meta.insert("level".into(), json!(o.level));
            meta.insert("overridden_by".into(), json!(rule.level));
            source_metadata(&mut meta, o.source_id.as_deref(), sources);
            items.push(EvidenceItem {
                parcel_id: parcel_id.to_string(),
                ref_type: RefType::Regulation,
                field: rule.field.clone(),
                value_num,
                value_text,
                reliability: Reliability::Derived,
                source_path: format!("{}/{code}/{}/overridden/{i}", o.level, rule.field),
                comment: format!("Écrasé par {}", rule.level),
                metadata: Value::Object(meta),
                inserted_by: BY_RULES.to_string(),
            });
        }
    }
    items
}

pub fn context_evidence(
    parcel_id: &str,
    flags: &[ContextFlag],
    layers: &[ContextLayer],
) -> Vec<EvidenceItem> {
    flags
        .iter()
        .map(|flag| {
            let layer = layers.iter().find(|l| l.name == flag.layer);
            let (reliability, source_path) = match layer {
                Some(l) => (l.severity.reliability(), format!("{}/{}", l.source, l.id)),
                None => (Reliability::Direct, format!("context/{}", flag.layer)),
            };
            EvidenceItem {
                parcel_id: parcel_id.to_string(),
                ref_type: RefType::Context,
                field: flag.layer.clone(),
                value_num: flag.value_num,
                value_text: flag.value_text.clone(),
                reliability,
                source_path,
                comment: flag.message.clone(),
                metadata: json!({
                    "severity": flag.severity,
                    "intersects": flag.intersects,
                    "distance_m": flag.distance,
                }),
                inserted_by: BY_CONTEXT.to_string(),
            }
        })
        .collect()
}

pub fn calculation_evidence(parcel_id: &str, result: &CalcResult) -> Vec<EvidenceItem> {
    let d = &result.details;
    let item = |field: &str,
                value: Option<f64>,
                reliability: Reliability,
                comment: String,
                metadata: Value| {
        EvidenceItem {
            parcel_id: parcel_id.to_string(),
            ref_type: RefType::Calculation,
            field: field.to_string(),
            value_num: value,
            value_text: None,
            reliability: if value.is_some() { reliability } else { Reliability::Missing },
            source_path: format!("calc/{field}"),
            comment,
            metadata,
            inserted_by: BY_CALCULATOR.to_string(),
        }
    };
    let formula = |f: &Option<String>, label: &str, missing: &str| match f {
        Some(f) => format!("{label}: {f}"),
        None => missing.to_string(),
    };

    let mut items = vec![
        item(
            "su_m2",
            result.su_m2,
            Reliability::Derived,
            formula(&d.formulas.su, "Surface utile calculée", "Surface utile non calculable"),
            json!({ "formula": d.formulas.su, "indice_u": d.indice_u }),
        ),
        item(
            "ibus_m2",
            result.ibus_m2,
            Reliability::Derived,
            formula(&d.formulas.ibus, "Surface brute calculée", "Surface brute non calculable"),
            json!({
                "formula": d.formulas.ibus,
                "ibus": d.ibus,
                "conversion_applied": d.conversion_applied,
            }),
        ),
        item(
            "emprise_m2",
            result.emprise_m2,
            Reliability::Derived,
            formula(
                &d.formulas.emprise,
                "Emprise au sol calculée",
                "Emprise au sol non calculable",
            ),
            json!({ "formula": d.formulas.emprise, "emprise_max": d.emprise_max }),
        ),
        item(
            "niveaux_max_est",
            result.niveaux_max_est.map(f64::from),
            Reliability::Estimated,
            formula(&d.formulas.niveaux, "Estimation niveaux", "Nombre de niveaux non estimable"),
            json!({ "formula": d.formulas.niveaux, "niveaux_max": d.niveaux_max }),
        ),
    ];
    if d.conversion_applied {
        items.push(item(
            "ibus_converted",
            d.ibus_calculated,
            Reliability::Derived,
            "IBUS converti depuis indice U selon table Valais".to_string(),
            json!({ "indice_u": d.indice_u, "ibus_calculated": d.ibus_calculated }),
        ));
    }
    items
}
