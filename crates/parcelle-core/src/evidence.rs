//! Provenance records and the per-parcel quality score.
//!
//! Every value the engine hands out (a winning regulation, a context flag,
//! a computed surface) is backed by an [`EvidenceItem`] stating where it
//! came from and how much it can be trusted. [`AnalysisQuality`] folds a
//! parcel's evidence trail into one score in `[0, 1]`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// What an evidence item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Regulation,
    Context,
    Calculation,
}

impl RefType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regulation => "regulation",
            Self::Context => "context",
            Self::Calculation => "calculation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regulation" => Some(Self::Regulation),
            "context" => Some(Self::Context),
            "calculation" => Some(Self::Calculation),
            _ => None,
        }
    }
}

/// Provenance class of a value. Variants are ordered best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    /// Read directly from a site-specific source.
    Direct,
    /// Computed from direct values, or a generic default.
    Derived,
    /// Heuristic estimate.
    Estimated,
    /// Could not be established.
    Missing,
}

impl Reliability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Derived => "derived",
            Self::Estimated => "estimated",
            Self::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "derived" => Some(Self::Derived),
            "estimated" => Some(Self::Estimated),
            "missing" => Some(Self::Missing),
            _ => None,
        }
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score weight of each [`Reliability`] class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub direct: f64,
    pub derived: f64,
    pub estimated: f64,
    pub missing: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            direct: 1.0,
            derived: 0.8,
            estimated: 0.5,
            missing: 0.0,
        }
    }
}

impl QualityWeights {
    pub fn weight(&self, r: Reliability) -> f64 {
        match r {
            Reliability::Direct => self.direct,
            Reliability::Derived => self.derived,
            Reliability::Estimated => self.estimated,
            Reliability::Missing => self.missing,
        }
    }
}

/// One provenance record.
///
/// Unique on `(parcel_id, ref_type, field, source_path)`; recording the same
/// item twice replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub parcel_id: String,
    pub ref_type: RefType,
    pub field: String,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
    pub reliability: Reliability,
    /// `LEVEL/zone_code/field` for regulations, `source/layer` for context,
    /// `calc/field` for calculations.
    pub source_path: String,
    pub comment: String,
    pub metadata: serde_json::Value,
    pub inserted_by: String,
}

/// Unique key of an [`EvidenceItem`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvidenceKey {
    pub parcel_id: String,
    pub ref_type: RefType,
    pub field: String,
    pub source_path: String,
}

impl EvidenceItem {
    pub fn key(&self) -> EvidenceKey {
        EvidenceKey {
            parcel_id: self.parcel_id.clone(),
            ref_type: self.ref_type,
            field: self.field.clone(),
            source_path: self.source_path.clone(),
        }
    }
}

/// A regulation document row, written by ingestion collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulationSource {
    pub id: String,
    pub pdf_path: String,
    pub article_ref: Option<String>,
    pub ocr_confidence: Option<f64>,
}

/// Aggregate provenance quality of one parcel analysis.
///
/// Unique on `(parcel_id, calc_date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisQuality {
    pub parcel_id: String,
    pub calc_date: NaiveDate,
    pub score_global: f64,
    pub score_calculations: f64,
    pub total_fields: usize,
    pub direct_count: usize,
    pub derived_count: usize,
    pub estimated_count: usize,
    pub missing_count: usize,
    /// Field → weight of its best evidence.
    pub details: BTreeMap<String, f64>,
}

impl AnalysisQuality {
    /// Score an evidence trail.
    ///
    /// Items are grouped by field; each field counts once, at the weight of
    /// its most reliable item (an overridden candidate never drags a field
    /// down). `score_global` averages every field, `score_calculations` only
    /// the calculation fields. Both are rounded to 2 decimals; an empty
    /// trail scores 0.
    pub fn from_items(
        parcel_id: &str,
        calc_date: NaiveDate,
        items: &[EvidenceItem],
        weights: &QualityWeights,
    ) -> Self {
        let mut best: BTreeMap<&str, (RefType, Reliability)> = BTreeMap::new();
        for item in items {
            best.entry(item.field.as_str())
                .and_modify(|(ref_type, r)| {
                    if item.reliability < *r {
                        *r = item.reliability;
                        *ref_type = item.ref_type;
                    }
                })
                .or_insert((item.ref_type, item.reliability));
        }

        let count = |class: Reliability| best.values().filter(|(_, r)| *r == class).count();
        let details: BTreeMap<String, f64> = best
            .iter()
            .map(|(field, (_, r))| (field.to_string(), weights.weight(*r)))
            .collect();
        let calc: Vec<f64> = best
            .values()
            .filter(|(t, _)| *t == RefType::Calculation)
            .map(|(_, r)| weights.weight(*r))
            .collect();

        Self {
            parcel_id: parcel_id.to_string(),
            calc_date,
            score_global: mean(details.values().copied()),
            score_calculations: mean(calc.into_iter()),
            total_fields: best.len(),
            direct_count: count(Reliability::Direct),
            derived_count: count(Reliability::Derived),
            estimated_count: count(Reliability::Estimated),
            missing_count: count(Reliability::Missing),
            details,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        return 0.0;
    }
    (sum / n as f64 * 100.0).round() / 100.0
}
