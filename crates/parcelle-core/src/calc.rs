//! Constructibility indicators derived from parcel area and consolidated rules.
//!
//! Pure and deterministic: the same area and rules always produce the same
//! [`CalcResult`]. Invalid input is reported through [`Control`] entries,
//! never through an error.
//!
//! # Indices
//!
//! - `indice_u`: floor-area ratio, heated/usable surfaces only → `su_m2`
//! - `ibus`: gross floor-area ratio, all surfaces → `ibus_m2`
//! - `emprise_max`: footprint ratio → `emprise_m2`
//!
//! When `ibus` is absent it is converted from `indice_u` with the cantonal
//! table (Valais, annex 1). Between keys the table is interpolated linearly;
//! outside it, `max(indice_u × 1.333, 0.5)` applies on both ends.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rule::{ConsolidatedRule, extract_building_rules};

/// `indice_u → ibus` conversion table, 0.05 steps.
pub const INDICE_U_TO_IBUS: [(f64, f64); 11] = [
    (0.35, 0.50),
    (0.40, 0.53),
    (0.45, 0.60),
    (0.50, 0.67),
    (0.55, 0.73),
    (0.60, 0.80),
    (0.65, 0.87),
    (0.70, 0.93),
    (0.75, 1.00),
    (0.80, 1.07),
    (0.85, 1.13),
];

const OUT_OF_TABLE_FACTOR: f64 = 1.333;
const OUT_OF_TABLE_MIN: f64 = 0.5;
const EXACT_MATCH_EPSILON: f64 = 0.001;

/// Convert an `indice_u` into an `ibus` factor (unrounded).
pub fn convert_indice_u(indice_u: f64) -> f64 {
    if let Some(&(_, ibus)) = INDICE_U_TO_IBUS
        .iter()
        .find(|(u, _)| (u - indice_u).abs() < EXACT_MATCH_EPSILON)
    {
        return ibus;
    }
    for pair in INDICE_U_TO_IBUS.windows(2) {
        let (u1, i1) = pair[0];
        let (u2, i2) = pair[1];
        if indice_u >= u1 && indice_u <= u2 {
            return i1 + (indice_u - u1) / (u2 - u1) * (i2 - i1);
        }
    }
    (indice_u * OUT_OF_TABLE_FACTOR).max(OUT_OF_TABLE_MIN)
}

/// Normal-range bounds for the input indices. Values outside
/// `(0, indice_u_max]` / `(0, emprise_max_max]` raise a warning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalcPolicy {
    pub indice_u_max: f64,
    pub emprise_max_max: f64,
}

impl Default for CalcPolicy {
    fn default() -> Self {
        Self {
            indice_u_max: 2.0,
            emprise_max_max: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlLevel {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCode {
    InvalidArea,
    MissingIndiceU,
    IbusConverted,
    MissingIbus,
    MissingEmprise,
    NiveauxLimited,
    IbusIncoherent,
    IndiceURange,
    EmpriseRange,
}

impl ControlCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArea => "INVALID_AREA",
            Self::MissingIndiceU => "MISSING_INDICE_U",
            Self::IbusConverted => "IBUS_CONVERTED",
            Self::MissingIbus => "MISSING_IBUS",
            Self::MissingEmprise => "MISSING_EMPRISE",
            Self::NiveauxLimited => "NIVEAUX_LIMITED",
            Self::IbusIncoherent => "IBUS_INCOHERENT",
            Self::IndiceURange => "INDICE_U_RANGE",
            Self::EmpriseRange => "EMPRISE_RANGE",
        }
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured check outcome attached to a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub code: ControlCode,
    pub level: ControlLevel,
    pub message: String,
}

impl Control {
    fn new(code: ControlCode, level: ControlLevel, message: impl Into<String>) -> Self {
        Self {
            code,
            level,
            message: message.into(),
        }
    }
}

/// Human-readable derivation of each computed quantity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Formulas {
    pub su: Option<String>,
    pub ibus: Option<String>,
    pub emprise: Option<String>,
    pub niveaux: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalcDetails {
    pub indice_u: Option<f64>,
    pub ibus: Option<f64>,
    /// `ibus` factor obtained from the conversion table, 2 decimals.
    pub ibus_calculated: Option<f64>,
    pub emprise_max: Option<f64>,
    pub h_max_m: Option<f64>,
    pub niveaux_max: Option<f64>,
    pub conversion_applied: bool,
    /// Input indices not supplied as rules (`indice_u`, `ibus`, `emprise_max`).
    pub missing_values: Vec<String>,
    pub formulas: Formulas,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcResult {
    pub su_m2: Option<f64>,
    pub ibus_m2: Option<f64>,
    pub emprise_m2: Option<f64>,
    pub niveaux_max_est: Option<u32>,
    /// Stepped completeness: 1.0, 0.75, 0.5, 0.25, or 0 for invalid input.
    pub reliability: f64,
    pub controls: Vec<Control>,
    pub details: CalcDetails,
}

impl CalcResult {
    pub fn has_control(&self, code: ControlCode) -> bool {
        self.controls.iter().any(|c| c.code == code)
    }
}

/// Counts of controls per level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSummary {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

pub fn summarize_controls(controls: &[Control]) -> ControlSummary {
    controls
        .iter()
        .fold(ControlSummary::default(), |mut acc, c| {
            match c.level {
                ControlLevel::Error => acc.errors += 1,
                ControlLevel::Warning => acc.warnings += 1,
                ControlLevel::Info => acc.infos += 1,
            }
            acc
        })
}

/// True when at least one floor-area index is available.
pub fn can_calculate(rules: &[ConsolidatedRule]) -> bool {
    let b = extract_building_rules(rules);
    b.indice_u.is_some() || b.ibus.is_some()
}

pub fn compute_build_indicators(parcel_area_m2: f64, rules: &[ConsolidatedRule]) -> CalcResult {
    compute_build_indicators_with(parcel_area_m2, rules, &CalcPolicy::default())
}

/// Compute constructibility indicators under an explicit range policy.
pub fn compute_build_indicators_with(
    parcel_area_m2: f64,
    rules: &[ConsolidatedRule],
    policy: &CalcPolicy,
) -> CalcResult {
    let mut controls = Vec::new();
    let mut details = CalcDetails::default();

    // NaN fails the `> 0` test and is treated as invalid too.
    if !(parcel_area_m2 > 0.0) {
        controls.push(Control::new(
            ControlCode::InvalidArea,
            ControlLevel::Error,
            "Surface de parcelle invalide ou nulle",
        ));
        return CalcResult {
            su_m2: None,
            ibus_m2: None,
            emprise_m2: None,
            niveaux_max_est: None,
            reliability: 0.0,
            controls,
            details,
        };
    }
    let area = parcel_area_m2;

    let b = extract_building_rules(rules);
    details.indice_u = b.indice_u;
    details.ibus = b.ibus;
    details.emprise_max = b.emprise_max;
    details.h_max_m = b.h_max_m;
    details.niveaux_max = b.niveaux_max;

    // A convertible indice_u covers a missing ibus.
    for (name, present) in [
        ("indice_u", b.indice_u.is_some()),
        ("ibus", b.ibus.is_some() || b.indice_u.is_some()),
        ("emprise_max", b.emprise_max.is_some()),
    ] {
        if !present {
            details.missing_values.push(name.to_string());
        }
    }

    // Usable surface.
    let su_m2 = match b.indice_u {
        Some(u) => {
            let su = round1(u * area);
            details.formulas.su = Some(format!("{u} × {area} = {su} m²"));
            Some(su)
        }
        None => {
            controls.push(Control::new(
                ControlCode::MissingIndiceU,
                ControlLevel::Warning,
                "Indice d'utilisation (U) non défini",
            ));
            None
        }
    };

    // Gross surface, converting from indice_u when ibus is absent.
    let ibus_factor = match (b.ibus, b.indice_u) {
        (Some(ibus), _) => Some(ibus),
        (None, Some(u)) => {
            let converted = round2(convert_indice_u(u));
            details.ibus_calculated = Some(converted);
            details.conversion_applied = true;
            controls.push(Control::new(
                ControlCode::IbusConverted,
                ControlLevel::Info,
                format!(
                    "IBUS calculé depuis indice U ({u}) selon table de conversion: {converted}"
                ),
            ));
            Some(converted)
        }
        (None, None) => None,
    };
    let ibus_m2 = match ibus_factor {
        Some(f) => {
            let ibus = round1(f * area);
            details.formulas.ibus = Some(format!("{f} × {area} = {ibus} m²"));
            Some(ibus)
        }
        None => {
            controls.push(Control::new(
                ControlCode::MissingIbus,
                ControlLevel::Warning,
                "IBUS non défini et impossible à calculer",
            ));
            None
        }
    };

    // Footprint.
    let emprise_m2 = match b.emprise_max {
        Some(e) => {
            let emprise = round1(e * area);
            details.formulas.emprise = Some(format!("{e} × {area} = {emprise} m²"));
            Some(emprise)
        }
        None => {
            controls.push(Control::new(
                ControlCode::MissingEmprise,
                ControlLevel::Warning,
                "Emprise au sol maximale non définie",
            ));
            None
        }
    };

    // Storeys.
    let mut niveaux_max_est = None;
    if let (Some(ibus), Some(emprise)) = (ibus_m2, emprise_m2) {
        if emprise > 0.0 {
            let est = (ibus / emprise).floor().max(0.0) as u32;
            details.formulas.niveaux = Some(format!("floor({ibus} / {emprise}) = {est}"));
            niveaux_max_est = Some(est);
            if let Some(cap) = b.niveaux_max {
                if f64::from(est) > cap {
                    let capped = cap.floor().max(0.0) as u32;
                    niveaux_max_est = Some(capped);
                    controls.push(Control::new(
                        ControlCode::NiveauxLimited,
                        ControlLevel::Info,
                        format!("Nombre de niveaux limité par le règlement à {capped}"),
                    ));
                }
            }
        }
    }

    // Coherence and ranges.
    if let (Some(su), Some(ibus)) = (su_m2, ibus_m2) {
        if ibus < su {
            controls.push(Control::new(
                ControlCode::IbusIncoherent,
                ControlLevel::Error,
                format!("IBUS ({ibus} m²) inférieur à SU ({su} m²) - incohérence"),
            ));
        }
    }
    if let Some(u) = b.indice_u {
        if u <= 0.0 || u > policy.indice_u_max {
            controls.push(Control::new(
                ControlCode::IndiceURange,
                ControlLevel::Warning,
                format!(
                    "Indice U ({u}) hors plage habituelle (0-{})",
                    policy.indice_u_max
                ),
            ));
        }
    }
    if let Some(e) = b.emprise_max {
        if e <= 0.0 || e > policy.emprise_max_max {
            controls.push(Control::new(
                ControlCode::EmpriseRange,
                ControlLevel::Warning,
                format!(
                    "Emprise max ({e}) hors plage habituelle (0-{})",
                    policy.emprise_max_max
                ),
            ));
        }
    }

    let missing = details.missing_values.len() as f64;
    let reliability = (1.0 - 0.25 * missing).max(0.25);

    CalcResult {
        su_m2,
        ibus_m2,
        emprise_m2,
        niveaux_max_est,
        reliability,
        controls,
        details,
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
