//! Regulation rows and their priority-based consolidation.
//!
//! # Priority tiers
//!
//! - `LEVEL1`: private-law servitudes, special plans (highest priority)
//! - `LEVEL2`: municipal complementary plans
//! - `LEVEL3`: communal zoning regulation (RCCZ)
//! - `LEVEL4`: cantonal / federal baseline (lowest priority)
//!
//! For a given zone and field, the applicable row at the numerically lowest
//! level wins. Ties inside a level go to the most recent `validity_from`.
//! Every other applicable row is kept in the `overridden` decision log.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::value::RuleValue;

/// Rule priority tier. Ordering follows priority: `Level1 < Level4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuleLevel {
    #[serde(rename = "LEVEL1")]
    Level1 = 1,
    #[serde(rename = "LEVEL2")]
    Level2 = 2,
    #[serde(rename = "LEVEL3")]
    Level3 = 3,
    #[serde(rename = "LEVEL4")]
    Level4 = 4,
}

impl RuleLevel {
    pub const ALL: [RuleLevel; 4] = [Self::Level1, Self::Level2, Self::Level3, Self::Level4];

    /// Numeric tier as persisted in `rule_definitions.level`.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(n: i32) -> Option<Self> {
        match n {
            1 => Some(Self::Level1),
            2 => Some(Self::Level2),
            3 => Some(Self::Level3),
            4 => Some(Self::Level4),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Level1 => "LEVEL1",
            Self::Level2 => "LEVEL2",
            Self::Level3 => "LEVEL3",
            Self::Level4 => "LEVEL4",
        }
    }
}

impl fmt::Display for RuleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted regulation row.
///
/// Unique on `(zone_id, field, level, validity_from)`. Rows are append-only:
/// re-inserting an existing key keeps the first-written value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRow {
    pub zone_id: String,
    pub level: RuleLevel,
    pub field: String,
    pub value: RuleValue,
    pub description: Option<String>,
    pub source_id: Option<String>,
    pub validity_from: NaiveDate,
    pub validity_to: Option<NaiveDate>,
}

/// Unique key of a [`RuleRow`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey {
    pub zone_id: String,
    pub field: String,
    pub level: RuleLevel,
    pub validity_from: NaiveDate,
}

impl RuleRow {
    pub fn new(
        zone_id: impl Into<String>,
        level: RuleLevel,
        field: impl Into<String>,
        value: impl Into<RuleValue>,
        validity_from: NaiveDate,
    ) -> Self {
        Self {
            zone_id: zone_id.into(),
            level,
            field: field.into(),
            value: value.into(),
            description: None,
            source_id: None,
            validity_from,
            validity_to: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn valid_until(mut self, validity_to: NaiveDate) -> Self {
        self.validity_to = Some(validity_to);
        self
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            zone_id: self.zone_id.clone(),
            field: self.field.clone(),
            level: self.level,
            validity_from: self.validity_from,
        }
    }

    /// `validity_from <= on` and (`validity_to` absent or `>= on`).
    pub fn is_applicable(&self, on: NaiveDate) -> bool {
        self.validity_from <= on && self.validity_to.is_none_or(|to| to >= on)
    }
}

/// A candidate that lost the priority contest for its field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverriddenRule {
    pub level: RuleLevel,
    pub value: RuleValue,
    pub description: Option<String>,
    pub source_id: Option<String>,
}

/// The winning value for one field of one zone, plus the decision log.
///
/// Invariant: `level <= o.level` for every `o` in `overridden`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRule {
    pub field: String,
    pub value: RuleValue,
    pub level: RuleLevel,
    pub description: Option<String>,
    pub source_id: Option<String>,
    pub zone_id: String,
    pub zone_code: String,
    pub overridden: Vec<OverriddenRule>,
}

impl ConsolidatedRule {
    pub fn has_overrides(&self) -> bool {
        !self.overridden.is_empty()
    }
}

/// Consolidate the rows of one zone into one [`ConsolidatedRule`] per field.
///
/// Rows not applicable on `on` are ignored. Output is ordered by field name.
/// Fields with no applicable row are simply absent.
pub fn consolidate(
    zone_id: &str,
    zone_code: &str,
    rows: &[RuleRow],
    on: NaiveDate,
) -> Vec<ConsolidatedRule> {
    let mut by_field: BTreeMap<&str, Vec<&RuleRow>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.is_applicable(on)) {
        by_field.entry(row.field.as_str()).or_default().push(row);
    }

    by_field
        .into_iter()
        .filter_map(|(field, mut candidates)| {
            // Highest priority first, then most recent validity inside a tier.
            candidates.sort_by(|a, b| {
                a.level
                    .cmp(&b.level)
                    .then_with(|| b.validity_from.cmp(&a.validity_from))
            });
            let (winner, rest) = candidates.split_first()?;
            Some(ConsolidatedRule {
                field: field.to_string(),
                value: winner.value.clone(),
                level: winner.level,
                description: winner.description.clone(),
                source_id: winner.source_id.clone(),
                zone_id: zone_id.to_string(),
                zone_code: zone_code.to_string(),
                overridden: rest
                    .iter()
                    .map(|r| OverriddenRule {
                        level: r.level,
                        value: r.value.clone(),
                        description: r.description.clone(),
                        source_id: r.source_id.clone(),
                    })
                    .collect(),
            })
        })
        .collect()
}

/// Highest-priority level among a set of consolidated rules.
pub fn highest_priority_level(rules: &[ConsolidatedRule]) -> Option<RuleLevel> {
    rules.iter().map(|r| r.level).min()
}

/// Typed view of the building fields the calculator and reports care about.
///
/// When several zones contribute the same field, the first occurrence wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildingRules {
    pub h_max_m: Option<f64>,
    pub niveaux_max: Option<f64>,
    pub indice_u: Option<f64>,
    pub ibus: Option<f64>,
    pub emprise_max: Option<f64>,
    pub recul_min_m: Option<f64>,
    pub toit_types: Option<RuleValue>,
    pub pente_toit_min_max: Option<RuleValue>,
}

/// Extract [`BuildingRules`] from consolidated rules. Numeric fields only
/// accept numeric values; roof fields accept any shape.
pub fn extract_building_rules(rules: &[ConsolidatedRule]) -> BuildingRules {
    let mut out = BuildingRules::default();
    for rule in rules {
        let slot = match rule.field.as_str() {
            "h_max_m" => &mut out.h_max_m,
            "niveaux_max" => &mut out.niveaux_max,
            "indice_u" => &mut out.indice_u,
            "ibus" => &mut out.ibus,
            "emprise_max" => &mut out.emprise_max,
            "recul_min_m" => &mut out.recul_min_m,
            "toit_types" => {
                out.toit_types.get_or_insert_with(|| rule.value.clone());
                continue;
            }
            "pente_toit_min_max" => {
                out.pente_toit_min_max
                    .get_or_insert_with(|| rule.value.clone());
                continue;
            }
            _ => continue,
        };
        if slot.is_none() {
            *slot = rule.value.as_number();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        day(2025, 6, 1)
    }

    fn row(level: RuleLevel, field: &str, value: f64) -> RuleRow {
        RuleRow::new("z1", level, field, value, day(2020, 1, 1))
    }

    #[test]
    fn servitude_overrides_communal_rule() {
        let rows = vec![
            row(RuleLevel::Level3, "h_max_m", 15.0),
            row(RuleLevel::Level1, "h_max_m", 12.0),
        ];
        let out = consolidate("z1", "R2", &rows, today());
        assert_eq!(out.len(), 1);
        let h = &out[0];
        assert_eq!(h.value, RuleValue::Number(12.0));
        assert_eq!(h.level, RuleLevel::Level1);
        assert_eq!(h.overridden.len(), 1);
        assert_eq!(h.overridden[0].level, RuleLevel::Level3);
        assert_eq!(h.overridden[0].value, RuleValue::Number(15.0));
        assert_eq!(h.zone_code, "R2");
    }

    #[test]
    fn one_rule_per_field_and_winner_dominates() {
        let rows = vec![
            row(RuleLevel::Level4, "h_max_m", 20.0),
            row(RuleLevel::Level3, "h_max_m", 15.0),
            row(RuleLevel::Level1, "h_max_m", 12.0),
            row(RuleLevel::Level4, "places_parc_ratio", 1.0),
            row(RuleLevel::Level3, "places_parc_ratio", 1.2),
            row(RuleLevel::Level2, "places_parc_ratio", 1.5),
            row(RuleLevel::Level3, "indice_u", 0.5),
        ];
        let out = consolidate("z1", "R2", &rows, today());
        let fields: Vec<&str> = out.iter().map(|r| r.field.as_str()).collect();
        assert_eq!(fields, vec!["h_max_m", "indice_u", "places_parc_ratio"]);
        for rule in &out {
            assert!(rule.overridden.iter().all(|o| rule.level <= o.level));
        }
        let parking = out.iter().find(|r| r.field == "places_parc_ratio").unwrap();
        assert_eq!(parking.value, RuleValue::Number(1.5));
        assert_eq!(parking.overridden.len(), 2);
        let indice = out.iter().find(|r| r.field == "indice_u").unwrap();
        assert!(!indice.has_overrides());
    }

    #[test]
    fn same_level_tie_goes_to_most_recent_validity() {
        let rows = vec![
            RuleRow::new("z1", RuleLevel::Level1, "emprise_max", 0.4, day(2024, 6, 1))
                .with_description("Ancienne servitude"),
            RuleRow::new("z1", RuleLevel::Level1, "emprise_max", 0.3, day(2025, 6, 1))
                .with_description("Nouvelle servitude"),
            RuleRow::new("z1", RuleLevel::Level1, "emprise_max", 0.25, day(2026, 6, 1))
                .with_description("Future servitude"),
        ];
        let out = consolidate("z1", "R2", &rows, today());
        assert_eq!(out[0].value, RuleValue::Number(0.3));
        assert_eq!(out[0].description.as_deref(), Some("Nouvelle servitude"));
        // The future row is not applicable and must not appear in the log.
        assert_eq!(out[0].overridden.len(), 1);
        assert_eq!(out[0].overridden[0].value, RuleValue::Number(0.4));
    }

    #[test]
    fn expired_rows_are_ignored() {
        let rows = vec![
            RuleRow::new("z1", RuleLevel::Level1, "h_max_m", 9.0, day(2010, 1, 1))
                .valid_until(day(2024, 12, 31)),
            row(RuleLevel::Level3, "h_max_m", 15.0),
        ];
        let out = consolidate("z1", "R2", &rows, today());
        assert_eq!(out[0].value, RuleValue::Number(15.0));
        assert!(out[0].overridden.is_empty());
    }

    #[test]
    fn validity_bounds_are_inclusive() {
        let r = RuleRow::new("z1", RuleLevel::Level3, "h_max_m", 9.0, today()).valid_until(today());
        assert!(r.is_applicable(today()));
        assert!(!r.is_applicable(today().succ_opt().unwrap()));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(consolidate("z1", "R2", &[], today()).is_empty());
        assert_eq!(highest_priority_level(&[]), None);
    }

    #[test]
    fn level_numbering_round_trips() {
        for level in RuleLevel::ALL {
            assert_eq!(RuleLevel::from_i32(level.as_i32()), Some(level));
        }
        assert_eq!(RuleLevel::from_i32(0), None);
        assert_eq!(
            serde_json::to_string(&RuleLevel::Level2).unwrap(),
            r#""LEVEL2""#
        );
    }

    #[test]
    fn building_rules_take_first_numeric_occurrence() {
        let rows = vec![
            RuleRow::new("a", RuleLevel::Level3, "indice_u", 0.5, day(2020, 1, 1)),
            RuleRow::new("a", RuleLevel::Level3, "toit_types", "2 pans", day(2020, 1, 1)),
        ];
        let mut rules = consolidate("a", "A", &rows, today());
        rules.extend(consolidate(
            "b",
            "B",
            &[
                RuleRow::new("b", RuleLevel::Level3, "indice_u", 0.8, day(2020, 1, 1)),
                RuleRow::new("b", RuleLevel::Level3, "h_max_m", "douze", day(2020, 1, 1)),
            ],
            today(),
        ));
        let b = extract_building_rules(&rules);
        assert_eq!(b.indice_u, Some(0.5));
        assert_eq!(b.h_max_m, None);
        assert_eq!(b.toit_types, Some(RuleValue::from("2 pans")));
        assert_eq!(highest_priority_level(&rules), Some(RuleLevel::Level3));
    }
}
