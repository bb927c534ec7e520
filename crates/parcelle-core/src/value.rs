//! Tagged regulatory values.
//!
//! Regulation rows carry heterogeneous payloads: most are numeric indices
//! (`indice_u = 0.5`), some are text (`"DS III"`), and a few are structured
//! (`toit_types = ["2 pans", "4 pans"]`, `pente_toit_min_max = {min: 20, max: 45}`).
//! [`RuleValue`] keeps that shape explicit instead of passing raw JSON around.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single regulatory value: number, text, boolean, ordered list or keyed map.
///
/// Serialises untagged, so the JSON form is the natural one (`0.5`, `"DS III"`,
/// `true`, `[..]`, `{..}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Number(f64),
    Bool(bool),
    Text(String),
    List(Vec<RuleValue>),
    Map(BTreeMap<String, RuleValue>),
}

impl RuleValue {
    /// Strict numeric view: only [`RuleValue::Number`] yields a value.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Lenient numeric view: numbers, plus text that parses as a number
    /// (`"0.5"`, `" 12 "`, `"0,5"`).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        }
    }

    /// Rebuild a value from the three persisted columns, in column priority
    /// order: `value_num`, then `value_text`, then `value_json`.
    pub fn from_columns(
        value_num: Option<f64>,
        value_text: Option<String>,
        value_json: Option<&str>,
    ) -> Result<Option<Self>, serde_json::Error> {
        if let Some(n) = value_num {
            return Ok(Some(Self::Number(n)));
        }
        if let Some(t) = value_text {
            return Ok(Some(Self::Text(t)));
        }
        match value_json {
            Some(raw) => serde_json::from_str(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Split into the `(value_num, value_text, value_json)` column triple.
    pub fn to_columns(
        &self,
    ) -> Result<(Option<f64>, Option<String>, Option<String>), serde_json::Error> {
        Ok(match self {
            Self::Number(n) => (Some(*n), None, None),
            Self::Text(t) => (None, Some(t.clone()), None),
            other => (None, None, Some(serde_json::to_string(other)?)),
        })
    }
}

impl From<f64> for RuleValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RuleValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<bool> for RuleValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for RuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
            other => {
                let json = serde_json::to_string(other).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}
