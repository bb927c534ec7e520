//! Hazard and constraint layers, and the flags they raise on a parcel.
//!
//! Each [`ContextLayer`] names a backing feature set in the store and a
//! [`SeverityRule`] that turns a spatial hit into a severity:
//!
//! | rule | severity bands |
//! |---|---|
//! | `Slope` | ≤30% → 1, 30–45% → 2, >45% → 3 |
//! | `NoiseSensitivity` | DS I/II → 1, DS III → 2, DS IV/V → 3 |
//! | `DangerMap` | red/blue → 3, yellow → 2, yellow-white → 1 |
//! | `Airport` | intersecting → 2, nearby → 1 |
//! | `Road` | within threshold → 2, farther → 1 |
//! | `Fixed(n)` | intersecting → n, nearby → 1 |

use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

use crate::evidence::Reliability;
use crate::geometry::{BBox, ParcelGeometry};

/// How a layer is tested against a parcel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerCheck {
    /// Geometric intersection; near misses within the report radius are
    /// still reported with their distance.
    Intersect,
    /// Distance-driven layer (roads): closer than `threshold_m` is a hit.
    Proximity { threshold_m: f64 },
}

impl LayerCheck {
    /// Search radius around the parcel for this layer.
    pub fn radius(&self, report_radius_m: f64) -> f64 {
        match self {
            Self::Intersect => report_radius_m,
            Self::Proximity { threshold_m } => threshold_m.max(report_radius_m),
        }
    }
}

/// Layer-specific severity classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "severity", rename_all = "snake_case")]
pub enum SeverityRule {
    Slope,
    NoiseSensitivity,
    DangerMap,
    Airport,
    Road,
    Fixed(u8),
}

impl SeverityRule {
    /// Severity in `1..=3` for one hit.
    pub fn severity(&self, hit: &LayerHit, check: &LayerCheck) -> u8 {
        match self {
            Self::Slope if hit.intersects => match hit.value_num {
                Some(p) if p > 45.0 => 3,
                Some(p) if p > 30.0 => 2,
                _ => 1,
            },
            Self::NoiseSensitivity if hit.intersects => {
                match hit.value_text.as_deref().and_then(noise_degree) {
                    Some(4) | Some(5) => 3,
                    Some(3) => 2,
                    _ => 1,
                }
            }
            Self::DangerMap if hit.intersects => {
                match hit.value_text.as_deref().map(danger_color) {
                    Some(DangerColor::Red | DangerColor::Blue) => 3,
                    Some(DangerColor::Yellow) => 2,
                    _ => 1,
                }
            }
            Self::Airport if hit.intersects => 2,
            Self::Road => {
                let threshold = match check {
                    LayerCheck::Proximity { threshold_m } => *threshold_m,
                    LayerCheck::Intersect => 0.0,
                };
                if hit.intersects || hit.distance_m.is_some_and(|d| d < threshold) {
                    2
                } else {
                    1
                }
            }
            Self::Fixed(n) if hit.intersects => (*n).clamp(1, 3),
            _ => 1,
        }
    }

    /// Lookup layers are direct evidence; computed measures are derived.
    pub fn reliability(&self) -> Reliability {
        match self {
            Self::Slope | Self::Road => Reliability::Derived,
            Self::NoiseSensitivity | Self::DangerMap | Self::Airport | Self::Fixed(_) => {
                Reliability::Direct
            }
        }
    }

    /// Default flag message for a hit.
    pub fn message(&self, hit: &LayerHit, severity: u8) -> String {
        let near = hit
            .distance_m
            .map(|d| format!(" à {}m", d.round()))
            .unwrap_or_default();
        match self {
            Self::Slope => {
                let slope = hit.value_num.unwrap_or(0.0).round();
                let impact = match severity {
                    3 => " - Construction complexe",
                    2 => " - Terrassements conséquents",
                    _ => "",
                };
                format!("Pente moyenne {slope}%{impact}")
            }
            Self::NoiseSensitivity if hit.intersects => {
                let ds = hit.value_text.as_deref().unwrap_or("OPB");
                let isolation = if severity >= 2 { "requise" } else { "recommandée" };
                format!("Zone de bruit {ds} - Isolation {isolation}")
            }
            Self::DangerMap if hit.intersects => {
                let color = hit.value_text.as_deref().unwrap_or("indéterminé");
                let measures = match severity {
                    3 => " - Construction très limitée",
                    2 => " - Mesures requises",
                    _ => "",
                };
                format!("Zone de danger {color}{measures}")
            }
            Self::Airport if hit.intersects => "Zone de sécurité aéroport (OFAC)".to_string(),
            Self::Road if severity >= 2 => {
                format!("Route cantonale{near} - Recul obligatoire")
            }
            Self::Road => format!("Route cantonale{near}"),
            Self::Fixed(_) if hit.intersects => "Contrainte applicable".to_string(),
            Self::NoiseSensitivity => format!("Zone de bruit{near}"),
            Self::DangerMap => format!("Zone de danger{near}"),
            Self::Airport => format!("Zone de sécurité aéroport{near}"),
            Self::Fixed(_) => format!("Contrainte{near}"),
        }
    }
}

/// Parse a noise sensitivity degree (`"DS III"`, `"III"`, `"3"`) into 1..=5.
fn noise_degree(text: &str) -> Option<u8> {
    let t = text.trim().to_ascii_uppercase();
    let t = t.strip_prefix("DS").unwrap_or(&t).trim();
    match t {
        "I" | "1" => Some(1),
        "II" | "2" => Some(2),
        "III" | "3" => Some(3),
        "IV" | "4" => Some(4),
        "V" | "5" => Some(5),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DangerColor {
    Red,
    Blue,
    Yellow,
    Residual,
    Unknown,
}

fn danger_color(text: &str) -> DangerColor {
    match text.trim().to_lowercase().as_str() {
        "rouge" | "red" | "fort" | "tres_fort" => DangerColor::Red,
        "bleu" | "blue" | "moyen" => DangerColor::Blue,
        "jaune" | "yellow" | "faible" => DangerColor::Yellow,
        "jaune-blanc" | "yellow-white" | "residuel" | "résiduel" => DangerColor::Residual,
        _ => DangerColor::Unknown,
    }
}

/// A registered context layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextLayer {
    pub id: String,
    pub name: String,
    pub check: LayerCheck,
    pub severity: SeverityRule,
    /// Provenance root used in evidence paths, e.g. `OPB/cadastre_bruit`.
    pub source: String,
}

/// One feature of a layer's backing geometry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerFeature {
    pub layer_id: String,
    pub geometry: MultiPolygon<f64>,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
}

impl LayerFeature {
    pub fn bbox(&self) -> Option<BBox> {
        BBox::of(&self.geometry)
    }

    /// Test this feature against a parcel. Returns `None` when the feature is
    /// neither intersecting nor within `radius_m`.
    pub fn hit_test(&self, parcel: &ParcelGeometry, radius_m: f64) -> Option<LayerHit> {
        if parcel.intersects(&self.geometry) {
            return Some(LayerHit {
                intersects: true,
                distance_m: None,
                value_num: self.value_num,
                value_text: self.value_text.clone(),
            });
        }
        let d = parcel.distance_to(&self.geometry);
        (d <= radius_m).then(|| LayerHit {
            intersects: false,
            distance_m: Some(d),
            value_num: self.value_num,
            value_text: self.value_text.clone(),
        })
    }
}

/// Spatial match of one layer feature against a parcel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerHit {
    pub intersects: bool,
    pub distance_m: Option<f64>,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
}

/// A constraint raised on a parcel by one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFlag {
    pub layer: String,
    pub intersects: bool,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
    /// Populated when the layer does not intersect but lies nearby.
    pub distance: Option<f64>,
    pub severity: u8,
    pub message: String,
}

impl ContextFlag {
    /// Evaluate a layer from its hits: the most severe intersecting hit wins;
    /// without any intersection, the nearest hit is reported with its distance.
    pub fn evaluate(layer: &ContextLayer, hits: &[LayerHit]) -> Option<Self> {
        let rate = |h: &LayerHit| layer.severity.severity(h, &layer.check);
        let best = hits
            .iter()
            .filter(|h| h.intersects)
            .max_by_key(|h| rate(h))
            .or_else(|| {
                hits.iter().min_by(|a, b| {
                    let da = a.distance_m.unwrap_or(f64::INFINITY);
                    let db = b.distance_m.unwrap_or(f64::INFINITY);
                    da.total_cmp(&db)
                })
            })?;
        let severity = rate(best);
        Some(Self {
            layer: layer.name.clone(),
            intersects: best.intersects,
            value_num: best.value_num,
            value_text: best.value_text.clone(),
            distance: best.distance_m,
            severity,
            message: layer.severity.message(best, severity),
        })
    }

    /// Flags worth reporting: intersecting, or near with a known distance.
    pub fn is_relevant(&self) -> bool {
        self.intersects || self.distance.is_some()
    }
}

/// Severity descending, then layer name ascending.
pub fn sort_flags(flags: &mut [ContextFlag]) {
    flags.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.layer.cmp(&b.layer))
    });
}

/// One `parcel_context` cache row.
///
/// Every evaluated layer gets a row, including clear ones (`intersects =
/// false`, no distance), so a parcel free of constraints is cached too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedContext {
    pub parcel_id: String,
    pub layer_id: String,
    pub layer_name: String,
    pub intersects: bool,
    pub severity: u8,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
    pub distance_m: Option<f64>,
    pub message: String,
    pub computed_at: DateTime<Utc>,
}

impl CachedContext {
    pub fn from_flag(
        parcel_id: &str,
        layer: &ContextLayer,
        flag: Option<&ContextFlag>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        match flag {
            Some(f) => Self {
                parcel_id: parcel_id.to_string(),
                layer_id: layer.id.clone(),
                layer_name: layer.name.clone(),
                intersects: f.intersects,
                severity: f.severity,
                value_num: f.value_num,
                value_text: f.value_text.clone(),
                distance_m: f.distance,
                message: f.message.clone(),
                computed_at,
            },
            None => Self {
                parcel_id: parcel_id.to_string(),
                layer_id: layer.id.clone(),
                layer_name: layer.name.clone(),
                intersects: false,
                severity: 1,
                value_num: None,
                value_text: None,
                distance_m: None,
                message: String::new(),
                computed_at,
            },
        }
    }

    pub fn to_flag(&self) -> ContextFlag {
        ContextFlag {
            layer: self.layer_name.clone(),
            intersects: self.intersects,
            value_num: self.value_num,
            value_text: self.value_text.clone(),
            distance: self.distance_m,
            severity: self.severity.clamp(1, 3),
            message: self.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(intersects: bool, num: Option<f64>, text: Option<&str>, d: Option<f64>) -> LayerHit {
        LayerHit {
            intersects,
            distance_m: d,
            value_num: num,
            value_text: text.map(String::from),
        }
    }

    fn layer(name: &str, check: LayerCheck, severity: SeverityRule) -> ContextLayer {
        ContextLayer {
            id: format!("{name}-id"),
            name: name.to_string(),
            check,
            severity,
            source: "test".into(),
        }
    }

    #[test]
    fn slope_bands() {
        let c = LayerCheck::Intersect;
        let s = SeverityRule::Slope;
        assert_eq!(s.severity(&hit(true, Some(12.0), None, None), &c), 1);
        assert_eq!(s.severity(&hit(true, Some(30.0), None, None), &c), 1);
        assert_eq!(s.severity(&hit(true, Some(38.0), None, None), &c), 2);
        assert_eq!(s.severity(&hit(true, Some(45.0), None, None), &c), 2);
        assert_eq!(s.severity(&hit(true, Some(52.0), None, None), &c), 3);
    }

    #[test]
    fn noise_degrees() {
        let c = LayerCheck::Intersect;
        let s = SeverityRule::NoiseSensitivity;
        assert_eq!(s.severity(&hit(true, None, Some("DS II"), None), &c), 1);
        assert_eq!(s.severity(&hit(true, None, Some("DS III"), None), &c), 2);
        assert_eq!(s.severity(&hit(true, None, Some("ds iv"), None), &c), 3);
        assert_eq!(s.severity(&hit(true, None, Some("V"), None), &c), 3);
        assert_eq!(s.severity(&hit(false, None, Some("DS V"), Some(40.0)), &c), 1);
    }

    #[test]
    fn danger_colors() {
        let c = LayerCheck::Intersect;
        let s = SeverityRule::DangerMap;
        assert_eq!(s.severity(&hit(true, None, Some("rouge"), None), &c), 3);
        assert_eq!(s.severity(&hit(true, None, Some("blue"), None), &c), 3);
        assert_eq!(s.severity(&hit(true, None, Some("jaune"), None), &c), 2);
        assert_eq!(s.severity(&hit(true, None, Some("jaune-blanc"), None), &c), 1);
    }

    #[test]
    fn airport_and_road() {
        let a = SeverityRule::Airport;
        assert_eq!(a.severity(&hit(true, None, None, None), &LayerCheck::Intersect), 2);
        assert_eq!(a.severity(&hit(false, None, None, Some(50.0)), &LayerCheck::Intersect), 1);

        let road = LayerCheck::Proximity { threshold_m: 25.0 };
        let r = SeverityRule::Road;
        assert_eq!(r.severity(&hit(false, None, None, Some(10.0)), &road), 2);
        assert_eq!(r.severity(&hit(false, None, None, Some(60.0)), &road), 1);
        assert_eq!(road.radius(100.0), 100.0);
    }

    #[test]
    fn evaluate_prefers_intersecting_then_nearest() {
        let l = layer("risk_nat", LayerCheck::Intersect, SeverityRule::DangerMap);
        let hits = vec![
            hit(true, None, Some("jaune"), None),
            hit(true, None, Some("rouge"), None),
            hit(false, None, Some("rouge"), Some(5.0)),
        ];
        let flag = ContextFlag::evaluate(&l, &hits).unwrap();
        assert!(flag.intersects);
        assert_eq!(flag.severity, 3);
        assert_eq!(flag.value_text.as_deref(), Some("rouge"));

        let hits = vec![
            hit(false, None, None, Some(80.0)),
            hit(false, None, None, Some(20.0)),
        ];
        let flag = ContextFlag::evaluate(&l, &hits).unwrap();
        assert!(!flag.intersects);
        assert_eq!(flag.distance, Some(20.0));
        assert_eq!(flag.severity, 1);
        assert!(flag.is_relevant());

        assert!(ContextFlag::evaluate(&l, &[]).is_none());
    }

    #[test]
    fn cache_row_round_trip() {
        let l = layer("opb_noise", LayerCheck::Intersect, SeverityRule::NoiseSensitivity);
        let flag = ContextFlag::evaluate(&l, &[hit(true, None, Some("DS III"), None)]).unwrap();
        let now = Utc::now();
        let row = CachedContext::from_flag("p1", &l, Some(&flag), now);
        assert_eq!(row.layer_id, "opb_noise-id");
        assert_eq!(row.to_flag(), flag);

        let clear = CachedContext::from_flag("p1", &l, None, now);
        assert!(!clear.to_flag().is_relevant());
    }

    #[test]
    fn layer_definition_serialises_tagged() {
        let l = layer(
            "roads_cantonal",
            LayerCheck::Proximity { threshold_m: 25.0 },
            SeverityRule::Road,
        );
        let json = serde_json::to_value(&l).unwrap();
        assert_eq!(json["check"]["kind"], "proximity");
        assert_eq!(json["severity"]["rule"], "road");
        let back: ContextLayer = serde_json::from_value(json).unwrap();
        assert_eq!(back, l);
    }

    #[test]
    fn sort_is_severity_desc_then_name() {
        let mk = |name: &str, severity: u8| ContextFlag {
            layer: name.into(),
            intersects: true,
            value_num: None,
            value_text: None,
            distance: None,
            severity,
            message: String::new(),
        };
        let mut flags = vec![mk("b", 2), mk("a", 1), mk("c", 3), mk("a", 2)];
        sort_flags(&mut flags);
        let order: Vec<(&str, u8)> = flags.iter().map(|f| (f.layer.as_str(), f.severity)).collect();
        assert_eq!(order, vec![("c", 3), ("a", 2), ("b", 2), ("a", 1)]);
    }
}
