pub mod calc;
pub mod config;
pub mod context;
pub mod evidence;
pub mod geometry;
pub mod rule;
pub mod schema;
pub mod value;

pub use calc::{
    CalcPolicy, CalcResult, Control, ControlCode, ControlLevel, compute_build_indicators,
    compute_build_indicators_with, convert_indice_u,
};
pub use config::{ConfigError, EngineConfig};
pub use context::{
    CachedContext, ContextFlag, ContextLayer, LayerCheck, LayerFeature, LayerHit, SeverityRule,
};
pub use evidence::{
    AnalysisQuality, EvidenceItem, QualityWeights, RefType, RegulationSource, Reliability,
};
pub use geometry::{BBox, GeometryError, ParcelGeometry, Zone};
pub use rule::{BuildingRules, ConsolidatedRule, OverriddenRule, RuleLevel, RuleRow, consolidate};
pub use schema::tables;
pub use value::RuleValue;
