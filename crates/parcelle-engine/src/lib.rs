//! Parcel analysis engine: rule resolution, spatial context, build
//! indicators and the evidence ledger, over any [`parcelle_store::Store`].

mod bounded;
mod error;
pub use error::EngineError;

pub mod context;
pub mod ledger;
pub mod rules;

pub use context::{ContextResolver, summarize_context};
pub use ledger::{EvidenceLedger, ParcelAnalysis};
pub use rules::RuleResolver;

#[cfg(test)]
mod testing;
