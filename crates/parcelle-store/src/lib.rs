//! Storage layer: the narrow store interface consumed by the engine, an
//! in-process [`MemoryStore`] and a DuckDB-backed [`DuckStore`].

mod error;
pub use error::StoreError;

mod interface;
pub use interface::{ContextStore, EvidenceStore, RuleStore, SourceStore, Store, ZoneStore};

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckStore;
