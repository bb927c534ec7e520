use std::time::Duration;

use parcelle_core::GeometryError;
use parcelle_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("unsupported geometry: {0}")]
    UnsupportedGeometry(#[from] GeometryError),
}
