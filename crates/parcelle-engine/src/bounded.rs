//! Optional deadline around store calls. The core never retries; an expired
//! call surfaces as [`EngineError::Timeout`] and the caller decides.

use std::future::Future;
use std::time::Duration;

use parcelle_store::StoreError;
use tracing::warn;

use crate::EngineError;

pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Option<Duration>,
    call: F,
) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let Some(after) = limit else {
        return Ok(call.await?);
    };
    match tokio::time::timeout(after, call).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(operation, ?after, "store call timed out");
            Err(EngineError::Timeout { operation, after })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_call_times_out() {
        let err = bounded::<(), _>("stall", Some(Duration::from_millis(50)), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { operation: "stall", .. }));
    }

    #[tokio::test]
    async fn unbounded_call_passes_errors_through() {
        let err = bounded::<(), _>("fail", None, async { Err(StoreError::Other("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Other(_))));
        assert_eq!(bounded("ok", Some(Duration::from_secs(1)), async { Ok(7) }).await.unwrap(), 7);
    }
}
