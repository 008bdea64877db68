use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Re-runs `check` until it yields a value or `within` elapses.
pub async fn poll_until<T, F, Fut>(what: &str, within: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let polling = async {
        loop {
            if let Some(value) = check().await.with_context(|| format!("check {what}"))? {
                return Ok(value);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(within, polling)
        .await
        .with_context(|| format!("{what} not observed within {within:?}"))?
}
