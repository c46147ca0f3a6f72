//! Utility functions shared by the master and the operation log

use std::time::Duration;

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Retry with exponential backoff.
///
/// Only errors reported as retryable are retried; the last error is returned
/// once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_attempts: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let jitter = Duration::from_millis(rand::random::<u64>() % 10);
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay + jitter
                );
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Validate a database name (non-empty, bounded, printable)
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidConfig("name cannot be empty".into()));
    }

    if name.len() > 256 {
        return Err(crate::Error::InvalidConfig(
            "name too long (max 256 bytes)".into(),
        ));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidConfig(
            "name contains invalid characters".into(),
        ));
    }

    Ok(())
}
