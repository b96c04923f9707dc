//! Optimistic-concurrency retries.
//!
//! Every read-modify-write of a stored object goes through [`retry_on_conflict`]:
//! the object is re-read and the mutation re-applied whenever the write loses a
//! resourceVersion race.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::store::{Object, ObjectStore};
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds, fails with something other than a
/// conflict, or runs out of attempts.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Err(e) if e.is_conflict() && attempt < config.max_attempts => {
                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = jittered.as_millis(),
                    "Conflict, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
            }
            result => return result,
        }
    }
}

/// Re-reads the named object, applies `mutate` and writes metadata and spec back.
/// `mutate` returns false when there is nothing to write.
pub async fn update_with_retry<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<K>
where
    K: Object,
    S: ObjectStore,
    F: Fn(&mut K) -> bool + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(&RetryConfig::default(), "update", || async move {
        let mut obj = store
            .get::<K>(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found::<K>(name))?;
        if !mutate(&mut obj) {
            return Ok(obj);
        }
        store.replace(namespace, &obj).await
    })
    .await
}

/// Like [`update_with_retry`] but writes only the status
pub async fn update_status_with_retry<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<K>
where
    K: Object,
    S: ObjectStore,
    F: Fn(&mut K) -> bool + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(&RetryConfig::default(), "update_status", || async move {
        let mut obj = store
            .get::<K>(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found::<K>(name))?;
        if !mutate(&mut obj) {
            return Ok(obj);
        }
        store.replace_status(namespace, &obj).await
    })
    .await
}
