//! Retry-hardened storage access.
//!
//! [`RetryingStore`] wraps any [`StorageBackend`] and retries transient
//! failures with exponential backoff and jitter. Terminal failures are
//! returned on the first attempt. When the attempt budget is spent, the
//! last error is returned unchanged.

use bytes::Bytes;
use metrics::counter;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::backend::{ObjectInfo, PutOptions, StorageBackend, StoredObject};
use super::error::{StorageError, StorageResult};
use crate::metrics::{STORAGE_OPERATIONS_TOTAL, STORAGE_RETRIES_TOTAL};
use crate::range::StorageRange;

/// Backoff parameters for storage calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay, before jitter.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure (1-based), with
    /// +/-20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let delay_ms = (base_ms * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64() * 1000.0);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64((delay_ms * jitter).max(0.0) / 1000.0)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// A storage backend decorator that retries transient failures.
pub struct RetryingStore {
    inner: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn StorageBackend>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails terminally, or the attempt budget
    /// is exhausted.
    async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let attempts = self.policy.attempts();
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    counter!(STORAGE_OPERATIONS_TOTAL, "operation" => operation, "status" => "ok")
                        .increment(1);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "storage {} attempt {}/{} failed, retrying in {:?}: {}",
                        operation, attempt, attempts, delay, e
                    );
                    counter!(STORAGE_RETRIES_TOTAL, "operation" => operation).increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(
                            "storage {} failed after {} attempts: {}",
                            operation, attempt, e
                        );
                    } else {
                        debug!("storage {} failed terminally: {}", operation, e);
                    }
                    counter!(STORAGE_OPERATIONS_TOTAL, "operation" => operation, "status" => "error")
                        .increment(1);
                    return Err(e);
                }
            }
        }
    }
}

impl StorageBackend for RetryingStore {
    fn get(
        &self,
        key: &str,
        range: Option<StorageRange>,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<StoredObject>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            match self.run("get", || self.inner.get(&key, range)).await {
                Err(StorageError::NotFound(_)) => Ok(None),
                other => other,
            }
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<Option<ObjectInfo>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            match self.run("head", || self.inner.head(&key)).await {
                Err(StorageError::NotFound(_)) => Ok(None),
                other => other,
            }
        })
    }

    fn put(
        &self,
        key: &str,
        data: Bytes,
        options: PutOptions,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            // Full-overwrite semantics make repeating the write safe.
            self.run("put", || self.inner.put(&key, data.clone(), options.clone()))
                .await
        })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move { self.run("delete", || self.inner.delete(&key)).await })
    }

    fn put_segment(
        &self,
        upload_key: &str,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = StorageResult<String>> + Send + '_>> {
        let upload_key = upload_key.to_string();
        Box::pin(async move {
            self.run("put_segment", || {
                self.inner.put_segment(&upload_key, offset, data.clone())
            })
            .await
        })
    }

    fn assemble_segments(
        &self,
        key: &str,
        upload_key: &str,
        offsets: &[u64],
        options: PutOptions,
    ) -> Pin<Box<dyn Future<Output = StorageResult<ObjectInfo>> + Send + '_>> {
        let key = key.to_string();
        let upload_key = upload_key.to_string();
        let offsets = offsets.to_vec();
        Box::pin(async move {
            self.run("assemble_segments", || {
                self.inner
                    .assemble_segments(&key, &upload_key, &offsets, options.clone())
            })
            .await
        })
    }

    fn delete_segments(
        &self,
        upload_key: &str,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + '_>> {
        let upload_key = upload_key.to_string();
        Box::pin(async move {
            self.run("delete_segments", || self.inner.delete_segments(&upload_key))
                .await
        })
    }
}
