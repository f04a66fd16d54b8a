//! Bounded worker pool for one provider.
//!
//! Every call through the pool holds one of the provider's concurrency
//! permits, is cut off after the provider's timeout, and is retried per the
//! provider's retry policy.

use crate::models::{GenerationError, PairgenError, ProviderConfig, Result};
use crate::provider::{
    OutputSchema, ProviderAdapter, RetryOutcome, RetryPolicy, StructuredResult, build_adapter,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

/// A provider adapter wrapped with its concurrency cap, timeout and retries.
pub struct ProviderPool {
    adapter: Arc<dyn ProviderAdapter>,
    /// Max concurrent in-flight calls
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ProviderPool {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        concurrency: usize,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            adapter,
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            retry,
            timeout,
        }
    }

    /// Build the pool for a configured provider.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self::new(
            build_adapter(config)?,
            config.concurrency,
            RetryPolicy::from_config(config),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    pub fn id(&self) -> &str {
        self.adapter.id()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// One deadline-bounded adapter call.
    async fn attempt(
        &self,
        prompt: &str,
        schema: &OutputSchema,
    ) -> std::result::Result<StructuredResult, GenerationError> {
        match tokio::time::timeout(self.timeout, self.adapter.generate(prompt, schema)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::timeout(format!(
                "no reply within {}s",
                self.timeout.as_secs_f64()
            ))),
        }
    }

    /// Generate under a concurrency permit, retrying transient failures.
    ///
    /// The returned outcome holds the terminal error when the retry budget
    /// is spent.
    pub async fn generate(
        &self,
        label: &str,
        prompt: &str,
        schema: &OutputSchema,
    ) -> Result<RetryOutcome<StructuredResult>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PairgenError::Internal("Semaphore closed".to_string()))?;

        let start = Instant::now();
        let outcome = self.retry.run(label, || self.attempt(prompt, schema)).await;

        debug!(
            provider = %self.id(),
            job = label,
            attempts = outcome.attempts,
            ok = outcome.result.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Provider call finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GenerationErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps, tracking how many calls overlap.
    struct SlowAdapter {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowAdapter {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for SlowAdapter {
        fn id(&self) -> &str {
            "slow"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _schema: &OutputSchema,
        ) -> std::result::Result<StructuredResult, GenerationError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(StructuredResult::from_pairs([("instruction", "a"), ("response", "b")]))
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_retried() {
        let adapter = Arc::new(SlowAdapter::new(Duration::from_millis(200)));
        let pool = ProviderPool::new(
            adapter,
            1,
            RetryPolicy::new(1, Duration::ZERO),
            Duration::from_millis(10),
        );

        let outcome = pool.generate("job", "p", &OutputSchema::default()).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap_err().kind, GenerationErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let adapter = Arc::new(SlowAdapter::new(Duration::from_millis(20)));
        let pool = Arc::new(ProviderPool::new(
            adapter.clone(),
            2,
            RetryPolicy::none(),
            Duration::from_secs(5),
        ));

        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.generate(&format!("job-{i}"), "p", &OutputSchema::default())
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().result.is_ok());
        }

        assert_eq!(adapter.peak.load(Ordering::SeqCst), 2);
    }
}
