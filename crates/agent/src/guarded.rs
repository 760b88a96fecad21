use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::retry::{RetryError, RetryPolicy};
use tokio::sync::Semaphore;

use crate::llm::{LlmError, LlmGateway, LlmRequest, LlmResponse};

/// Caps outstanding calls per process and retries transient failures.
///
/// A permit is held only while a request is in flight, so calls sleeping in
/// backoff do not block other jobs.
pub struct GuardedGateway<G> {
    inner: G,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl<G: LlmGateway> GuardedGateway<G> {
    pub fn new(inner: G, max_concurrency: usize, policy: RetryPolicy) -> Self {
        Self { inner, permits: Arc::new(Semaphore::new(max_concurrency.max(1))), policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn attempt(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Client("llm concurrency limiter closed".to_string()))?;
        self.inner.call(request).await
    }
}

#[async_trait]
impl<G: LlmGateway> LlmGateway for GuardedGateway<G> {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.policy
            .run("llm.call", || self.attempt(request), LlmError::is_retryable)
            .await
            .map_err(|error| match error {
                RetryError::Fatal(error) => error,
                RetryError::Exhausted { attempts, last } => {
                    tracing::error!(
                        event_name = "llm.call.exhausted",
                        attempts,
                        model = %request.model,
                        error = %last,
                        "llm call failed after retries"
                    );
                    LlmError::RetriesExhausted { attempts, last: Box::new(last) }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use huddle_core::domain::run::TokenUsage;
    use huddle_core::retry::RetryPolicy;

    use super::GuardedGateway;
    use crate::llm::{LlmError, LlmGateway, LlmRequest, LlmResponse};
    use crate::scripted::ScriptedGateway;

    fn request() -> LlmRequest {
        LlmRequest {
            system_prompt: "system".to_string(),
            developer_context: String::new(),
            user_payload: "payload".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 100,
        }
    }

    fn instant(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn transient_statuses_are_retried() {
        let scripted = ScriptedGateway::new()
            .then_error(LlmError::Status { status: 429, body: "slow down".to_string() })
            .then_error(LlmError::Timeout)
            .then_text("{}");
        let gateway = GuardedGateway::new(scripted, 2, instant(4));

        let response = gateway.call(&request()).await.expect("third attempt succeeds");

        assert_eq!(response.raw_text, "{}");
        assert_eq!(gateway.inner().call_count(), 3);
        assert_eq!(gateway.available_permits(), 2);
    }

    #[tokio::test]
    async fn client_errors_propagate_immediately() {
        let scripted = ScriptedGateway::new()
            .then_error(LlmError::Status { status: 400, body: "bad request".to_string() })
            .then_text("{}");
        let gateway = GuardedGateway::new(scripted, 1, instant(4));

        let error = gateway.call(&request()).await.unwrap_err();

        assert!(matches!(error, LlmError::Status { status: 400, .. }));
        assert_eq!(gateway.inner().call_count(), 1);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let scripted = ScriptedGateway::new()
            .then_error(LlmError::Status { status: 503, body: String::new() })
            .then_error(LlmError::Status { status: 502, body: String::new() });
        let gateway = GuardedGateway::new(scripted, 1, instant(2));

        let error = gateway.call(&request()).await.unwrap_err();

        match error {
            LlmError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, LlmError::Status { status: 502, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// Sleeps inside the call and records the peak number of concurrent calls.
    #[derive(Default)]
    struct SlowGateway {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LlmGateway for SlowGateway {
        async fn call(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(LlmResponse::from_text("{}".to_string(), "slow".to_string(), TokenUsage::default()))
        }
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let gateway = Arc::new(GuardedGateway::new(SlowGateway::default(), 2, instant(1)));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move { gateway.call(&request()).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("call");
        }

        assert_eq!(gateway.inner().peak.load(Ordering::SeqCst), 2);
    }
}
