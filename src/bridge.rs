use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::agent::{AgentError, ModelService};
use crate::capture::Screenshot;
use crate::cua::{ActionRequest, ComputerCallOutput, ModelResponse, OpeningTurn};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 500, max_delay_ms: 8_000 }
    }
}

impl RetryConfig {
    /// `min(max_delay, base_delay * 2^attempt)`, attempt is zero-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(31));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// Every call to the model service goes through here.
pub struct ResponseBridge<M> {
    model: M,
    retry: RetryConfig,
    acknowledge_safety_checks: bool,
}

impl<M: ModelService> ResponseBridge<M> {
    pub fn new(model: M, retry: RetryConfig) -> Self {
        Self { model, retry, acknowledge_safety_checks: true }
    }

    pub fn acknowledge_safety_checks(mut self, yes: bool) -> Self {
        self.acknowledge_safety_checks = yes;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// First request of a run: task text plus the seed screenshot.
    pub async fn open(
        &self,
        instructions: &str,
        task: &str,
        seed: Screenshot,
    ) -> Result<ModelResponse, AgentError> {
        let turn = OpeningTurn {
            instructions: instructions.to_string(),
            task: task.to_string(),
            image_url: seed.data_url(),
        };
        drop(seed);
        let resp = self.with_retry("open", || self.model.open(&turn)).await?;
        info!(response_id = %resp.id, "initial model response");
        Ok(resp)
    }

    /// Answers `action`'s call with `screenshot` and returns the model's next response.
    pub async fn advance(
        &self,
        prior: &ModelResponse,
        action: &ActionRequest,
        screenshot: Screenshot,
    ) -> Result<ModelResponse, AgentError> {
        let acknowledged = if self.acknowledge_safety_checks {
            action.pending_safety_checks.clone()
        } else {
            Vec::new()
        };
        if !acknowledged.is_empty() {
            warn!(call_id = %action.call_id, checks = acknowledged.len(), "acknowledging safety checks");
        }
        let output = ComputerCallOutput {
            call_id: action.call_id.clone(),
            image_url: screenshot.data_url(),
            acknowledged_safety_checks: acknowledged,
        };
        drop(screenshot);
        let resp = self
            .with_retry("advance", || self.model.continue_turn(&prior.id, &output))
            .await?;
        info!(previous = %prior.id, response_id = %resp.id, "received new response");
        Ok(resp)
    }

    async fn with_retry<F, Fut>(&self, op: &str, mut call: F) -> Result<ModelResponse, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<ModelResponse, AgentError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(resp) => return Ok(resp),
                Err(AgentError::Model { message, retryable: true }) if attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(op, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %message, "model call failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let r = RetryConfig { max_retries: 5, base_delay_ms: 500, max_delay_ms: 3_000 };
        assert_eq!(r.backoff(0), Duration::from_millis(500));
        assert_eq!(r.backoff(1), Duration::from_millis(1_000));
        assert_eq!(r.backoff(2), Duration::from_millis(2_000));
        assert_eq!(r.backoff(3), Duration::from_millis(3_000));
        assert_eq!(r.backoff(40), Duration::from_millis(3_000));
    }
}
