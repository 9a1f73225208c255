//! Test case execution
//!
//! The queue drives each test case through two phases: sending the synthetic
//! email and waiting for the AI pipeline to produce an extraction result.
//! `SimulatedExecutor` stands in for the real mail provider and extraction
//! service with random latency and an injected failure rate.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SimulatorConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("email delivery failed: {0}")]
    EmailDelivery(String),

    #[error("AI processing failed: {0}")]
    Processing(String),
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Deliver the synthetic email for a test case.
    async fn send_email(&self, test_case_id: &str) -> Result<(), TaskError>;

    /// Wait for the extraction and return the produced result ID.
    async fn process(&self, test_case_id: &str) -> Result<String, TaskError>;
}

pub struct SimulatedExecutor {
    config: SimulatorConfig,
}

impl SimulatedExecutor {
    pub fn new(config: SimulatorConfig) -> Self {
        let mut config = config;
        config.success_rate = config.success_rate.clamp(0.0, 1.0);
        Self { config }
    }

    fn random_delay(range: (u64, u64)) -> Duration {
        let (min, max) = range;
        let ms = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn send_email(&self, test_case_id: &str) -> Result<(), TaskError> {
        let delay = Self::random_delay(self.config.email_delay_ms);
        tracing::debug!("Simulating email send for {} ({} ms)", test_case_id, delay.as_millis());
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn process(&self, test_case_id: &str) -> Result<String, TaskError> {
        let delay = Self::random_delay(self.config.ai_delay_ms);
        tokio::time::sleep(delay).await;

        let succeeded = rand::thread_rng().gen_bool(self.config.success_rate);
        if succeeded {
            Ok(format!("result_{}_{}", test_case_id, Uuid::new_v4().simple()))
        } else {
            Err(TaskError::Processing(format!(
                "simulated extraction failure for {}",
                test_case_id
            )))
        }
    }
}
