use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::ledger::{LedgerError, WebhookLedger};
use crate::router::EventRouter;
use crate::types::ProcessingResult;

/// Retries beyond this count are refused.
pub const MAX_RETRIES: u32 = 5;

/// Only this many recent failures are eligible for retry.
pub const RECENT_FAILURE_WINDOW: usize = 100;

/// Advisory delays for an external scheduler, indexed by the record's current
/// retry count. The coordinator itself retries immediately when invoked.
pub const BACKOFF_SCHEDULE_SECONDS: [u64; 5] = [1, 5, 15, 60, 300];

#[must_use]
pub fn backoff_delay(retry_count: u32) -> Duration {
    let seconds = BACKOFF_SCHEDULE_SECONDS
        .get(retry_count as usize)
        .copied()
        .unwrap_or(BACKOFF_SCHEDULE_SECONDS[BACKOFF_SCHEDULE_SECONDS.len() - 1]);
    Duration::from_secs(seconds)
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("no recent failed webhook record matches {0}")]
    NotFound(String),
    #[error("webhook record {id} has exhausted its {max_retries} retries")]
    Exhausted { id: String, max_retries: u32 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl RetryError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "record_not_found",
            Self::Exhausted { .. } => "retry_exhausted",
            Self::Ledger(_) => "ledger_unavailable",
        }
    }
}

/// Re-submits a previously failed delivery through the normal pipeline under
/// retry bookkeeping rules. The retry's own outcome lives in its own new
/// record; only the retry counter and timestamp of the original move.
pub struct RetryCoordinator {
    ledger: Arc<dyn WebhookLedger>,
    router: Arc<EventRouter>,
}

impl RetryCoordinator {
    pub fn new(ledger: Arc<dyn WebhookLedger>, router: Arc<EventRouter>) -> Self {
        Self { ledger, router }
    }

    pub async fn retry(&self, id: &str) -> Result<ProcessingResult, RetryError> {
        let failures = self.ledger.recent_failures(RECENT_FAILURE_WINDOW).await?;
        let original = failures
            .into_iter()
            .find(|record| record.id == id)
            .ok_or_else(|| RetryError::NotFound(id.to_string()))?;

        if original.retry_count >= MAX_RETRIES {
            return Err(RetryError::Exhausted {
                id: original.id,
                max_retries: MAX_RETRIES,
            });
        }

        let retry_id = format!("retry_{}_{}", original.id, Utc::now().timestamp_millis());
        tracing::info!(
            original = %original.id,
            retry = %retry_id,
            attempt = original.retry_count + 1,
            "retrying failed webhook"
        );
        let result = self
            .router
            .process(
                &original.event_type,
                original.payload.clone(),
                "retry",
                Some(&retry_id),
                None,
            )
            .await;

        let mut bumped = original;
        bumped.retry_count += 1;
        bumped.created_at = Utc::now();
        if let Err(error) = self.ledger.update(bumped).await {
            tracing::error!(id, reason = %error, "failed to bump retry counter");
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{MAX_RETRIES, RetryCoordinator, RetryError, backoff_delay};
    use crate::ledger::{InMemoryWebhookLedger, WebhookLedger};
    use crate::rate_limit::FixedWindowLimiter;
    use crate::registry::ConnectionRegistry;
    use crate::reward::testing::RecordingRewardLedger;
    use crate::router::{EventRouter, RouterPolicy};
    use crate::types::WebhookRecord;

    struct Fixture {
        coordinator: RetryCoordinator,
        ledger: Arc<InMemoryWebhookLedger>,
        rewards: Arc<RecordingRewardLedger>,
    }

    fn build_fixture() -> Fixture {
        let ledger = Arc::new(InMemoryWebhookLedger::new(256));
        let rewards = Arc::new(RecordingRewardLedger::new());
        let router = Arc::new(EventRouter::new(
            Arc::new(FixedWindowLimiter::new(60_000, 1_000)),
            ledger.clone(),
            rewards.clone(),
            Arc::new(ConnectionRegistry::new()),
            RouterPolicy::default(),
        ));
        Fixture {
            coordinator: RetryCoordinator::new(ledger.clone(), router),
            ledger,
            rewards,
        }
    }

    fn failed_record(id: &str, retry_count: u32) -> WebhookRecord {
        let mut record = WebhookRecord::pre_image(
            id,
            "fixflow",
            "reward.completed",
            json!({"customer_id": "customer-1", "shop_id": "shop-9", "amount": 25.0}),
        );
        record.processed = true;
        record.result = Some(json!({"success": false, "error": "downstream unavailable"}));
        record.retry_count = retry_count;
        record
    }

    #[test]
    fn the_backoff_schedule_is_fixed_and_saturating() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(60));
        assert_eq!(backoff_delay(4), Duration::from_secs(300));
        assert_eq!(backoff_delay(40), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn an_unknown_id_is_not_found() {
        let fixture = build_fixture();
        let error = fixture
            .coordinator
            .retry("evt_ghost")
            .await
            .expect_err("should miss");
        assert!(matches!(error, RetryError::NotFound(_)));
        assert_eq!(fixture.rewards.call_count().await, 0);
    }

    #[tokio::test]
    async fn an_exhausted_record_is_refused_without_dispatch() {
        let fixture = build_fixture();
        fixture
            .ledger
            .append(failed_record("evt_tired", MAX_RETRIES))
            .await
            .expect("append");

        let error = fixture
            .coordinator
            .retry("evt_tired")
            .await
            .expect_err("should refuse");
        assert!(matches!(error, RetryError::Exhausted { max_retries: 5, .. }));
        assert_eq!(fixture.rewards.call_count().await, 0);
    }

    #[tokio::test]
    async fn a_retry_reenters_the_pipeline_and_bumps_the_original() {
        let fixture = build_fixture();
        fixture
            .ledger
            .append(failed_record("evt_1", 0))
            .await
            .expect("append");

        let result = fixture.coordinator.retry("evt_1").await.expect("retry");
        assert!(result.success);
        assert!(result.id.starts_with("retry_evt_1_"));

        let retry_record = fixture.ledger.get(&result.id).await.expect("retry record");
        assert_eq!(retry_record.source, "retry");
        assert_eq!(retry_record.retry_count, 0);

        let original = fixture.ledger.get("evt_1").await.expect("original");
        assert_eq!(original.retry_count, 1);
        // The retry's outcome lives only in its own record.
        assert!(original.is_failure());
    }

    #[tokio::test]
    async fn a_successful_record_is_not_retryable() {
        let fixture = build_fixture();
        let mut record = failed_record("evt_ok", 0);
        record.result = Some(json!({"success": true, "transaction_ref": "txn_1"}));
        fixture.ledger.append(record).await.expect("append");

        let error = fixture
            .coordinator
            .retry("evt_ok")
            .await
            .expect_err("successes are not in the failure window");
        assert!(matches!(error, RetryError::NotFound(_)));
    }
}
