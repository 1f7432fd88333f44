use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::ledger::WebhookLedger;
use crate::rate_limit::FixedWindowLimiter;
use crate::registry::ConnectionRegistry;
use crate::reward::{RewardLedger, RewardReceipt};
use crate::types::{Notification, ProcessingResult, ServerFrame, WebhookRecord};

/// Closed set of webhook event kinds. Adding a kind is a compile-time-checked
/// change: `parse` and the dispatch match must both name it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    RewardCompleted,
    ReferralVerified,
    EngagementConversion,
    RecipientRegistered,
}

impl EventKind {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reward.completed" => Some(Self::RewardCompleted),
            "referral.verified" => Some(Self::ReferralVerified),
            "engagement.conversion" => Some(Self::EngagementConversion),
            "recipient.registered" => Some(Self::RecipientRegistered),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RewardCompleted => "reward.completed",
            Self::ReferralVerified => "referral.verified",
            Self::EngagementConversion => "engagement.conversion",
            Self::RecipientRegistered => "recipient.registered",
        }
    }
}

/// Token-effect knobs applied by the handlers.
#[derive(Clone, Debug)]
pub struct RouterPolicy {
    pub reward_min_amount: f64,
    pub tier_bonus_threshold: f64,
    pub tier_bonus_rate: f64,
    pub referral_bonus_amount: f64,
    pub welcome_bonus_amount: f64,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            reward_min_amount: 0.01,
            tier_bonus_threshold: 100.0,
            tier_bonus_rate: 0.1,
            referral_bonus_amount: 10.0,
            welcome_bonus_amount: 5.0,
        }
    }
}

struct HandlerOutcome {
    success: bool,
    transaction_ref: Option<String>,
    message: Option<String>,
    error: Option<String>,
    notification: Option<Notification>,
}

impl HandlerOutcome {
    fn completed(receipt: RewardReceipt, notification: Option<Notification>) -> Self {
        Self {
            success: true,
            transaction_ref: Some(receipt.transaction_ref),
            message: receipt.message,
            error: None,
            notification,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_ref: None,
            message: None,
            error: Some(error.into()),
            notification: None,
        }
    }
}

/// Routes a validated delivery to exactly one handler and keeps the audit
/// trail around it: pre-image append before dispatch, result update after.
///
/// Idempotency is deliberately absent: the same logical event delivered
/// twice produces two records and two downstream effects.
pub struct EventRouter {
    limiter: Arc<FixedWindowLimiter>,
    ledger: Arc<dyn WebhookLedger>,
    rewards: Arc<dyn RewardLedger>,
    registry: Arc<ConnectionRegistry>,
    policy: RouterPolicy,
}

impl EventRouter {
    pub fn new(
        limiter: Arc<FixedWindowLimiter>,
        ledger: Arc<dyn WebhookLedger>,
        rewards: Arc<dyn RewardLedger>,
        registry: Arc<ConnectionRegistry>,
        policy: RouterPolicy,
    ) -> Self {
        Self {
            limiter,
            ledger,
            rewards,
            registry,
            policy,
        }
    }

    pub async fn process(
        &self,
        event_type: &str,
        payload: Value,
        source: &str,
        caller_id: Option<&str>,
        source_ip: Option<&str>,
    ) -> ProcessingResult {
        let started = Instant::now();
        let id = caller_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| generate_event_id(source));

        let rate_key = format!("{source}_{}", source_ip.unwrap_or("unknown"));
        let decision = self.limiter.check(&rate_key).await;
        if !decision.allowed {
            tracing::warn!(source, key = %rate_key, "webhook delivery rate limited");
            return ProcessingResult {
                success: false,
                id,
                transaction_ref: None,
                message: None,
                error: Some("rate limit exceeded".to_string()),
                processing_time_ms: started.elapsed().as_millis() as u64,
                rate_limited: true,
                retry_after_seconds: decision.retry_after_seconds,
            };
        }

        // Durable pre-image: a crash mid-handler still leaves a traceable
        // unfinished record.
        let record = WebhookRecord::pre_image(&id, source, event_type, payload.clone());
        if let Err(error) = self.ledger.append(record.clone()).await {
            tracing::error!(id = %id, reason = %error, "webhook pre-image append failed");
        }

        let outcome = match EventKind::parse(event_type) {
            Some(kind) => self.dispatch(kind, &payload).await,
            None => {
                tracing::warn!(id = %id, event_type, source, "unknown event type");
                HandlerOutcome::failed("unknown event type")
            }
        };

        if let Some(notification) = &outcome.notification {
            let delivered = self
                .registry
                .send_to_recipient(
                    &notification.recipient_id,
                    &ServerFrame::Notification(notification.clone()),
                )
                .await;
            tracing::debug!(
                recipient = %notification.recipient_id,
                delivered,
                "notification push attempted"
            );
        }

        let processing_time_ms = started.elapsed().as_millis() as u64;
        let mut finished = record;
        finished.processed = true;
        finished.processing_time_ms = Some(processing_time_ms);
        finished.result = Some(json!({
            "success": outcome.success,
            "transaction_ref": outcome.transaction_ref,
            "message": outcome.message,
            "error": outcome.error,
        }));
        if let Err(error) = self.ledger.update(finished).await {
            // Best-effort from the caller's perspective; the handler result
            // still goes back unchanged.
            tracing::error!(id = %id, reason = %error, "webhook result update failed");
        }

        ProcessingResult {
            success: outcome.success,
            id,
            transaction_ref: outcome.transaction_ref,
            message: outcome.message,
            error: outcome.error,
            processing_time_ms,
            rate_limited: false,
            retry_after_seconds: None,
        }
    }

    async fn dispatch(&self, kind: EventKind, payload: &Value) -> HandlerOutcome {
        match kind {
            EventKind::RewardCompleted => self.handle_reward_completed(payload).await,
            EventKind::ReferralVerified => self.handle_referral_verified(payload).await,
            EventKind::EngagementConversion => self.handle_engagement_conversion(payload).await,
            EventKind::RecipientRegistered => self.handle_recipient_registered(payload).await,
        }
    }

    async fn handle_reward_completed(&self, payload: &Value) -> HandlerOutcome {
        let customer_id = match require_str(payload, "customer_id") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let shop_id = match require_str(payload, "shop_id") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let amount = match require_amount(payload, "amount") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        if amount < self.policy.reward_min_amount {
            return HandlerOutcome::failed(format!(
                "amount {amount} is below the minimum of {}",
                self.policy.reward_min_amount
            ));
        }

        match self
            .rewards
            .process_event("reward", customer_id, amount, Some(shop_id))
            .await
        {
            Ok(receipt) => {
                self.apply_tier_bonus(customer_id, amount, shop_id).await;
                let notification = Notification::new(
                    customer_id,
                    "reward",
                    "Tokens earned",
                    format!("You earned a reward worth {amount} tokens."),
                    json!({"amount": amount, "shop_id": shop_id}),
                );
                HandlerOutcome::completed(receipt, Some(notification))
            }
            Err(error) => {
                tracing::warn!(customer = customer_id, reason = %error, "reward event failed");
                HandlerOutcome::failed(error.to_string())
            }
        }
    }

    /// Secondary enrichment on large rewards. Its failure never fails the
    /// primary transaction, which has already settled.
    async fn apply_tier_bonus(&self, customer_id: &str, amount: f64, shop_id: &str) {
        if amount < self.policy.tier_bonus_threshold {
            return;
        }
        let bonus = amount * self.policy.tier_bonus_rate;
        if let Err(error) = self
            .rewards
            .process_event("tier_bonus", customer_id, bonus, Some(shop_id))
            .await
        {
            tracing::warn!(customer = customer_id, bonus, reason = %error, "tier bonus skipped");
        }
    }

    async fn handle_referral_verified(&self, payload: &Value) -> HandlerOutcome {
        let referrer_id = match require_str(payload, "referrer_id") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let referred_id = match require_str(payload, "referred_id") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let shop_id = optional_str(payload, "shop_id");
        let amount = self.policy.referral_bonus_amount;

        match self
            .rewards
            .process_event("referral", referrer_id, amount, shop_id)
            .await
        {
            Ok(receipt) => {
                let notification = Notification::new(
                    referrer_id,
                    "referral",
                    "Referral verified",
                    format!("Your referral was verified; {amount} tokens are on the way."),
                    json!({"amount": amount, "referred_id": referred_id}),
                );
                HandlerOutcome::completed(receipt, Some(notification))
            }
            Err(error) => {
                tracing::warn!(referrer = referrer_id, reason = %error, "referral event failed");
                HandlerOutcome::failed(error.to_string())
            }
        }
    }

    async fn handle_engagement_conversion(&self, payload: &Value) -> HandlerOutcome {
        let customer_id = match require_str(payload, "customer_id") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let campaign_id = match require_str(payload, "campaign_id") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let amount = match require_amount(payload, "amount") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let shop_id = optional_str(payload, "shop_id");

        match self
            .rewards
            .process_event("engagement", customer_id, amount, shop_id)
            .await
        {
            Ok(receipt) => {
                let notification = Notification::new(
                    customer_id,
                    "engagement",
                    "Campaign reward",
                    format!("Campaign {campaign_id} earned you {amount} tokens."),
                    json!({"amount": amount, "campaign_id": campaign_id}),
                );
                HandlerOutcome::completed(receipt, Some(notification))
            }
            Err(error) => {
                tracing::warn!(customer = customer_id, campaign = campaign_id, reason = %error, "engagement event failed");
                HandlerOutcome::failed(error.to_string())
            }
        }
    }

    async fn handle_recipient_registered(&self, payload: &Value) -> HandlerOutcome {
        let customer_id = match require_str(payload, "customer_id") {
            Ok(value) => value,
            Err(error) => return HandlerOutcome::failed(error),
        };
        let shop_id = optional_str(payload, "shop_id");
        let amount = self.policy.welcome_bonus_amount;

        match self
            .rewards
            .process_event("welcome", customer_id, amount, shop_id)
            .await
        {
            Ok(receipt) => {
                let notification = Notification::new(
                    customer_id,
                    "welcome",
                    "Welcome aboard",
                    format!("Your account is ready; {amount} welcome tokens were credited."),
                    json!({"amount": amount}),
                );
                HandlerOutcome::completed(receipt, Some(notification))
            }
            Err(error) => {
                tracing::warn!(customer = customer_id, reason = %error, "welcome event failed");
                HandlerOutcome::failed(error.to_string())
            }
        }
    }
}

fn generate_event_id(source: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{source}_{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

fn require_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing required field {field}"))
}

fn optional_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn require_amount(payload: &Value, field: &str) -> Result<f64, String> {
    let amount = payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing required field {field}"))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(format!("field {field} must be a non-negative number"));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{EventKind, EventRouter, RouterPolicy};
    use crate::ledger::InMemoryWebhookLedger;
    use crate::rate_limit::FixedWindowLimiter;
    use crate::registry::ConnectionRegistry;
    use crate::reward::testing::RecordingRewardLedger;

    fn build_router(
        limiter_max: u32,
    ) -> (
        EventRouter,
        Arc<InMemoryWebhookLedger>,
        Arc<RecordingRewardLedger>,
    ) {
        let ledger = Arc::new(InMemoryWebhookLedger::new(64));
        let rewards = Arc::new(RecordingRewardLedger::new());
        let router = EventRouter::new(
            Arc::new(FixedWindowLimiter::new(60_000, limiter_max)),
            ledger.clone(),
            rewards.clone(),
            Arc::new(ConnectionRegistry::new()),
            RouterPolicy::default(),
        );
        (router, ledger, rewards)
    }

    #[test]
    fn the_event_kind_set_is_closed() {
        assert_eq!(
            EventKind::parse("reward.completed"),
            Some(EventKind::RewardCompleted)
        );
        assert_eq!(
            EventKind::parse(" Referral.Verified "),
            Some(EventKind::ReferralVerified)
        );
        assert_eq!(EventKind::parse("invoice.payment_succeeded"), None);
    }

    #[tokio::test]
    async fn a_valid_reward_event_settles_and_is_audited() {
        let (router, ledger, rewards) = build_router(100);
        let result = router
            .process(
                "reward.completed",
                json!({"customer_id": "customer-1", "shop_id": "shop-9", "amount": 25.0}),
                "fixflow",
                None,
                Some("203.0.113.5"),
            )
            .await;

        assert!(result.success);
        assert!(result.transaction_ref.is_some());
        assert!(result.id.starts_with("fixflow_"));
        assert_eq!(rewards.call_count().await, 1);

        let stored = ledger.get(&result.id).await.expect("audited");
        assert!(stored.processed);
        assert!(stored.succeeded());
        assert!(stored.processing_time_ms.is_some());
    }

    #[tokio::test]
    async fn the_same_logical_event_twice_produces_two_records() {
        let (router, ledger, _) = build_router(100);
        let payload = json!({"customer_id": "customer-1", "shop_id": "shop-9", "amount": 25.0});
        let first = router
            .process("reward.completed", payload.clone(), "fixflow", None, None)
            .await;
        let second = router
            .process("reward.completed", payload, "fixflow", None, None)
            .await;

        assert_ne!(first.id, second.id);
        assert_eq!(ledger.len().await, 2);
    }

    #[tokio::test]
    async fn an_unknown_event_type_fails_but_is_still_audited_once() {
        let (router, ledger, rewards) = build_router(100);
        let result = router
            .process("invoice.created", json!({}), "fixflow", None, None)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unknown event type"));
        assert_eq!(ledger.len().await, 1);
        assert_eq!(rewards.call_count().await, 0);

        let stored = ledger.get(&result.id).await.expect("audited");
        assert!(stored.is_failure());
    }

    #[tokio::test]
    async fn a_rate_limited_delivery_writes_nothing() {
        let (router, ledger, _) = build_router(1);
        let payload = json!({"customer_id": "customer-1", "shop_id": "shop-9", "amount": 25.0});
        router
            .process(
                "reward.completed",
                payload.clone(),
                "fixflow",
                None,
                Some("203.0.113.5"),
            )
            .await;
        let limited = router
            .process(
                "reward.completed",
                payload,
                "fixflow",
                None,
                Some("203.0.113.5"),
            )
            .await;

        assert!(limited.rate_limited);
        assert!(!limited.success);
        assert!(limited.retry_after_seconds.is_some());
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn a_below_minimum_amount_is_a_validation_failure() {
        let (router, _, rewards) = build_router(100);
        let result = router
            .process(
                "reward.completed",
                json!({"customer_id": "customer-1", "shop_id": "shop-9", "amount": 0.001}),
                "fixflow",
                None,
                None,
            )
            .await;

        assert!(!result.success);
        assert!(result.error.expect("error").contains("below the minimum"));
        assert_eq!(rewards.call_count().await, 0);
    }

    #[tokio::test]
    async fn a_large_reward_triggers_the_tier_bonus_best_effort() {
        let (router, _, rewards) = build_router(100);
        let result = router
            .process(
                "reward.completed",
                json!({"customer_id": "customer-1", "shop_id": "shop-9", "amount": 150.0}),
                "fixflow",
                None,
                None,
            )
            .await;
        assert!(result.success);

        let calls = rewards.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].kind, "tier_bonus");
        assert!((calls[1].amount - 15.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn a_downstream_failure_becomes_a_structured_result() {
        let (router, ledger, rewards) = build_router(100);
        rewards.fail_with(Some("ledger offline")).await;
        let result = router
            .process(
                "reward.completed",
                json!({"customer_id": "customer-1", "shop_id": "shop-9", "amount": 25.0}),
                "fixflow",
                None,
                None,
            )
            .await;

        assert!(!result.success);
        assert!(result.error.expect("error").contains("ledger offline"));
        let stored = ledger.get(&result.id).await.expect("audited");
        assert!(stored.is_failure());
    }

    #[tokio::test]
    async fn a_caller_supplied_id_is_preserved() {
        let (router, ledger, _) = build_router(100);
        let result = router
            .process(
                "recipient.registered",
                json!({"customer_id": "customer-7"}),
                "fixflow",
                Some("evt_custom_1"),
                None,
            )
            .await;
        assert_eq!(result.id, "evt_custom_1");
        assert!(ledger.get("evt_custom_1").await.is_some());
    }
}
