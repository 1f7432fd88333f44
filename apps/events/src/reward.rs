use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("reward ledger rejected event: {0}")]
    Rejected(String),
    #[error("reward ledger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RewardReceipt {
    pub transaction_ref: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// The reward/token-ledger collaborator. The core never computes token
/// effects itself; it hands a validated event to this interface and records
/// whatever comes back.
#[async_trait]
pub trait RewardLedger: Send + Sync {
    async fn process_event(
        &self,
        kind: &str,
        subject_id: &str,
        amount: f64,
        shop_id: Option<&str>,
    ) -> Result<RewardReceipt, RewardError>;
}

#[derive(Debug, Serialize)]
struct LedgerEventRequest<'a> {
    kind: &'a str,
    subject_id: &'a str,
    amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    shop_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct LedgerEventResponse {
    success: bool,
    #[serde(default)]
    transaction_ref: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Out-of-process reward ledger reached over HTTP.
pub struct HttpRewardLedger {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpRewardLedger {
    pub fn new(
        base_url: String,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RewardError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RewardError::Unavailable(error.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            client,
        })
    }
}

#[async_trait]
impl RewardLedger for HttpRewardLedger {
    async fn process_event(
        &self,
        kind: &str,
        subject_id: &str,
        amount: f64,
        shop_id: Option<&str>,
    ) -> Result<RewardReceipt, RewardError> {
        let mut request = self
            .client
            .post(format!("{}/v1/ledger/events", self.base_url))
            .json(&LedgerEventRequest {
                kind,
                subject_id,
                amount,
                shop_id,
            });
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| RewardError::Unavailable(error.to_string()))?;
        let status = response.status();
        let body: LedgerEventResponse = response
            .json()
            .await
            .map_err(|error| RewardError::Unavailable(format!("{status}: {error}")))?;

        if !status.is_success() || !body.success {
            let reason = body
                .error
                .or(body.message)
                .unwrap_or_else(|| format!("ledger returned {status}"));
            return Err(RewardError::Rejected(reason));
        }
        match body.transaction_ref {
            Some(transaction_ref) => Ok(RewardReceipt {
                transaction_ref,
                message: body.message,
            }),
            None => Err(RewardError::Unavailable(
                "ledger response missing transaction_ref".to_string(),
            )),
        }
    }
}

/// Local fallback used when no ledger endpoint is configured (dev and test
/// environments). Accepts everything and fabricates a transaction reference.
pub struct StaticRewardLedger;

#[async_trait]
impl RewardLedger for StaticRewardLedger {
    async fn process_event(
        &self,
        kind: &str,
        subject_id: &str,
        amount: f64,
        shop_id: Option<&str>,
    ) -> Result<RewardReceipt, RewardError> {
        let transaction_ref = format!("local_{}", Uuid::new_v4().simple());
        tracing::debug!(
            kind,
            subject = subject_id,
            amount,
            shop = shop_id.unwrap_or("none"),
            transaction_ref = %transaction_ref,
            "static reward ledger accepted event"
        );
        Ok(RewardReceipt {
            transaction_ref,
            message: None,
        })
    }
}
