use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::WebhookRecord;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("webhook ledger unavailable: {0}")]
    Unavailable(String),
    #[error("webhook record {0} not found")]
    NotFound(String),
}

/// Append/update interface over the platform's relational store, reduced to
/// what the ingestion core needs: the audit trail and the failed-delivery
/// query backing the retry path.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    async fn append(&self, record: WebhookRecord) -> Result<(), LedgerError>;

    /// Replace the stored record with the same id.
    async fn update(&self, record: WebhookRecord) -> Result<(), LedgerError>;

    /// Finished-but-failed records, newest first.
    async fn recent_failures(&self, limit: usize) -> Result<Vec<WebhookRecord>, LedgerError>;

    fn driver_name(&self) -> &'static str;
}

/// Bounded in-memory ledger used for db-less runs and tests.
pub struct InMemoryWebhookLedger {
    capacity: usize,
    records: Mutex<VecDeque<WebhookRecord>>,
}

impl InMemoryWebhookLedger {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<WebhookRecord> {
        self.records
            .lock()
            .await
            .iter()
            .rev()
            .find(|record| record.id == id)
            .cloned()
    }
}

#[async_trait]
impl WebhookLedger for InMemoryWebhookLedger {
    async fn append(&self, record: WebhookRecord) -> Result<(), LedgerError> {
        let mut records = self.records.lock().await;
        records.push_back(record);
        while records.len() > self.capacity {
            let _ = records.pop_front();
        }
        Ok(())
    }

    async fn update(&self, record: WebhookRecord) -> Result<(), LedgerError> {
        let mut records = self.records.lock().await;
        match records.iter_mut().rev().find(|stored| stored.id == record.id) {
            Some(stored) => {
                *stored = record;
                Ok(())
            }
            None => Err(LedgerError::NotFound(record.id)),
        }
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<WebhookRecord>, LedgerError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .rev()
            .filter(|record| record.is_failure())
            .take(limit)
            .cloned()
            .collect())
    }

    fn driver_name(&self) -> &'static str {
        "memory"
    }
}
