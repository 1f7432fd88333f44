use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};

use crate::ledger::{LedgerError, WebhookLedger};
use crate::types::WebhookRecord;

const ENSURE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS webhook_events (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    processed BOOLEAN NOT NULL DEFAULT FALSE,
    processing_time_ms BIGINT,
    result JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
)";

/// Webhook ledger backed by the platform's relational store. Selected when
/// `EVENTS_DB_URL` is configured; everything else in the core stays
/// storage-agnostic behind the `WebhookLedger` trait.
#[derive(Clone)]
pub struct PostgresWebhookLedger {
    client: Arc<Mutex<Client>>,
}

impl PostgresWebhookLedger {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "events postgres connection error");
            }
        });

        client
            .execute(ENSURE_SCHEMA, &[])
            .await
            .context("ensure webhook_events schema")?;

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }
}

fn record_from_row(row: &Row) -> WebhookRecord {
    let processing_time_ms: Option<i64> = row.get("processing_time_ms");
    let retry_count: i32 = row.get("retry_count");
    WebhookRecord {
        id: row.get("id"),
        source: row.get("source"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        processed: row.get("processed"),
        processing_time_ms: processing_time_ms.map(|value| value.max(0) as u64),
        result: row.get("result"),
        created_at: row.get("created_at"),
        retry_count: retry_count.max(0) as u32,
    }
}

#[async_trait]
impl WebhookLedger for PostgresWebhookLedger {
    async fn append(&self, record: WebhookRecord) -> Result<(), LedgerError> {
        let processing_time_ms = record.processing_time_ms.map(|value| value as i64);
        let retry_count = record.retry_count as i32;
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_events \
                 (id, source, event_type, payload, processed, processing_time_ms, result, created_at, retry_count) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &record.id,
                    &record.source,
                    &record.event_type,
                    &record.payload,
                    &record.processed,
                    &processing_time_ms,
                    &record.result,
                    &record.created_at,
                    &retry_count,
                ],
            )
            .await
            .map_err(|error| LedgerError::Unavailable(error.to_string()))?;
        Ok(())
    }

    async fn update(&self, record: WebhookRecord) -> Result<(), LedgerError> {
        let processing_time_ms = record.processing_time_ms.map(|value| value as i64);
        let retry_count = record.retry_count as i32;
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE webhook_events \
                 SET processed = $2, processing_time_ms = $3, result = $4, created_at = $5, retry_count = $6 \
                 WHERE id = $1",
                &[
                    &record.id,
                    &record.processed,
                    &processing_time_ms,
                    &record.result,
                    &record.created_at,
                    &retry_count,
                ],
            )
            .await
            .map_err(|error| LedgerError::Unavailable(error.to_string()))?;
        if updated == 0 {
            return Err(LedgerError::NotFound(record.id));
        }
        Ok(())
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<WebhookRecord>, LedgerError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT id, source, event_type, payload, processed, processing_time_ms, result, created_at, retry_count \
                 FROM webhook_events \
                 WHERE processed AND COALESCE((result ->> 'success')::BOOLEAN, FALSE) = FALSE \
                 ORDER BY created_at DESC \
                 LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(|error| LedgerError::Unavailable(error.to_string()))?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    fn driver_name(&self) -> &'static str {
        "postgres"
    }
}
