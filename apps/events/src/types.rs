use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Durable audit record for one webhook delivery attempt.
///
/// The record is appended with `processed = false` before any handler runs and
/// updated exactly once per attempt. Retries create a new record whose id is
/// `retry_{original_id}_{unix_millis}`; the two records are linked by id
/// convention only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub payload: Value,
    pub processed: bool,
    pub processing_time_ms: Option<u64>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl WebhookRecord {
    #[must_use]
    pub fn pre_image(id: &str, source: &str, event_type: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            event_type: event_type.to_string(),
            payload,
            processed: false,
            processing_time_ms: None,
            result: None,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result
            .as_ref()
            .and_then(|result| result.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// A record counts as failed once its attempt finished without success.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.processed && !self.succeeded()
    }
}

/// Outcome of one pass through the event pipeline, returned to the caller
/// even when the handler itself failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

/// Unit of real-time delivery to connected recipients. Undeliverable
/// notifications are dropped, never queued.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    #[must_use]
    pub fn new(
        recipient_id: &str,
        kind: &str,
        title: impl Into<String>,
        body: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            recipient_id: recipient_id.trim().to_ascii_lowercase(),
            kind: kind.to_string(),
            title: title.into(),
            body: body.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

/// Frames pushed from the service to a connected socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected,
    Authenticated { recipient_id: String },
    Notification(Notification),
    Pong,
    Error { error: String },
}

/// Frames accepted from a client socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate { token: String },
    Ping,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ClientFrame, Notification, ServerFrame, WebhookRecord};

    #[test]
    fn record_failure_requires_a_finished_attempt() {
        let mut record = WebhookRecord::pre_image("evt_1", "fixflow", "reward.completed", json!({}));
        assert!(!record.is_failure());

        record.processed = true;
        record.result = Some(json!({"success": false, "error": "downstream unavailable"}));
        assert!(record.is_failure());

        record.result = Some(json!({"success": true, "transaction_ref": "txn_9"}));
        assert!(!record.is_failure());
    }

    #[test]
    fn server_frames_use_type_and_payload_keys() {
        let frame = ServerFrame::Authenticated {
            recipient_id: "customer-1".to_string(),
        };
        let encoded = serde_json::to_value(&frame).expect("frame should encode");
        assert_eq!(encoded["type"], "authenticated");
        assert_eq!(encoded["payload"]["recipient_id"], "customer-1");

        let connected = serde_json::to_value(ServerFrame::Connected).expect("frame should encode");
        assert_eq!(connected, json!({"type": "connected"}));
    }

    #[test]
    fn client_ping_frame_decodes_without_payload() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"ping"}"#).expect("ping should decode");
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn notification_lowercases_the_recipient() {
        let notification = Notification::new("Customer-42", "reward", "t", "b", json!({}));
        assert_eq!(notification.recipient_id, "customer-42");
    }
}
