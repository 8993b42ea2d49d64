//! Message envelope and publish options (wire format, camelCase JSON)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue job payload
///
/// ```json
/// { "topic": "wallet.withdraw", "type": "WITHDRAW_REQUESTED", "data": {...},
///   "meta": { "timestamp": "2026-01-01T00:00:00Z", "correlationId": "..." } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    pub topic: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: T,
    pub meta: EnvelopeMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMeta {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl Envelope<Value> {
    /// Build an envelope stamped with the current time
    pub fn new(
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        data: Value,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            msg_type: msg_type.into(),
            data,
            meta: EnvelopeMeta {
                timestamp: Utc::now(),
                correlation_id,
                version: Some(1),
            },
        }
    }

    /// Decode `data` into a typed payload
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.meta.correlation_id.as_deref()
    }
}

/// Delivery contract of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Enqueue directly, best effort
    #[default]
    Volatile,
    /// Record into the outbox on the caller's transaction
    Reliable,
    /// Enqueue, then wait for the consumer's completion marker
    Handshake,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Queue-level attempts, defaults to the bus configuration (3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PublishMode>,
}

impl PublishOptions {
    pub fn dedupe(key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn mode(mut self, mode: PublishMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new(
            "wallet.withdraw",
            "WITHDRAW_REQUESTED",
            json!({"withdrawId": "w1"}),
            Some("c-1".into()),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "WITHDRAW_REQUESTED");
        assert_eq!(v["meta"]["correlationId"], "c-1");
        assert_eq!(v["meta"]["version"], 1);
        assert!(v["meta"]["timestamp"].is_string());
        assert!(v.get("msg_type").is_none());
    }

    #[test]
    fn test_envelope_without_optional_meta() {
        let raw = r#"{"topic":"t","type":"X","data":null,"meta":{"timestamp":"2026-01-01T00:00:00Z"}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.correlation_id(), None);
        assert_eq!(env.meta.version, None);
    }

    #[test]
    fn test_publish_options_camel_case() {
        let opts: PublishOptions =
            serde_json::from_str(r#"{"delayMs":5,"dedupeKey":"k","mode":"reliable"}"#).unwrap();
        assert_eq!(opts.delay_ms, Some(5));
        assert_eq!(opts.dedupe_key.as_deref(), Some("k"));
        assert_eq!(opts.mode, Some(PublishMode::Reliable));
        assert_eq!(opts.attempts, None);
    }

    #[test]
    fn test_decode_payload() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct P {
            withdraw_id: String,
        }
        let env = Envelope::new("t", "X", json!({"withdrawId": "w9"}), None);
        let p: P = env.decode().unwrap();
        assert_eq!(p.withdraw_id, "w9");
    }
}
