//! The RPC envelope — the single object carried by every [`crate::frame::Frame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{id?, type, payload?}`. Immutable once queued for send.
///
/// `id` is an opaque correlation id: client-chosen for requests, echoed
/// verbatim by the host on replies and stream events. The host never
/// invents ids of its own accord — if a request omits one, the dispatcher
/// generates one and echoes that same id on every envelope for the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self { id: None, kind: kind.into(), payload }
    }

    pub fn with_id(id: impl Into<String>, kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self { id: Some(id.into()), kind: kind.into(), payload }
    }

    /// Build an `error` envelope carrying `{code, message}`, echoing `id` if present.
    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: "error".to_string(),
            payload: Some(serde_json::json!({
                "code": code,
                "message": message.into(),
            })),
        }
    }

    /// Deserialize `payload` into `T`, treating a missing payload as an error
    /// rather than silently defaulting — callers that accept an absent
    /// payload should match on `self.payload` themselves.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Some(v) => serde_json::from_value(v.clone()),
            None => serde_json::from_value(Value::Object(Default::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let env = Envelope::with_id("r1", "model.list", Some(serde_json::json!({"x": 1})));
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn omits_absent_id_and_payload() {
        let env = Envelope::new("model.list", None);
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("payload").is_none());
        assert_eq!(json.get("type").unwrap(), "model.list");
    }

    #[test]
    fn error_envelope_shape() {
        let env = Envelope::error(Some("u1".into()), "unknown_type", "Unknown message type: nope");
        assert_eq!(env.kind, "error");
        let payload = env.payload.unwrap();
        assert_eq!(payload["code"], "unknown_type");
        assert_eq!(payload["message"], "Unknown message type: nope");
    }
}
