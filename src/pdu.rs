//! Protocol Data Units exchanged with the RTM service
//!
//! Every frame on the wire is a JSON object `{"action", "body", "id"?}`.
//! The typed bodies below cover each action the client sends or receives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ACTION_PUBLISH: &str = "rtm/publish";
pub const ACTION_WRITE: &str = "rtm/write";
pub const ACTION_READ: &str = "rtm/read";
pub const ACTION_DELETE: &str = "rtm/delete";
pub const ACTION_SEARCH: &str = "rtm/search";
pub const ACTION_SEARCH_DATA: &str = "rtm/search/data";
pub const ACTION_SUBSCRIBE: &str = "rtm/subscribe";
pub const ACTION_UNSUBSCRIBE: &str = "rtm/unsubscribe";
pub const ACTION_SUBSCRIPTION_DATA: &str = "rtm/subscription/data";
pub const ACTION_SUBSCRIPTION_INFO: &str = "rtm/subscription/info";
pub const ACTION_SUBSCRIPTION_ERROR: &str = "rtm/subscription/error";
pub const ACTION_HANDSHAKE: &str = "auth/handshake";
pub const ACTION_AUTHENTICATE: &str = "auth/authenticate";

/// A single frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pdu {
    pub action: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Outcome of a response, taken from the action suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
    /// Partial response; more frames for the same id may follow
    Data,
    Bad,
}

impl Outcome {
    /// Whether no further frames are expected for the request
    pub fn is_terminal(self) -> bool {
        matches!(self, Outcome::Ok | Outcome::Error)
    }
}

impl Pdu {
    pub fn new(action: impl Into<String>, body: Value) -> Self {
        Self {
            action: action.into(),
            body,
            id: None,
        }
    }

    /// Classify the action suffix. Depends on nothing but the action string.
    pub fn outcome(&self) -> Outcome {
        match self.action.rfind('/') {
            Some(idx) => match &self.action[idx..] {
                "/ok" => Outcome::Ok,
                "/error" => Outcome::Error,
                "/data" => Outcome::Data,
                _ => Outcome::Bad,
            },
            None => Outcome::Bad,
        }
    }

    /// Id if present and non-empty
    pub fn correlation_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishBody {
    pub channel: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PublishOk {
    #[serde(default)]
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBody {
    pub channel: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WriteOk {
    #[serde(default)]
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadBody {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadOk {
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteBody {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteOk {
    #[serde(default)]
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchBody {
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchChunk {
    #[serde(default)]
    pub channels: Vec<String>,
}

/// History window requested on subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
}

/// Application-supplied subscribe options
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscribeOptions {
    /// Streamview filter; when set the subscription id is sent as `subscription_id`
    pub filter: Option<String>,
    pub history: Option<History>,
    pub period: Option<u64>,
    /// Initial position, used for the first subscribe only
    pub position: Option<String>,
}

/// Body of `rtm/subscribe`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscribeBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fast_forward: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<History>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscribeOk {
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscribeError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub subscription_id: String,
}

/// Pushed when the service fast-forwarded a subscription
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub reason: String,
    pub subscription_id: String,
    #[serde(default)]
    pub position: String,
}

/// Pushed when the service dropped a subscription
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriptionError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
    pub subscription_id: String,
    #[serde(default)]
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub subscription_id: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeBody {
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnsubscribeOk {
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnsubscribeError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub subscription_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_from_suffix() {
        assert_eq!(Pdu::new("rtm/publish/ok", Value::Null).outcome(), Outcome::Ok);
        assert_eq!(Pdu::new("rtm/publish/error", Value::Null).outcome(), Outcome::Error);
        assert_eq!(Pdu::new("rtm/search/data", Value::Null).outcome(), Outcome::Data);
        assert_eq!(Pdu::new("rtm/subscription/data", Value::Null).outcome(), Outcome::Data);
        assert_eq!(Pdu::new("rtm/publish", Value::Null).outcome(), Outcome::Bad);
        assert_eq!(Pdu::new("nonsense", Value::Null).outcome(), Outcome::Bad);
        assert_eq!(Pdu::new("", Value::Null).outcome(), Outcome::Bad);
    }

    #[test]
    fn test_outcome_ignores_body() {
        let pdu = Pdu::new("rtm/write/ok", json!({"error": "looks bad", "reason": "but is ok"}));
        assert_eq!(pdu.outcome(), Outcome::Ok);
    }

    #[test]
    fn test_terminal_outcomes() {
        assert!(Outcome::Ok.is_terminal());
        assert!(Outcome::Error.is_terminal());
        assert!(!Outcome::Data.is_terminal());
        assert!(!Outcome::Bad.is_terminal());
    }

    #[test]
    fn test_pdu_without_id_serialization() {
        let pdu = Pdu::new(ACTION_PUBLISH, json!({"channel": "c", "message": 1}));
        let json = serde_json::to_string(&pdu).unwrap();
        assert_eq!(json, r#"{"action":"rtm/publish","body":{"channel":"c","message":1}}"#);
    }

    #[test]
    fn test_pdu_with_id_serialization() {
        let mut pdu = Pdu::new(ACTION_DELETE, json!({"channel": "c"}));
        pdu.id = Some("7".to_string());
        let json = serde_json::to_string(&pdu).unwrap();
        assert_eq!(json, r#"{"action":"rtm/delete","body":{"channel":"c"},"id":"7"}"#);
    }

    #[test]
    fn test_pdu_missing_body_is_null() {
        let pdu: Pdu = serde_json::from_str(r#"{"action":"rtm/delete/ok","id":"3"}"#).unwrap();
        assert_eq!(pdu.body, Value::Null);
        assert_eq!(pdu.correlation_id(), Some("3"));
    }

    #[test]
    fn test_empty_id_is_not_correlated() {
        let pdu: Pdu = serde_json::from_str(r#"{"action":"x/ok","body":{},"id":""}"#).unwrap();
        assert_eq!(pdu.correlation_id(), None);
    }

    #[test]
    fn test_read_body_omits_empty_position() {
        let body = ReadBody {
            channel: "c".to_string(),
            position: None,
        };
        assert_eq!(serde_json::to_value(&body).unwrap(), json!({"channel": "c"}));
    }

    #[test]
    fn test_subscribe_body_omits_defaults() {
        let body = SubscribeBody {
            channel: Some("animals".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&body).unwrap(), json!({"channel": "animals"}));
    }

    #[test]
    fn test_subscription_data_deserialization() {
        let json = r#"{"subscription_id":"s","position":"10:2","messages":[1,"two",{"n":3}]}"#;
        let data: SubscriptionData = serde_json::from_str(json).unwrap();
        assert_eq!(data.subscription_id, "s");
        assert_eq!(data.position, "10:2");
        assert_eq!(data.messages, vec![json!(1), json!("two"), json!({"n": 3})]);
    }

    #[test]
    fn test_subscription_data_requires_id() {
        let json = r#"{"position":"1","messages":[]}"#;
        assert!(serde_json::from_str::<SubscriptionData>(json).is_err());
    }
}
