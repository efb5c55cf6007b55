use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single line-delimited or length-prefixed protocol frame. `msg_type`
/// distinguishes requests, responses, and unsolicited events; `request_id`
/// correlates a response to the request that triggered it and is `None` for
/// events the broker emits on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEnvelope<T = Value> {
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub payload: T,
}

impl<T> ProtocolEnvelope<T> {
    pub fn new(msg_type: impl Into<String>, payload: T) -> Self {
        Self {
            msg_type: msg_type.into(),
            request_id: None,
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
