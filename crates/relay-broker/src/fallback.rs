use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel returned by [`FallbackClient::send_message`] when the companion
/// process has no route for the target (§6 "returns an event identifier or
/// the literal `unsupported_operation` sentinel").
pub const UNSUPPORTED_OPERATION: &str = "unsupported_operation";

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("fallback request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fallback endpoint returned invalid JSON-RPC: {0}")]
    Malformed(String),
    #[error("fallback endpoint reported an error: {0}")]
    Rpc(String),
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'a str,
    method: &'static str,
    params: SessionsSendParams<'a>,
}

#[derive(Debug, Serialize)]
struct SessionsSendParams<'a> {
    target: &'a str,
    text: &'a str,
    data: &'a Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<SessionsSendResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionsSendResult {
    #[serde(default)]
    event_id: Option<String>,
}

/// Last-resort delivery path used when the primary [`crate::DeliveryEngine`]
/// path can't reach a target (§4.7 "on exhaustion, a single attempt is made
/// on the fallback path"). Speaks JSON-RPC `sessions_send` to a companion
/// process on the loopback interface, mirroring the backend HTTP client this
/// codebase already uses for its own job-lease/submit calls: one
/// `reqwest::Client`, `Url::join` for the endpoint, `.json(&req).send()`.
pub struct FallbackClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl FallbackClient {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Send one `sessions_send` request. Returns the event identifier the
    /// companion process assigned, or [`UNSUPPORTED_OPERATION`] if the
    /// companion has no route for `target`.
    pub async fn send_message(&self, target: &str, text: &str, data: Value) -> Result<String, FallbackError> {
        let request_id = relay_types::new_id();
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: &request_id,
            method: "sessions_send",
            params: SessionsSendParams { target, text, data: &data },
        };

        let response = self.http.post(self.endpoint.clone()).json(&body).send().await?;
        let status = response.status();
        let text_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(FallbackError::Rpc(format!("http {status}: {text_body}")));
        }

        let parsed: JsonRpcResponse =
            serde_json::from_str(&text_body).map_err(|e| FallbackError::Malformed(e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(FallbackError::Rpc(error.to_string()));
        }

        Ok(parsed
            .result
            .and_then(|r| r.event_id)
            .unwrap_or_else(|| UNSUPPORTED_OPERATION.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Spins up a bare-bones HTTP/1.1 responder on loopback (no test-only
    /// HTTP server dependency in this workspace) that reads one request and
    /// replies with a fixed JSON-RPC body, then exercises the real client
    /// against it end to end.
    async fn one_shot_server(response_body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                response_body.len(),
                response_body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        addr
    }

    #[tokio::test]
    async fn parses_event_id_from_a_successful_response() {
        let addr = one_shot_server(r#"{"jsonrpc":"2.0","result":{"event_id":"evt-1"}}"#).await;
        let endpoint = Url::parse(&format!("http://{addr}/rpc")).unwrap();
        let client = FallbackClient::new(endpoint);

        let event_id = client
            .send_message("#general", "hello", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(event_id, "evt-1");
    }

    #[tokio::test]
    async fn missing_event_id_falls_back_to_the_sentinel() {
        let addr = one_shot_server(r#"{"jsonrpc":"2.0","result":{}}"#).await;
        let endpoint = Url::parse(&format!("http://{addr}/rpc")).unwrap();
        let client = FallbackClient::new(endpoint);

        let event_id = client
            .send_message("#general", "hello", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(event_id, UNSUPPORTED_OPERATION);
    }

    #[tokio::test]
    async fn rpc_error_surfaces_as_an_error() {
        let addr = one_shot_server(r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"no route"}}"#).await;
        let endpoint = Url::parse(&format!("http://{addr}/rpc")).unwrap();
        let client = FallbackClient::new(endpoint);

        let result = client.send_message("#general", "hello", serde_json::json!({})).await;
        assert!(matches!(result, Err(FallbackError::Rpc(_))));
    }
}
