use futures_util::{SinkExt, StreamExt};
use relay_codec::LineCodec;
use relay_types::{ProtocolEnvelope, ProtocolError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// The JSON-RPC-ish methods the protocol stream understands. Unrecognized
/// method strings become [`ProtocolError::UnknownMethod`] rather than a
/// panic — a peer on an older or newer protocol version must fail a single
/// request, not the whole stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMethod {
    SpawnAgent,
    ReleaseAgent,
    SendInput,
    SendMessage,
    SetModel,
    StopWorker,
    ListWorkers,
    GetStatus,
    GetMetrics,
    GetCrashInsights,
    Ping,
}

impl ProtocolMethod {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "spawn_agent" => Self::SpawnAgent,
            "release_agent" => Self::ReleaseAgent,
            "send_input" => Self::SendInput,
            "send_message" => Self::SendMessage,
            "set_model" => Self::SetModel,
            "stop_worker" => Self::StopWorker,
            "list_agents" | "list_workers" => Self::ListWorkers,
            "get_status" => Self::GetStatus,
            "get_metrics" => Self::GetMetrics,
            "get_crash_insights" => Self::GetCrashInsights,
            "ping" => Self::Ping,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpawnAgent => "spawn_agent",
            Self::ReleaseAgent => "release_agent",
            Self::SendInput => "send_input",
            Self::SendMessage => "send_message",
            Self::SetModel => "set_model",
            Self::StopWorker => "stop_worker",
            Self::ListWorkers => "list_agents",
            Self::GetStatus => "get_status",
            Self::GetMetrics => "get_metrics",
            Self::GetCrashInsights => "get_crash_insights",
            Self::Ping => "ping",
        }
    }
}

/// A line-delimited JSON-RPC transport over any async byte stream — stdio
/// in the broker binary, a WebSocket message's byte payload when adapted by
/// the companion gateway.
pub struct ProtocolStream<T> {
    framed: Framed<T, LineCodec>,
}

impl<T> ProtocolStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T, max_frame_bytes: usize) -> Self {
        Self {
            framed: Framed::new(io, LineCodec::new(max_frame_bytes)),
        }
    }

    pub async fn recv<P: DeserializeOwned>(&mut self) -> Result<ProtocolEnvelope<P>, ProtocolError> {
        let line = self
            .framed
            .next()
            .await
            .ok_or(ProtocolError::Closed)?
            .map_err(ProtocolError::from)?;
        serde_json::from_str(&line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub async fn recv_value(&mut self) -> Result<ProtocolEnvelope<Value>, ProtocolError> {
        self.recv().await
    }

    pub async fn send<P: Serialize>(&mut self, envelope: &ProtocolEnvelope<P>) -> Result<(), ProtocolError> {
        let line = serde_json::to_string(envelope).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.framed.send(line).await.map_err(ProtocolError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods() {
        assert_eq!(ProtocolMethod::parse("ping"), Some(ProtocolMethod::Ping));
        assert_eq!(
            ProtocolMethod::parse("spawn_agent"),
            Some(ProtocolMethod::SpawnAgent)
        );
        assert_eq!(ProtocolMethod::parse("unknown_thing"), None);
    }

    #[test]
    fn round_trips_method_name() {
        assert_eq!(ProtocolMethod::SendMessage.as_str(), "send_message");
    }

    #[tokio::test]
    async fn send_then_recv_round_trips_an_envelope() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client_stream = ProtocolStream::new(client, 1024);
        let mut server_stream = ProtocolStream::new(server, 1024);

        let envelope = ProtocolEnvelope::new("ping", serde_json::json!({}));
        client_stream.send(&envelope).await.unwrap();

        let received: ProtocolEnvelope<Value> = server_stream.recv().await.unwrap();
        assert_eq!(received.msg_type, "ping");
    }
}
