use std::net::SocketAddr;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use relay_types::{Message, MessageTarget};

#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    #[error("malformed signature bytes")]
    MalformedSignature,
    #[error("signature does not verify against the configured key")]
    InvalidSignature,
    #[error("handshake timestamp is outside the allowed skew")]
    TimestampSkew,
}

/// Fields a connecting companion presents for the signed WebSocket
/// handshake. The signature covers the canonical pipe-separated payload
/// `{ts_ms}|{session_id}|{nonce}` so the server can verify authenticity
/// without maintaining per-session shared secrets.
pub struct HandshakeRequest<'a> {
    pub ts_ms: i64,
    pub session_id: &'a str,
    pub nonce: &'a str,
    pub signature: &'a [u8],
}

impl HandshakeRequest<'_> {
    pub fn canonical_payload(&self) -> String {
        format!("{}|{}|{}", self.ts_ms, self.session_id, self.nonce)
    }
}

/// Maximum allowed difference between a handshake's declared timestamp and
/// wall-clock time, guarding against a captured handshake being replayed
/// long after it was issued.
pub const MAX_HANDSHAKE_SKEW_MS: i64 = 30_000;

pub fn verify_handshake(
    request: &HandshakeRequest<'_>,
    public_key: &VerifyingKey,
    now_ms: i64,
) -> Result<(), CompanionError> {
    if (now_ms - request.ts_ms).abs() > MAX_HANDSHAKE_SKEW_MS {
        return Err(CompanionError::TimestampSkew);
    }

    let signature = Signature::from_slice(request.signature)
        .map_err(|_| CompanionError::MalformedSignature)?;

    public_key
        .verify(request.canonical_payload().as_bytes(), &signature)
        .map_err(|_| CompanionError::InvalidSignature)
}

/// Handshake frame a connecting companion sends as the first WebSocket text
/// message, before any `chat.send` request is accepted (§6 "a secondary
/// WebSocket endpoint on the local loopback interface accepting a signed
/// connect handshake").
#[derive(Debug, Deserialize)]
struct ConnectFrame {
    ts_ms: i64,
    session_id: String,
    nonce: String,
    /// Hex-encoded Ed25519 signature over the canonical payload.
    signature: String,
}

/// Requests a connected, authenticated companion may send after the
/// handshake. Only `chat.send` is named in §6; unrecognized request shapes
/// are ignored rather than closing the connection, the same
/// don't-fail-the-whole-stream posture the protocol stream takes on unknown
/// methods (§4.5).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CompanionRequest {
    #[serde(rename = "chat.send")]
    ChatSend {
        channel: String,
        sender: String,
        text: String,
    },
}

/// Accepts WebSocket connections on the loopback interface, verifies each
/// connecting companion's signed handshake, and forwards `chat.send`
/// requests as [`Message`]s onto `sink` (normally the same channel the
/// broker's inbound gateway reads from).
pub struct CompanionGateway {
    listener: TcpListener,
    public_key: VerifyingKey,
    sink: mpsc::UnboundedSender<Message>,
}

impl CompanionGateway {
    pub async fn bind(
        addr: SocketAddr,
        public_key: VerifyingKey,
        sink: mpsc::UnboundedSender<Message>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            public_key,
            sink,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener errors, spawning one task per
    /// connection so a slow or misbehaving companion can't block the others.
    pub fn run(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match self.listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "companion gateway accept failed");
                        break;
                    }
                };
                let public_key = self.public_key.clone();
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, public_key, sink).await {
                        debug!(%peer, %err, "companion connection closed");
                    }
                });
            }
        })
    }
}

async fn handle_connection(
    stream: TcpStream,
    public_key: VerifyingKey,
    sink: mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    let handshake_text = match ws.next().await {
        Some(Ok(WsMessage::Text(text))) => text,
        Some(Ok(_)) => anyhow::bail!("first frame must be a text handshake"),
        Some(Err(err)) => return Err(err.into()),
        None => anyhow::bail!("connection closed before handshake"),
    };
    let connect: ConnectFrame = serde_json::from_str(handshake_text.as_ref())?;
    let signature = decode_hex(&connect.signature)?;
    let request = HandshakeRequest {
        ts_ms: connect.ts_ms,
        session_id: &connect.session_id,
        nonce: &connect.nonce,
        signature: &signature,
    };
    verify_handshake(&request, &public_key, chrono::Utc::now().timestamp_millis())?;
    ws.send(WsMessage::Text(r#"{"type":"connect_ack"}"#.to_string().into()))
        .await?;

    while let Some(frame) = ws.next().await {
        let WsMessage::Text(text) = frame? else {
            continue;
        };
        let Ok(CompanionRequest::ChatSend { channel, sender, text }) =
            serde_json::from_str::<CompanionRequest>(text.as_ref())
        else {
            continue;
        };
        let body = format!("[relaycast:{channel}] @{sender}: {text}");
        let message = Message::new(relay_types::new_id(), sender, MessageTarget::Channel(channel), body);
        if sink.send(message).is_err() {
            break;
        }
    }

    Ok(())
}

fn decode_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        anyhow::bail!("hex signature has odd length");
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn valid_signature_over_canonical_payload_verifies() {
        let signing = signing_key();
        let verifying = signing.verifying_key();

        let request = HandshakeRequest {
            ts_ms: 1_000,
            session_id: "sess-1",
            nonce: "abc",
            signature: &[0u8; 64],
        };
        let signature = signing.sign(request.canonical_payload().as_bytes());
        let request = HandshakeRequest {
            signature: signature.to_bytes().as_slice(),
            ..request
        };

        assert!(verify_handshake(&request, &verifying, 1_000).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected_even_with_a_valid_signature() {
        let signing = signing_key();
        let verifying = signing.verifying_key();

        let request = HandshakeRequest {
            ts_ms: 0,
            session_id: "sess-1",
            nonce: "abc",
            signature: &[0u8; 64],
        };
        let signature = signing.sign(request.canonical_payload().as_bytes());
        let request = HandshakeRequest {
            signature: signature.to_bytes().as_slice(),
            ..request
        };

        let far_future = MAX_HANDSHAKE_SKEW_MS + 1;
        assert!(matches!(
            verify_handshake(&request, &verifying, far_future),
            Err(CompanionError::TimestampSkew)
        ));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let signing = signing_key();
        let verifying = signing.verifying_key();

        let signed_request = HandshakeRequest {
            ts_ms: 1_000,
            session_id: "sess-1",
            nonce: "abc",
            signature: &[0u8; 64],
        };
        let signature = signing.sign(signed_request.canonical_payload().as_bytes());

        let tampered = HandshakeRequest {
            ts_ms: 1_000,
            session_id: "sess-2",
            nonce: "abc",
            signature: signature.to_bytes().as_slice(),
        };

        assert!(matches!(
            verify_handshake(&tampered, &verifying, 1_000),
            Err(CompanionError::InvalidSignature)
        ));
    }

    fn encode_hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[tokio::test]
    async fn gateway_forwards_a_chat_send_after_a_valid_handshake() {
        let signing = signing_key();
        let verifying = signing.verifying_key();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let gateway = CompanionGateway::bind("127.0.0.1:0".parse().unwrap(), verifying, tx)
            .await
            .unwrap();
        let addr = gateway.local_addr().unwrap();
        gateway.run();

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        let ts_ms = chrono::Utc::now().timestamp_millis();
        let handshake = HandshakeRequest {
            ts_ms,
            session_id: "sess-1",
            nonce: "nonce-1",
            signature: &[0u8; 64],
        };
        let signature = signing.sign(handshake.canonical_payload().as_bytes());
        let connect_frame = serde_json::json!({
            "ts_ms": ts_ms,
            "session_id": "sess-1",
            "nonce": "nonce-1",
            "signature": encode_hex(signature.to_bytes().as_slice()),
        });
        client
            .send(WsMessage::Text(connect_frame.to_string().into()))
            .await
            .unwrap();

        let ack = client.next().await.unwrap().unwrap();
        assert!(matches!(ack, WsMessage::Text(_)));

        let chat_send = serde_json::json!({
            "type": "chat.send",
            "channel": "general",
            "sender": "alice",
            "text": "hello there",
        });
        client
            .send(WsMessage::Text(chat_send.to_string().into()))
            .await
            .unwrap();

        let forwarded = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.body, "[relaycast:general] @alice: hello there");
        assert_eq!(forwarded.target, MessageTarget::Channel("general".to_string()));
    }

    #[tokio::test]
    async fn gateway_rejects_a_bad_signature_and_forwards_nothing() {
        let signing = signing_key();
        let verifying = signing.verifying_key();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let gateway = CompanionGateway::bind("127.0.0.1:0".parse().unwrap(), verifying, tx)
            .await
            .unwrap();
        let addr = gateway.local_addr().unwrap();
        gateway.run();

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        let ts_ms = chrono::Utc::now().timestamp_millis();
        let connect_frame = serde_json::json!({
            "ts_ms": ts_ms,
            "session_id": "sess-1",
            "nonce": "nonce-1",
            "signature": encode_hex(&[0u8; 64]),
        });
        client
            .send(WsMessage::Text(connect_frame.to_string().into()))
            .await
            .unwrap();

        // The server closes the connection instead of acking; nothing ever
        // reaches the sink.
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err() || result.unwrap().is_none());
    }
}
