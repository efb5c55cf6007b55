use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use relay_broker::{
    BrokerSupervisor, CompanionGateway, DeliveryEngine, DeliveryOutcome, EventBus, FallbackClient,
    InboundGateway, ProtocolMethod,
};
use relay_pty::PtyWorkerCommand;
use relay_types::{Event, Message, MessageTarget, ProtocolEnvelope, RestartPolicy};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::cli::BrokerArgs;

/// Drive the broker's line-delimited JSON-RPC protocol stream (§4.5) over
/// this process's own stdin/stdout until a `shutdown` request or stdin
/// closes.
pub async fn run(args: BrokerArgs) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new(1024));
    let (supervisor, mut worker_events_rx) = BrokerSupervisor::new(events.clone());
    let supervisor = Arc::new(Mutex::new(supervisor));
    let delivery = Arc::new(Mutex::new(DeliveryEngine::new(
        relay_pty::DEFAULT_MAX_VERIFICATION_ATTEMPTS,
    )));
    // Deliveries that originated from the companion gateway rather than the
    // protocol stream's own `send_message`, kept so a terminal delivery
    // failure knows to retry once on the HTTP fallback path (§4.7).
    let pending_inbound: Arc<Mutex<HashMap<String, Message>>> = Arc::new(Mutex::new(HashMap::new()));
    let fallback = args.fallback_url.as_deref().and_then(|url| match url.parse() {
        Ok(endpoint) => Some(Arc::new(FallbackClient::new(endpoint))),
        Err(err) => {
            warn!(%err, url, "ignoring malformed --fallback-url");
            None
        }
    });

    // The companion WebSocket gateway (§6) is optional: only started when
    // both its bind address and verifying key are configured. Accepted
    // `chat.send` requests arrive on `companion_rx`, get deduped by the
    // inbound gateway, and are enqueued through the same delivery engine
    // `send_message` uses.
    if let (Some(addr), Some(public_key_hex)) = (args.companion_addr, args.companion_public_key.as_deref()) {
        match decode_verifying_key(public_key_hex) {
            Ok(public_key) => {
                let (companion_tx, companion_rx) = mpsc::unbounded_channel::<Message>();
                match CompanionGateway::bind(addr, public_key, companion_tx).await {
                    Ok(gateway) => {
                        info!(%addr, "companion gateway listening");
                        gateway.run();
                        spawn_inbound_pump(
                            companion_rx,
                            Duration::from_secs(args.inbound_dedup_ttl_secs),
                            supervisor.clone(),
                            delivery.clone(),
                            events.clone(),
                            pending_inbound.clone(),
                        );
                    }
                    Err(err) => warn!(%err, %addr, "failed to bind companion gateway"),
                }
            }
            Err(err) => warn!(%err, "ignoring malformed --companion-public-key"),
        }
    }

    // One writer task owns stdout so request/response frames and
    // fire-and-forget event frames never interleave mid-line.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Every lifecycle event is pushed to the stream as it happens, fanned
    // out from the same event bus the supervisor publishes to (§4.4).
    {
        let out_tx = out_tx.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let envelope = ProtocolEnvelope::new("event", serde_json::to_value(&event).unwrap_or(Value::Null));
                if let Ok(line) = serde_json::to_string(&envelope) {
                    if out_tx.send(line).is_err() {
                        break;
                    }
                }
            }
        });
    }

    // Raw per-worker output is forwarded onto the stream; delivery
    // confirmations/failures resolve the in-flight slot and dispatch
    // whatever is queued behind it.
    {
        let out_tx = out_tx.clone();
        let delivery = delivery.clone();
        let supervisor = supervisor.clone();
        let pending_inbound = pending_inbound.clone();
        let fallback = fallback.clone();
        let events = events.clone();
        tokio::spawn(async move {
            while let Some((worker, event)) = worker_events_rx.recv().await {
                match event {
                    relay_pty::PtyWorkerEvent::Stream { chunk } => {
                        let envelope = ProtocolEnvelope::new(
                            "event",
                            json!({ "type": "worker_stream", "worker": worker, "chunk": chunk }),
                        );
                        if let Ok(line) = serde_json::to_string(&envelope) {
                            let _ = out_tx.send(line);
                        }
                    }
                    relay_pty::PtyWorkerEvent::DeliveryInjected { delivery_id } => {
                        delivery.lock().await.mark_injected(&worker);
                        events.publish(Event::DeliveryStateChanged {
                            delivery_id,
                            worker: worker.clone(),
                            state: relay_types::DeliveryState::Injected,
                        });
                    }
                    relay_pty::PtyWorkerEvent::DeliveryVerified { delivery_id } => {
                        pending_inbound.lock().await.remove(&delivery_id);
                        let next = delivery.lock().await.mark_verified(&worker);
                        events.publish(Event::DeliveryStateChanged {
                            delivery_id,
                            worker: worker.clone(),
                            state: relay_types::DeliveryState::Verified,
                        });
                        dispatch_next(&supervisor, &worker, next).await;
                    }
                    relay_pty::PtyWorkerEvent::DeliveryFailed { delivery_id } => {
                        let inbound_message = pending_inbound.lock().await.remove(&delivery_id);
                        if let (Some(message), Some(client)) = (inbound_message, fallback.clone()) {
                            let worker = worker.clone();
                            tokio::spawn(async move {
                                match client.send_message(&worker, &message.body, Value::Null).await {
                                    Ok(event_id) => {
                                        info!(%event_id, worker, "inbound message delivered via fallback path")
                                    }
                                    Err(err) => warn!(%err, worker, "fallback delivery also failed"),
                                }
                            });
                        }
                        let next = delivery.lock().await.mark_failed(&worker);
                        events.publish(Event::DeliveryStateChanged {
                            delivery_id,
                            worker: worker.clone(),
                            state: relay_types::DeliveryState::Failed,
                        });
                        dispatch_next(&supervisor, &worker, next).await;
                    }
                    relay_pty::PtyWorkerEvent::Idle => {
                        events.publish(Event::WorkerIdle { worker: worker.clone() });
                    }
                    relay_pty::PtyWorkerEvent::ExitSentinelSeen => {
                        events.publish(Event::WorkerExitRequested { worker: worker.clone() });
                        let mut guard = supervisor.lock().await;
                        if let Err(err) = guard.stop_worker(&worker).await {
                            warn!(worker, error = %err, "failed to release worker after exit sentinel");
                        }
                    }
                    relay_pty::PtyWorkerEvent::Exited { exit_code } => {
                        let envelope = ProtocolEnvelope::new(
                            "event",
                            json!({ "type": "worker_exited", "worker": worker, "exit_code": exit_code }),
                        );
                        if let Ok(line) = serde_json::to_string(&envelope) {
                            let _ = out_tx.send(line);
                        }
                    }
                }
            }
        });
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = tokio::io::AsyncBufReadExt::lines(stdin);

    let mut said_hello = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "malformed protocol frame");
                continue;
            }
        };

        let msg_type = envelope.get("msg_type").and_then(Value::as_str).unwrap_or("");
        let request_id = envelope.get("request_id").and_then(Value::as_str).map(str::to_string);
        let payload = envelope.get("payload").cloned().unwrap_or(Value::Null);

        if msg_type == "hello" {
            said_hello = true;
            let ack = ProtocolEnvelope::new("hello_ack", json!({ "protocol_version": 1 }));
            if let Ok(line) = serde_json::to_string(&ack) {
                let _ = out_tx.send(line);
            }
            continue;
        }

        if !said_hello {
            send_error(&out_tx, request_id.as_deref(), "protocol_error", "hello must be sent first");
            continue;
        }

        if msg_type == "shutdown" {
            info!("shutdown requested over protocol stream");
            send_ok(&out_tx, request_id.as_deref(), Value::Null);
            break;
        }

        let Some(method) = ProtocolMethod::parse(msg_type) else {
            send_error(&out_tx, request_id.as_deref(), "unsupported_operation", msg_type);
            continue;
        };

        match method {
            ProtocolMethod::Ping => {
                send_ok(&out_tx, request_id.as_deref(), json!({ "pong": true }));
            }
            ProtocolMethod::SpawnAgent => {
                let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
                let command = payload.get("command").and_then(Value::as_str).unwrap_or("claude");
                let initial_task = payload.get("task").and_then(Value::as_str);
                // Per-worker override of the default 30s idle threshold (§3).
                let idle_threshold = payload
                    .get("idle_threshold_secs")
                    .and_then(Value::as_u64)
                    .map(Duration::from_secs);
                let channels: Vec<String> = payload
                    .get("channels")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let mut guard = supervisor.lock().await;
                match guard.spawn_agent_in(name, command, &[], RestartPolicy::Never, None, initial_task, idle_threshold, &channels) {
                    Ok(()) => send_ok(&out_tx, request_id.as_deref(), json!({ "name": name })),
                    Err(err) => send_error(&out_tx, request_id.as_deref(), "spawn_failed", &err.to_string()),
                }
            }
            ProtocolMethod::ReleaseAgent | ProtocolMethod::StopWorker => {
                let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
                let mut guard = supervisor.lock().await;
                match guard.stop_worker(name).await {
                    Ok(()) => send_ok(&out_tx, request_id.as_deref(), Value::Null),
                    Err(err) => send_error(&out_tx, request_id.as_deref(), "unknown_worker", &err.to_string()),
                }
            }
            ProtocolMethod::ListWorkers => {
                let names = supervisor.lock().await.worker_names();
                send_ok(&out_tx, request_id.as_deref(), json!({ "workers": names }));
            }
            ProtocolMethod::GetMetrics => {
                let worker_states = supervisor.lock().await.worker_states();
                let mut workers_by_state: HashMap<String, usize> = HashMap::new();
                for state in worker_states.values() {
                    *workers_by_state.entry(format!("{state:?}").to_lowercase()).or_insert(0) += 1;
                }

                let deliveries_by_state = delivery_state_counts(&events.recent());

                let delivery_guard = delivery.lock().await;
                let mut injection_latency_p50_ms = serde_json::Map::new();
                for worker in worker_states.keys() {
                    if let Some(p50) = delivery_guard.latency_percentile(worker, 50.0) {
                        injection_latency_p50_ms.insert(worker.clone(), json!(p50.as_millis() as u64));
                    }
                }
                drop(delivery_guard);

                send_ok(
                    &out_tx,
                    request_id.as_deref(),
                    json!({
                        "worker_count": worker_states.len(),
                        "workers_by_state": workers_by_state,
                        "deliveries_by_state": deliveries_by_state,
                        "injection_latency_p50_ms": injection_latency_p50_ms,
                        "recent_events": events.recent().len(),
                    }),
                );
            }
            ProtocolMethod::SendInput => {
                // Raw keystroke injection: no echo verification, unlike
                // `send_message` (§4.6 "direct PTY write without the
                // delivery-engine's echo confirmation").
                let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
                let text = payload.get("text").and_then(Value::as_str).unwrap_or_default();
                let guard = supervisor.lock().await;
                let Some(handle) = guard.worker(name) else {
                    send_error(&out_tx, request_id.as_deref(), "unknown_worker", name);
                    continue;
                };
                let sent = handle
                    .commands
                    .send(PtyWorkerCommand::Inject {
                        delivery_id: relay_types::new_id(),
                        text: text.to_string(),
                        expected_echo: String::new(),
                        max_attempts: 1,
                    })
                    .await;
                drop(guard);
                match sent {
                    Ok(()) => send_ok(&out_tx, request_id.as_deref(), Value::Null),
                    Err(err) => send_error(&out_tx, request_id.as_deref(), "delivery_failed", &err.to_string()),
                }
            }
            ProtocolMethod::SendMessage => {
                let target_str = payload.get("target").and_then(Value::as_str).unwrap_or("");
                let body = payload.get("body").and_then(Value::as_str).unwrap_or("").to_string();
                let target = parse_target(target_str);

                let guard = supervisor.lock().await;
                let targets: Vec<String> = match &target {
                    MessageTarget::Worker(name) => vec![name.clone()],
                    MessageTarget::Broadcast => guard.worker_names(),
                    MessageTarget::Channel(channel) => guard.workers_in_channel(channel),
                };

                if targets.is_empty() {
                    drop(guard);
                    send_error(&out_tx, request_id.as_deref(), "delivery_failed", "broadcast with no targets");
                    continue;
                }

                let mut event_ids = Vec::new();
                for worker in targets {
                    let Some(handle) = guard.worker(&worker) else {
                        continue;
                    };
                    let message = Message::new(relay_types::new_id(), "protocol", target.clone(), body.clone());
                    let event_id = message.id.clone();
                    let outcome = delivery.lock().await.enqueue(&worker, message, body.clone());
                    events.publish(Event::DeliveryStateChanged {
                        delivery_id: event_id.clone(),
                        worker: worker.clone(),
                        state: relay_types::DeliveryState::Queued,
                    });
                    if let DeliveryOutcome::Dispatch(record) = outcome {
                        let _ = handle
                            .commands
                            .send(PtyWorkerCommand::Inject {
                                delivery_id: record.delivery_id.clone(),
                                text: format!("{}\n", record.expected_echo),
                                expected_echo: record.expected_echo.clone(),
                                max_attempts: record.max_attempts,
                            })
                            .await;
                    }
                    event_ids.push(event_id);
                }
                drop(guard);
                send_ok(&out_tx, request_id.as_deref(), json!({ "event_ids": event_ids }));
            }
            ProtocolMethod::SetModel => {
                send_ok(&out_tx, request_id.as_deref(), Value::Null);
            }
            ProtocolMethod::GetStatus => {
                let names = supervisor.lock().await.worker_names();
                send_ok(&out_tx, request_id.as_deref(), json!({ "workers": names }));
            }
            ProtocolMethod::GetCrashInsights => {
                send_ok(&out_tx, request_id.as_deref(), json!({ "crashes": [] }));
            }
        }
    }

    drop(out_tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    Ok(())
}

/// After a delivery resolves, inject whatever the engine dispatched next so
/// the worker's one-job-at-a-time queue keeps draining on its own.
async fn dispatch_next(
    supervisor: &Arc<Mutex<BrokerSupervisor>>,
    worker: &str,
    outcome: Option<DeliveryOutcome>,
) {
    let Some(DeliveryOutcome::Dispatch(record)) = outcome else {
        return;
    };
    let guard = supervisor.lock().await;
    let Some(handle) = guard.worker(worker) else {
        return;
    };
    let _ = handle
        .commands
        .send(PtyWorkerCommand::Inject {
            delivery_id: record.delivery_id.clone(),
            text: format!("{}\n", record.expected_echo),
            expected_echo: record.expected_echo.clone(),
            max_attempts: record.max_attempts,
        })
        .await;
}

/// Drains companion-accepted messages, dedups them, and enqueues each one
/// onto the delivery engine exactly as `send_message` does for the
/// protocol stream, recording the delivery id so a terminal failure can
/// retry once on the HTTP fallback path.
fn spawn_inbound_pump(
    mut inbound_rx: mpsc::UnboundedReceiver<Message>,
    dedup_ttl: Duration,
    supervisor: Arc<Mutex<BrokerSupervisor>>,
    delivery: Arc<Mutex<DeliveryEngine>>,
    events: Arc<EventBus>,
    pending_inbound: Arc<Mutex<HashMap<String, Message>>>,
) {
    tokio::spawn(async move {
        let mut gateway = InboundGateway::new(dedup_ttl);
        while let Some(message) = inbound_rx.recv().await {
            let Some(message) = gateway.accept(message) else {
                continue;
            };

            let guard = supervisor.lock().await;
            let targets: Vec<String> = match &message.target {
                MessageTarget::Worker(name) => vec![name.clone()],
                MessageTarget::Broadcast => guard.worker_names(),
                MessageTarget::Channel(channel) => guard.workers_in_channel(channel),
            };
            if targets.is_empty() {
                drop(guard);
                events.publish(Event::Warning {
                    message: "inbound relay message had no eligible targets".to_string(),
                });
                continue;
            }

            for worker in targets {
                let Some(handle) = guard.worker(&worker) else {
                    continue;
                };
                let outcome = delivery
                    .lock()
                    .await
                    .enqueue(&worker, message.clone(), message.body.clone());
                events.publish(Event::DeliveryStateChanged {
                    delivery_id: message.id.clone(),
                    worker: worker.clone(),
                    state: relay_types::DeliveryState::Queued,
                });
                if let DeliveryOutcome::Dispatch(record) = outcome {
                    pending_inbound
                        .lock()
                        .await
                        .insert(record.delivery_id.clone(), message.clone());
                    let _ = handle
                        .commands
                        .send(PtyWorkerCommand::Inject {
                            delivery_id: record.delivery_id.clone(),
                            text: format!("{}\n", record.expected_echo),
                            expected_echo: record.expected_echo.clone(),
                            max_attempts: record.max_attempts,
                        })
                        .await;
                }
            }
        }
    });
}

fn decode_verifying_key(hex: &str) -> anyhow::Result<VerifyingKey> {
    if hex.len() != 64 {
        anyhow::bail!("companion public key must be 64 hex characters (32 bytes), got {}", hex.len());
    }
    let mut bytes = [0u8; 32];
    for (i, slot) in bytes.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)?;
    }
    VerifyingKey::from_bytes(&bytes).map_err(|err| anyhow::anyhow!("invalid ed25519 public key: {err}"))
}

/// Tallies deliveries by their most recently observed state, folding the
/// event bus's replay ring down to one state per delivery id (§4.5
/// `get_metrics`).
fn delivery_state_counts(events: &[Event]) -> HashMap<String, usize> {
    let mut latest: HashMap<&str, relay_types::DeliveryState> = HashMap::new();
    for event in events {
        if let Event::DeliveryStateChanged { delivery_id, state, .. } = event {
            latest.insert(delivery_id.as_str(), *state);
        }
    }
    let mut counts = HashMap::new();
    for state in latest.values() {
        *counts.entry(format!("{state:?}").to_lowercase()).or_insert(0) += 1;
    }
    counts
}

fn parse_target(raw: &str) -> MessageTarget {
    if raw == "*" {
        MessageTarget::Broadcast
    } else if let Some(channel) = raw.strip_prefix('#') {
        MessageTarget::Channel(channel.to_string())
    } else {
        MessageTarget::Worker(raw.to_string())
    }
}

fn send_ok(out_tx: &mpsc::UnboundedSender<String>, request_id: Option<&str>, payload: Value) {
    let mut envelope = ProtocolEnvelope::new("ok", payload);
    if let Some(id) = request_id {
        envelope = envelope.with_request_id(id.to_string());
    }
    if let Ok(line) = serde_json::to_string(&envelope) {
        let _ = out_tx.send(line);
    }
}

fn send_error(out_tx: &mpsc::UnboundedSender<String>, request_id: Option<&str>, code: &str, message: &str) {
    let mut envelope = ProtocolEnvelope::new("error", json!({ "code": code, "message": message }));
    if let Some(id) = request_id {
        envelope = envelope.with_request_id(id.to_string());
    }
    if let Ok(line) = serde_json::to_string(&envelope) {
        let _ = out_tx.send(line);
    }
}
