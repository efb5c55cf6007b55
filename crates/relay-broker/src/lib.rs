//! Broker-side machinery: the delivery engine that gets messages into
//! workers and confirms they arrived, the event bus every subscriber reads
//! from, the line-delimited JSON-RPC protocol stream, the supervisor that
//! owns the worker table, the inbound gateway that dedups external
//! messages, the companion WebSocket gateway, and its localhost HTTP
//! fallback client.

mod companion;
mod delivery;
mod event_bus;
mod fallback;
mod inbound;
mod protocol;
mod supervisor;

pub use companion::{verify_handshake, CompanionError, CompanionGateway, HandshakeRequest};
pub use delivery::{DeliveryEngine, DeliveryOutcome};
pub use event_bus::EventBus;
pub use fallback::{FallbackClient, FallbackError, UNSUPPORTED_OPERATION};
pub use inbound::InboundGateway;
pub use protocol::{ProtocolMethod, ProtocolStream};
pub use supervisor::{BrokerSupervisor, SupervisorError, WorkerHandle};
