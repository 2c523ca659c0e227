//! Lanlink overlay core
//!
//! Ties the protocol and network edges into a working overlay node:
//! - Distributed virtual-IPv4 negotiation
//! - Heartbeat liveness table with packet-level conflict detection
//! - TUN bridge between the OS network stack and the overlay
//! - TCP tunnel multiplexer with watermark backpressure
//! - LAN discovery bridging
//! - The node engine wiring it all to the session substrate

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod mux;
pub mod negotiator;
pub mod routes;

pub use bridge::{BridgeStats, TunBridge};
pub use config::{OverlayConfig, OverlayMode};
pub use discovery::DiscoveryBridge;
pub use engine::{NodeEvent, OverlayNode};
pub use error::{CoreError, CoreResult};
pub use heartbeat::{HeartbeatManager, NodeInfo, PacketConflict};
pub use mux::MuxEndpoint;
pub use negotiator::{ControlOut, IpNegotiator, NegotiationPhase, NegotiatorEvent};
pub use routes::{RouteEntry, RoutingTable};
