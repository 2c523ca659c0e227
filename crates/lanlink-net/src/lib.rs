//! Lanlink network edges
//!
//! Everything that touches the outside world lives here:
//! - The session-substrate contract and an in-memory implementation
//!   for tests
//! - The overlay transport: peer membership, broadcast, session priming
//! - The link supervisor: path-health rules and relay fallback
//! - Adaptive poll pacing for the inbound message pump
//! - The TUN device trait with Linux, macOS and Windows backends

pub mod error;
pub mod memory;
pub mod poll;
pub mod substrate;
pub mod supervisor;
pub mod transport;
pub mod tun;

pub use error::{NetError, NetResult};
pub use memory::MemoryHub;
pub use poll::AdaptivePoll;
pub use substrate::{
    Delivery, InboundMessage, LinkState, RealtimeStatus, SendError, SessionEvent, Substrate,
    TransportTuning,
};
pub use supervisor::{LinkSupervisor, SupervisorEvent};
pub use transport::{OverlayTransport, PeerListener};
pub use tun::{create_tun, TunConfig, TunDevice};
