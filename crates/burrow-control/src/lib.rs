//! Core brokering engine for burrow
//!
//! Everything between the control socket and the persisted session state:
//! line framing for the agent protocol, the single-shot pairing table, the
//! tunnel registry, the Tunnel state machine with its bridge, the control
//! connection handler, and the startup restorer.

pub mod framing;
pub mod gauge;
pub mod handler;
pub mod net;
pub mod pairing;
pub mod registry;
pub mod restore;
pub mod tunnel;

pub use framing::FramingError;
pub use gauge::ConnGauge;
pub use handler::ControlHandler;
pub use pairing::{DataConn, PairingError, PendingConns};
pub use registry::{RegistryError, TunnelRegistry};
pub use restore::Restorer;
pub use tunnel::{Tunnel, TunnelConfig, TunnelSpec, TunnelState};
