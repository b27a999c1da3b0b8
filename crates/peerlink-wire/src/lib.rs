//! peerlink wire — a TCP messaging driver for a fixed set of named peers.
//!
//! Peers exchange [`SessionMessage`]s over length-prefixed JSON frames.
//! Addresses are swapped out-of-band; after that a driver can unicast,
//! broadcast and pull inbound messages as a stream.
//!
//! ## Architecture
//!
//! - **AddressRegistry**: per-driver map from peer name to transport address
//! - **SocketLayer**: owns the listener, inbound readers and outbound links
//! - **Dispatcher**: `send`, `broadcast` and the pull-style `receive`
//! - **PeerDriver**: the public facade tying the three together

pub mod dispatch;
pub mod driver;
pub mod message;
pub mod registry;
pub mod socket;

pub use dispatch::{Dispatcher, ReceiveMode};
pub use driver::PeerDriver;
pub use message::{WireEnvelope, PROTOCOL_VERSION};
pub use peerlink_types::{
    Driver, DriverConfig, SessionMessage, SessionType, WireError, WireResult, WILDCARD,
};
pub use registry::{AddressRegistry, PeerAddress, Registration};
pub use socket::SocketLayer;
