//! c8ylp-proxy: The local proxy core.
//!
//! Bridges native TCP clients to device tunnels exposed by the Cumulocity
//! remote-access gateway. One accepted TCP connection maps to one
//! authenticated WebSocket tunnel; two byte pumps move the opaque stream
//! in both directions until either side ends.

pub mod acceptor;
pub mod bridge;
pub mod resolver;
pub mod supervisor;
pub mod tunnel;

pub use acceptor::{Acceptor, BoundAcceptor};
pub use bridge::{BridgeConfig, BridgeReport, TCP_SIZE_DEFAULT, TCP_SIZE_MAX, TCP_SIZE_MIN};
pub use resolver::{Credentials, CumulocityResolver, ResolveRequest};
pub use supervisor::{RunOptions, Supervisor};
