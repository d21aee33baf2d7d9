//! c8ylp-core: Shared types for the Cumulocity local proxy.
//!
//! Provides the error enum, the immutable tunnel descriptor with a
//! redactable bearer token, local endpoint and acceptor mode types, and
//! the exit-status mapping used by the CLI.

pub mod descriptor;
pub mod error;
pub mod status;

// Re-export commonly used items at crate root.
pub use descriptor::{AcceptorMode, LocalEndpoint, SecretToken, TerminalCause, TunnelDescriptor};
pub use error::{ProxyError, ProxyResult};
pub use status::ExitStatus;
