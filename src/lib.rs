//! ALPC_R - local connection-oriented message passing with ALPC port semantics
//!
//! This crate provides named connection ports, the connect/accept
//! handshake, the synchronous send-wait-receive exchange with cancellation
//! and timeouts, and the out-of-band attribute bundle that rides alongside
//! each message (security contexts, shared views, handles, direct events,
//! tokens and work-on-behalf tickets).
//!
//! Access checks and sender process/thread opening are external
//! collaborators, supplied through the [`access`] traits.

// Large error payloads carry retry context (required and granted sizes)
#![allow(clippy::result_large_err)]

extern crate alloc;

// Core types
pub mod error;
pub mod types;

// Configuration and identity
pub mod access;
pub mod config;
pub mod identity;

// Transport
pub mod ipc;
pub mod transport;

pub use access::{AccessCheck, AccessRights, AllowAll, RequiredServer, SenderOpener};
pub use config::{attribute_header_size, max_allowed_message_length, TransportConfig};
pub use error::{AlpcError, Result};
pub use identity::{ImpersonationGuard, ImpersonationLevel, Principal, SecurityQos, Sid};
pub use ipc::{
    AttributeBundle, AttributeFlags, CancelFlags, ConnectOptions, DisconnectFlags, MessageBuffer,
    MessageFlags, MessageType, PortAttributes, PortMessage, PortState,
};
pub use transport::{Port, Transport};
pub use types::{AlpcHandle, ClientId, MessageId, Timeout};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "ALPC_R";
