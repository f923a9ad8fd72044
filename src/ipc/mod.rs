//! ALPC-style inter-process communication
//!
//! Ports, the messages that travel between them and the attributes that
//! ride alongside. Leaf modules first:
//!
//! - [`message`] and [`attributes`]: wire layouts
//! - [`mqueue`]: blocking per-port queues with delivery tickets
//! - [`port`]: port objects, attributes and lifecycle state
//! - [`section`], [`security`], [`reserve`]: port-owned resources
//! - [`connect`] and [`exchange`]: the handshake and send-wait-receive
//! - [`info`]: information classes
//! - [`guard`]: scoped ownership of port resources

pub mod attributes;
pub mod connect;
pub mod exchange;
pub mod guard;
pub mod info;
pub mod message;
pub mod mqueue;
pub mod port;
pub mod reserve;
pub mod section;
pub mod security;

pub use attributes::{
    Attribute, AttributeBuffer, AttributeBundle, AttributeFlags, AttributeKind, AttributeLayout,
    ContextAttr, DirectAttr, HandleAttr, HandleAttrFlags, ObjectTypes, SecurityAttr,
    SecurityAttrFlags, TokenAttr, ViewAttr, ViewAttrFlags, WorkOnBehalfAttr,
};
pub use connect::{ConnectOptions, DisconnectFlags};
pub use exchange::{CancelFlags, MessageFlags};
pub use guard::{PortResource, Scoped};
pub use info::{BasicInformation, MessageInformationClass, PortInformationClass};
pub use message::{
    MessageBuffer, MessageType, PortMessage, PortMessageHeader, TypeFlags, PORT_MESSAGE_HEADER_SIZE,
};
pub use mqueue::{DeliveryTicket, TicketState};
pub use port::{PortAttributeFlags, PortAttributes, PortKind, PortState};
pub use security::{ImpersonationFlags, SecurityContextState};
