//! Connection handshake and port lifecycle
//!
//! Connect queues a `ConnectionRequest` on the server's connection port and
//! blocks the client until the server accepts, refuses, or the deadline
//! passes. Accept pairs a fresh server communication port with the client
//! port. Disconnect is idempotent and notifies the peer with `PortClosed`.

use alloc::sync::{Arc, Weak};
use bitflags::bitflags;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

use super::attributes::AttributeBundle;
use super::message::{MessageType, PortMessage};
use super::mqueue::{DeliveryTicket, Envelope};
use super::port::{PortAttributes, PortKind, PortObject, PortState};
use crate::access::{AccessRights, PortOperation, RequiredServer, ALPC_GENERIC_MAPPING};
use crate::error::{AlpcError, Result};
use crate::identity;
use crate::transport::{Port, Transport};
use crate::types::Timeout;

bitflags! {
    /// Flags for `disconnect_port`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DisconnectFlags: u32 {
        /// Cancel this port's messages still queued at the peer
        const NO_FLUSH_ON_CLOSE = 0x1;
    }
}

// ============================================================================
// Pending connections
// ============================================================================

enum PendingState {
    Waiting,
    Accepted(PortMessage),
    Refused,
    /// Client stopped waiting
    Abandoned,
}

/// Rendezvous between a blocked client and the accepting server
pub(crate) struct PendingConnection {
    client: Weak<PortObject>,
    state: Mutex<PendingState>,
    decided: Condvar,
}

impl PendingConnection {
    fn new(client: &Arc<PortObject>) -> Arc<Self> {
        Arc::new(Self {
            client: Arc::downgrade(client),
            state: Mutex::new(PendingState::Waiting),
            decided: Condvar::new(),
        })
    }

    /// Refuse unless already decided
    pub(crate) fn refuse(&self) {
        let mut state = self.state.lock();
        if matches!(*state, PendingState::Waiting) {
            *state = PendingState::Refused;
            self.decided.notify_all();
        }
    }

    /// Still waiting for the server's decision
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), PendingState::Waiting)
    }

    /// Block the client until a decision or the deadline
    fn wait(&self, deadline: Option<Instant>) -> Result<PortMessage> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                PendingState::Accepted(reply) => return Ok(reply.clone()),
                PendingState::Refused => return Err(AlpcError::ConnectionRefused),
                PendingState::Abandoned => return Err(AlpcError::PortDisconnected),
                PendingState::Waiting => {}
            }
            match deadline {
                None => self.decided.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        *state = PendingState::Abandoned;
                        return Err(AlpcError::Timeout);
                    }
                    let _ = self.decided.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

/// Options for connecting to a named connection port
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Attributes of the client port; transport defaults when `None`
    pub attributes: Option<PortAttributes>,
    /// Server principal the client insists on
    pub required_server: Option<RequiredServer>,
    /// Payload delivered to the server with the connection request
    pub connection_message: Option<PortMessage>,
    /// Attributes sent with the connection request
    pub message_attributes: Option<AttributeBundle>,
    pub timeout: Timeout,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attributes(mut self, attributes: PortAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn with_required_server(mut self, required: RequiredServer) -> Self {
        self.required_server = Some(required);
        self
    }

    pub fn with_connection_message(mut self, message: PortMessage) -> Self {
        self.connection_message = Some(message);
        self
    }

    pub fn with_message_attributes(mut self, attributes: AttributeBundle) -> Self {
        self.message_attributes = Some(attributes);
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }
}

// ============================================================================
// Create and connect
// ============================================================================

impl Transport {
    /// Create a listening connection port, optionally under a name
    pub fn create_port(&self, name: Option<&str>, attributes: Option<PortAttributes>) -> Result<Port> {
        let shared = &self.inner;
        let attributes = attributes.unwrap_or(shared.config.default_port_attributes);
        attributes.validate(shared.config.max_message_length)?;

        let principal = identity::effective_principal();
        let rights = AccessRights::GENERIC_ALL.map_generic(&ALPC_GENERIC_MAPPING);
        if !shared
            .access
            .can_perform(&principal, PortOperation::Create, name, rights)
        {
            return Err(AlpcError::AccessDenied);
        }

        let port = PortObject::new(
            shared.clone(),
            PortKind::Connection,
            name.map(String::from),
            attributes,
            0,
        );
        if let Some(name) = name {
            shared.register(name, &port)?;
        }
        debug!("port {:?}: created connection port {:?}", port.id, name);
        Ok(Port::from_object(port))
    }

    /// Connect to the connection port registered under `name`.
    ///
    /// A server requirement must be a SID here; descriptor requirements go
    /// through [`Transport::connect_port_ex`]. Returns the connected client
    /// port and the server's connection reply.
    pub fn connect_port(&self, name: &str, options: ConnectOptions) -> Result<(Port, PortMessage)> {
        if let Some(RequiredServer::Descriptor(_)) = options.required_server {
            return Err(AlpcError::InvalidParameter(
                "descriptor requirements need connect_port_ex",
            ));
        }
        self.connect(name, None, options)
    }

    /// Connect, also naming the client port and allowing a descriptor
    /// requirement on the server
    pub fn connect_port_ex(
        &self,
        name: &str,
        client_name: Option<&str>,
        options: ConnectOptions,
    ) -> Result<(Port, PortMessage)> {
        self.connect(name, client_name, options)
    }

    fn connect(
        &self,
        name: &str,
        client_name: Option<&str>,
        options: ConnectOptions,
    ) -> Result<(Port, PortMessage)> {
        let shared = &self.inner;
        let attributes = options
            .attributes
            .unwrap_or(shared.config.default_port_attributes);
        attributes.validate(shared.config.max_message_length)?;

        let principal = identity::effective_principal();
        if !shared
            .access
            .can_perform(&principal, PortOperation::Connect, Some(name), AccessRights::CONNECT)
        {
            return Err(AlpcError::AccessDenied);
        }

        let server = shared.lookup(name).ok_or(AlpcError::NotFound)?;
        server.ensure_live()?;
        if let Some(required) = &options.required_server {
            if !shared.access.server_satisfies(required, &server.owner) {
                return Err(AlpcError::AccessDenied);
            }
        }

        let client = PortObject::new(
            shared.clone(),
            PortKind::ClientCommunication,
            client_name.map(String::from),
            attributes,
            0,
        );

        let mut request = match options.connection_message {
            Some(message) => message,
            None => PortMessage::new(&[])?,
        };
        let max = attributes
            .max_message_length
            .min(server.attributes.max_message_length);
        if request.total_length() > max {
            return Err(AlpcError::MessageTooLarge {
                size: request.total_length(),
                max,
            });
        }

        let message_id = shared.next_message_id();
        request.stamp(MessageType::ConnectionRequest, message_id, identity::current_client_id());
        let outgoing = client.resolve_outgoing(&server, options.message_attributes.as_ref())?;
        let pending = PendingConnection::new(&client);
        let ticket = DeliveryTicket::new(message_id, request.header.trailer.callback_id(), true, false);
        let origin = client.origin(&request, outgoing.security.clone());
        let envelope = Envelope {
            message: request,
            attributes: outgoing.attributes,
            shared_view: outgoing.view,
            ticket,
            origin,
            connection: Some(pending.clone()),
            sequence: 0,
            pooled: false,
        };
        server.queue.push(envelope, server.pool_limit())?;
        debug!("port {:?}: connecting to {:?} (request {})", client.id, name, message_id);

        match pending.wait(options.timeout.deadline()) {
            Ok(reply) => {
                debug!("port {:?}: connected to {:?}", client.id, name);
                Ok((Port::from_object(client), reply))
            }
            Err(err) => {
                // Accepting a request the server already took reports the
                // abandonment through its retained record
                server.queue.withdraw(message_id);
                server.pending.lock().remove(&message_id);
                debug!("port {:?}: connect to {:?} failed: {}", client.id, name, err);
                Err(err)
            }
        }
    }
}

// ============================================================================
// Accept
// ============================================================================

impl Port {
    /// Accept or refuse a connection request received on this connection
    /// port.
    ///
    /// `reply` must carry the request's message id; its payload is handed
    /// to the client as the connection reply. Refusing returns `Ok(None)`.
    pub fn accept_connect_port(
        &self,
        attributes: Option<PortAttributes>,
        port_context: u64,
        reply: &PortMessage,
        accept: bool,
    ) -> Result<Option<Port>> {
        let port = &self.object;
        if port.kind != PortKind::Connection {
            return Err(AlpcError::InvalidParameter("not a connection port"));
        }
        port.ensure_live()?;

        let message_id = reply.message_id();
        let pending = port.pending.lock().remove(&message_id);
        let Some(pending) = pending else {
            let mut retained = port.retained.lock();
            let abandoned = retained
                .get(message_id)
                .is_some_and(|record| record.kind == MessageType::ConnectionRequest);
            if abandoned {
                retained.remove(message_id);
                return Err(AlpcError::PortDisconnected);
            }
            return Err(AlpcError::NotFound);
        };
        let record = port.retained.lock().remove(message_id);

        if !accept {
            pending.refuse();
            debug!("port {:?}: refused connection {}", port.id, message_id);
            return Ok(None);
        }

        let attributes = attributes.unwrap_or(port.shared.config.default_port_attributes);
        attributes.validate(port.shared.config.max_message_length)?;

        let mut state = pending.state.lock();
        if !matches!(*state, PendingState::Waiting) {
            return Err(AlpcError::PortDisconnected);
        }
        let client = pending.client.upgrade().ok_or(AlpcError::PortDisconnected)?;

        let server = PortObject::new(
            port.shared.clone(),
            PortKind::ServerCommunication,
            None,
            attributes,
            port_context,
        );
        {
            let mut links = server.links.lock();
            links.peer = Arc::downgrade(&client);
            links.connection = Arc::downgrade(port);
            links.peer_principal = Some(
                record
                    .map(|record| record.origin.principal)
                    .unwrap_or_else(|| client.owner.clone()),
            );
        }
        {
            let mut links = client.links.lock();
            links.peer = Arc::downgrade(&server);
            links.connection = Arc::downgrade(port);
            links.peer_principal = Some(port.owner.clone());
        }
        port.links.lock().accepted.push(Arc::downgrade(&server));
        server.set_state(PortState::Connected);
        client.set_state(PortState::Connected);

        let mut connection_reply = PortMessage::new(reply.data())?;
        connection_reply.stamp(
            MessageType::ConnectionReply,
            message_id,
            identity::current_client_id(),
        );
        *state = PendingState::Accepted(connection_reply);
        pending.decided.notify_all();
        drop(state);

        debug!(
            "port {:?}: accepted connection {} as port {:?}",
            port.id, message_id, server.id
        );
        Ok(Some(Port::from_object(server)))
    }

    /// Disconnect the port. Calling it again is a no-op.
    pub fn disconnect_port(&self, flags: DisconnectFlags) {
        self.object.disconnect(flags);
    }
}

// ============================================================================
// Disconnect and close
// ============================================================================

impl PortObject {
    pub(crate) fn disconnect(self: &Arc<Self>, flags: DisconnectFlags) {
        {
            let mut state = self.state.lock();
            match *state {
                PortState::Disconnected | PortState::Closed => return,
                _ => *state = PortState::Disconnected,
            }
        }
        debug!("port {:?}: disconnecting ({:?})", self.id, flags);

        if flags.contains(DisconnectFlags::NO_FLUSH_ON_CLOSE) {
            for ticket in self.sent.lock().values() {
                // Only still-queued messages can be withdrawn; the rest stay delivered
                let _ = ticket.cancel(true);
            }
        }

        for envelope in self.queue.close() {
            envelope.ticket.abandon();
            if let Some(pending) = &envelope.connection {
                pending.refuse();
            }
            if let Some(origin) = envelope.origin.port.upgrade() {
                origin.queue.notify_all();
            }
        }
        for record in self.retained.lock().drain() {
            if record.kind.expects_reply() {
                record.ticket.abandon();
                if let Some(origin) = record.origin.port.upgrade() {
                    origin.queue.notify_all();
                }
            }
        }
        for (_, pending) in core::mem::take(&mut *self.pending.lock()) {
            pending.refuse();
        }

        match self.kind {
            PortKind::Connection => {
                if let Some(name) = &self.name {
                    self.shared.unregister(name, self);
                }
                let accepted = core::mem::take(&mut self.links.lock().accepted);
                for port in accepted.iter().filter_map(Weak::upgrade) {
                    port.disconnect(flags);
                }
            }
            PortKind::ClientCommunication | PortKind::ServerCommunication => {
                if let Some(peer) = self.peer() {
                    peer.peer_closed(self);
                }
            }
        }
    }

    /// The other end of the conversation went away
    fn peer_closed(&self, closing: &Arc<PortObject>) {
        let mut message = PortMessage::empty();
        message.stamp(
            MessageType::PortClosed,
            self.shared.next_message_id(),
            closing.owner_client,
        );
        let envelope = Envelope {
            ticket: DeliveryTicket::new(message.message_id(), 0, false, false),
            origin: closing.origin(&message, None),
            message,
            attributes: AttributeBundle::new(),
            shared_view: None,
            connection: None,
            sequence: 0,
            pooled: false,
        };
        // A server learns about closed clients on its connection port
        let notified = match self.kind {
            PortKind::ServerCommunication => self.connection().map(|c| c.queue.push(envelope, None)),
            _ => Some(self.queue.push(envelope, None)),
        };
        if let Some(Err(err)) = notified {
            trace!("port {:?}: close notice not queued: {}", self.id, err);
        }

        {
            let mut state = self.state.lock();
            if matches!(*state, PortState::Created | PortState::Connected) {
                *state = PortState::Disconnected;
            }
        }
        self.queue.shutdown();
        debug!("port {:?}: peer {:?} closed", self.id, closing.id);
    }

    /// Final teardown when the owning handle is dropped
    pub(crate) fn close(self: &Arc<Self>) {
        self.disconnect(DisconnectFlags::empty());
        if let Some(name) = &self.name {
            self.shared.unregister(name, self);
        }
        *self.resources.lock() = Default::default();
        self.set_state(PortState::Closed);
        debug!("port {:?}: closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_create_port_names_are_unique() {
        let transport = Transport::default();
        let first = transport.create_port(Some("\\RPC Control\\unique"), None).unwrap();
        assert!(matches!(
            transport.create_port(Some("\\RPC Control\\unique"), None),
            Err(AlpcError::NameCollision)
        ));
        drop(first);
        assert!(transport.create_port(Some("\\RPC Control\\unique"), None).is_ok());
    }

    #[test]
    fn test_connect_missing_name() {
        let transport = Transport::default();
        assert!(matches!(
            transport.connect_port("\\nobody", ConnectOptions::new()),
            Err(AlpcError::NotFound)
        ));
    }

    #[test]
    fn test_connect_times_out_without_acceptor() {
        let transport = Transport::default();
        let server = transport
            .create_port(
                Some("\\silent"),
                Some(PortAttributes::new().with_max_message_length(1000)),
            )
            .unwrap();
        let result = transport.connect_port(
            "\\silent",
            ConnectOptions::new()
                .with_connection_message(PortMessage::new(&[0; 200]).unwrap())
                .with_timeout(Duration::from_millis(500)),
        );
        assert!(matches!(result, Err(AlpcError::Timeout)));
        // The withdrawn request is gone from the server queue
        assert!(server.object.queue.is_empty());
    }

    #[test]
    fn test_refused_connection() {
        let transport = Transport::default();
        let server = transport.create_port(Some("\\refuser"), None).unwrap();
        let client = {
            let transport = transport.clone();
            thread::spawn(move || transport.connect_port("\\refuser", ConnectOptions::new()).map(|_| ()))
        };
        let request = server.receive(256, Timeout::from_millis(2000)).unwrap();
        assert_eq!(request.kind(), Some(MessageType::ConnectionRequest));
        assert!(server.accept_connect_port(None, 0, &request, false).unwrap().is_none());
        assert_eq!(client.join().unwrap(), Err(AlpcError::ConnectionRefused));
    }

    #[test]
    fn test_abandoned_request_leaves_nothing_pending() {
        let transport = Transport::default();
        let server = transport.create_port(Some("\\impatient"), None).unwrap();
        let client = {
            let transport = transport.clone();
            thread::spawn(move || {
                transport
                    .connect_port(
                        "\\impatient",
                        ConnectOptions::new().with_timeout(Duration::from_millis(200)),
                    )
                    .map(|_| ())
            })
        };
        let request = server.receive(256, Timeout::from_millis(2000)).unwrap();
        assert_eq!(client.join().unwrap(), Err(AlpcError::Timeout));
        assert!(server.object.pending.lock().is_empty());

        assert!(matches!(
            server.accept_connect_port(None, 0, &request, true),
            Err(AlpcError::PortDisconnected)
        ));
        assert!(matches!(
            server.accept_connect_port(None, 0, &request, true),
            Err(AlpcError::NotFound)
        ));
    }

    #[test]
    fn test_descriptor_requirement_needs_ex() {
        let transport = Transport::default();
        let _server = transport.create_port(Some("\\strict"), None).unwrap();
        let options = ConnectOptions::new().with_required_server(RequiredServer::Descriptor(vec![1]));
        assert!(matches!(
            transport.connect_port("\\strict", options.clone()),
            Err(AlpcError::InvalidParameter(_))
        ));
        assert!(matches!(
            transport.connect_port_ex("\\strict", None, options),
            Err(AlpcError::AccessDenied)
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let transport = Transport::default();
        let server = transport.create_port(Some("\\twice"), None).unwrap();
        server.disconnect_port(DisconnectFlags::empty());
        assert_eq!(server.state(), PortState::Disconnected);
        server.disconnect_port(DisconnectFlags::NO_FLUSH_ON_CLOSE);
        assert_eq!(server.state(), PortState::Disconnected);
        assert!(matches!(
            transport.connect_port("\\twice", ConnectOptions::new()),
            Err(AlpcError::NotFound)
        ));
    }
}
