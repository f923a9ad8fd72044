//! Message exchange - send-wait-receive, replies and cancellation
//!
//! A single [`Port::send_wait_receive`] call sends an optional message, then
//! blocks for an optional incoming one. Routing follows the conversation:
//!
//! - a client communication port sends into the server's connection port
//! - a server communication port sends into the client port
//! - a reply travels back to whichever port sent the request
//!
//! The receiving port remembers every request, datagram and connection
//! request it hands out, so the server can reply to, impersonate, or query
//! the sender of that message later by its message id.

use alloc::sync::Arc;
use bitflags::bitflags;
use log::{debug, trace};

use super::attributes::{
    Attribute, AttributeBundle, AttributeKind, ContextAttr, HandleAttrFlags, SecurityAttrFlags,
    TokenAttr,
};
use super::message::{MessageBuffer, MessageType, PortMessage, PortMessageHeader, TypeFlags};
use super::mqueue::{DeliveryTicket, Envelope, Origin, Wanted};
use super::port::{DeliveredRecord, PortAttributeFlags, PortObject};
use super::section::SharedView;
use super::security::SecurityContext;
use crate::error::{AlpcError, Result};
use crate::identity;
use crate::transport::Port;
use crate::types::{MessageId, Timeout};

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Flags for [`Port::send_wait_receive`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        /// The outgoing message answers a received request
        const REPLY_MESSAGE = 0x1;
        const LPC_MODE = 0x2;
        /// Drop the record of a received message without replying
        const RELEASE_MESSAGE = 0x1_0000;
        /// Receive only the reply to the request just sent
        const SYNC_REQUEST = 0x2_0000;
        const WAIT_USER_MODE = 0x10_0000;
        const WAIT_ALERTABLE = 0x20_0000;
        const WOW64_CALL = 0x8000_0000;
    }
}

bitflags! {
    /// Flags for [`Port::cancel_message`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CancelFlags: u32 {
        /// Only cancel a message no receiver has taken yet
        const TRY_CANCEL = 0x1;
        /// Skip the sequence and callback id match
        const NO_CONTEXT_CHECK = 0x8;
    }
}

// ============================================================================
// Outgoing attributes
// ============================================================================

/// Sender attributes resolved against the port's resources
pub(crate) struct Outgoing {
    pub attributes: AttributeBundle,
    pub view: Option<SharedView>,
    pub security: Option<Arc<SecurityContext>>,
}

fn check_length(message: &PortMessage, max: usize) -> Result<()> {
    message.header.validate(max)?;
    if message.header.length.data_length() as usize != message.data().len() {
        return Err(AlpcError::InvalidParameter("data length does not match the payload"));
    }
    // Delivery writes the header and payload only
    if message.header.length.total_length() as usize != message.total_length() {
        return Err(AlpcError::InvalidParameter("total length does not match the payload"));
    }
    Ok(())
}

impl PortObject {
    /// Resolve the attributes a sender attached for delivery to `target`
    pub(crate) fn resolve_outgoing(
        &self,
        target: &PortObject,
        bundle: Option<&AttributeBundle>,
    ) -> Result<Outgoing> {
        let Some(bundle) = bundle else {
            return Ok(Outgoing {
                attributes: AttributeBundle::new(),
                view: None,
                security: None,
            });
        };
        let mut attributes = bundle.clone();
        // The transport fills these in on receive
        attributes.take(AttributeKind::Token);

        let security = match bundle.security() {
            Some(attr) if !attr.context.is_null() => {
                let context = self.security_context(attr.context)?;
                context.impersonation()?;
                Some(context)
            }
            Some(attr) if attr.flags.contains(SecurityAttrFlags::CREATE_HANDLE) => {
                let qos = attr.qos.unwrap_or(self.attributes.security_qos);
                Some(SecurityContext::capture(self.shared.allocate_handle(), qos))
            }
            _ => None,
        };

        let view = bundle.view().map(|attr| self.share_view(attr)).transpose()?;

        if let Some(handle) = bundle.handle() {
            if !target.attributes.flags.contains(PortAttributeFlags::ALLOW_DUP_OBJECT) {
                return Err(AlpcError::InvalidParameter(
                    "receiving port does not accept handles",
                ));
            }
            let indirect = handle.flags.contains(HandleAttrFlags::INDIRECT);
            if !indirect && !target.attributes.dup_object_types.contains(handle.object_type) {
                return Err(AlpcError::AccessDenied);
            }
        }

        Ok(Outgoing {
            attributes,
            view,
            security,
        })
    }

    /// What the receiver of `message` learns about its sender
    pub(crate) fn origin(
        self: &Arc<Self>,
        message: &PortMessage,
        security: Option<Arc<SecurityContext>>,
    ) -> Origin {
        let declined = message.header.kind.flags().contains(TypeFlags::NO_IMPERSONATE);
        Origin {
            port: Arc::downgrade(self),
            client_id: message.header.client_id,
            port_context: self.conversation_context(),
            principal: self.sender_principal(),
            impersonation: self.offered_impersonation(declined),
            security,
        }
    }

    /// Send a request or datagram; returns the ticket when a reply is due
    fn send_message(
        self: &Arc<Self>,
        flags: MessageFlags,
        message: &mut PortMessage,
        attributes: Option<&AttributeBundle>,
        receiving: bool,
    ) -> Result<Option<Arc<DeliveryTicket>>> {
        let kind = match message.kind() {
            Some(kind @ (MessageType::Request | MessageType::Datagram)) => kind,
            None if message.header.kind.raw_type() == 0 => {
                if flags.contains(MessageFlags::SYNC_REQUEST) || receiving {
                    MessageType::Request
                } else {
                    MessageType::Datagram
                }
            }
            _ => {
                return Err(AlpcError::InvalidParameter(
                    "only requests, datagrams and replies can be sent",
                ))
            }
        };
        self.ensure_live()?;
        let target = self.send_target()?;
        let max = self
            .attributes
            .max_message_length
            .min(target.attributes.max_message_length)
            .min(self.shared.config.max_message_length);
        check_length(message, max)?;
        self.check_reserve(message)?;
        let outgoing = self.resolve_outgoing(&target, attributes)?;

        let message_id = self.shared.next_message_id();
        message.stamp(kind, message_id, identity::current_client_id());
        let ticket = DeliveryTicket::new(
            message_id,
            message.header.trailer.callback_id(),
            kind.expects_reply(),
            outgoing.attributes.direct().is_some(),
        );
        let envelope = Envelope {
            message: message.clone(),
            attributes: outgoing.attributes,
            shared_view: outgoing.view,
            ticket: ticket.clone(),
            origin: self.origin(message, outgoing.security),
            connection: None,
            sequence: 0,
            pooled: false,
        };
        // A reserve charged against the target already holds room for the message
        let pool_limit = if self.claim_reserve(message, &target, &ticket)? {
            None
        } else {
            target.pool_limit()
        };
        if let Err(err) = target.queue.push(envelope, pool_limit) {
            self.unclaim_reserve(message, &ticket);
            return Err(err);
        }
        self.track_sent(ticket.clone());
        trace!("port {:?}: sent {:?} {} to port {:?}", self.id, kind, message_id, target.id);
        Ok(kind.expects_reply().then_some(ticket))
    }

    /// Route a reply back to the port the request came from.
    ///
    /// Replies skip the requester's pool check: the requester is already
    /// waiting for them, and refusing one would strand the request.
    fn send_reply(
        self: &Arc<Self>,
        message: &mut PortMessage,
        attributes: Option<&AttributeBundle>,
    ) -> Result<()> {
        let message_id = message.message_id();
        let (kind, requester, callback_id) = self.with_record(message_id, |record| {
            (record.kind, record.origin.port.upgrade(), record.ticket.callback_id())
        })?;
        if kind != MessageType::Request {
            return Err(AlpcError::InvalidParameter("message does not expect a reply"));
        }
        let requester = requester.ok_or(AlpcError::PortDisconnected)?;
        let max = self
            .attributes
            .max_message_length
            .min(requester.attributes.max_message_length)
            .min(self.shared.config.max_message_length);
        check_length(message, max)?;
        self.check_reserve(message)?;
        let outgoing = self.resolve_outgoing(&requester, attributes)?;
        let ticket = DeliveryTicket::new(
            message_id,
            callback_id,
            false,
            outgoing.attributes.direct().is_some(),
        );
        self.claim_reserve(message, &requester, &ticket)?;

        let Some(record) = self.take_record(message_id) else {
            self.unclaim_reserve(message, &ticket);
            return Err(AlpcError::NotFound);
        };
        if !record.ticket.complete_reply() {
            // The requester stopped waiting; nobody will read the reply
            self.unclaim_reserve(message, &ticket);
            trace!("port {:?}: reply {} dropped, request cancelled", self.id, message_id);
            return Ok(());
        }

        message.stamp(MessageType::Reply, message_id, identity::current_client_id());
        let envelope = Envelope {
            message: message.clone(),
            attributes: outgoing.attributes,
            shared_view: outgoing.view,
            ticket: ticket.clone(),
            origin: self.origin(message, outgoing.security),
            connection: None,
            sequence: 0,
            pooled: false,
        };
        if let Err(err) = requester.queue.push(envelope, None) {
            self.unclaim_reserve(message, &ticket);
            return Err(err);
        }
        self.track_sent(ticket);
        trace!("port {:?}: replied to {} on port {:?}", self.id, message_id, requester.id);
        Ok(())
    }

    /// Hand a dequeued envelope to the caller and record it
    fn deliver(
        &self,
        envelope: Envelope,
        buffer: &mut MessageBuffer,
        receive_attributes: Option<&mut AttributeBundle>,
    ) -> Result<()> {
        let Envelope {
            message,
            attributes,
            shared_view,
            ticket,
            origin,
            connection,
            sequence,
            ..
        } = envelope;
        buffer.fill(&message)?;

        if let Some(out) = receive_attributes {
            out.clear_valid();
            for kind in AttributeKind::iter(out.allocated()) {
                let value = match kind {
                    AttributeKind::Security => attributes.security().map(|a| Attribute::Security(*a)),
                    AttributeKind::View => shared_view
                        .as_ref()
                        .map(|view| Attribute::View(self.map_shared(view))),
                    AttributeKind::Context => Some(Attribute::Context(ContextAttr {
                        port_context: origin.port_context,
                        message_context: attributes.context().map_or(0, |c| c.message_context),
                        sequence,
                        message_id: message.message_id(),
                        callback_id: ticket.callback_id(),
                    })),
                    AttributeKind::Handle => attributes.handle().map(|a| Attribute::Handle(*a)),
                    AttributeKind::Token => {
                        let token = match &origin.security {
                            Some(context) => context.principal().token,
                            None => origin.principal.token,
                        };
                        Some(Attribute::Token(TokenAttr {
                            token_id: token.token_id,
                            authentication_id: token.authentication_id,
                            modified_id: token.modified_id,
                        }))
                    }
                    // Completion events stay with the sender
                    AttributeKind::Direct => None,
                    AttributeKind::WorkOnBehalfOf => attributes
                        .work_on_behalf()
                        .map(|a| Attribute::WorkOnBehalfOf(*a)),
                };
                if let Some(value) = value {
                    out.insert(value);
                }
            }
        }

        let message_id = message.message_id();
        if let Some(kind @ (MessageType::Request | MessageType::Datagram | MessageType::ConnectionRequest)) =
            message.kind()
        {
            if let Some(pending) = connection {
                // A client that already gave up removes its own entry
                let mut waiting = self.pending.lock();
                if pending.is_waiting() {
                    waiting.insert(message_id, pending);
                }
            }
            self.remember(DeliveredRecord {
                message_id,
                kind,
                client_id: message.header.client_id,
                ticket,
                origin,
                handle: attributes.handle().copied(),
            });
        }
        trace!("port {:?}: received {:?} {} seq={}", self.id, message.kind(), message_id, sequence);
        Ok(())
    }
}

// ============================================================================
// Port operations
// ============================================================================

impl Port {
    /// Send a message, then wait for one.
    ///
    /// Without `send` the call only waits; without `receive` it only sends.
    /// With [`MessageFlags::SYNC_REQUEST`] the wait is for the reply to the
    /// request just sent. A message that does not fit in `receive` stays
    /// queued and the call fails with the size it needs.
    pub fn send_wait_receive(
        &self,
        flags: MessageFlags,
        send: Option<&mut PortMessage>,
        send_attributes: Option<&AttributeBundle>,
        receive: Option<&mut MessageBuffer>,
        receive_attributes: Option<&mut AttributeBundle>,
        timeout: Timeout,
    ) -> Result<()> {
        let port = &self.object;
        let deadline = timeout.deadline();

        let mut awaiting = None;
        if let Some(message) = send {
            if flags.contains(MessageFlags::RELEASE_MESSAGE) {
                let record = port.take_record(message.message_id()).ok_or(AlpcError::NotFound)?;
                if let Some(pending) = port.pending.lock().remove(&record.message_id) {
                    pending.refuse();
                }
                // A released request will never see its reply
                if record.kind.expects_reply() {
                    record.ticket.abandon();
                    if let Some(origin) = record.origin.port.upgrade() {
                        origin.queue.notify_all();
                    }
                }
                debug!("port {:?}: released message {}", port.id, message.message_id());
            } else if flags.contains(MessageFlags::REPLY_MESSAGE)
                || message.kind() == Some(MessageType::Reply)
            {
                port.send_reply(message, send_attributes)?;
            } else {
                awaiting = port.send_message(flags, message, send_attributes, receive.is_some())?;
            }
        }

        let Some(buffer) = receive else {
            return Ok(());
        };
        let wanted = match &awaiting {
            Some(ticket) if flags.contains(MessageFlags::SYNC_REQUEST) => Wanted::ReplyTo(ticket.as_ref()),
            _ => Wanted::Any,
        };
        let envelope = match port.queue.pop(wanted, buffer.capacity(), deadline) {
            Ok(envelope) => envelope,
            Err(AlpcError::Cancelled) if port.ensure_live().is_err() => {
                return Err(AlpcError::PortDisconnected)
            }
            Err(err) => return Err(err),
        };
        buffer.clear();
        port.deliver(envelope, buffer, receive_attributes)
    }

    /// Send a datagram or request without waiting
    pub fn send(&self, message: &mut PortMessage, attributes: Option<&AttributeBundle>) -> Result<()> {
        self.send_wait_receive(MessageFlags::empty(), Some(message), attributes, None, None, Timeout::Infinite)
    }

    /// Wait for the next message, up to `capacity` bytes long
    pub fn receive(&self, capacity: usize, timeout: impl Into<Timeout>) -> Result<PortMessage> {
        let mut buffer = MessageBuffer::with_capacity(capacity);
        self.send_wait_receive(MessageFlags::empty(), None, None, Some(&mut buffer), None, timeout.into())?;
        buffer.message()
    }

    /// Send a request and wait for its reply
    pub fn request(
        &self,
        message: &mut PortMessage,
        capacity: usize,
        timeout: impl Into<Timeout>,
    ) -> Result<PortMessage> {
        let mut buffer = MessageBuffer::with_capacity(capacity);
        self.send_wait_receive(
            MessageFlags::SYNC_REQUEST,
            Some(message),
            None,
            Some(&mut buffer),
            None,
            timeout.into(),
        )?;
        buffer.message()
    }

    /// Reply to a received request
    pub fn reply(&self, request: &PortMessageHeader, data: &[u8]) -> Result<()> {
        let mut reply = PortMessage::reply_to(request, data)?;
        self.send_wait_receive(
            MessageFlags::REPLY_MESSAGE,
            Some(&mut reply),
            None,
            None,
            None,
            Timeout::Infinite,
        )
    }

    /// Context identifying a message sent from this port, for cancellation
    pub fn sent_message_context(&self, message_id: MessageId) -> Result<ContextAttr> {
        let ticket = self.object.sent_ticket(message_id).ok_or(AlpcError::NotFound)?;
        Ok(ContextAttr {
            port_context: self.object.port_context,
            message_context: 0,
            sequence: ticket.sequence(),
            message_id,
            callback_id: ticket.callback_id(),
        })
    }

    /// Cancel a message sent from this port.
    ///
    /// Succeeds when the message was withdrawn (or already cancelled) and
    /// reports `AlreadyDelivered` when the receiver won the race.
    pub fn cancel_message(&self, flags: CancelFlags, context: &ContextAttr) -> Result<()> {
        let port = &self.object;
        let ticket = port.sent_ticket(context.message_id).ok_or(AlpcError::NotFound)?;
        if !flags.contains(CancelFlags::NO_CONTEXT_CHECK)
            && (ticket.sequence() != context.sequence || ticket.callback_id() != context.callback_id)
        {
            return Err(AlpcError::NotFound);
        }
        ticket.cancel(flags.contains(CancelFlags::TRY_CANCEL))?;
        // A thread blocked on the reply must observe the cancel
        port.queue.notify_all();
        debug!("port {:?}: cancelled message {}", port.id, context.message_id);
        Ok(())
    }

    /// Open the process that sent a received message
    pub fn open_sender_process(&self, message: &PortMessageHeader, desired_access: u32) -> Result<u64> {
        let client = self.object.with_record(message.message_id, |record| record.origin.client_id)?;
        self.object.shared.opener.open_process(client, desired_access)
    }

    /// Open the thread that sent a received message
    pub fn open_sender_thread(&self, message: &PortMessageHeader, desired_access: u32) -> Result<u64> {
        let client = self.object.with_record(message.message_id, |record| record.origin.client_id)?;
        self.object.shared.opener.open_thread(client, desired_access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::attributes::{AttributeFlags, DirectAttr, HandleAttr, ObjectTypes};
    use crate::ipc::connect::ConnectOptions;
    use crate::ipc::message::LengthField;
    use crate::ipc::port::PortAttributes;
    use crate::transport::Transport;
    use std::thread;
    use std::time::Duration;

    fn connected(transport: &Transport, name: &str, attributes: PortAttributes) -> (Port, Port, Port) {
        let listener = transport.create_port(Some(name), Some(attributes)).unwrap();
        let client = {
            let transport = transport.clone();
            let name = name.to_string();
            thread::spawn(move || {
                transport
                    .connect_port(&name, ConnectOptions::new().with_attributes(attributes))
                    .map(|(port, _)| port)
            })
        };
        let request = listener.receive(256, Duration::from_secs(5)).unwrap();
        let server = listener
            .accept_connect_port(Some(attributes), 0x5151, &request, true)
            .unwrap()
            .unwrap();
        (listener, server, client.join().unwrap().unwrap())
    }

    #[test]
    fn test_request_reply_pairing() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\pairing", PortAttributes::new());

        let server_side = thread::spawn(move || {
            let request = listener.receive(512, Duration::from_secs(5)).unwrap();
            assert_eq!(request.kind(), Some(MessageType::Request));
            listener.reply(&request.header, b"pong").unwrap();
            request.message_id()
        });

        let mut request = PortMessage::request(b"ping").unwrap();
        let reply = client.request(&mut request, 512, Duration::from_secs(5)).unwrap();
        let served = server_side.join().unwrap();
        assert_eq!(reply.kind(), Some(MessageType::Reply));
        assert_eq!(reply.data(), b"pong");
        assert_eq!(reply.message_id(), request.message_id());
        assert_eq!(served, request.message_id());
    }

    #[test]
    fn test_send_only_infers_datagram() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\datagram", PortAttributes::new());
        let mut message = PortMessage::new(b"fire").unwrap();
        client.send(&mut message, None).unwrap();
        assert_eq!(message.kind(), Some(MessageType::Datagram));
        assert_ne!(message.message_id(), 0);

        let received = listener.receive(128, Timeout::from_millis(1000)).unwrap();
        assert_eq!(received.data(), b"fire");
        // Datagrams take no reply
        assert!(matches!(
            listener.reply(&received.header, b"no"),
            Err(AlpcError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_receive_buffer_too_small_keeps_message() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\small", PortAttributes::new());
        client.send(&mut PortMessage::datagram(&[7; 100]).unwrap(), None).unwrap();

        assert_eq!(
            listener.receive(64, Timeout::from_millis(100)),
            Err(AlpcError::BufferTooSmall { required: 140 })
        );
        let received = listener.receive(140, Timeout::from_millis(100)).unwrap();
        assert_eq!(received.data().len(), 100);
    }

    #[test]
    fn test_padded_total_length_rejected() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\padded", PortAttributes::new());
        let mut padded = PortMessage::datagram(&[1; 10]).unwrap();
        padded.header.length = LengthField::new(10, 100);
        assert!(matches!(
            client.send(&mut padded, None),
            Err(AlpcError::InvalidParameter(_))
        ));
        assert!(listener.object.queue.is_empty());

        client.send(&mut PortMessage::datagram(&[1; 10]).unwrap(), None).unwrap();
        let received = listener.receive(100, Timeout::from_millis(500)).unwrap();
        assert_eq!(received.data(), &[1u8; 10][..]);
        assert_eq!(received.total_length(), 50);
    }

    #[test]
    fn test_receive_times_out() {
        let transport = Transport::default();
        let listener = transport.create_port(Some("\\quiet"), None).unwrap();
        assert_eq!(
            listener.receive(128, Duration::from_millis(50)),
            Err(AlpcError::Timeout)
        );
    }

    #[test]
    fn test_message_larger_than_port_limit() {
        let transport = Transport::default();
        let attributes = PortAttributes::new().with_max_message_length(100);
        let (_listener, _server, client) = connected(&transport, "\\limit", attributes);
        let mut message = PortMessage::datagram(&[0; 61]).unwrap();
        assert_eq!(
            client.send(&mut message, None),
            Err(AlpcError::MessageTooLarge { size: 101, max: 100 })
        );
        assert!(client.send(&mut PortMessage::datagram(&[0; 60]).unwrap(), None).is_ok());
    }

    #[test]
    fn test_cancel_queued_then_delivered() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\cancel", PortAttributes::new());

        let mut first = PortMessage::datagram(b"first").unwrap();
        client.send(&mut first, None).unwrap();
        let context = client.sent_message_context(first.message_id()).unwrap();
        client.cancel_message(CancelFlags::TRY_CANCEL, &context).unwrap();
        // Cancelling twice reports the same outcome
        client.cancel_message(CancelFlags::TRY_CANCEL, &context).unwrap();

        let mut second = PortMessage::datagram(b"second").unwrap();
        client.send(&mut second, None).unwrap();
        let received = listener.receive(128, Timeout::from_millis(500)).unwrap();
        assert_eq!(received.data(), b"second");

        let context = client.sent_message_context(second.message_id()).unwrap();
        assert_eq!(
            client.cancel_message(CancelFlags::NO_CONTEXT_CHECK, &context),
            Err(AlpcError::AlreadyDelivered)
        );
    }

    #[test]
    fn test_cancel_context_must_match() {
        let transport = Transport::default();
        let (_listener, _server, client) = connected(&transport, "\\mismatch", PortAttributes::new());
        let mut message = PortMessage::datagram(b"x").unwrap();
        client.send(&mut message, None).unwrap();
        let mut context = client.sent_message_context(message.message_id()).unwrap();
        context.sequence += 1;
        assert_eq!(client.cancel_message(CancelFlags::empty(), &context), Err(AlpcError::NotFound));
        client.cancel_message(CancelFlags::NO_CONTEXT_CHECK, &context).unwrap();
    }

    #[test]
    fn test_cancel_wakes_sync_waiter() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\wake", PortAttributes::new());
        let client = Arc::new(client);

        let waiter = {
            let client = client.clone();
            thread::spawn(move || {
                let mut request = PortMessage::request(b"slow").unwrap();
                client.request(&mut request, 256, Duration::from_secs(5))
            })
        };
        let request = listener.receive(256, Duration::from_secs(5)).unwrap();
        let context = client.sent_message_context(request.message_id()).unwrap();
        client.cancel_message(CancelFlags::empty(), &context).unwrap();
        assert_eq!(waiter.join().unwrap(), Err(AlpcError::Cancelled));
        // The late reply is dropped quietly
        listener.reply(&request.header, b"late").unwrap();
    }

    #[test]
    fn test_context_attribute_on_receive() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\context", PortAttributes::new());
        let mut message = PortMessage::datagram(b"ctx").unwrap().with_callback_id(9);
        client.send(&mut message, None).unwrap();

        let mut buffer = MessageBuffer::with_capacity(128);
        let mut attributes =
            AttributeBundle::with_allocated(AttributeFlags::CONTEXT | AttributeFlags::TOKEN | AttributeFlags::DIRECT);
        listener
            .send_wait_receive(
                MessageFlags::empty(),
                None,
                None,
                Some(&mut buffer),
                Some(&mut attributes),
                Timeout::from_millis(500),
            )
            .unwrap();
        let context = attributes.context().unwrap();
        assert_eq!(context.port_context, 0x5151);
        assert_eq!(context.message_id, message.message_id());
        assert_eq!(context.callback_id, 9);
        // The connection request took sequence 1
        assert_eq!(context.sequence, 2);
        assert!(attributes.token().is_some());
        assert!(attributes.direct().is_none());
        assert_eq!(attributes.valid(), AttributeFlags::CONTEXT | AttributeFlags::TOKEN);
    }

    #[test]
    fn test_handle_attribute_needs_dup_permission() {
        let transport = Transport::default();
        let (_listener, _server, client) = connected(&transport, "\\nodup", PortAttributes::new());
        let handle = AttributeBundle::new().with(Attribute::Handle(HandleAttr {
            handle: 0x44,
            object_type: ObjectTypes::FILE,
            ..Default::default()
        }));
        assert!(matches!(
            client.send(&mut PortMessage::datagram(b"h").unwrap(), Some(&handle)),
            Err(AlpcError::InvalidParameter(_))
        ));

        let attributes = PortAttributes::new()
            .with_flags(PortAttributeFlags::ALLOW_DUP_OBJECT)
            .with_dup_object_types(ObjectTypes::EVENT);
        let (listener, _server, client) = connected(&transport, "\\dup", attributes);
        assert_eq!(
            client.send(&mut PortMessage::datagram(b"h").unwrap(), Some(&handle)),
            Err(AlpcError::AccessDenied)
        );
        let event = AttributeBundle::new().with(Attribute::Handle(HandleAttr {
            handle: 0x45,
            object_type: ObjectTypes::EVENT,
            ..Default::default()
        }));
        client.send(&mut PortMessage::datagram(b"h").unwrap(), Some(&event)).unwrap();
        assert!(listener.receive(128, Timeout::from_millis(500)).is_ok());
    }

    #[test]
    fn test_direct_ticket_tracked() {
        let transport = Transport::default();
        let (_listener, _server, client) = connected(&transport, "\\direct", PortAttributes::new());
        let direct = AttributeBundle::new().with(Attribute::Direct(DirectAttr::default()));
        let mut message = PortMessage::datagram(b"d").unwrap();
        client.send(&mut message, Some(&direct)).unwrap();
        let ticket = client.object.sent_ticket(message.message_id()).unwrap();
        assert!(ticket.is_direct());
        assert!(!ticket.is_delivered());
    }

    #[test]
    fn test_release_message_forgets_record() {
        let transport = Transport::default();
        let (listener, _server, client) = connected(&transport, "\\release", PortAttributes::new());
        client.send(&mut PortMessage::request(b"r").unwrap(), None).unwrap();
        let mut request = listener.receive(128, Timeout::from_millis(500)).unwrap();
        listener
            .send_wait_receive(
                MessageFlags::RELEASE_MESSAGE,
                Some(&mut request),
                None,
                None,
                None,
                Timeout::Infinite,
            )
            .unwrap();
        assert_eq!(listener.reply(&request.header, b"gone"), Err(AlpcError::NotFound));
    }

    #[test]
    fn test_connection_port_cannot_send() {
        let transport = Transport::default();
        let listener = transport.create_port(Some("\\mute"), None).unwrap();
        assert!(matches!(
            listener.send(&mut PortMessage::datagram(b"x").unwrap(), None),
            Err(AlpcError::InvalidParameter(_))
        ));
    }
}
