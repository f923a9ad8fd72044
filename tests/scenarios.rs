//! End-to-end conversations between threads
//!
//! Each test builds its own transport so names never collide across the
//! parallel test runner.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use alpc_r::identity::{self, Principal, Sid};
use alpc_r::ipc::{
    Attribute, AttributeBundle, AttributeFlags, CancelFlags, ConnectOptions, ContextAttr,
    DirectAttr, DisconnectFlags, ImpersonationFlags, MessageBuffer, MessageFlags,
    MessageInformationClass, MessageType, PortAttributeFlags, PortAttributes, PortMessage,
    PortState, SecurityAttr, TypeFlags, ViewAttr,
};
use alpc_r::{AlpcError, ImpersonationLevel, Port, Timeout, Transport};

const WAIT: Duration = Duration::from_secs(5);

/// Connection port, accepted server port and connected client port
fn connect_pair(
    transport: &Transport,
    name: &str,
    server_attributes: PortAttributes,
    client_attributes: PortAttributes,
) -> (Port, Port, Port) {
    let listener = transport.create_port(Some(name), Some(server_attributes)).unwrap();
    let connecting = {
        let transport = transport.clone();
        let name = name.to_string();
        thread::spawn(move || {
            transport.connect_port(
                &name,
                ConnectOptions::new()
                    .with_attributes(client_attributes)
                    .with_timeout(WAIT),
            )
        })
    };
    let request = listener.receive(1024, WAIT).unwrap();
    assert_eq!(request.kind(), Some(MessageType::ConnectionRequest));
    let server = listener
        .accept_connect_port(None, 0x77, &request, true)
        .unwrap()
        .unwrap();
    let (client, reply) = connecting.join().unwrap().unwrap();
    assert_eq!(reply.kind(), Some(MessageType::ConnectionReply));
    assert_eq!(reply.message_id(), request.message_id());
    (listener, server, client)
}

#[test]
fn test_connect_times_out_without_acceptor() {
    let transport = Transport::default();
    let attributes = PortAttributes::new().with_max_message_length(1000);
    let _listener = transport.create_port(Some("\\idle"), Some(attributes)).unwrap();

    let result = transport.connect_port(
        "\\idle",
        ConnectOptions::new()
            .with_attributes(attributes)
            .with_connection_message(PortMessage::new(&[0x11; 200]).unwrap())
            .with_timeout(Duration::from_millis(500)),
    );
    assert!(matches!(result, Err(AlpcError::Timeout)));
}

#[test]
fn test_connect_to_unknown_name() {
    let transport = Transport::default();
    let result = transport.connect_port("\\nobody", ConnectOptions::new().with_timeout(WAIT));
    assert!(matches!(result, Err(AlpcError::NotFound)));
}

#[test]
fn test_accept_and_exchange() {
    let transport = Transport::default();
    let attributes = PortAttributes::new().with_max_message_length(1000);
    let (listener, server, client) = connect_pair(&transport, "\\exchange", attributes, attributes);
    assert_eq!(client.state(), PortState::Connected);
    assert_eq!(server.state(), PortState::Connected);
    assert_eq!(server.port_context(), 0x77);

    let serving = thread::spawn(move || {
        let request = listener.receive(1000, WAIT).unwrap();
        assert_eq!(request.data(), b"ping");
        listener.reply(&request.header, &[0x5A; 500]).unwrap();
        (listener, request.message_id())
    });

    let mut request = PortMessage::request(b"ping").unwrap();
    let reply = client.request(&mut request, 1000, WAIT).unwrap();
    let (_listener, served) = serving.join().unwrap();

    assert_eq!(reply.kind(), Some(MessageType::Reply));
    assert_eq!(reply.message_id(), request.message_id());
    assert_eq!(served, request.message_id());
    assert_eq!(reply.data().len(), 500);
    assert!(reply.total_length() < 1000);
}

#[test]
fn test_refused_connection() {
    let transport = Transport::default();
    let listener = transport.create_port(Some("\\refuse"), None).unwrap();
    let connecting = {
        let transport = transport.clone();
        thread::spawn(move || transport.connect_port("\\refuse", ConnectOptions::new().with_timeout(WAIT)))
    };
    let request = listener.receive(256, WAIT).unwrap();
    let refused = listener.accept_connect_port(None, 0, &request, false).unwrap();
    assert!(refused.is_none());
    assert!(matches!(connecting.join().unwrap(), Err(AlpcError::ConnectionRefused)));
}

#[test]
fn test_view_deleted_twice() {
    let port = Transport::default().create_port(None, None).unwrap();
    let (section, granted) = port.create_port_section(0, None, 4096).unwrap();
    assert_eq!(granted, 4096);

    let mut view = ViewAttr {
        section,
        view_size: 4096,
        ..Default::default()
    };
    port.create_section_view(0, &mut view).unwrap();
    assert_ne!(view.view_base, 0);

    port.delete_section_view(0, view.view_base).unwrap();
    assert_eq!(port.delete_section_view(0, view.view_base), Err(AlpcError::NotFound));
}

#[test]
fn test_reserve_bounds_message_size() {
    let transport = Transport::default();
    let (listener, _server, client) =
        connect_pair(&transport, "\\reserve", PortAttributes::new(), PortAttributes::new());

    let (reserve, granted) = client.create_resource_reserve(0, 100).unwrap();
    assert_eq!(granted, 100);

    let mut oversized = PortMessage::datagram(&[0; 61]).unwrap().with_reserve(reserve);
    assert_eq!(
        client.send(&mut oversized, None),
        Err(AlpcError::MessageTooLarge { size: 101, max: 100 })
    );

    let mut fitting = PortMessage::datagram(&[0; 60]).unwrap().with_reserve(reserve);
    client.send(&mut fitting, None).unwrap();
    let received = listener.receive(256, WAIT).unwrap();
    assert_eq!(received.message_id(), fitting.message_id());
}

#[test]
fn test_cancel_races_delivery_deterministically() {
    let transport = Transport::default();
    let (listener, _server, client) =
        connect_pair(&transport, "\\race", PortAttributes::new(), PortAttributes::new());
    let client = Arc::new(client);

    for round in 0u32..100 {
        let mut message = PortMessage::datagram(&round.to_le_bytes()).unwrap();
        client.send(&mut message, None).unwrap();
        let context = client.sent_message_context(message.message_id()).unwrap();

        let start = Arc::new(Barrier::new(2));
        let canceller = {
            let client = Arc::clone(&client);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                client.cancel_message(CancelFlags::TRY_CANCEL, &context)
            })
        };
        start.wait();
        let received = listener.receive(64, Duration::from_millis(20));
        let cancelled = canceller.join().unwrap();

        match (cancelled, received) {
            (Ok(()), Err(AlpcError::Timeout)) => {}
            (Err(AlpcError::AlreadyDelivered), Ok(delivered)) => {
                assert_eq!(delivered.message_id(), message.message_id());
            }
            (cancelled, received) => {
                panic!("round {}: cancel {:?} with receive {:?}", round, cancelled, received)
            }
        }
    }
    // Nothing cancelled ever surfaces later
    assert!(matches!(
        listener.receive(64, Duration::from_millis(10)),
        Err(AlpcError::Timeout)
    ));
}

#[test]
fn test_disconnect_is_idempotent_and_notifies() {
    let transport = Transport::default();
    let (listener, server, client) =
        connect_pair(&transport, "\\hangup", PortAttributes::new(), PortAttributes::new());

    client.disconnect_port(DisconnectFlags::empty());
    assert_eq!(client.state(), PortState::Disconnected);
    client.disconnect_port(DisconnectFlags::empty());
    assert_eq!(client.state(), PortState::Disconnected);

    let notice = listener.receive(256, WAIT).unwrap();
    assert_eq!(notice.kind(), Some(MessageType::PortClosed));
    assert_eq!(server.state(), PortState::Disconnected);

    let mut late = PortMessage::datagram(b"late").unwrap();
    assert_eq!(client.send(&mut late, None), Err(AlpcError::PortDisconnected));
    let mut answer = PortMessage::datagram(b"answer").unwrap();
    assert_eq!(server.send(&mut answer, None), Err(AlpcError::PortDisconnected));
}

#[test]
fn test_disconnect_without_flush_cancels_queued() {
    let transport = Transport::default();
    let (listener, _server, client) =
        connect_pair(&transport, "\\noflush", PortAttributes::new(), PortAttributes::new());

    let mut first = PortMessage::datagram(b"one").unwrap();
    let mut second = PortMessage::datagram(b"two").unwrap();
    client.send(&mut first, None).unwrap();
    client.send(&mut second, None).unwrap();
    client.disconnect_port(DisconnectFlags::NO_FLUSH_ON_CLOSE);

    let notice = listener.receive(256, WAIT).unwrap();
    assert_eq!(notice.kind(), Some(MessageType::PortClosed));
}

#[test]
fn test_client_sees_server_close() {
    let transport = Transport::default();
    let (_listener, server, client) =
        connect_pair(&transport, "\\server-gone", PortAttributes::new(), PortAttributes::new());

    drop(server);
    let notice = client.receive(256, WAIT).unwrap();
    assert_eq!(notice.kind(), Some(MessageType::PortClosed));
    assert_eq!(client.state(), PortState::Disconnected);
    assert!(matches!(client.receive(256, WAIT), Err(AlpcError::PortDisconnected)));
}

#[test]
fn test_impersonation_follows_client_grant() {
    let transport = Transport::default();
    let client_sid = Sid::parse("S-1-5-21-100-200-300-1001").unwrap();
    let listener = transport.create_port(Some("\\impersonate"), None).unwrap();

    let client_side = {
        let transport = transport.clone();
        let sid = client_sid.clone();
        thread::spawn(move || -> alpc_r::Result<()> {
            identity::set_thread_principal(Principal::new(sid));
            let attributes = PortAttributes::new().with_flags(PortAttributeFlags::ALLOW_IMPERSONATION);
            let (client, _) = transport.connect_port(
                "\\impersonate",
                ConnectOptions::new().with_attributes(attributes).with_timeout(WAIT),
            )?;
            let mut granted = PortMessage::request(b"granted")?;
            client.request(&mut granted, 256, WAIT)?;
            let mut declined = PortMessage::request(b"declined")?.with_type_flags(TypeFlags::NO_IMPERSONATE);
            client.request(&mut declined, 256, WAIT)?;
            Ok(())
        })
    };

    let connection = listener.receive(256, WAIT).unwrap();
    let server = listener.accept_connect_port(None, 0, &connection, true).unwrap().unwrap();

    let mut sid_bytes = [0u8; 68];
    let written = server
        .query_information(alpc_r::ipc::PortInformationClass::ConnectedSid, &mut sid_bytes)
        .unwrap();
    assert_eq!(Sid::from_bytes(&sid_bytes[..written]).unwrap(), client_sid);

    let granted = listener.receive(256, WAIT).unwrap();
    {
        let guard = listener
            .impersonate_client(&granted.header, ImpersonationFlags::empty())
            .unwrap();
        assert_eq!(guard.level(), Some(ImpersonationLevel::Impersonation));
        assert_eq!(identity::effective_principal().sid, client_sid);
    }
    assert_ne!(identity::effective_principal().sid, client_sid);
    assert!(matches!(
        listener.impersonate_client(
            &granted.header,
            ImpersonationFlags::require_level(ImpersonationLevel::Delegation)
        ),
        Err(AlpcError::ImpersonationLevelTooLow {
            required: ImpersonationLevel::Delegation,
            actual: ImpersonationLevel::Impersonation,
        })
    ));

    let written = listener
        .query_message_information(&granted.header, MessageInformationClass::Sid, &mut sid_bytes)
        .unwrap();
    assert_eq!(Sid::from_bytes(&sid_bytes[..written]).unwrap(), client_sid);
    listener.reply(&granted.header, b"ok").unwrap();

    let declined = listener.receive(256, WAIT).unwrap();
    assert!(matches!(
        listener.impersonate_client(&declined.header, ImpersonationFlags::empty()),
        Err(AlpcError::AccessDenied)
    ));
    let guard = listener
        .impersonate_client(&declined.header, ImpersonationFlags::ANONYMOUS_FALLBACK)
        .unwrap();
    assert_eq!(identity::effective_principal().sid, Sid::anonymous());
    guard.revert();
    assert!(!identity::is_impersonating());
    listener.reply(&declined.header, b"ok").unwrap();

    client_side.join().unwrap().unwrap();
}

#[test]
fn test_revoked_context_stops_impersonation() {
    let transport = Transport::default();
    let (listener, _server, client) =
        connect_pair(&transport, "\\revoke", PortAttributes::new(), PortAttributes::new());

    let context = client.create_security_context(0, None).unwrap();
    let bundle = AttributeBundle::new().with(Attribute::Security(SecurityAttr {
        context,
        ..Default::default()
    }));
    let mut message = PortMessage::datagram(b"with context").unwrap();
    client.send(&mut message, Some(&bundle)).unwrap();
    let received = listener.receive(256, WAIT).unwrap();

    drop(
        listener
            .impersonate_client(&received.header, ImpersonationFlags::empty())
            .unwrap(),
    );
    client.revoke_security_context(0, context).unwrap();
    assert!(matches!(
        listener.impersonate_client(&received.header, ImpersonationFlags::empty()),
        Err(AlpcError::ContextRevoked)
    ));

    let mut again = PortMessage::datagram(b"again").unwrap();
    assert_eq!(client.send(&mut again, Some(&bundle)), Err(AlpcError::ContextRevoked));
}

#[test]
fn test_container_impersonation() {
    let transport = Transport::default();
    let listener = transport.create_port(Some("\\container"), None).unwrap();
    let app_sid = Sid::parse("S-1-15-2-1-2-3").unwrap();
    let user_sid = Sid::parse("S-1-5-21-7-8-9-1002").unwrap();

    let client_side = {
        let transport = transport.clone();
        let principal = Principal::new(user_sid.clone()).with_container(app_sid.clone());
        thread::spawn(move || -> alpc_r::Result<()> {
            identity::set_thread_principal(principal);
            let attributes = PortAttributes::new().with_flags(PortAttributeFlags::ALLOW_IMPERSONATION);
            let (client, _) = transport.connect_port(
                "\\container",
                ConnectOptions::new().with_attributes(attributes).with_timeout(WAIT),
            )?;
            let mut request = PortMessage::request(b"contained")?;
            client.request(&mut request, 256, WAIT)?;
            Ok(())
        })
    };

    let connection = listener.receive(256, WAIT).unwrap();
    let _server = listener.accept_connect_port(None, 0, &connection, true).unwrap().unwrap();
    let request = listener.receive(256, WAIT).unwrap();
    {
        let _guard = listener
            .impersonate_client_container(&request.header, ImpersonationFlags::empty())
            .unwrap();
        assert_eq!(identity::effective_principal().sid, app_sid);
    }
    {
        let _guard = listener
            .impersonate_client(&request.header, ImpersonationFlags::empty())
            .unwrap();
        assert_eq!(identity::effective_principal().sid, user_sid);
    }
    listener.reply(&request.header, b"done").unwrap();
    client_side.join().unwrap().unwrap();
}

#[test]
fn test_shared_view_travels_with_message() {
    let transport = Transport::default();
    let (listener, _server, client) =
        connect_pair(&transport, "\\bulk", PortAttributes::new(), PortAttributes::new());

    let (section, granted) = client.create_port_section(0, None, 4096).unwrap();
    let mut view = ViewAttr {
        section,
        view_size: granted as u64,
        ..Default::default()
    };
    client.create_section_view(0, &mut view).unwrap();
    client.view_write(view.view_base, 16, b"bulk payload").unwrap();

    let bundle = AttributeBundle::new().with(Attribute::View(view));
    let mut message = PortMessage::datagram(b"see view").unwrap();
    client.send(&mut message, Some(&bundle)).unwrap();

    let mut buffer = MessageBuffer::with_capacity(256);
    let mut received = AttributeBundle::with_allocated(AttributeFlags::VIEW | AttributeFlags::CONTEXT);
    listener
        .send_wait_receive(
            MessageFlags::empty(),
            None,
            None,
            Some(&mut buffer),
            Some(&mut received),
            Timeout::from_millis(5000),
        )
        .unwrap();
    assert_eq!(buffer.data(), b"see view");

    let mapped = *received.view().unwrap();
    assert_ne!(mapped.view_base, view.view_base);
    assert_eq!(mapped.view_size, 4096);
    let mut read_back = [0u8; 12];
    listener.view_read(mapped.view_base, 16, &mut read_back).unwrap();
    assert_eq!(&read_back, b"bulk payload");

    // Writes from either side land in the same memory
    listener.view_write(mapped.view_base, 0, b"ack").unwrap();
    let mut ack = [0u8; 3];
    client.view_read(view.view_base, 0, &mut ack).unwrap();
    assert_eq!(&ack, b"ack");

    let context = received.context().unwrap();
    assert_eq!(context.message_id, message.message_id());
    assert_eq!(context.port_context, 0x77);
}

#[test]
fn test_direct_status_tracks_delivery() {
    let transport = Transport::default();
    let (listener, _server, client) =
        connect_pair(&transport, "\\direct", PortAttributes::new(), PortAttributes::new());

    let bundle = AttributeBundle::new().with(Attribute::Direct(DirectAttr {
        event: alpc_r::AlpcHandle(0x40),
    }));
    let mut message = PortMessage::datagram(b"direct").unwrap();
    client.send(&mut message, Some(&bundle)).unwrap();

    let mut status = [0u8; 4];
    client.query_message_direct_status(&message.header, &mut status).unwrap();
    assert_eq!(u32::from_le_bytes(status), 0x103);

    listener.receive(256, WAIT).unwrap();
    client.query_message_direct_status(&message.header, &mut status).unwrap();
    assert_eq!(u32::from_le_bytes(status), 0);

    let mut plain = PortMessage::datagram(b"plain").unwrap();
    client.send(&mut plain, None).unwrap();
    assert!(matches!(
        client.query_message_direct_status(&plain.header, &mut status),
        Err(AlpcError::InvalidParameter(_))
    ));
}

#[test]
fn test_cancel_with_stale_context() {
    let transport = Transport::default();
    let (_listener, _server, client) =
        connect_pair(&transport, "\\stale", PortAttributes::new(), PortAttributes::new());

    let mut message = PortMessage::datagram(b"x").unwrap();
    client.send(&mut message, None).unwrap();
    let context = client.sent_message_context(message.message_id()).unwrap();
    let stale = ContextAttr {
        sequence: context.sequence + 1,
        ..context
    };
    assert_eq!(client.cancel_message(CancelFlags::TRY_CANCEL, &stale), Err(AlpcError::NotFound));
    client
        .cancel_message(CancelFlags::TRY_CANCEL | CancelFlags::NO_CONTEXT_CHECK, &stale)
        .unwrap();
}

#[test]
fn test_reserve_cannot_flood_server_pool() {
    let transport = Transport::default();
    let server_attributes = PortAttributes::new().with_max_pool_usage(200);
    let (listener, _server, client) =
        connect_pair(&transport, "\\flood", server_attributes, PortAttributes::new());

    // The grant comes out of the server's pool
    let (reserve, granted) = client.create_resource_reserve(0, 100).unwrap();
    assert_eq!(granted, 100);

    let send_all = |reserve: Option<alpc_r::AlpcHandle>| {
        let mut accepted = 0;
        for _ in 0..10 {
            let mut message = PortMessage::datagram(&[0; 60]).unwrap();
            if let Some(reserve) = reserve {
                message = message.with_reserve(reserve);
            }
            match client.send(&mut message, None) {
                Ok(()) => accepted += 1,
                Err(AlpcError::QuotaExceeded { .. }) => {}
                Err(other) => panic!("unexpected send error {:?}", other),
            }
        }
        accepted
    };
    // One message in flight per reserve
    assert_eq!(send_all(Some(reserve)), 1);
    // What the grant left of the pool
    assert_eq!(send_all(None), 1);

    listener.receive(256, WAIT).unwrap();
    listener.receive(256, WAIT).unwrap();
    assert!(matches!(
        listener.receive(256, Duration::from_millis(10)),
        Err(AlpcError::Timeout)
    ));

    // Received, so the reserve is free again
    assert_eq!(send_all(Some(reserve)), 1);
    listener.receive(256, WAIT).unwrap();

    // Deleting the reserve hands its grant back to the pool
    client.delete_resource_reserve(0, reserve).unwrap();
    assert_eq!(send_all(None), 2);
}

#[test]
fn test_reserve_held_until_reply() {
    let transport = Transport::default();
    let (listener, _server, client) =
        connect_pair(&transport, "\\held", PortAttributes::new(), PortAttributes::new());
    let (reserve, _) = client.create_resource_reserve(0, 200).unwrap();

    let mut first = PortMessage::request(b"first").unwrap().with_reserve(reserve);
    client.send(&mut first, None).unwrap();
    let received = listener.receive(256, WAIT).unwrap();

    // Taken by the server but not yet answered
    let mut second = PortMessage::request(b"second").unwrap().with_reserve(reserve);
    assert!(matches!(
        client.send(&mut second, None),
        Err(AlpcError::QuotaExceeded { .. })
    ));

    listener.reply(&received.header, b"done").unwrap();
    let mut third = PortMessage::request(b"third").unwrap().with_reserve(reserve);
    client.send(&mut third, None).unwrap();
}
