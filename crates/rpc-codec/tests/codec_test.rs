//! Client and server codecs talking to each other without a transport.

use std::io::Cursor;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use proven_rpc_codec::*;

fn registry() -> Arc<Registry<BinaryProtocol>> {
    Arc::new(
        Registry::new()
            .with(CallFactory::new::<String, String>("ping"))
            .with(CallFactory::new::<(u32, u32), u32>("add")),
    )
}

fn codecs() -> (ClientCodec<BinaryProtocol>, ServerCodec<BinaryProtocol>) {
    (
        ClientCodec::new(BinaryProtocol::new(), CodecConfig::default()),
        ServerCodec::new(BinaryProtocol::new(), registry(), CodecConfig::default()),
    )
}

fn server_receive(
    server: &ServerCodec<BinaryProtocol>,
    bytes: &Bytes,
) -> Dispatch<BinaryProtocol> {
    let mut src = Cursor::new(&bytes[..]);
    let dispatch = server.on_inbound(&mut src).unwrap();
    assert_eq!(src.position() as usize, bytes.len());
    dispatch
}

fn client_receive(
    client: &ClientCodec<BinaryProtocol>,
    bytes: &Bytes,
) -> Result<Reply<BinaryProtocol>> {
    client.on_inbound(&mut Cursor::new(&bytes[..]))
}

fn reply_envelope(method: &str, seq_id: i32, result: &str) -> Bytes {
    let protocol = BinaryProtocol::new();
    let mut buf = BytesMut::new();
    protocol
        .write_envelope_begin(
            &EnvelopeHeader::new(MessageType::Reply, method, seq_id),
            &mut buf,
        )
        .unwrap();
    protocol.write_value(result, &mut buf).unwrap();
    buf.freeze()
}

#[test]
fn test_ping_round_trip() {
    let (client, server) = codecs();
    let ping = registry().lookup("ping").unwrap();

    let request = client.send(ping.call("X".to_string()).unwrap()).unwrap();
    assert_eq!(client.outstanding().unwrap().seq_id(), Some(1));

    let Dispatch::Call(call) = server_receive(&server, &request) else {
        panic!("expected a call");
    };
    assert_eq!(call.method(), "ping");
    assert_eq!(call.seq_id(), Some(1));
    assert_eq!(server.pending_seq_id(), Some(1));

    let response = server.send(&call.reply("Y".to_string()).unwrap()).unwrap();
    assert_eq!(server.pending_seq_id(), None);

    let reply = client_receive(&client, &response).unwrap();
    assert_eq!(reply.originating_call().method(), "ping");
    assert_eq!(reply.into_result::<String>().unwrap(), "Y");
    assert!(client.outstanding().is_none());

    // The slot is free again.
    let request = client.send(ping.call("Z".to_string()).unwrap()).unwrap();
    let Dispatch::Call(call) = server_receive(&server, &request) else {
        panic!("expected a call");
    };
    assert_eq!(call.seq_id(), Some(2));
}

#[test]
fn test_typed_arguments_survive_the_wire() {
    let (client, server) = codecs();
    let add = registry().lookup("add").unwrap();

    let request = client.send(add.call((40u32, 2u32)).unwrap()).unwrap();
    let Dispatch::Call(call) = server_receive(&server, &request) else {
        panic!("expected a call");
    };
    let ((a, b), handle) = call.into_parts::<(u32, u32)>().unwrap();

    let response = server.send(&handle.reply(a + b).unwrap()).unwrap();
    let reply = client_receive(&client, &response).unwrap();
    assert_eq!(*reply.result::<u32>().unwrap(), 42);
}

#[test]
fn test_mismatched_seq_id_closes_client() {
    let (client, server) = codecs();
    let ping = registry().lookup("ping").unwrap();

    for _ in 0..4 {
        let request = client.send(ping.new_call()).unwrap();
        let Dispatch::Call(call) = server_receive(&server, &request) else {
            panic!("expected a call");
        };
        let response = server.send(&call.reply(String::new()).unwrap()).unwrap();
        client_receive(&client, &response).unwrap();
    }

    client.send(ping.new_call()).unwrap();
    assert_eq!(client.outstanding().unwrap().seq_id(), Some(5));

    let err = client_receive(&client, &reply_envelope("ping", 6, "late")).unwrap_err();
    assert!(matches!(
        err,
        Error::SequenceMismatch {
            expected: Some(5),
            actual: 6
        }
    ));
    assert!(err.is_fatal());
    assert!(client.is_closed());
    assert!(matches!(
        client.send(ping.new_call()),
        Err(Error::ConnectionClosed)
    ));
}

#[test]
fn test_exception_clears_client_state() {
    let (client, server) = codecs();
    let ping = registry().lookup("ping").unwrap();

    let request = client.send(ping.new_call()).unwrap();
    let Dispatch::Call(call) = server_receive(&server, &request) else {
        panic!("expected a call");
    };
    let failure = call.fail(ApplicationException::new(
        ExceptionKind::InternalError,
        "database unavailable",
    ));
    let response = server.send(&failure).unwrap();

    let reply = client_receive(&client, &response).unwrap();
    let exception = reply.exception().unwrap();
    assert_eq!(exception.code, 6);
    assert_eq!(exception.message, "database unavailable");
    assert!(client.outstanding().is_none());
    assert!(!client.is_closed());

    match reply.into_result::<String>() {
        Err(Error::Application(exception)) => {
            assert_eq!(exception.kind(), ExceptionKind::InternalError);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    client.send(ping.new_call()).unwrap();
    assert_eq!(client.outstanding().unwrap().seq_id(), Some(2));
}

#[test]
fn test_unknown_method_round_trip() {
    let (client, server) = codecs();
    let missing = Arc::new(CallFactory::<BinaryProtocol>::new::<String, String>("missing"));

    let request = client.send(missing.call("?".to_string()).unwrap()).unwrap();
    let Dispatch::Reject(reject) = server_receive(&server, &request) else {
        panic!("expected a reject");
    };
    assert_eq!(server.pending_seq_id(), Some(1));

    let response = server.send(&reject).unwrap();
    let reply = client_receive(&client, &response).unwrap();
    assert_eq!(
        reply.exception().map(ApplicationException::kind),
        Some(ExceptionKind::UnknownMethod)
    );
    assert!(!server.is_closed());
    assert!(!client.is_closed());
}

#[test]
fn test_concurrent_call_is_rejected_without_side_effects() {
    let (client, _server) = codecs();
    let ping = registry().lookup("ping").unwrap();

    client.send(ping.call("first".to_string()).unwrap()).unwrap();
    let err = client
        .send(ping.call("second".to_string()).unwrap())
        .unwrap_err();

    assert!(matches!(err, Error::ConcurrentCallViolation { .. }));
    assert_eq!(client.outstanding().unwrap().seq_id(), Some(1));
    assert_eq!(client.last_seq_id(), 1);
    assert!(!client.is_closed());
}

#[test]
fn test_closed_codecs_fail_fast() {
    let (client, server) = codecs();
    let ping = registry().lookup("ping").unwrap();

    let request = client.send(ping.new_call()).unwrap();
    let outstanding = client.close().unwrap();
    assert_eq!(outstanding.seq_id(), Some(1));
    assert!(client.outstanding().is_none());

    server.close();
    assert!(matches!(
        server.on_inbound(&mut Cursor::new(&request[..])),
        Err(Error::ConnectionClosed)
    ));
    assert_eq!(server.pending_seq_id(), None);
}
