//! Client scenarios driven through a scriptable STUN transaction layer.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytecodec::{DecodeExt, EncodeExt};
use parking_lot::Mutex;
use stun_codec::rfc5389::attributes::{
    ErrorCode, MessageIntegrity, Nonce, Realm, Username,
};
use stun_codec::rfc5389::errors::{BadRequest, Unauthorized};
use stun_codec::rfc5766::attributes::{
    ChannelNumber, Data, RequestedTransport, XorPeerAddress, XorRelayAddress,
};
use stun_codec::rfc5766::methods::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, SEND};
use stun_codec::{MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use trackable::error::ErrorKindExt;

use turn_client::attribute::{Attribute, Message};
use turn_client::channel_data::{ChannelData, ChannelDataDecoder, ChannelDataEncoder};
use turn_client::{
    Allocation, Client, DemuxHandler, ErrorKind, Options, PacketSocket, Result, StunTransport,
    TransactionHandler,
};

type DoFn = Box<dyn FnMut(Message, TransactionHandler) -> Result<()> + Send>;
type IndicateFn = Box<dyn FnMut(Message) -> Result<()> + Send>;

/// STUN transport whose behavior each test scripts with closures.
struct ScriptedStun {
    do_fn: Mutex<DoFn>,
    indicate_fn: Mutex<IndicateFn>,
}
impl ScriptedStun {
    fn new() -> Arc<ScriptedStun> {
        Arc::new(ScriptedStun {
            do_fn: Mutex::new(Box::new(|_, _| panic!("no transaction expected"))),
            indicate_fn: Mutex::new(Box::new(|_| panic!("no indication expected"))),
        })
    }

    fn on_request(
        &self,
        f: impl FnMut(Message, TransactionHandler) -> Result<()> + Send + 'static,
    ) {
        *self.do_fn.lock() = Box::new(f);
    }

    fn on_indication(&self, f: impl FnMut(Message) -> Result<()> + Send + 'static) {
        *self.indicate_fn.lock() = Box::new(f);
    }

    fn expect_no_request(&self) {
        self.on_request(|_, _| panic!("no transaction expected"));
    }
}
impl StunTransport for ScriptedStun {
    fn request(&self, request: Message, handler: TransactionHandler) -> Result<()> {
        (&mut *self.do_fn.lock())(request, handler)
    }

    fn indicate(&self, indication: Message) -> Result<()> {
        (&mut *self.indicate_fn.lock())(indication)
    }

    fn install_demux(&self, _demux: DemuxHandler) {}
}

/// Server socket that records every datagram written to it.
struct CapturingSocket {
    sent: Mutex<Vec<Vec<u8>>>,
}
impl CapturingSocket {
    fn new() -> Arc<CapturingSocket> {
        Arc::new(CapturingSocket {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<Vec<u8>> {
        self.sent.lock().drain(..).collect()
    }
}
impl PacketSocket for CapturingSocket {
    fn send(&self, datagram: &[u8], _deadline: Option<Instant>) -> Result<()> {
        self.sent.lock().push(datagram.to_vec());
        Ok(())
    }
}

/// Routes the client's tracing output into the test harness.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn addr(s: &str) -> SocketAddr {
    s.parse().expect("malformed test address")
}

fn encode(message: Message) -> Vec<u8> {
    MessageEncoder::default()
        .encode_into_bytes(message)
        .expect("encoding never fails")
}

/// Runs `message` through the codec, as a response from the wire would be.
fn roundtrip(message: Message) -> Message {
    MessageDecoder::<Attribute>::default()
        .decode_from_bytes(&encode(message))
        .expect("decoding never fails")
        .expect("well-formed message")
}

fn respond(request: &Message, class: MessageClass, attributes: Vec<Attribute>) -> Message {
    let mut response = Message::new(class, request.method(), request.transaction_id());
    for attribute in attributes {
        response.add_attribute(attribute);
    }
    roundtrip(response)
}

fn new_client(
    stun: &Arc<ScriptedStun>,
    socket: &Arc<CapturingSocket>,
    credentials: Option<(&str, &str)>,
) -> Client {
    init_logging();
    Client::new(Options {
        conn: socket.clone(),
        stun: stun.clone(),
        username: credentials.map(|(u, _)| u.to_owned()),
        password: credentials.map(|(_, p)| p.to_owned()),
        software: None,
    })
    .expect("client options are valid")
}

fn allocate_ok(stun: &Arc<ScriptedStun>, client: &Client, relayed: SocketAddr) -> Allocation {
    stun.on_request(move |request, handler| {
        assert_eq!(request.method(), ALLOCATE);
        assert_eq!(request.class(), MessageClass::Request);
        let response = respond(
            &request,
            MessageClass::SuccessResponse,
            vec![XorRelayAddress::new(relayed).into()],
        );
        handler(Ok(response));
        Ok(())
    });
    client.allocate().expect("allocation failed")
}

#[test]
fn allocate_surfaces_transport_and_event_errors() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);

    stun.on_request(|_, _| Err(ErrorKind::Transport.cause("socket gone").into()));
    let e = client.allocate().unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Transport);

    stun.on_request(|_, handler| {
        handler(Err(ErrorKind::Transaction.cause("retransmit timeout").into()));
        Ok(())
    });
    let e = client.allocate().unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Transaction);
}

#[test]
fn allocate_requires_relayed_address() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);

    stun.on_request(|request, handler| {
        handler(Ok(respond(&request, MessageClass::SuccessResponse, vec![])));
        Ok(())
    });
    let e = client.allocate().unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Protocol);
}

#[test]
fn allocate_rejects_malformed_mapped_address() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);

    stun.on_request(|_, handler| {
        // Allocate success response whose XOR-MAPPED-ADDRESS value is the
        // 3-byte garbage [1, 2, 3]. The transaction layer decodes responses
        // off the wire, so hand it raw bytes and surface what decoding gives.
        let mut bytes = vec![0x01, 0x03, 0x00, 0x08, 0x21, 0x12, 0xA4, 0x42];
        bytes.extend_from_slice(&[7; 12]);
        bytes.extend_from_slice(&[0x00, 0x20, 0x00, 0x03, 1, 2, 3, 0]);
        match MessageDecoder::<Attribute>::default().decode_from_bytes(&bytes) {
            Ok(Ok(message)) => handler(Ok(message)),
            _ => handler(Err(ErrorKind::Protocol.cause("broken response").into())),
        }
        Ok(())
    });
    let e = client.allocate().unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Protocol);
}

#[test]
fn allocate_anonymous() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);

    stun.on_request(|request, handler| {
        assert_eq!(request.method(), ALLOCATE);
        let requested = request
            .get_attribute::<RequestedTransport>()
            .expect("REQUESTED-TRANSPORT missing");
        assert_eq!(requested.protocol(), 17);
        assert!(matches!(
            request.attributes().last(),
            Some(Attribute::Fingerprint(_))
        ));
        let response = respond(
            &request,
            MessageClass::SuccessResponse,
            vec![XorRelayAddress::new(addr("127.0.0.2:1113")).into()],
        );
        handler(Ok(response));
        Ok(())
    });
    let allocation = client.allocate().unwrap();
    assert_eq!(allocation.relayed(), addr("127.0.0.2:1113"));
}

#[test]
fn allocate_authenticated() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, Some(("user", "secret")));

    let username = Username::new("user".to_owned()).unwrap();
    let realm = Realm::new("realm".to_owned()).unwrap();
    stun.on_request(move |request, handler| {
        assert_eq!(request.method(), ALLOCATE);
        if request.get_attribute::<Username>().is_none() {
            let response = respond(
                &request,
                MessageClass::ErrorResponse,
                vec![
                    Realm::new("realm".to_owned()).unwrap().into(),
                    Nonce::new("nonce".to_owned()).unwrap().into(),
                    ErrorCode::from(Unauthorized).into(),
                ],
            );
            handler(Ok(response));
            return Ok(());
        }

        // The retry must carry the challenge back, with an integrity
        // checkable against MD5("user:realm:secret").
        let request = roundtrip(request);
        assert_eq!(request.get_attribute::<Username>().unwrap().name(), "user");
        assert_eq!(request.get_attribute::<Realm>().unwrap().text(), "realm");
        assert_eq!(request.get_attribute::<Nonce>().unwrap().value(), "nonce");
        let mi = request
            .get_attribute::<MessageIntegrity>()
            .expect("MESSAGE-INTEGRITY missing");
        assert!(mi
            .check_long_term_credential(&username, &realm, "secret")
            .is_ok());

        let mut response = Message::new(
            MessageClass::SuccessResponse,
            request.method(),
            request.transaction_id(),
        );
        response.add_attribute(XorRelayAddress::new(addr("127.0.0.2:1113")));
        let mi =
            MessageIntegrity::new_long_term_credential(&response, &username, &realm, "secret")
                .unwrap();
        response.add_attribute(mi);
        handler(Ok(roundtrip(response)));
        Ok(())
    });

    let allocation = client.allocate().unwrap();
    assert_eq!(allocation.relayed(), addr("127.0.0.2:1113"));
}

#[test]
fn allocate_gives_up_after_second_challenge() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, Some(("user", "secret")));

    stun.on_request(|request, handler| {
        let response = respond(
            &request,
            MessageClass::ErrorResponse,
            vec![
                Realm::new("realm".to_owned()).unwrap().into(),
                Nonce::new("nonce".to_owned()).unwrap().into(),
                ErrorCode::from(Unauthorized).into(),
            ],
        );
        handler(Ok(response));
        Ok(())
    });
    let e = client.allocate().unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Unauthorized);
}

#[test]
fn create_permission_errors_surface() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);
    let allocation = allocate_ok(&stun, &client, addr("127.0.0.2:1113"));

    stun.on_request(|_, _| Err(ErrorKind::Transport.cause("socket gone").into()));
    let e = allocation.create(addr("127.0.0.1:0").ip()).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Transport);

    stun.on_request(|request, handler| {
        let response = respond(
            &request,
            MessageClass::ErrorResponse,
            vec![ErrorCode::from(BadRequest).into()],
        );
        handler(Ok(response));
        Ok(())
    });
    let e = allocation.create(addr("127.0.0.1:0").ip()).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::ServerError);

    // An error response without ERROR-CODE is a protocol violation.
    stun.on_request(|request, handler| {
        handler(Ok(respond(&request, MessageClass::ErrorResponse, vec![])));
        Ok(())
    });
    let e = allocation.create(addr("127.0.0.1:0").ip()).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Protocol);
}

#[test]
fn send_and_data_roundtrip() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);
    let allocation = allocate_ok(&stun, &client, addr("127.0.0.2:1113"));

    let peer = addr("127.0.0.1:1001");
    stun.on_request(move |request, handler| {
        assert_eq!(request.method(), CREATE_PERMISSION);
        assert_eq!(request.class(), MessageClass::Request);
        let bound = request
            .get_attribute::<XorPeerAddress>()
            .expect("XOR-PEER-ADDRESS missing");
        assert_eq!(bound.address(), addr("127.0.0.1:0"));
        handler(Ok(respond(&request, MessageClass::SuccessResponse, vec![])));
        Ok(())
    });
    let permission = allocation.create(peer.ip()).unwrap();
    let conn = permission.create_udp(peer).unwrap();

    stun.expect_no_request();
    let (sent_tx, sent_rx) = flume::unbounded();
    stun.on_indication(move |indication| {
        assert_eq!(indication.method(), SEND);
        assert_eq!(indication.class(), MessageClass::Indication);
        let data_count = indication
            .attributes()
            .filter(|a| matches!(a, Attribute::Data(_)))
            .count();
        let peer_count = indication
            .attributes()
            .filter(|a| matches!(a, Attribute::XorPeerAddress(_)))
            .count();
        assert_eq!((data_count, peer_count), (1, 1));
        assert!(matches!(
            indication.attributes().last(),
            Some(Attribute::Fingerprint(_))
        ));
        let data = indication.get_attribute::<Data>().unwrap().data().to_vec();
        let to = indication.get_attribute::<XorPeerAddress>().unwrap().address();
        sent_tx.send((to, data)).unwrap();
        Ok(())
    });

    assert_eq!(conn.write(&[1, 2, 3, 4]).unwrap(), 4);
    let (to, data) = sent_rx.try_recv().unwrap();
    assert_eq!(to, peer);
    assert_eq!(data, [1, 2, 3, 4]);

    // Reflect the payload back as a Data indication.
    let mut data_indication =
        Message::new(MessageClass::Indication, DATA, TransactionId::new([9; 12]));
    data_indication.add_attribute(XorPeerAddress::new(peer));
    data_indication.add_attribute(Data::new(data).unwrap());
    client.route_packet(&encode(data_indication));

    let mut buf = [0; 1500];
    let n = conn.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], [1, 2, 3, 4]);
}

#[test]
fn channel_bind_and_channel_data() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);
    let allocation = allocate_ok(&stun, &client, addr("127.0.0.2:1113"));

    let peer = addr("127.0.0.1:1001");
    stun.on_request(|request, handler| {
        handler(Ok(respond(&request, MessageClass::SuccessResponse, vec![])));
        Ok(())
    });
    let permission = allocation.create(peer.ip()).unwrap();
    let conn = permission.create_udp(peer).unwrap();
    let other = permission.create_udp(addr("127.0.0.1:1002")).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        stun.on_request(move |request, handler| {
            assert_eq!(request.method(), CHANNEL_BIND);
            let number = request
                .get_attribute::<ChannelNumber>()
                .expect("CHANNEL-NUMBER missing")
                .value();
            assert!((0x4000..=0x7FFF).contains(&number));
            assert!(request.get_attribute::<XorPeerAddress>().is_some());
            seen.lock().push(number);
            handler(Ok(respond(&request, MessageClass::SuccessResponse, vec![])));
            Ok(())
        });
    }
    conn.bind().unwrap();
    assert!(conn.bound());
    assert_eq!(conn.binding(), Some(seen.lock()[0]));

    let e = conn.bind().unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::AlreadyBound);

    // Channel numbers are unique within the client.
    other.bind().unwrap();
    assert_ne!(other.binding(), conn.binding());

    // A bound connection writes ChannelData to the raw socket, not STUN.
    stun.expect_no_request();
    stun.on_indication(|_| panic!("no indication expected"));
    let number = conn.binding().unwrap();
    assert_eq!(conn.write(&[1, 2, 3, 4]).unwrap(), 4);
    let frames = socket.take();
    assert_eq!(frames.len(), 1);
    let frame = ChannelDataDecoder::default()
        .decode_from_bytes(&frames[0])
        .unwrap();
    assert_eq!(frame.channel_number(), number);
    assert_eq!(frame.data(), [1, 2, 3, 4]);

    // And inbound frames for that channel reach the same connection.
    let inbound = ChannelDataEncoder::default()
        .encode_into_bytes(ChannelData::new(number, vec![5, 6, 7, 8]).unwrap())
        .unwrap();
    client.route_packet(&inbound);
    let mut buf = [0; 1500];
    let n = conn.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], [5, 6, 7, 8]);
}

#[test]
fn permission_close_is_idempotent() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);
    let allocation = allocate_ok(&stun, &client, addr("127.0.0.2:1113"));

    let peer = addr("127.0.0.1:1001");
    stun.on_request(|request, handler| {
        handler(Ok(respond(&request, MessageClass::SuccessResponse, vec![])));
        Ok(())
    });
    let permission = allocation.create(peer.ip()).unwrap();
    let conn = permission.create_udp(peer).unwrap();

    assert!(permission.close().is_ok());
    assert!(permission.close().is_ok());

    let mut buf = [0; 16];
    let e = conn.read(&mut buf).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Closed);
    let e = conn.write(&[1]).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Closed);

    // The connection is deregistered: traffic for it is silently dropped.
    let mut data_indication =
        Message::new(MessageClass::Indication, DATA, TransactionId::new([9; 12]));
    data_indication.add_attribute(XorPeerAddress::new(peer));
    data_indication.add_attribute(Data::new(vec![1, 2]).unwrap());
    client.route_packet(&encode(data_indication));
}

#[test]
fn read_deadline_expires() {
    let stun = ScriptedStun::new();
    let socket = CapturingSocket::new();
    let client = new_client(&stun, &socket, None);
    let allocation = allocate_ok(&stun, &client, addr("127.0.0.2:1113"));

    let peer = addr("127.0.0.1:1001");
    stun.on_request(|request, handler| {
        handler(Ok(respond(&request, MessageClass::SuccessResponse, vec![])));
        Ok(())
    });
    let permission = allocation.create(peer.ip()).unwrap();
    let conn = permission.create_udp(peer).unwrap();

    let started = Instant::now();
    conn.set_read_deadline(Some(started + Duration::from_millis(50)));
    let mut buf = [0; 16];
    let e = conn.read(&mut buf).unwrap_err();
    assert_eq!(*e.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(50));
}
