//! Drives two sessions against each other through an in-memory host:
//! the new-game handshake, loss and retransmission, duplicate initials
//! arriving over different transports, and the relay flipping a session's
//! role.

use assert_matches::assert_matches;
use meeplenet_proto::{
    addr::{IpEndpoint, PeerAddr, RelayEndpoint, SmsEndpoint, TransportKind},
    host::{Host, TransportFlags},
    octs::Bytes,
    relay::{ConnectResp, RelayFrame, RelayPhase},
    session::{RecvError, Session},
    ty::{ChannelId, ConnId, CookieId, MsgSeq, RelayHostId},
};

#[derive(Debug, Default)]
struct TestHost {
    now: u32,
    seed: u16,
    /// Every frame handed to a transport driver, with its kind.
    sent: Vec<(Vec<u8>, TransportKind)>,
    role_changes: Vec<bool>,
    relay_phases: Vec<RelayPhase>,
    queue_counts: Vec<usize>,
}

impl TestHost {
    fn new(seed: u16) -> Self {
        Self {
            now: 1000,
            seed,
            ..Self::default()
        }
    }

    fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
            .into_iter()
            .map(|(frame, _)| frame)
            .collect()
    }
}

impl Host for TestHost {
    fn send(
        &mut self,
        frame: &[u8],
        _msg_no: &str,
        _addr: &PeerAddr,
        kind: TransportKind,
        _game_id: u32,
    ) -> i32 {
        self.sent.push((frame.to_vec(), kind));
        i32::try_from(frame.len()).unwrap_or(i32::MAX)
    }

    fn transport_flags(&self) -> TransportFlags {
        TransportFlags::empty()
    }

    fn count_changed(&mut self, pending: usize) {
        self.queue_counts.push(pending);
    }

    fn relay_status(&mut self, phase: RelayPhase) {
        self.relay_phases.push(phase);
    }

    fn role_change(&mut self, new_is_server: bool) {
        self.role_changes.push(new_is_server);
    }

    fn now_secs(&self) -> u32 {
        self.now
    }

    fn random_seed(&mut self) -> u16 {
        self.seed
    }
}

fn ip_addr() -> PeerAddr {
    let mut addr = PeerAddr::new();
    addr.set_ip(IpEndpoint {
        host_name: "peer.example".into(),
        ip: 0x0A00_0002,
        port: 4567,
    });
    addr
}

fn sms_addr() -> PeerAddr {
    let mut addr = PeerAddr::new();
    addr.set_sms(SmsEndpoint {
        phone: "+15555550123".into(),
        port: 3344,
    });
    addr
}

fn relay_addr() -> PeerAddr {
    let mut addr = PeerAddr::new();
    addr.set_relay(RelayEndpoint {
        room: "kitchen".into(),
        host_name: "relay.example".into(),
        ip: 0x0A00_0001,
        port: 10997,
        seeks_public: false,
        advertise: false,
    });
    addr
}

/// Runs the new-game handshake and returns (client, client host, server,
/// server host, established channel).
fn handshake() -> (Session, TestHost, Session, TestHost, ChannelId) {
    let mut client_host = TestHost::new(0xA1B0);
    let mut server_host = TestHost::new(0xC0D0);
    let mut client = Session::client(1, 2);
    let mut server = Session::server(1, 2);

    let addr = ip_addr();
    client.augment_host_addr(&mut client_host, &addr);
    server.augment_host_addr(&mut server_host, &addr);

    // client sends its initial payload with no channel and no conn id
    client.send(&mut client_host, ChannelId::NONE, b"HELLO").unwrap();
    let initial = client_host.take_sent().remove(0);

    // server sees it, assigns a channel, processes the payload
    let incoming = server
        .check_incoming(&mut server_host, Bytes::from(initial), &ip_addr())
        .unwrap()
        .unwrap();
    let channel = incoming.channel;
    assert_eq!(ChannelId(0xA1B1), channel);
    assert_eq!(MsgSeq::INITIAL, incoming.seq);
    assert_eq!(b"HELLO", &incoming.payload[..]);
    server.msg_processed(incoming, false);

    // server host assigns the connection id and replies
    server.set_conn_id(ConnId(0x5EED_5EED));
    server.send(&mut server_host, channel, b"ACK").unwrap();
    let reply = server_host.take_sent().remove(0);

    // the reply establishes the client's record, conn id, and drains the
    // initial message from its queue
    assert_eq!(1, client.count_pending_packets());
    let incoming = client
        .check_incoming(&mut client_host, Bytes::from(reply), &ip_addr())
        .unwrap()
        .unwrap();
    assert_eq!(b"ACK", &incoming.payload[..]);
    client.msg_processed(incoming, false);

    assert_eq!(ConnId(0x5EED_5EED), client.conn_id());
    assert_eq!(0, client.count_pending_packets());

    (client, client_host, server, server_host, channel)
}

#[test]
fn new_game_handshake() {
    handshake();
}

#[test]
fn loss_and_retransmit_preserve_order() {
    let (mut client, mut client_host, mut server, mut server_host, channel) = handshake();

    for payload in [b"mv1", b"mv2", b"mv3"] {
        client.send(&mut client_host, channel, payload).unwrap();
    }
    let frames = client_host.take_sent();
    assert_eq!(3, frames.len());

    let mut delivered = Vec::new();
    let mut feed = |server: &mut Session, host: &mut TestHost, frame: &[u8], out: &mut Vec<Vec<u8>>| {
        match server.check_incoming(host, Bytes::from(frame.to_vec()), &ip_addr()) {
            Ok(Some(incoming)) => {
                out.push(incoming.payload.to_vec());
                server.msg_processed(incoming, false);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        }
    };

    // sequence 1 arrives; 2 is lost; 3 arrives early and must wait
    feed(&mut server, &mut server_host, &frames[0], &mut delivered).unwrap();
    assert_matches!(
        feed(&mut server, &mut server_host, &frames[2], &mut delivered),
        Err(RecvError::SequenceGap { .. })
    );
    assert_eq!(vec![b"mv1".to_vec()], delivered);

    // retransmission repairs the gap, in order
    let resent = client.resend_all(&mut client_host, None, true);
    assert_eq!(3, resent);
    let frames = client_host.take_sent();

    assert_matches!(
        feed(&mut server, &mut server_host, &frames[0], &mut delivered),
        Err(RecvError::SequenceDup { .. })
    );
    feed(&mut server, &mut server_host, &frames[1], &mut delivered).unwrap();
    feed(&mut server, &mut server_host, &frames[2], &mut delivered).unwrap();

    assert_eq!(
        vec![b"mv1".to_vec(), b"mv2".to_vec(), b"mv3".to_vec()],
        delivered
    );
}

#[test]
fn duplicate_initial_is_rejected_and_absorbs_endpoints() {
    let mut client_host = TestHost::new(0xA1B0);
    let mut server_host = TestHost::new(0xC0D0);
    let mut client = Session::client(1, 2);
    let mut server = Session::server(1, 2);
    client.augment_host_addr(&mut client_host, &ip_addr());
    server.augment_host_addr(&mut server_host, &ip_addr());

    client.send(&mut client_host, ChannelId::NONE, b"HELLO").unwrap();
    let initial = client_host.take_sent().remove(0);

    let incoming = server
        .check_incoming(&mut server_host, Bytes::from(initial.clone()), &ip_addr())
        .unwrap()
        .unwrap();
    server.msg_processed(incoming, false);

    // the same initial arrives again, this time over short messages
    assert_matches!(
        server.check_incoming(&mut server_host, Bytes::from(initial), &sms_addr()),
        Err(RecvError::DuplicateInitial {
            channel: ChannelId(0xA1B1)
        })
    );

    // no second record, and the session now knows it is reachable over sms
    assert!(server.addr().has(TransportKind::Sms));
}

#[test]
fn initials_from_different_devices_get_unique_channels() {
    let mut server_host = TestHost::new(0xC0D0);
    let mut server = Session::server(1, 3);
    server.augment_host_addr(&mut server_host, &ip_addr());

    let mut channels = Vec::new();
    for seed in [0xA1B0u16, 0xB2C0] {
        let mut peer_host = TestHost::new(seed);
        let mut peer = Session::client(1, 3);
        peer.augment_host_addr(&mut peer_host, &ip_addr());
        peer.send(&mut peer_host, ChannelId::NONE, b"HELLO").unwrap();
        let initial = peer_host.take_sent().remove(0);

        let incoming = server
            .check_incoming(&mut server_host, Bytes::from(initial), &ip_addr())
            .unwrap()
            .unwrap();
        channels.push(incoming.channel);
        server.msg_processed(incoming, false);
    }

    assert_eq!(ChannelId(0xA1B1), channels[0]);
    assert_eq!(ChannelId(0xB2C2), channels[1]);
    assert!(channels[0].number() <= ChannelId::MASK);
    assert!(channels[1].number() <= ChannelId::MASK);
}

#[test]
fn connect_resp_can_flip_the_role() {
    let mut host = TestHost::new(0xA1B0);
    let mut session = Session::client(1, 2);
    session.augment_host_addr(&mut host, &relay_addr());

    // joining the room sent a Connect and left us pending
    let sent = host.take_sent();
    assert_eq!(1, sent.len());
    assert!(host.relay_phases.contains(&RelayPhase::ConnectPending));

    // the relay says we are host id 1: the server, not the client we assumed
    let resp = RelayFrame::ConnectResp(ConnectResp {
        host_id: RelayHostId::SERVER,
        cookie_id: CookieId(0x0717),
        heartbeat: 0,
        players_sought: 2,
        players_here: 1,
        conn_name: "kitchen/8f3a".into(),
        dev_id: None,
    });
    let consumed = session
        .check_incoming(&mut host, resp.to_bytes(), &relay_addr())
        .unwrap();
    assert!(consumed.is_none());

    assert_eq!(vec![true], host.role_changes);
    assert!(session.role().is_server());
    assert_eq!(0, session.count_pending_packets());
    assert!(host.relay_phases.contains(&RelayPhase::Connected));
}

#[test]
fn all_here_completes_the_relay_conversation() {
    let mut host = TestHost::new(0xA1B0);
    let mut session = Session::client(1, 2);
    session.augment_host_addr(&mut host, &relay_addr());
    host.take_sent();

    let resp = RelayFrame::ConnectResp(ConnectResp {
        host_id: RelayHostId(2),
        cookie_id: CookieId(0x0717),
        heartbeat: 0,
        players_sought: 2,
        players_here: 1,
        conn_name: "kitchen/8f3a".into(),
        dev_id: None,
    });
    session
        .check_incoming(&mut host, resp.to_bytes(), &relay_addr())
        .unwrap();
    assert!(!host.relay_phases.contains(&RelayPhase::AllConnected));

    let all_here = RelayFrame::AllHere {
        src_id: RelayHostId(2),
        conn_name: "kitchen/8f3a".into(),
    };
    session
        .check_incoming(&mut host, all_here.to_bytes(), &relay_addr())
        .unwrap();
    assert!(host.relay_phases.contains(&RelayPhase::AllConnected));
    assert_eq!(Some("kitchen/8f3a/2".to_owned()), session.relay_id());
    assert!(session.is_connected());
}

#[test]
fn backoff_spaces_out_resend_passes() {
    let (mut client, mut client_host, mut server, mut server_host, channel) = handshake();

    client.send(&mut client_host, channel, b"mv1").unwrap();
    client_host.take_sent();

    // first unforced pass goes out and doubles the backoff
    assert_eq!(1, client.resend_all(&mut client_host, None, false));
    assert_eq!(1, client_host.take_sent().len());

    // a pass inside the backoff window sends nothing
    assert_eq!(0, client.resend_all(&mut client_host, None, false));
    assert!(client_host.take_sent().is_empty());

    // once the window passes, the next pass goes out
    client_host.now += 2;
    assert_eq!(1, client.resend_all(&mut client_host, None, false));
    assert_eq!(1, client_host.take_sent().len());

    // a valid receipt resets the backoff entirely
    server.send(&mut server_host, channel, b"srv").unwrap();
    let frame = server_host.take_sent().remove(0);
    let incoming = client
        .check_incoming(&mut client_host, Bytes::from(frame), &ip_addr())
        .unwrap()
        .unwrap();
    client.msg_processed(incoming, false);

    assert_eq!(1, client.resend_all(&mut client_host, None, false));
    assert_eq!(1, client_host.take_sent().len());
}

#[test]
fn ack_only_receipt_resets_the_backoff() {
    let (mut client, mut client_host, mut server, mut server_host, channel) = handshake();

    client.send(&mut client_host, channel, b"mv1").unwrap();
    client.send(&mut client_host, channel, b"mv2").unwrap();
    let frames = client_host.take_sent();

    // the server sees only the first move
    let incoming = server
        .check_incoming(&mut server_host, Bytes::from(frames[0].clone()), &ip_addr())
        .unwrap()
        .unwrap();
    server.msg_processed(incoming, false);

    // stretch the client's backoff with two successful unforced passes,
    // then confirm the window is closed
    assert_eq!(2, client.resend_all(&mut client_host, None, false));
    client_host.now += 2;
    assert_eq!(2, client.resend_all(&mut client_host, None, false));
    client_host.take_sent();
    assert_eq!(0, client.resend_all(&mut client_host, None, false));

    // the server's durable save triggers an ack-only frame for the move
    let _ = server.write_to_stream(&mut server_host, meeplenet_proto::ty::SaveToken(3));
    server.save_succeeded(&mut server_host, meeplenet_proto::ty::SaveToken(3));
    let acks = server_host.take_sent();
    assert_eq!(1, acks.len());

    // the ACK drains the first move and, as a valid receipt, resets the
    // backoff: without the clock moving, the next unforced pass goes out
    let consumed = client
        .check_incoming(&mut client_host, Bytes::from(acks[0].clone()), &ip_addr())
        .unwrap();
    assert!(consumed.is_none());
    assert_eq!(1, client.count_pending_packets());

    assert_eq!(1, client.resend_all(&mut client_host, None, false));
    assert_eq!(1, client_host.take_sent().len());
}

#[test]
fn empty_payloads_are_refused() {
    let mut host = TestHost::new(0xA1B0);
    let mut session = Session::client(1, 2);
    session.augment_host_addr(&mut host, &ip_addr());
    assert!(session.send(&mut host, ChannelId::NONE, b"").is_err());
}

#[test]
fn restored_session_resumes_the_exchange() {
    let (mut client, mut client_host, mut server, mut server_host, channel) = handshake();

    client.send(&mut client_host, channel, b"mv1").unwrap();
    client_host.take_sent();

    // persist the client mid-game and bring it back
    let blob = client.write_to_stream(&mut client_host, meeplenet_proto::ty::SaveToken(1));
    let mut client = Session::from_stream(
        &mut client_host,
        meeplenet_proto::session::Role::Client,
        blob,
    )
    .unwrap();

    // the unacknowledged move is still pending and still resends
    assert_eq!(1, client.count_pending_packets());
    assert_eq!(1, client.resend_all(&mut client_host, None, true));
    let frame = client_host.take_sent().remove(0);

    let incoming = server
        .check_incoming(&mut server_host, Bytes::from(frame), &ip_addr())
        .unwrap()
        .unwrap();
    assert_eq!(b"mv1", &incoming.payload[..]);
    server.msg_processed(incoming, false);

    // and the restored session still accepts the server's next message
    server.send(&mut server_host, channel, b"srv").unwrap();
    let frame = server_host.take_sent().remove(0);
    let incoming = client
        .check_incoming(&mut client_host, Bytes::from(frame), &ip_addr())
        .unwrap()
        .unwrap();
    assert_eq!(b"srv", &incoming.payload[..]);
    client.msg_processed(incoming, false);
}
