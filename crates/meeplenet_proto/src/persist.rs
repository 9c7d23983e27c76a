//! Version-tagged serialization of a whole session, so a process restart
//! (or reinstall restoring from backup) resumes exactly where it left off.
//!
//! The stream version comes first; the decoder picks a recipe per version
//! and refuses versions newer than it knows. The host owns the storage and
//! the key; the core only produces and consumes the bytes, and runs the
//! save-token handshake that gates the saved cursors (see
//! [`Session::save_succeeded`]).

use octs::{Bytes, BytesMut, Read, Write};

use crate::{
    addr::{AddrError, PeerAddr, TransportKind},
    host::Host,
    queue::QueueElem,
    session::{Role, Session},
    table::ChannelTable,
    ty::{ChannelId, ConnId, MsgSeq, RelayHostId, SaveToken},
    util::{read_str8, write_str8, StrError},
};

/// Current stream version.
pub const STREAM_VERSION: u8 = 1;

/// Failed to restore a session from a persisted blob.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    /// Blob ended early.
    #[error("blob too short")]
    TooShort,
    /// The blob was written by a newer build.
    #[error("stream version {0} is newer than this build understands")]
    UnsupportedVersion(u8),
    /// An embedded address failed to decode.
    #[error("bad address")]
    Addr(#[from] AddrError),
    /// An embedded string failed to decode.
    #[error("bad string")]
    BadString(#[from] StrError),
}

fn read_u8(src: &mut Bytes) -> Result<u8, PersistError> {
    src.read::<u8>().map_err(|_| PersistError::TooShort)
}

fn read_u16(src: &mut Bytes) -> Result<u16, PersistError> {
    src.read::<u16>().map_err(|_| PersistError::TooShort)
}

fn read_u32(src: &mut Bytes) -> Result<u32, PersistError> {
    src.read::<u32>().map_err(|_| PersistError::TooShort)
}

impl Session {
    /// Serializes the session and remembers `token` as the save in flight.
    ///
    /// When the host later confirms that exactly these bytes hit stable
    /// storage, by echoing the same token to [`Session::save_succeeded`],
    /// the saved cursors advance. The blob stores the resend deadline as
    /// seconds-remaining, so it stays meaningful across a restart.
    #[allow(clippy::cast_possible_truncation)] // lengths bounded by the u8/u16 layout
    pub fn write_to_stream(&mut self, host: &mut dyn Host, token: SaveToken) -> Bytes {
        let mut dst = BytesMut::new();
        let w = &mut dst;

        put_u8(w, STREAM_VERSION);
        put_u8(w, 0); // reserved flags byte, kept for layout stability
        self.addr.write_to(w);
        put_u8(w, (self.relay.players_here << 4) | (self.relay.players_total & 0x0F));
        put_u32(w, self.conn_id.0);
        put_u16(w, self.next_channel_no);
        put_u16(w, self.channel_seed);
        put_u16(w, self.resend_backoff);
        put_u32(w, self.next_resend.saturating_sub(host.now_secs()));
        if self.addr.has(TransportKind::Relay) {
            put_u8(w, self.relay.my_host_id.0);
            write_str8(w, &self.relay.conn_name);
        }

        debug_assert!(self.queue.len() <= usize::from(u8::MAX));
        debug_assert!(self.table.len() <= usize::from(u8::MAX));
        put_u8(w, self.queue.len() as u8);
        put_u8(w, self.table.len() as u8);

        for rec in self.table.iter() {
            rec.addr.write_to(w);
            put_u16(w, rec.next_seq.0 as u16);
            put_u16(w, rec.last_recv.0 as u16);
            put_u16(w, rec.last_acked.0 as u16);
            put_u16(w, rec.channel.0);
            if rec.addr.has(TransportKind::Relay) {
                put_u8(w, rec.relay_host.0);
            }
        }

        for elem in self.queue.iter() {
            put_u16(w, elem.channel.0);
            put_u32(w, elem.seq.0);
            debug_assert!(elem.frame.len() <= usize::from(u16::MAX));
            put_u16(w, elem.frame.len() as u16);
            let res = w.write_from(&elem.frame[..]);
            debug_assert!(res.is_ok());
        }

        let mut disabled = 0u16;
        for (kind_index, dirs) in self.disabled.iter().enumerate() {
            for (dir_index, flag) in dirs.iter().enumerate() {
                if *flag {
                    disabled |= 1 << (kind_index * 2 + dir_index);
                }
            }
        }
        put_u16(w, disabled);

        self.last_save_token = Some(token);
        dst.freeze()
    }

    /// Restores a session from a blob produced by
    /// [`Session::write_to_stream`].
    ///
    /// `role` is the host's record of which side this device is; the relay
    /// may still overrule it later. The relay conversation always restarts
    /// from Unconnected; connection state does not survive a process.
    pub fn from_stream(
        host: &mut dyn Host,
        role: Role,
        mut src: Bytes,
    ) -> Result<Self, PersistError> {
        let version = read_u8(&mut src)?;
        if version > STREAM_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }

        let _flags = read_u8(&mut src)?;
        let addr = PeerAddr::read_from(&mut src)?;
        let players = read_u8(&mut src)?;
        let (players_here, players_total) = (players >> 4, players & 0x0F);

        let mut session = Self::new(role, players_here, players_total);
        session.addr = addr;

        session.conn_id = ConnId(read_u32(&mut src)?);
        session.next_channel_no = read_u16(&mut src)?;
        session.channel_seed = read_u16(&mut src)?;
        session.resend_backoff = read_u16(&mut src)?;
        session.next_resend = host.now_secs().saturating_add(read_u32(&mut src)?);
        if session.addr.has(TransportKind::Relay) {
            session.relay.my_host_id = RelayHostId(read_u8(&mut src)?);
            session.relay.conn_name = read_str8(&mut src)?;
        }

        let queue_len = read_u8(&mut src)?;
        let n_records = read_u8(&mut src)?;

        let mut table = ChannelTable::new();
        for _ in 0..n_records {
            let rec_addr = PeerAddr::read_from(&mut src)?;
            let next_seq = MsgSeq(u32::from(read_u16(&mut src)?));
            let last_recv = MsgSeq(u32::from(read_u16(&mut src)?));
            let last_acked = MsgSeq(u32::from(read_u16(&mut src)?));
            let channel = ChannelId(read_u16(&mut src)?);
            let relay_host = if rec_addr.has(TransportKind::Relay) {
                RelayHostId(read_u8(&mut src)?)
            } else {
                RelayHostId::NONE
            };

            let rec = table.remember(channel, relay_host, rec_addr);
            rec.next_seq = next_seq;
            // the blob itself was the durable save: everything received when
            // it was written had, by definition, been saved
            rec.last_recv = last_recv;
            rec.last_saved = last_recv;
            rec.last_acked = last_acked;
        }
        session.table = table;

        for _ in 0..queue_len {
            let channel = ChannelId(read_u16(&mut src)?);
            let seq = MsgSeq(read_u32(&mut src)?);
            let len = usize::from(read_u16(&mut src)?);
            let frame = src
                .read_next(len)
                .map_err(|_| PersistError::TooShort)?;
            session.queue.push(QueueElem {
                channel,
                seq,
                frame,
                send_count: 0,
            });
        }

        let disabled = read_u16(&mut src)?;
        for kind_index in 0..session.disabled.len() {
            for dir_index in 0..2 {
                session.disabled[kind_index][dir_index] =
                    disabled & (1 << (kind_index * 2 + dir_index)) != 0;
            }
        }

        host.count_changed(session.queue.len());
        Ok(session)
    }
}

fn put_u8(dst: &mut BytesMut, value: u8) {
    let res = dst.write(&value);
    debug_assert!(res.is_ok());
}

fn put_u16(dst: &mut BytesMut, value: u16) {
    let res = dst.write(&value);
    debug_assert!(res.is_ok());
}

fn put_u32(dst: &mut BytesMut, value: u32) {
    let res = dst.write(&value);
    debug_assert!(res.is_ok());
}

#[cfg(test)]
mod tests {
    use crate::{
        addr::{IpEndpoint, SmsEndpoint},
        host::TransportFlags,
        session::Direction,
    };

    use super::*;

    struct NullHost;

    impl Host for NullHost {
        fn send(
            &mut self,
            frame: &[u8],
            _msg_no: &str,
            _addr: &PeerAddr,
            _kind: TransportKind,
            _game_id: u32,
        ) -> i32 {
            i32::try_from(frame.len()).unwrap_or(i32::MAX)
        }

        fn transport_flags(&self) -> TransportFlags {
            TransportFlags::empty()
        }

        fn role_change(&mut self, _new_is_server: bool) {}

        fn now_secs(&self) -> u32 {
            1000
        }

        fn random_seed(&mut self) -> u16 {
            0xA1B0
        }
    }

    fn populated() -> Session {
        let host = &mut NullHost;
        let mut session = Session::server(1, 2);
        let mut addr = PeerAddr::new();
        addr.set_ip(IpEndpoint {
            host_name: "game.example".into(),
            ip: 0x0A00_0001,
            port: 4567,
        });
        session.augment_host_addr(host, &addr);
        session.set_conn_id(ConnId(0x5EED_5EED));
        session.set_kind_disabled(TransportKind::Sms, Direction::Receive, true);

        let mut peer = PeerAddr::new();
        peer.set_sms(SmsEndpoint {
            phone: "+15555550123".into(),
            port: 3344,
        });
        let rec = session.table.remember(ChannelId(0xA1B1), RelayHostId::NONE, peer);
        rec.next_seq = MsgSeq(4);
        rec.last_recv = MsgSeq(2);
        rec.last_saved = MsgSeq(2);
        rec.last_acked = MsgSeq(2);

        session.queue.push(QueueElem {
            channel: ChannelId(0xA1B1),
            seq: MsgSeq(3),
            frame: Bytes::from_static(b"framed move"),
            send_count: 2,
        });
        session
    }

    #[test]
    fn round_trip_preserves_observable_state() {
        let host = &mut NullHost;
        let mut session = populated();
        let blob = session.write_to_stream(host, SaveToken(7));

        let restored = Session::from_stream(host, Role::Server, blob).unwrap();

        assert_eq!(session.conn_id(), restored.conn_id());
        assert_eq!(session.count_pending_packets(), restored.count_pending_packets());
        assert_eq!(session.addr(), restored.addr());
        assert!(restored.kind_disabled(TransportKind::Sms, Direction::Receive));
        assert!(!restored.kind_disabled(TransportKind::Sms, Direction::Send));

        let orig: Vec<_> = session
            .table
            .iter()
            .map(|r| (r.channel, r.next_seq, r.last_recv, r.last_acked))
            .collect();
        let back: Vec<_> = restored
            .table
            .iter()
            .map(|r| (r.channel, r.next_seq, r.last_recv, r.last_acked))
            .collect();
        assert_eq!(orig, back);

        let mut frames = Vec::new();
        restored.pending_msgs(|frame, seq| frames.push((seq, frame.to_vec())));
        assert_eq!(vec![(MsgSeq(3), b"framed move".to_vec())], frames);
    }

    #[test]
    fn newer_version_is_refused() {
        let mut blob = BytesMut::new();
        put_u8(&mut blob, STREAM_VERSION + 1);
        put_u8(&mut blob, 0);
        assert_eq!(
            Err(PersistError::UnsupportedVersion(STREAM_VERSION + 1)),
            Session::from_stream(&mut NullHost, Role::Client, blob.freeze()).map(|_| ()),
        );
    }

    #[test]
    fn stale_save_token_does_not_advance_cursors() {
        let host = &mut NullHost;
        let mut session = populated();
        {
            let rec = session.table.iter_mut().next().unwrap();
            rec.last_recv = MsgSeq(5);
            rec.last_saved = MsgSeq(2);
        }

        let _ = session.write_to_stream(host, SaveToken(7));
        let _ = session.write_to_stream(host, SaveToken(8));

        session.save_succeeded(host, SaveToken(7));
        assert_eq!(MsgSeq(2), session.table.iter().next().unwrap().last_saved);

        session.save_succeeded(host, SaveToken(8));
        assert_eq!(MsgSeq(5), session.table.iter().next().unwrap().last_saved);
    }
}
