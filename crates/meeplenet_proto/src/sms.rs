//! Fragmentation, batching and reassembly for the short-message transport.
//!
//! Short messages are tiny and expensive, so this codec works both ends of
//! the problem: outbound, whole messages are held briefly and packed
//! together ("combo" datagrams), and anything too large is split into
//! numbered parts; inbound, parts are reassembled by `(phone, msg id)`. The
//! reassembly state is persisted through the host blob store on every
//! change, so a partial delivery survives a crash or restart.
//!
//! The transport carries text: a datagram of [`MTU`] octets holds only
//! `MTU * 3 / 4` bytes of binary once ascii-armored, and every size budget
//! here works from that binary figure.
//!
//! Unlike everything else in this crate, [`SmsProto`] locks internally: the
//! host may genuinely drive it from more than one thread (a radio/modem
//! driver plus a timer thread).

use std::sync::{Mutex, PoisonError};

use ahash::AHashMap;
use octs::{Buf, Bytes, BytesMut, Read, Write};

use crate::{
    host::Host,
    util::{read_str8, write_str8},
};

/// Octet limit of one transport datagram.
pub const MTU: usize = 115;

/// Binary bytes that survive ascii-armoring into one datagram.
pub const BIN_BUDGET: usize = MTU * 3 / 4;

/// How long an outbound message may wait for company, seconds.
pub const MAX_WAIT_SECS: u32 = 3;

/// Split-part header: proto, msg id, index, count.
const PART_HEADER_LEN: usize = 4;

/// Largest data slice one split part carries.
const PART_DATA_LEN: usize = BIN_BUDGET - PART_HEADER_LEN;

const PROTO_SPLIT: u8 = 1;
const PROTO_COMBO: u8 = 2;

/// Version byte of the persisted partials blob.
const PARTIALS_VERSION: u8 = 0;

const BLOB_KEY_PARTIALS: &str = "sms.partials";
const BLOB_KEY_NEXT_ID: &str = "sms.next_id";

/// What one whole short message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SmsCmd {
    /// Invitation to a game; carries no game id yet.
    Invite,
    /// A framed game message.
    Data,
    /// The sending device deleted the game.
    Death,
    /// Acknowledges an invitation.
    Ack,
}

impl SmsCmd {
    const fn to_raw(self) -> u8 {
        match self {
            Self::Invite => 1,
            Self::Data => 2,
            Self::Death => 3,
            Self::Ack => 4,
        }
    }

    const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Invite,
            2 => Self::Data,
            3 => Self::Death,
            4 => Self::Ack,
            _ => return None,
        })
    }
}

/// One whole message delivered out of [`SmsProto::prep_inbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    /// What the message is.
    pub cmd: SmsCmd,
    /// Game the message belongs to; 0 for invitations.
    pub game_id: u32,
    /// The opaque bytes (for [`SmsCmd::Data`], a framed game message).
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct OutQueue {
    /// When the oldest queued message arrived.
    created: u32,
    /// Whole messages, each already carrying its inner header.
    msgs: Vec<Vec<u8>>,
    total: usize,
}

#[derive(Debug, Clone, Default)]
struct Partial {
    parts: Vec<Option<Vec<u8>>>,
}

impl Partial {
    fn is_complete(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(Option::is_some)
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_msg_id: u8,
    to_phones: AHashMap<String, OutQueue>,
    partials: AHashMap<(String, u8), Partial>,
}

/// The short-message fragmentation codec.
///
/// One instance per process; state is keyed by phone number, not by game.
#[derive(Debug, Default)]
pub struct SmsProto {
    inner: Mutex<Inner>,
}

impl SmsProto {
    /// Creates a codec, restoring the persisted message-id counter and any
    /// partial reassemblies from the host blob store.
    #[must_use]
    pub fn new(host: &mut dyn Host) -> Self {
        let mut inner = Inner::default();
        if let Some(bytes) = host.load_blob(BLOB_KEY_NEXT_ID) {
            inner.next_msg_id = bytes.first().copied().unwrap_or(0);
        }
        if let Some(bytes) = host.load_blob(BLOB_KEY_PARTIALS) {
            match restore_partials(&bytes) {
                Some(partials) => inner.partials = partials,
                None => tracing::warn!("discarding unreadable partials blob"),
            }
        }
        tracing::debug!(
            next_msg_id = inner.next_msg_id,
            partials = inner.partials.len(),
            "short-message codec restored",
        );
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Queues `msg` (if any) for `to_phone`, then flushes if the batch is
    /// due: the caller forced it, the accumulated bytes would not fit a
    /// single datagram anyway, or the oldest message has waited
    /// [`MAX_WAIT_SECS`].
    ///
    /// Returns the datagrams to hand to the transport, plus the residual
    /// number of seconds the caller should wait before polling again (0 when
    /// nothing is pending).
    pub fn prep_outbound(
        &self,
        host: &mut dyn Host,
        msg: Option<(SmsCmd, u32, &[u8])>,
        to_phone: &str,
        port: u16,
        force: bool,
    ) -> (Vec<Bytes>, u32) {
        let now = host.now_secs();
        let mut inner = self.lock();

        if let Some((cmd, game_id, payload)) = msg {
            let rec = inner.to_phones.entry(to_phone.to_owned()).or_default();
            if rec.msgs.is_empty() {
                rec.created = now;
            }
            let framed = frame_msg(cmd, port, game_id, payload);
            rec.total += framed.len();
            rec.msgs.push(framed);
        }

        let due = inner.to_phones.get(to_phone).is_some_and(|rec| {
            !rec.msgs.is_empty()
                && (force
                    || rec.total > BIN_BUDGET
                    || now.saturating_sub(rec.created) >= MAX_WAIT_SECS)
        });

        if due {
            let rec = inner.to_phones.remove(to_phone).unwrap_or_default();
            let datagrams = to_datagrams(&mut inner, rec, force);
            host.store_blob(BLOB_KEY_NEXT_ID, &[inner.next_msg_id]);
            tracing::debug!(count = datagrams.len(), to_phone, "flushing short messages");
            (datagrams, 0)
        } else {
            let wait = inner
                .to_phones
                .get(to_phone)
                .filter(|rec| !rec.msgs.is_empty())
                .map_or(0, |rec| {
                    MAX_WAIT_SECS.saturating_sub(now.saturating_sub(rec.created))
                });
            (Vec::new(), wait)
        }
    }

    /// Feeds one received datagram in; returns every whole message it
    /// completes whose port matches `want_port`.
    pub fn prep_inbound(
        &self,
        host: &mut dyn Host,
        from_phone: &str,
        want_port: u16,
        data: &[u8],
    ) -> Vec<SmsMessage> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        let mut src = Bytes::from(data.to_vec());

        let Ok(proto) = src.read::<u8>() else {
            return out;
        };
        match proto {
            PROTO_SPLIT => {
                let (Ok(msg_id), Ok(index), Ok(count)) =
                    (src.read::<u8>(), src.read::<u8>(), src.read::<u8>())
                else {
                    return out;
                };
                if index >= count {
                    tracing::debug!(index, count, "dropping malformed split part");
                    return out;
                }

                let key = (from_phone.to_owned(), msg_id);
                let complete = {
                    let partial = inner.partials.entry(key.clone()).or_insert_with(|| Partial {
                        parts: vec![None; usize::from(count)],
                    });
                    if partial.parts.len() != usize::from(count) {
                        tracing::warn!(msg_id, "part count changed mid-reassembly; restarting");
                        partial.parts = vec![None; usize::from(count)];
                    }
                    partial.parts[usize::from(index)] = Some(src.to_vec());
                    partial.is_complete()
                };

                if complete {
                    if let Some(partial) = inner.partials.remove(&key) {
                        let whole: Vec<u8> =
                            partial.parts.into_iter().flatten().flatten().collect();
                        if let Some(msg) = parse_msg(&whole, want_port) {
                            out.push(msg);
                        }
                    }
                }
                save_partials(host, &inner);
            }
            PROTO_COMBO => {
                while src.remaining() >= 2 {
                    let Ok(len) = src.read::<u8>() else { break };
                    let Ok(_msg_id) = src.read::<u8>() else { break };
                    let Ok(one) = src.read_next(usize::from(len)) else {
                        tracing::debug!("combo datagram truncated");
                        break;
                    };
                    if let Some(msg) = parse_msg(&one, want_port) {
                        out.push(msg);
                    }
                }
            }
            other => {
                // happens routinely: any other app's message on this number
                tracing::debug!(proto = other, "ignoring datagram with unknown protocol");
            }
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frames one whole message: inner header, then the payload.
fn frame_msg(cmd: SmsCmd, port: u16, game_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut dst = BytesMut::with_capacity(8 + payload.len());
    let res = dst.write(&PROTO_SPLIT);
    debug_assert!(res.is_ok());
    let res = dst.write(&port);
    debug_assert!(res.is_ok());
    let res = dst.write(&cmd.to_raw());
    debug_assert!(res.is_ok());
    if cmd != SmsCmd::Invite {
        let res = dst.write(&game_id);
        debug_assert!(res.is_ok());
    }
    let res = dst.write_from(payload);
    debug_assert!(res.is_ok());
    dst.freeze().to_vec()
}

/// Parses one whole message, dropping it if its port is not ours.
fn parse_msg(whole: &[u8], want_port: u16) -> Option<SmsMessage> {
    let mut src = Bytes::from(whole.to_vec());
    let proto = src.read::<u8>().ok()?;
    if proto != PROTO_SPLIT {
        return None;
    }
    let port = src.read::<u16>().ok()?;
    let cmd = SmsCmd::from_raw(src.read::<u8>().ok()?)?;
    let game_id = if cmd == SmsCmd::Invite {
        0
    } else {
        src.read::<u32>().ok()?
    };
    if port != want_port {
        tracing::debug!(port, want_port, "dropping message for another port");
        return None;
    }
    Some(SmsMessage {
        cmd,
        game_id,
        payload: src.to_vec(),
    })
}

/// Turns a phone's queued messages into datagrams: combos where messages
/// fit together, numbered split parts where one is too large (or the caller
/// wants the old single-message format).
fn to_datagrams(inner: &mut Inner, rec: OutQueue, force_old: bool) -> Vec<Bytes> {
    let mut out = Vec::new();
    let msgs = rec.msgs;
    let mut ii = 0;
    while ii < msgs.len() {
        // see how many neighbors fit into one combo datagram
        let mut last = ii;
        if !force_old && msgs[ii].len() + 2 < BIN_BUDGET {
            let mut sum = 1;
            while last < msgs.len() && sum + 2 + msgs[last].len() <= BIN_BUDGET {
                sum += 2 + msgs[last].len();
                last += 1;
            }
        }

        if last > ii {
            let mut dst = BytesMut::new();
            let res = dst.write(&PROTO_COMBO);
            debug_assert!(res.is_ok());
            for msg in &msgs[ii..last] {
                debug_assert!(msg.len() <= usize::from(u8::MAX));
                let res = dst.write(&(msg.len() as u8));
                debug_assert!(res.is_ok());
                let res = dst.write(&next_msg_id(inner));
                debug_assert!(res.is_ok());
                let res = dst.write_from(&msg[..]);
                debug_assert!(res.is_ok());
            }
            out.push(dst.freeze());
            ii = last;
        } else {
            let msg = &msgs[ii];
            let msg_id = next_msg_id(inner);
            let count = msg.len().div_ceil(PART_DATA_LEN);
            debug_assert!(count <= usize::from(u8::MAX));
            for (index, chunk) in msg.chunks(PART_DATA_LEN).enumerate() {
                let mut dst = BytesMut::with_capacity(PART_HEADER_LEN + chunk.len());
                let res = dst.write(&PROTO_SPLIT);
                debug_assert!(res.is_ok());
                let res = dst.write(&msg_id);
                debug_assert!(res.is_ok());
                let res = dst.write(&(index as u8));
                debug_assert!(res.is_ok());
                let res = dst.write(&(count as u8));
                debug_assert!(res.is_ok());
                let res = dst.write_from(chunk);
                debug_assert!(res.is_ok());
                out.push(dst.freeze());
            }
            ii += 1;
        }
    }
    out
}

fn next_msg_id(inner: &mut Inner) -> u8 {
    let id = inner.next_msg_id;
    inner.next_msg_id = inner.next_msg_id.wrapping_add(1);
    id
}

/// Persists the reassembly tables: version byte, then one entry per
/// in-flight message.
fn save_partials(host: &mut dyn Host, inner: &Inner) {
    let mut dst = BytesMut::new();
    let res = dst.write(&PARTIALS_VERSION);
    debug_assert!(res.is_ok());
    debug_assert!(inner.partials.len() <= usize::from(u8::MAX));
    let res = dst.write(&(inner.partials.len() as u8));
    debug_assert!(res.is_ok());
    for ((phone, msg_id), partial) in &inner.partials {
        write_str8(&mut dst, phone);
        let res = dst.write(msg_id);
        debug_assert!(res.is_ok());
        debug_assert!(partial.parts.len() <= usize::from(u8::MAX));
        let res = dst.write(&(partial.parts.len() as u8));
        debug_assert!(res.is_ok());
        for part in &partial.parts {
            match part {
                Some(bytes) => {
                    let res = dst.write(&1u8);
                    debug_assert!(res.is_ok());
                    debug_assert!(bytes.len() <= usize::from(u16::MAX));
                    let res = dst.write(&(bytes.len() as u16));
                    debug_assert!(res.is_ok());
                    let res = dst.write_from(&bytes[..]);
                    debug_assert!(res.is_ok());
                }
                None => {
                    let res = dst.write(&0u8);
                    debug_assert!(res.is_ok());
                }
            }
        }
    }
    host.store_blob(BLOB_KEY_PARTIALS, &dst.freeze());
}

fn restore_partials(bytes: &[u8]) -> Option<AHashMap<(String, u8), Partial>> {
    let mut src = Bytes::from(bytes.to_vec());
    if src.read::<u8>().ok()? != PARTIALS_VERSION {
        return None;
    }
    let n_entries = src.read::<u8>().ok()?;
    let mut partials = AHashMap::new();
    for _ in 0..n_entries {
        let phone = read_str8(&mut src).ok()?;
        let msg_id = src.read::<u8>().ok()?;
        let count = src.read::<u8>().ok()?;
        let mut partial = Partial {
            parts: Vec::with_capacity(usize::from(count)),
        };
        for _ in 0..count {
            let present = src.read::<u8>().ok()? != 0;
            if present {
                let len = usize::from(src.read::<u16>().ok()?);
                let part = src.read_next(len).ok()?;
                partial.parts.push(Some(part.to_vec()));
            } else {
                partial.parts.push(None);
            }
        }
        partials.insert((phone, msg_id), partial);
    }
    Some(partials)
}

#[cfg(test)]
mod tests {
    use crate::{addr::PeerAddr, addr::TransportKind, host::TransportFlags};

    use super::*;

    #[derive(Default)]
    struct BlobHost {
        now: u32,
        blobs: AHashMap<String, Vec<u8>>,
    }

    impl Host for BlobHost {
        fn send(
            &mut self,
            _frame: &[u8],
            _msg_no: &str,
            _addr: &PeerAddr,
            _kind: TransportKind,
            _game_id: u32,
        ) -> i32 {
            -1
        }

        fn transport_flags(&self) -> TransportFlags {
            TransportFlags::empty()
        }

        fn role_change(&mut self, _new_is_server: bool) {}

        fn now_secs(&self) -> u32 {
            self.now
        }

        fn random_seed(&mut self) -> u16 {
            0
        }

        fn load_blob(&mut self, key: &str) -> Option<Vec<u8>> {
            self.blobs.get(key).cloned()
        }

        fn store_blob(&mut self, key: &str, bytes: &[u8]) {
            self.blobs.insert(key.to_owned(), bytes.to_vec());
        }
    }

    const PHONE: &str = "+15555550123";
    const PORT: u16 = 3344;

    #[test]
    fn small_messages_batch_until_the_wait_expires() {
        let mut host = BlobHost::default();
        let proto = SmsProto::new(&mut host);

        let (sent, wait) =
            proto.prep_outbound(&mut host, Some((SmsCmd::Data, 7, &b"mv1"[..])), PHONE, PORT, false);
        assert!(sent.is_empty());
        assert_eq!(MAX_WAIT_SECS, wait);

        host.now += 1;
        let (sent, wait) =
            proto.prep_outbound(&mut host, Some((SmsCmd::Data, 7, &b"mv2"[..])), PHONE, PORT, false);
        assert!(sent.is_empty());
        assert_eq!(MAX_WAIT_SECS - 1, wait);

        host.now += MAX_WAIT_SECS;
        let (sent, wait) = proto.prep_outbound(&mut host, None, PHONE, PORT, false);
        assert_eq!(0, wait);
        // both messages packed into one combo datagram
        assert_eq!(1, sent.len());
        assert!(sent[0].len() <= BIN_BUDGET);
        assert_eq!(PROTO_COMBO, sent[0][0]);

        let msgs = proto.prep_inbound(&mut host, PHONE, PORT, &sent[0]);
        assert_eq!(2, msgs.len());
        assert_eq!(b"mv1".to_vec(), msgs[0].payload);
        assert_eq!(b"mv2".to_vec(), msgs[1].payload);
        assert_eq!(7, msgs[0].game_id);
    }

    #[test]
    fn force_flushes_immediately() {
        let mut host = BlobHost::default();
        let proto = SmsProto::new(&mut host);
        let (sent, wait) =
            proto.prep_outbound(&mut host, Some((SmsCmd::Data, 7, &b"now"[..])), PHONE, PORT, true);
        assert_eq!(0, wait);
        assert_eq!(1, sent.len());
    }

    #[test]
    fn large_payload_splits_into_three_parts() {
        let mut host = BlobHost::default();
        let proto = SmsProto::new(&mut host);

        let payload = vec![0x5A; 200];
        let (sent, _) =
            proto.prep_outbound(&mut host, Some((SmsCmd::Data, 7, &payload)), PHONE, PORT, true);
        assert_eq!(3, sent.len());
        for (index, part) in sent.iter().enumerate() {
            assert!(part.len() <= BIN_BUDGET);
            assert_eq!(PROTO_SPLIT, part[0]);
            assert_eq!(index as u8, part[2]);
            assert_eq!(3, part[3]);
        }

        // deliver out of order; completion only on the last
        assert!(proto.prep_inbound(&mut host, PHONE, PORT, &sent[2]).is_empty());
        assert!(proto.prep_inbound(&mut host, PHONE, PORT, &sent[0]).is_empty());
        let msgs = proto.prep_inbound(&mut host, PHONE, PORT, &sent[1]);
        assert_eq!(1, msgs.len());
        assert_eq!(payload, msgs[0].payload);
    }

    #[test]
    fn reassembly_survives_a_restart() {
        let mut host = BlobHost::default();
        let payload = vec![0x77; 200];
        let sent = {
            let proto = SmsProto::new(&mut host);
            let (sent, _) = proto.prep_outbound(
                &mut host,
                Some((SmsCmd::Data, 9, &payload)),
                PHONE,
                PORT,
                true,
            );
            sent
        };

        {
            let proto = SmsProto::new(&mut host);
            assert!(proto.prep_inbound(&mut host, PHONE, PORT, &sent[0]).is_empty());
            assert!(proto.prep_inbound(&mut host, PHONE, PORT, &sent[1]).is_empty());
            // process dies here; partials are in the blob store
        }

        let proto = SmsProto::new(&mut host);
        let msgs = proto.prep_inbound(&mut host, PHONE, PORT, &sent[2]);
        assert_eq!(1, msgs.len());
        assert_eq!(payload, msgs[0].payload);
    }

    #[test]
    fn wrong_port_is_dropped() {
        let mut host = BlobHost::default();
        let proto = SmsProto::new(&mut host);
        let (sent, _) =
            proto.prep_outbound(&mut host, Some((SmsCmd::Data, 7, &b"x"[..])), PHONE, PORT, true);
        assert!(proto.prep_inbound(&mut host, PHONE, PORT + 1, &sent[0]).is_empty());
    }
}
