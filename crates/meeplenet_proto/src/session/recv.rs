use octs::Bytes;

use crate::{
    addr::{PeerAddr, TransportKind},
    frame::{self, FrameError},
    host::Host,
    relay::RelayGame,
    session::Direction,
    ty::{ChannelId, ConnId, FrameFlags, FrameHeader, MsgSeq, RelayHostId},
};

use super::Session;

/// Why an inbound message was dropped.
///
/// Every variant is a silent drop: nothing is surfaced to the player, and
/// the payload is discarded. Side effects that are correct regardless of
/// the drop may still have happened: a duplicate's cumulative ACK still
/// drains the queue, and a duplicate initial still donates its transport
/// endpoints. The peer's retransmission schedule repairs genuine losses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// Shorter than the fixed header.
    #[error("message too short")]
    TooShort,
    /// The sender claims the same role we hold.
    #[error("both sides claim server={is_server}")]
    RoleMismatch {
        /// The role both sides claim.
        is_server: bool,
    },
    /// The frame's channel seed disagrees with ours.
    #[error("channel {got} does not carry our seed {ours}")]
    ChannelMismatch {
        /// Channel in the frame.
        got: ChannelId,
        /// Our channel seed.
        ours: ChannelId,
    },
    /// The frame belongs to a different session.
    #[error("connection id {got} but ours is {ours}")]
    WrongConnId {
        /// Connection id in the frame.
        got: ConnId,
        /// Our connection id.
        ours: ConnId,
    },
    /// A second initial message for a channel we already know. Its transport
    /// endpoints were absorbed before rejection.
    #[error("duplicate initial message on {channel}")]
    DuplicateInitial {
        /// The already-known channel.
        channel: ChannelId,
    },
    /// The channel allocator is out of numbers; the game has too many
    /// participants.
    #[error("out of channel numbers")]
    AllocatorExhausted,
    /// In-session frame for a channel we have no record of.
    #[error("no record for channel {channel}")]
    NoRecord {
        /// The unknown channel.
        channel: ChannelId,
    },
    /// Sequence beyond the next expected one; the gap must be retransmitted
    /// first.
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap {
        /// Next sequence we can accept.
        expected: MsgSeq,
        /// Sequence in the frame.
        got: MsgSeq,
    },
    /// Sequence at or below the highest already received.
    #[error("already seen sequence {got}")]
    SequenceDup {
        /// Sequence in the frame.
        got: MsgSeq,
    },
    /// Inbound traffic on this transport kind is disabled.
    #[error("transport disabled for receive")]
    TransportDisabled,
    /// The relay header on this message was malformed.
    #[error("bad relay frame")]
    Relay(#[from] crate::relay::RelayWireError),
}

/// A validated inbound game message, handed to the host for processing.
///
/// The host must report the outcome through [`Session::msg_processed`]
/// before issuing another receive.
#[derive(Debug)]
pub struct Incoming {
    /// Channel the message arrived on; for an initial message to the server,
    /// this is the freshly-assigned channel.
    pub channel: ChannelId,
    /// Sequence of the message.
    pub seq: MsgSeq,
    /// The opaque game payload.
    pub payload: Bytes,
    pub(crate) created_rec: bool,
}

impl Session {
    /// Feeds one datagram received on a transport into the session.
    ///
    /// `ret_addr` is the sender's address as the transport driver saw it:
    /// exactly one kind, the one the bytes arrived on.
    ///
    /// Returns:
    /// * `Ok(Some(incoming))`: a new in-order game payload; hand it to the
    ///   rules engine, then call [`Session::msg_processed`].
    /// * `Ok(None)`: the bytes were consumed by the protocol itself (relay
    ///   conversation, ack-only frame, duplicate suppression side effects).
    /// * `Err(_)`: the message was dropped and the payload discarded.
    pub fn check_incoming(
        &mut self,
        host: &mut dyn Host,
        bytes: Bytes,
        ret_addr: &PeerAddr,
    ) -> Result<Option<Incoming>, RecvError> {
        debug_assert!(
            !self.processing,
            "receive issued while a prior message is still being processed",
        );

        let kind = ret_addr.first_kind();
        if let Some(kind) = kind {
            if self.kind_disabled(kind, Direction::Receive) {
                return Err(RecvError::TransportDisabled);
            }
        }

        let mut bytes = bytes;
        let mut sender = RelayHostId::NONE;
        if kind == Some(TransportKind::Relay) {
            match self.relay_preprocess(host, &mut bytes)? {
                RelayGame::Consumed => return Ok(None),
                RelayGame::Game { src } => sender = src,
            }
        }

        let (flags, header) = frame::read_envelope(&mut bytes).map_err(|err| match err {
            FrameError::TooShort => RecvError::TooShort,
        })?;

        // role bit: only meaningful when the sender emitted flags at all
        if !flags.is_empty() && self.role.is_server() == flags.contains(FrameFlags::FROM_SERVER) {
            return Err(RecvError::RoleMismatch {
                is_server: self.role.is_server(),
            });
        }

        // a client's channels all carry its own seed; the server cannot make
        // this check, its records carry every client's seed
        if !self.role.is_server() && self.channel_seed != 0 && header.channel != ChannelId::NONE {
            let ours = ChannelId(self.channel_seed);
            if header.channel.seed_bits() != ours.seed_bits() {
                return Err(RecvError::ChannelMismatch {
                    got: header.channel,
                    ours,
                });
            }
        }

        if header.conn_id.is_set() && self.conn_id.is_set() && header.conn_id != self.conn_id {
            return Err(RecvError::WrongConnId {
                got: header.conn_id,
                ours: self.conn_id,
            });
        }

        if header.conn_id.is_set() {
            self.recv_in_session(host, header, bytes, ret_addr, sender)
        } else {
            self.recv_initial(host, header, bytes, ret_addr, sender)
        }
    }

    /// The host reports the outcome of processing a message returned by
    /// [`Session::check_incoming`].
    ///
    /// On success the record's received cursor advances to the message's
    /// sequence (the saved cursor waits for the durable-save handshake). On
    /// rejection, a record created for this message is discarded, forgetting
    /// the peer entirely.
    pub fn msg_processed(&mut self, incoming: Incoming, rejected: bool) {
        debug_assert!(self.processing, "msg_processed without a pending message");
        self.processing = false;

        if rejected {
            tracing::debug!(channel = %incoming.channel, "host rejected message");
            if incoming.created_rec {
                self.table.remove(incoming.channel);
            }
            return;
        }

        let mut phones = |_: &str, _: &str| false;
        let Some(rec) = self.table.get_mut(None, incoming.channel, true, &mut phones) else {
            debug_assert!(false, "processed message has no record");
            return;
        };
        if rec.last_recv < incoming.seq {
            rec.last_recv = incoming.seq;
        }
    }

    /// Initial path: the frame carries no connection id, so this is a first
    /// contact (or a stale duplicate of one).
    fn recv_initial(
        &mut self,
        host: &mut dyn Host,
        header: FrameHeader,
        payload: Bytes,
        ret_addr: &PeerAddr,
        sender: RelayHostId,
    ) -> Result<Option<Incoming>, RecvError> {
        let known = {
            let mut phones = |a: &str, b: &str| host.phones_same(a, b);
            self.table
                .get(Some(ret_addr), header.channel, true, &mut phones)
                .map(|rec| rec.channel)
        };

        if let Some(channel) = known {
            // duplicate initial: absorb any new endpoints, then reject
            let mut phones = |a: &str, b: &str| host.phones_same(a, b);
            self.table
                .augment(channel, ret_addr, sender, &mut self.addr, &mut phones);
            return Err(RecvError::DuplicateInitial { channel });
        }

        let channel = if self.role.is_server() {
            self.allocate_channel(header.channel)?
        } else {
            header.channel
        };
        self.table.remember(channel, sender, ret_addr.clone());

        // a receipt, payload or not; the backoff restarts from zero
        self.reset_backoff();

        if payload.is_empty() {
            // nothing for the host in this one; the record it created stays
            return Ok(None);
        }

        self.last_save_token = None;
        self.processing = true;
        Ok(Some(Incoming {
            channel,
            seq: header.seq,
            payload,
            created_rec: true,
        }))
    }

    /// In-session path: the frame carries a connection id.
    fn recv_in_session(
        &mut self,
        host: &mut dyn Host,
        header: FrameHeader,
        payload: Bytes,
        ret_addr: &PeerAddr,
        sender: RelayHostId,
    ) -> Result<Option<Incoming>, RecvError> {
        let mut created_rec = false;
        let channel = if self.conn_id.is_set() {
            let found = {
                let mut phones = |a: &str, b: &str| host.phones_same(a, b);
                self.table
                    .get(None, header.channel, false, &mut phones)
                    .map(|rec| rec.channel)
            };
            found.ok_or(RecvError::NoRecord {
                channel: header.channel,
            })?
        } else {
            // the server has assigned the connection id and shared it in this
            // frame; adopt it, creating our record for the server if this is
            // the first reply we see
            let found = {
                let mut phones = |a: &str, b: &str| host.phones_same(a, b);
                self.table
                    .get(Some(ret_addr), header.channel, true, &mut phones)
                    .map(|rec| rec.channel)
            };
            let channel = found.unwrap_or_else(|| {
                created_rec = true;
                self.table
                    .remember(header.channel, sender, ret_addr.clone())
                    .channel
            });
            tracing::debug!(conn_id = %header.conn_id, "adopting connection id from peer");
            self.conn_id = header.conn_id;
            if header.channel.number() > self.next_channel_no {
                // never hand out a number we have seen in use
                self.next_channel_no = header.channel.number();
            }
            channel
        };

        // the cumulative ACK releases everything it covers, even if the
        // message itself turns out to be a duplicate
        let removed = self.queue.drain_acked(channel, header.ack);
        if removed > 0 {
            self.notify_queue_changed(host);
        }

        {
            let mut phones = |a: &str, b: &str| host.phones_same(a, b);
            self.table
                .augment(channel, ret_addr, sender, &mut self.addr, &mut phones);
        }

        let last_recv = {
            let mut phones = |_: &str, _: &str| false;
            self.table
                .get(None, channel, false, &mut phones)
                .map(|rec| rec.last_recv)
        };
        let Some(last_recv) = last_recv else {
            return Err(RecvError::NoRecord { channel });
        };

        // any frame that resolves to a known record is a receipt, including
        // ack-only frames and retransmits; the backoff restarts from zero
        self.reset_backoff();

        if payload.is_empty() {
            // ack-only frame: the drain above was its whole purpose
            return Ok(None);
        }

        let expected = last_recv.next();
        if header.seq > expected {
            return Err(RecvError::SequenceGap {
                expected,
                got: header.seq,
            });
        }
        if header.seq < expected {
            return Err(RecvError::SequenceDup { got: header.seq });
        }

        self.last_save_token = None;
        self.processing = true;
        Ok(Some(Incoming {
            channel,
            seq: header.seq,
            payload,
            created_rec,
        }))
    }

    /// Assigns a channel number on the server, or fast-forwards the
    /// allocator past a number already in use.
    fn allocate_channel(&mut self, channel: ChannelId) -> Result<ChannelId, RecvError> {
        if channel.number() == 0 {
            if self.next_channel_no >= ChannelId::MASK {
                return Err(RecvError::AllocatorExhausted);
            }
            self.next_channel_no += 1;
            let assigned = channel.with_number(self.next_channel_no);
            tracing::debug!(%assigned, "assigned channel number");
            Ok(assigned)
        } else {
            if channel.number() > self.next_channel_no {
                self.next_channel_no = channel.number();
            }
            Ok(channel)
        }
    }
}
