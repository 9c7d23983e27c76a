use octs::Bytes;

use crate::{
    addr::TransportKind,
    frame,
    host::{Host, TimerKind},
    queue::QueueElem,
    session::Direction,
    ty::{ChannelId, FrameFlags, FrameHeader, MsgSeq},
};

use super::Session;

/// Refused to accept a payload for sending.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Zero-length payloads are reserved for the internal ack-only path.
    #[error("empty payload")]
    EmptyPayload,
}

impl Session {
    /// Queues `payload` for reliable delivery on `channel` and attempts
    /// immediate delivery on every enabled transport.
    ///
    /// Pass [`ChannelId::NONE`] before a channel has been established (a
    /// client's initial message); the message then goes out with the
    /// session's seed and sequence 0.
    ///
    /// Returns the byte count accepted by the best-succeeding transport, or
    /// a negative value if no transport accepted the frame; the message
    /// stays queued either way and will be retried by the resend path.
    ///
    /// # Errors
    ///
    /// Errors if `payload` is empty.
    pub fn send(
        &mut self,
        host: &mut dyn Host,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<i32, SendError> {
        if payload.is_empty() {
            return Err(SendError::EmptyPayload);
        }

        let assigned = {
            let mut phones = |a: &str, b: &str| host.phones_same(a, b);
            self.table
                .get_mut(None, channel, false, &mut phones)
                .map(|rec| {
                    let seq = rec.assign_seq();
                    let ack = rec.last_saved;
                    rec.last_acked = ack;
                    (channel, seq, ack)
                })
        };
        let (channel, seq, ack) = match assigned {
            Some(assigned) => assigned,
            None => {
                // no record yet: this is the initial message, carried on the
                // seed alone until the server assigns a number
                let seed = self.channel_seed(host);
                (
                    ChannelId(seed).with_number(0),
                    MsgSeq::INITIAL,
                    MsgSeq::INITIAL,
                )
            }
        };

        let header = FrameHeader {
            conn_id: self.conn_id,
            channel,
            seq,
            ack,
        };
        tracing::debug!(%channel, %seq, %ack, len = payload.len(), "queueing message");
        let framed = frame::build(FrameFlags::for_role(self.role.is_server()), header, payload);

        let before = self.queue.len();
        let index = self.queue.push(QueueElem {
            channel,
            seq,
            frame: framed,
            send_count: 0,
        });
        if self.queue.len() != before {
            self.notify_queue_changed(host);
        }

        Ok(self.send_queued(host, index, None))
    }

    /// One resend pass over the whole queue, in order.
    ///
    /// Honors the exponential backoff unless `force` is set: a pass more
    /// frequent than the current backoff is skipped. On a pass where every
    /// element was accepted by some transport, the backoff doubles
    /// (`2 * (backoff + 1)`); any valid receipt resets it to zero.
    ///
    /// `filter` restricts delivery to one transport kind.
    ///
    /// Returns how many elements were handed out.
    pub fn resend_all(
        &mut self,
        host: &mut dyn Host,
        filter: Option<TransportKind>,
        force: bool,
    ) -> usize {
        let now = host.now_secs();
        if !force && now < self.next_resend {
            tracing::debug!(
                seconds_left = self.next_resend - now,
                "resend skipped: inside backoff",
            );
            return 0;
        }
        if self.queue.is_empty() {
            return 0;
        }

        let elems: Vec<(ChannelId, MsgSeq, Bytes)> = self
            .queue
            .iter()
            .map(|elem| (elem.channel, elem.seq, elem.frame.clone()))
            .collect();

        let mut count = 0;
        let mut all_delivered = true;
        for (index, (channel, seq, framed)) in elems.into_iter().enumerate() {
            let sent = self.send_frame_on_channel(host, channel, seq, &framed, filter);
            if sent < 0 {
                all_delivered = false;
                break;
            }
            if let Some(elem) = self.queue.get_mut(index) {
                elem.send_count = elem.send_count.saturating_add(1);
            }
            count += 1;
        }

        if all_delivered && !force {
            self.resend_backoff = 2 * (1 + self.resend_backoff);
            self.next_resend = now + u32::from(self.resend_backoff);
            tracing::debug!(backoff = self.resend_backoff, "resend pass done");
            host.set_timer(TimerKind::Resend, self.resend_backoff);
        }
        count
    }

    /// Sends a zero-payload frame to every peer whose latest cumulative ACK
    /// has not yet been put on the wire (`acked < received`). Runs after
    /// every durable save; a no-op until the connection id is assigned.
    pub fn ack_any(&mut self, host: &mut dyn Host) {
        if !self.conn_id.is_set() {
            tracing::debug!("ack pass skipped: no connection id yet");
            return;
        }
        let needy: Vec<(ChannelId, MsgSeq)> = self
            .table
            .iter()
            .filter(|rec| rec.last_acked < rec.last_recv)
            .map(|rec| (rec.channel, rec.last_saved))
            .collect();
        for (channel, ack) in needy {
            tracing::debug!(%channel, %ack, "sending ack-only frame");
            self.send_empty(host, channel, ack);
            let mut phones = |_: &str, _: &str| false;
            if let Some(rec) = self.table.get_mut(None, channel, false, &mut phones) {
                rec.last_acked = ack;
            }
        }
    }

    /// Sends one already-queued element on every eligible transport and bumps
    /// its send count on success.
    pub(crate) fn send_queued(
        &mut self,
        host: &mut dyn Host,
        index: usize,
        filter: Option<TransportKind>,
    ) -> i32 {
        let Some((channel, seq, framed)) = self
            .queue
            .get_mut(index)
            .map(|elem| (elem.channel, elem.seq, elem.frame.clone()))
        else {
            return -1;
        };
        let sent = self.send_frame_on_channel(host, channel, seq, &framed, filter);
        if sent >= 0 {
            if let Some(elem) = self.queue.get_mut(index) {
                elem.send_count = elem.send_count.saturating_add(1);
            }
        }
        sent
    }

    /// Hands one framed message to every enabled, non-disabled transport for
    /// its channel's address, returning the best byte count (negative when
    /// every kind failed).
    fn send_frame_on_channel(
        &mut self,
        host: &mut dyn Host,
        channel: ChannelId,
        seq: MsgSeq,
        framed: &Bytes,
        filter: Option<TransportKind>,
    ) -> i32 {
        let addr = {
            let mut phones = |a: &str, b: &str| host.phones_same(a, b);
            self.table
                .get(None, channel, false, &mut phones)
                .map(|rec| rec.addr.clone())
        };
        let addr = match addr {
            Some(addr) if !addr.is_empty() => addr,
            // no per-channel address yet; fall back to the session's own
            _ => self.addr.clone(),
        };

        let msg_no = format!("{}:{}", self.relay.my_host_id, seq);
        let mut best = -1;
        for kind in addr.kinds().collect::<Vec<_>>() {
            if self.kind_disabled(kind, Direction::Send) {
                tracing::debug!(?kind, "skipping disabled transport");
                continue;
            }
            if filter.is_some_and(|f| f != kind) {
                continue;
            }
            let sent = match kind {
                TransportKind::Relay => self.send_game_msg_via_relay(host, channel, framed, &msg_no),
                TransportKind::Sms
                | TransportKind::Radio
                | TransportKind::Mqtt
                | TransportKind::Ip => host.send(framed, &msg_no, &addr, kind, self.conn_id.0),
            };
            tracing::trace!(?kind, sent, "transport attempt");
            if sent > best {
                best = sent;
            }
        }
        best
    }

    /// Builds and sends a zero-payload frame carrying only the cumulative
    /// ACK. Never queued: if it is lost, the next one supersedes it.
    pub(crate) fn send_empty(&mut self, host: &mut dyn Host, channel: ChannelId, ack: MsgSeq) {
        let header = FrameHeader {
            conn_id: self.conn_id,
            channel,
            seq: MsgSeq::INITIAL,
            ack,
        };
        let framed = frame::build(FrameFlags::for_role(self.role.is_server()), header, &[]);
        let _ = self.send_frame_on_channel(host, channel, MsgSeq::INITIAL, &framed, None);
    }
}
