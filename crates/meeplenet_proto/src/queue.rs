//! The outbound message queue: every framed game message that has not yet
//! been covered by a cumulative ACK from its peer.
//!
//! Elements stay resident across resends and process restarts; they only
//! leave the queue when the peer's cumulative ACK covers them, or when the
//! session is reset.

use octs::Bytes;

use crate::ty::{ChannelId, MsgSeq};

/// Refuse new chat traffic once this many messages are pending.
pub const CHAT_CEILING: usize = 64;

/// One unacknowledged outbound message, fully framed.
#[derive(Debug, Clone)]
pub struct QueueElem {
    /// Channel the message was sent on.
    pub channel: ChannelId,
    /// Sequence of the message on its channel.
    pub seq: MsgSeq,
    /// The framed bytes, exactly as handed to the transports.
    pub frame: Bytes,
    /// How many times this element has been handed to a transport since it
    /// was created or loaded. Diagnostics only.
    pub send_count: u16,
}

impl PartialEq for QueueElem {
    fn eq(&self, other: &Self) -> bool {
        // send_count is bookkeeping, not identity
        self.seq == other.seq && self.channel == other.channel && self.frame == other.frame
    }
}

impl Eq for QueueElem {}

/// Outbound queue, ordered by channel and, within a channel, by ascending
/// sequence.
#[derive(Debug, Clone, Default)]
pub struct MsgQueue {
    elems: Vec<QueueElem>,
}

impl MsgQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Appends `elem`, returning the index of the element that now represents
    /// it.
    ///
    /// If the current tail is byte-identical to `elem` the incoming one is
    /// dropped and the tail's index is returned, making enqueue idempotent
    /// under replay (a message re-built after a restore collapses onto the
    /// stored copy).
    pub fn push(&mut self, elem: QueueElem) -> usize {
        if let Some(tail) = self.elems.last() {
            if *tail == elem {
                tracing::debug!(
                    channel = %elem.channel,
                    seq = %elem.seq,
                    "collapsing duplicate enqueue onto tail",
                );
                return self.elems.len() - 1;
            }
        }
        self.elems.push(elem);
        // a healthy game never accumulates anywhere near this much; release
        // builds tolerate a degenerate queue and keep going
        debug_assert!(self.elems.len() <= 128, "queue length runaway");
        self.elems.len() - 1
    }

    /// Removes every element covered by a cumulative ACK of `upto` on
    /// `channel`.
    ///
    /// Matching ignores the channel-number bits: an element belongs to
    /// `channel` if its seed bits agree. A client's initial element (sent
    /// before it had a seed at all, so with zero seed bits) is also covered
    /// once the incoming channel is numbered, since any reply from the server is
    /// an implicit ACK of the initial message.
    ///
    /// Returns how many elements were removed.
    pub fn drain_acked(&mut self, channel: ChannelId, upto: MsgSeq) -> usize {
        let before = self.elems.len();
        self.elems.retain(|elem| {
            let covered = elem.channel.seed_bits() == channel.seed_bits()
                || (elem.channel.seed_bits() == 0 && channel != ChannelId::NONE);
            !(covered && elem.seq <= upto)
        });
        let removed = before - self.elems.len();
        if removed > 0 {
            tracing::debug!(%channel, %upto, removed, "drained acked messages");
        }
        removed
    }

    /// Iterates head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &QueueElem> {
        self.elems.iter()
    }

    /// Iterates head to tail, mutably; the resend path uses this to bump
    /// send counts.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueueElem> {
        self.elems.iter_mut()
    }

    /// Gets the element at `index`, mutably.
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut QueueElem> {
        self.elems.get_mut(index)
    }

    /// Drops every element. Used by session reset and role flips.
    pub fn clear(&mut self) {
        self.elems.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(channel: u16, seq: u32, frame: &[u8]) -> QueueElem {
        QueueElem {
            channel: ChannelId(channel),
            seq: MsgSeq(seq),
            frame: Bytes::from(frame.to_vec()),
            send_count: 0,
        }
    }

    #[test]
    fn push_is_idempotent_on_tail() {
        let mut q = MsgQueue::new();
        let index = q.push(elem(0xA1B1, 1, b"one"));
        assert_eq!(index, q.push(elem(0xA1B1, 1, b"one")));
        assert_eq!(1, q.len());

        // differing bytes do not collapse
        q.push(elem(0xA1B1, 2, b"two"));
        assert_eq!(2, q.len());
    }

    #[test]
    fn drain_is_cumulative_and_exact() {
        let mut q = MsgQueue::new();
        for seq in 1..=4 {
            q.push(elem(0xA1B1, seq, b"m"));
        }
        // a different seed's channel is untouched
        q.push(elem(0xC0D1, 1, b"other"));

        assert_eq!(2, q.drain_acked(ChannelId(0xA1B1), MsgSeq(2)));
        let left: Vec<_> = q.iter().map(|e| (e.channel.0, e.seq.0)).collect();
        assert_eq!(vec![(0xA1B1, 3), (0xA1B1, 4), (0xC0D1, 1)], left);
    }

    #[test]
    fn numbered_reply_covers_seedless_initial() {
        let mut q = MsgQueue::new();
        q.push(elem(0x0000, 0, b"initial"));
        assert_eq!(1, q.drain_acked(ChannelId(0xA1B1), MsgSeq(0)));
        assert!(q.is_empty());
    }

    #[test]
    fn numbered_reply_covers_same_seed_initial() {
        let mut q = MsgQueue::new();
        // client initial: seed bits only, number still 0, sequence 0
        q.push(elem(0xA1B0, 0, b"initial"));
        assert_eq!(1, q.drain_acked(ChannelId(0xA1B1), MsgSeq(0)));
        assert!(q.is_empty());
    }
}
