//! The channel table: one address record per remote peer, holding the peer's
//! address and the four sequence cursors that drive reliable delivery.

use crate::{
    addr::PeerAddr,
    ty::{ChannelId, MsgSeq, RelayHostId},
};

/// Per-peer state, one record per channel.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    /// Where the peer can be reached.
    pub addr: PeerAddr,
    /// Next outbound sequence to assign on this channel. Starts at `1`.
    pub next_seq: MsgSeq,
    /// Highest sequence received from the peer.
    pub last_recv: MsgSeq,
    /// Highest received sequence that has durably hit storage. Never exceeds
    /// `last_recv`; this is the value that goes out as the cumulative ACK,
    /// since the peer deletes its copies based on it.
    pub last_saved: MsgSeq,
    /// Highest cumulative ACK we have put on the wire for this peer.
    pub last_acked: MsgSeq,
    /// Channel this record serves.
    pub channel: ChannelId,
    /// The peer's relay host id, when the relay transport is in use.
    pub relay_host: RelayHostId,
}

impl AddressRecord {
    fn new(channel: ChannelId, relay_host: RelayHostId, addr: PeerAddr) -> Self {
        Self {
            addr,
            next_seq: MsgSeq::ONE,
            last_recv: MsgSeq::INITIAL,
            last_saved: MsgSeq::INITIAL,
            last_acked: MsgSeq::INITIAL,
            channel,
            relay_host,
        }
    }

    /// Assigns and returns the next outbound sequence.
    pub fn assign_seq(&mut self) -> MsgSeq {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.next();
        seq
    }
}

/// The set of [`AddressRecord`]s a session knows about.
///
/// Records are appended when a peer is first seen and live until the session
/// is destroyed or the host explicitly rejects the peer's initial message.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    recs: Vec<AddressRecord>,
}

impl ChannelTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recs.len()
    }

    /// Whether the table has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    /// Iterates over all records.
    pub fn iter(&self) -> impl Iterator<Item = &AddressRecord> {
        self.recs.iter()
    }

    /// Iterates over all records, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AddressRecord> {
        self.recs.iter_mut()
    }

    /// Looks up the record for `channel`.
    ///
    /// The primary match is on the channel id: the full id, or only its seed
    /// bits when `mask_number` is set (the form used for initial messages,
    /// whose number bits are still zero). If that fails and `addr` is given,
    /// a secondary match compares transport-specific endpoint identity:
    /// host and port for direct IP or the relay, MAC for radio, device id for
    /// the broker, and the host's phone-normalising predicate for short
    /// messages.
    pub fn get(
        &self,
        addr: Option<&PeerAddr>,
        channel: ChannelId,
        mask_number: bool,
        phones_same: &mut dyn FnMut(&str, &str) -> bool,
    ) -> Option<&AddressRecord> {
        self.position(addr, channel, mask_number, phones_same)
            .map(|index| &self.recs[index])
    }

    /// Like [`ChannelTable::get`], but mutable.
    pub fn get_mut(
        &mut self,
        addr: Option<&PeerAddr>,
        channel: ChannelId,
        mask_number: bool,
        phones_same: &mut dyn FnMut(&str, &str) -> bool,
    ) -> Option<&mut AddressRecord> {
        self.position(addr, channel, mask_number, phones_same)
            .map(move |index| &mut self.recs[index])
    }

    fn position(
        &self,
        addr: Option<&PeerAddr>,
        channel: ChannelId,
        mask_number: bool,
        phones_same: &mut dyn FnMut(&str, &str) -> bool,
    ) -> Option<usize> {
        self.recs.iter().position(|rec| {
            let channels_match = if mask_number {
                rec.channel.seed_bits() == channel.seed_bits()
            } else {
                rec.channel == channel
            };
            if channels_match {
                return true;
            }
            let Some(addr) = addr else { return false };
            addr.first_kind()
                .is_some_and(|kind| rec.addr.endpoint_eq(addr, kind, phones_same))
        })
    }

    /// Appends a record for a newly-seen peer, or returns the existing one if
    /// `channel` is already known.
    pub fn remember(
        &mut self,
        channel: ChannelId,
        relay_host: RelayHostId,
        addr: PeerAddr,
    ) -> &mut AddressRecord {
        let index = match self.recs.iter().position(|rec| rec.channel == channel) {
            Some(index) => index,
            None => {
                tracing::debug!(%channel, ?relay_host, "creating address record");
                self.recs.push(AddressRecord::new(channel, relay_host, addr));
                self.recs.len() - 1
            }
        };
        &mut self.recs[index]
    }

    /// Splices out the record for `channel`. Called after the host signals
    /// final rejection of the initial message that created it.
    pub fn remove(&mut self, channel: ChannelId) -> Option<AddressRecord> {
        let index = self.recs.iter().position(|rec| rec.channel == channel)?;
        tracing::debug!(%channel, "removing address record");
        Some(self.recs.remove(index))
    }

    /// Merges endpoints the peer on `channel` just proved reachable on into
    /// its record, and the kinds (without specifics) into `top_addr`, the
    /// session's top-level address. Updates the record's relay host id when
    /// the frame named one.
    pub fn augment(
        &mut self,
        channel: ChannelId,
        newer: &PeerAddr,
        relay_host: RelayHostId,
        top_addr: &mut PeerAddr,
        phones_same: &mut dyn FnMut(&str, &str) -> bool,
    ) {
        let Some(rec) = self.get_mut(None, channel, false, phones_same) else {
            return;
        };
        rec.addr.augment(newer);
        if rec.addr.relay().is_some() && relay_host != RelayHostId::NONE {
            rec.relay_host = relay_host;
        }
        for kind in newer.kinds() {
            top_addr.add_kind_default(kind);
        }
    }

    /// Drops every record. Used by session reset and role flips.
    pub fn clear(&mut self) {
        self.recs.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::addr::{SmsEndpoint, TransportKind};

    use super::*;

    fn eq(a: &str, b: &str) -> bool {
        a == b
    }

    fn sms_addr(phone: &str) -> PeerAddr {
        let mut addr = PeerAddr::new();
        addr.set_sms(SmsEndpoint {
            phone: phone.into(),
            port: 3344,
        });
        addr
    }

    #[test]
    fn masked_lookup_matches_seed() {
        let mut table = ChannelTable::new();
        table.remember(ChannelId(0xA1B1), RelayHostId::NONE, PeerAddr::new());

        assert!(table.get(None, ChannelId(0xA1B0), true, &mut eq).is_some());
        assert!(table.get(None, ChannelId(0xA1B0), false, &mut eq).is_none());
        assert!(table.get(None, ChannelId(0xC0D0), true, &mut eq).is_none());
    }

    #[test]
    fn secondary_match_by_phone_predicate() {
        let mut table = ChannelTable::new();
        table.remember(
            ChannelId(0xA1B1),
            RelayHostId::NONE,
            sms_addr("+1 555 555 0123"),
        );

        // same number, different formatting; host predicate normalises
        let probe = sms_addr("5555550123");
        let mut normalised = |a: &str, b: &str| {
            let digits = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
            digits(a).ends_with(&digits(b)) || digits(b).ends_with(&digits(a))
        };
        assert!(table
            .get(Some(&probe), ChannelId(0xFFF1), false, &mut normalised)
            .is_some());
        assert!(table
            .get(Some(&probe), ChannelId(0xFFF1), false, &mut eq)
            .is_none());
    }

    #[test]
    fn augment_reaches_top_level_address() {
        let mut table = ChannelTable::new();
        table.remember(ChannelId(0xA1B1), RelayHostId::NONE, PeerAddr::new());

        let mut top = PeerAddr::new();
        table.augment(
            ChannelId(0xA1B1),
            &sms_addr("+15555550123"),
            RelayHostId::NONE,
            &mut top,
            &mut eq,
        );

        let rec = table.get(None, ChannelId(0xA1B1), false, &mut eq).unwrap();
        assert_eq!("+15555550123", rec.addr.sms().unwrap().phone);
        // the top-level address learns the kind, not the peer's specifics
        assert!(top.has(TransportKind::Sms));
        assert_eq!("", top.sms().unwrap().phone);
    }

    #[test]
    fn remove_splices_out() {
        let mut table = ChannelTable::new();
        table.remember(ChannelId(0xA1B1), RelayHostId::NONE, PeerAddr::new());
        table.remember(ChannelId(0xA1B2), RelayHostId::NONE, PeerAddr::new());

        assert!(table.remove(ChannelId(0xA1B1)).is_some());
        assert_eq!(1, table.len());
        assert!(table.get(None, ChannelId(0xA1B1), false, &mut eq).is_none());
    }
}
