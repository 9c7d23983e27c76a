//! The polymorphic peer address: one value that can simultaneously hold an
//! endpoint for every transport the session knows how to reach a peer on.
//!
//! A peer that is reachable over both the relay and short messages carries
//! both endpoint records; the send path tries every enabled kind. When a
//! frame arrives bearing endpoints the channel did not previously know, the
//! channel table merges them in via [`PeerAddr::augment`].

use bitflags::bitflags;
use octs::{Bytes, BytesMut, Read, Write};

use crate::util::{read_str8, write_str8, StrError};

/// One way of reaching a peer.
///
/// The variant order here is the canonical enumeration order: it defines both
/// the wire order of endpoint records and which kind counts as the "type" of
/// a multi-kind address (the first enabled one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub enum TransportKind {
    /// The central forwarding relay.
    Relay,
    /// Short messages (small MTU, store-and-forward).
    Sms,
    /// Low-power radio, peer addressed by MAC.
    Radio,
    /// Pub/sub broker, peer addressed by device id.
    Mqtt,
    /// Direct IP.
    Ip,
}

impl TransportKind {
    /// Every kind, in enumeration order.
    pub const ALL: [Self; 5] = [Self::Relay, Self::Sms, Self::Radio, Self::Mqtt, Self::Ip];

    const fn bit(self) -> KindSet {
        match self {
            Self::Relay => KindSet::RELAY,
            Self::Sms => KindSet::SMS,
            Self::Radio => KindSet::RADIO,
            Self::Mqtt => KindSet::MQTT,
            Self::Ip => KindSet::IP,
        }
    }
}

bitflags! {
    /// Set of [`TransportKind`]s enabled in a [`PeerAddr`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct KindSet: u8 {
        /// [`TransportKind::Relay`].
        const RELAY = 1 << 0;
        /// [`TransportKind::Sms`].
        const SMS = 1 << 1;
        /// [`TransportKind::Radio`].
        const RADIO = 1 << 2;
        /// [`TransportKind::Mqtt`].
        const MQTT = 1 << 3;
        /// [`TransportKind::Ip`].
        const IP = 1 << 4;
    }
}

/// Endpoint for [`TransportKind::Relay`]: the room this game lives in on the
/// relay, plus how to reach the relay host itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelayEndpoint {
    /// Room (invite) name on the relay.
    pub room: String,
    /// Relay host name.
    pub host_name: String,
    /// Resolved relay IP, if known.
    pub ip: u32,
    /// Relay port.
    pub port: u16,
    /// Whether this device is looking for a public room.
    pub seeks_public: bool,
    /// Whether this device advertises its room publicly.
    pub advertise: bool,
}

/// Endpoint for [`TransportKind::Sms`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SmsEndpoint {
    /// Peer phone number, in whatever form the host's messaging layer uses.
    pub phone: String,
    /// Application port, distinguishing game traffic from other users of the
    /// same number.
    pub port: u16,
}

/// Endpoint for [`TransportKind::Radio`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RadioEndpoint {
    /// Peer MAC address, formatted by the radio driver.
    pub mac: String,
}

/// Endpoint for [`TransportKind::Mqtt`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MqttEndpoint {
    /// Peer device identifier on the broker.
    pub dev_id: u64,
}

/// Endpoint for [`TransportKind::Ip`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpEndpoint {
    /// Peer host name, if known.
    pub host_name: String,
    /// Peer IP.
    pub ip: u32,
    /// Peer port.
    pub port: u16,
}

/// A peer address: a set of enabled transport kinds plus, for each, the
/// transport-specific endpoint record.
///
/// Invariant: an endpoint record is present exactly when its kind is in
/// [`PeerAddr::kinds`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerAddr {
    kinds: KindSet,
    relay: Option<RelayEndpoint>,
    sms: Option<SmsEndpoint>,
    radio: Option<RadioEndpoint>,
    mqtt: Option<MqttEndpoint>,
    ip: Option<IpEndpoint>,
}

/// Failed to decode a [`PeerAddr`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    /// Input ended mid-address.
    #[error("buffer too short")]
    TooShort,
    /// The kind bitmap carried bits this build does not know about: version
    /// skew; the whole load must fail loudly rather than guess at the
    /// record layout that follows.
    #[error("unknown transport kinds {bits:#04x}")]
    UnknownKinds {
        /// The offending bits.
        bits: u8,
    },
    /// A string field was malformed.
    #[error("bad string field")]
    BadString(#[from] StrError),
}

impl PeerAddr {
    /// Creates an address with no kinds enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the enabled kinds as a bit set.
    #[must_use]
    pub const fn kind_set(&self) -> KindSet {
        self.kinds
    }

    /// Iterates over the enabled kinds in enumeration order.
    pub fn kinds(&self) -> impl Iterator<Item = TransportKind> + '_ {
        TransportKind::ALL
            .into_iter()
            .filter(|kind| self.has(*kind))
    }

    /// The "type" of this address: its first enabled kind.
    #[must_use]
    pub fn first_kind(&self) -> Option<TransportKind> {
        self.kinds().next()
    }

    /// Whether `kind` is enabled.
    #[must_use]
    pub const fn has(&self, kind: TransportKind) -> bool {
        self.kinds.contains(kind.bit())
    }

    /// Whether no kind is enabled.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Gets the relay endpoint, if the relay kind is enabled.
    #[must_use]
    pub const fn relay(&self) -> Option<&RelayEndpoint> {
        self.relay.as_ref()
    }

    /// Gets the short-message endpoint, if enabled.
    #[must_use]
    pub const fn sms(&self) -> Option<&SmsEndpoint> {
        self.sms.as_ref()
    }

    /// Gets the radio endpoint, if enabled.
    #[must_use]
    pub const fn radio(&self) -> Option<&RadioEndpoint> {
        self.radio.as_ref()
    }

    /// Gets the broker endpoint, if enabled.
    #[must_use]
    pub const fn mqtt(&self) -> Option<&MqttEndpoint> {
        self.mqtt.as_ref()
    }

    /// Gets the direct-IP endpoint, if enabled.
    #[must_use]
    pub const fn ip(&self) -> Option<&IpEndpoint> {
        self.ip.as_ref()
    }

    /// Enables the relay kind with the given endpoint.
    pub fn set_relay(&mut self, ep: RelayEndpoint) -> &mut Self {
        self.kinds |= KindSet::RELAY;
        self.relay = Some(ep);
        self
    }

    /// Enables the short-message kind with the given endpoint.
    pub fn set_sms(&mut self, ep: SmsEndpoint) -> &mut Self {
        self.kinds |= KindSet::SMS;
        self.sms = Some(ep);
        self
    }

    /// Enables the radio kind with the given endpoint.
    pub fn set_radio(&mut self, ep: RadioEndpoint) -> &mut Self {
        self.kinds |= KindSet::RADIO;
        self.radio = Some(ep);
        self
    }

    /// Enables the broker kind with the given endpoint.
    pub fn set_mqtt(&mut self, ep: MqttEndpoint) -> &mut Self {
        self.kinds |= KindSet::MQTT;
        self.mqtt = Some(ep);
        self
    }

    /// Enables the direct-IP kind with the given endpoint.
    pub fn set_ip(&mut self, ep: IpEndpoint) -> &mut Self {
        self.kinds |= KindSet::IP;
        self.ip = Some(ep);
        self
    }

    /// Enables `kind` with a default-valued endpoint record, if it is not
    /// already enabled. The specifics stay empty until a real endpoint is
    /// learned; only the kind membership is meaningful.
    pub(crate) fn add_kind_default(&mut self, kind: TransportKind) {
        if self.has(kind) {
            return;
        }
        match kind {
            TransportKind::Relay => self.relay = Some(RelayEndpoint::default()),
            TransportKind::Sms => self.sms = Some(SmsEndpoint::default()),
            TransportKind::Radio => self.radio = Some(RadioEndpoint::default()),
            TransportKind::Mqtt => self.mqtt = Some(MqttEndpoint::default()),
            TransportKind::Ip => self.ip = Some(IpEndpoint::default()),
        }
        self.kinds |= kind.bit();
    }

    /// Disables `kind` and drops its endpoint record.
    pub fn remove(&mut self, kind: TransportKind) {
        self.kinds &= !kind.bit();
        match kind {
            TransportKind::Relay => self.relay = None,
            TransportKind::Sms => self.sms = None,
            TransportKind::Radio => self.radio = None,
            TransportKind::Mqtt => self.mqtt = None,
            TransportKind::Ip => self.ip = None,
        }
    }

    /// Disables every kind except `kind`.
    pub fn retain_only(&mut self, kind: TransportKind) {
        for other in TransportKind::ALL {
            if other != kind {
                self.remove(other);
            }
        }
    }

    /// Merges endpoints from `newer` into `self`, returning whether any kind
    /// was added.
    ///
    /// A kind `self` already carries keeps its endpoint: an in-flight frame
    /// is not allowed to silently retarget an established endpoint. A
    /// concrete difference is logged and otherwise ignored.
    pub fn augment(&mut self, newer: &Self) -> bool {
        let mut added = false;
        for kind in newer.kinds() {
            if self.has(kind) {
                if !self.endpoint_eq(newer, kind, &mut |a, b| a == b) {
                    tracing::warn!("peer endpoint for {kind:?} differs from the one on record");
                }
                continue;
            }
            tracing::debug!("learned new {kind:?} endpoint for peer");
            added = true;
            match kind {
                TransportKind::Relay => self.relay = newer.relay.clone(),
                TransportKind::Sms => self.sms = newer.sms.clone(),
                TransportKind::Radio => self.radio = newer.radio.clone(),
                TransportKind::Mqtt => self.mqtt = newer.mqtt,
                TransportKind::Ip => self.ip = newer.ip.clone(),
            }
            self.kinds |= kind.bit();
        }
        added
    }

    /// Merges endpoints from `newer` into `self`, overwriting specifics that
    /// differ. Used for the session's own address, where the host is
    /// authoritative; peer-driven merges go through [`PeerAddr::augment`].
    pub fn absorb(&mut self, newer: &Self) {
        for kind in newer.kinds() {
            match kind {
                TransportKind::Relay => self.relay = newer.relay.clone(),
                TransportKind::Sms => self.sms = newer.sms.clone(),
                TransportKind::Radio => self.radio = newer.radio.clone(),
                TransportKind::Mqtt => self.mqtt = newer.mqtt,
                TransportKind::Ip => self.ip = newer.ip.clone(),
            }
            self.kinds |= kind.bit();
        }
    }

    /// Whether `self` and `other` name the same peer on `kind`, using the
    /// per-transport notion of endpoint identity.
    ///
    /// `phones_same` is the host's phone-normalising predicate; it is only
    /// consulted for the short-message kind.
    pub(crate) fn endpoint_eq(
        &self,
        other: &Self,
        kind: TransportKind,
        phones_same: &mut dyn FnMut(&str, &str) -> bool,
    ) -> bool {
        match kind {
            TransportKind::Relay => match (&self.relay, &other.relay) {
                (Some(a), Some(b)) => a.ip == b.ip && a.port == b.port,
                _ => false,
            },
            TransportKind::Sms => match (&self.sms, &other.sms) {
                (Some(a), Some(b)) => a.port == b.port && phones_same(&a.phone, &b.phone),
                _ => false,
            },
            TransportKind::Radio => match (&self.radio, &other.radio) {
                (Some(a), Some(b)) => a.mac == b.mac,
                _ => false,
            },
            TransportKind::Mqtt => match (&self.mqtt, &other.mqtt) {
                (Some(a), Some(b)) => a.dev_id == b.dev_id,
                _ => false,
            },
            TransportKind::Ip => match (&self.ip, &other.ip) {
                (Some(a), Some(b)) => a.ip == b.ip && a.port == b.port,
                _ => false,
            },
        }
    }

    /// Writes the kind bitmap, then each enabled endpoint record in
    /// enumeration order.
    pub(crate) fn write_to(&self, dst: &mut BytesMut) {
        let res = dst.write(&self.kinds.bits());
        debug_assert!(res.is_ok());
        for kind in self.kinds() {
            match kind {
                TransportKind::Relay => {
                    let Some(ep) = &self.relay else { continue };
                    write_str8(dst, &ep.room);
                    write_str8(dst, &ep.host_name);
                    let res = dst
                        .write(&ep.ip)
                        .and_then(|()| dst.write(&ep.port))
                        .and_then(|()| dst.write(&u8::from(ep.seeks_public)))
                        .and_then(|()| dst.write(&u8::from(ep.advertise)));
                    debug_assert!(res.is_ok());
                }
                TransportKind::Sms => {
                    let Some(ep) = &self.sms else { continue };
                    write_str8(dst, &ep.phone);
                    let res = dst.write(&ep.port);
                    debug_assert!(res.is_ok());
                }
                TransportKind::Radio => {
                    let Some(ep) = &self.radio else { continue };
                    write_str8(dst, &ep.mac);
                }
                TransportKind::Mqtt => {
                    let Some(ep) = &self.mqtt else { continue };
                    let res = dst.write(&ep.dev_id);
                    debug_assert!(res.is_ok());
                }
                TransportKind::Ip => {
                    let Some(ep) = &self.ip else { continue };
                    write_str8(dst, &ep.host_name);
                    let res = dst.write(&ep.ip).and_then(|()| dst.write(&ep.port));
                    debug_assert!(res.is_ok());
                }
            }
        }
    }

    /// Reads an address written by [`PeerAddr::write_to`].
    pub(crate) fn read_from(src: &mut Bytes) -> Result<Self, AddrError> {
        let bits = src.read::<u8>().map_err(|_| AddrError::TooShort)?;
        let Some(kinds) = KindSet::from_bits(bits) else {
            return Err(AddrError::UnknownKinds {
                bits: bits & !KindSet::all().bits(),
            });
        };

        let mut addr = Self::new();
        for kind in TransportKind::ALL {
            if !kinds.contains(kind.bit()) {
                continue;
            }
            match kind {
                TransportKind::Relay => {
                    let room = read_str8(src)?;
                    let host_name = read_str8(src)?;
                    let ip = src.read::<u32>().map_err(|_| AddrError::TooShort)?;
                    let port = src.read::<u16>().map_err(|_| AddrError::TooShort)?;
                    let seeks_public = src.read::<u8>().map_err(|_| AddrError::TooShort)? != 0;
                    let advertise = src.read::<u8>().map_err(|_| AddrError::TooShort)? != 0;
                    addr.set_relay(RelayEndpoint {
                        room,
                        host_name,
                        ip,
                        port,
                        seeks_public,
                        advertise,
                    });
                }
                TransportKind::Sms => {
                    let phone = read_str8(src)?;
                    let port = src.read::<u16>().map_err(|_| AddrError::TooShort)?;
                    addr.set_sms(SmsEndpoint { phone, port });
                }
                TransportKind::Radio => {
                    let mac = read_str8(src)?;
                    addr.set_radio(RadioEndpoint { mac });
                }
                TransportKind::Mqtt => {
                    let dev_id = src.read::<u64>().map_err(|_| AddrError::TooShort)?;
                    addr.set_mqtt(MqttEndpoint { dev_id });
                }
                TransportKind::Ip => {
                    let host_name = read_str8(src)?;
                    let ip = src.read::<u32>().map_err(|_| AddrError::TooShort)?;
                    let port = src.read::<u16>().map_err(|_| AddrError::TooShort)?;
                    addr.set_ip(IpEndpoint {
                        host_name,
                        ip,
                        port,
                    });
                }
            }
        }
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PeerAddr {
        let mut addr = PeerAddr::new();
        addr.set_relay(RelayEndpoint {
            room: "kitchen".into(),
            host_name: "relay.example".into(),
            ip: 0x0A00_0001,
            port: 10997,
            seeks_public: false,
            advertise: true,
        })
        .set_sms(SmsEndpoint {
            phone: "+15555550123".into(),
            port: 3344,
        });
        addr
    }

    #[test]
    fn first_kind_is_enumeration_order() {
        let addr = sample();
        assert_eq!(Some(TransportKind::Relay), addr.first_kind());
        assert_eq!(
            vec![TransportKind::Relay, TransportKind::Sms],
            addr.kinds().collect::<Vec<_>>()
        );
    }

    #[test]
    fn codec_round_trip() {
        let addr = sample();
        let mut buf = BytesMut::new();
        addr.write_to(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(addr, PeerAddr::read_from(&mut bytes).unwrap());
    }

    #[test]
    fn unknown_kind_bits_fail_loudly() {
        let mut bytes = Bytes::from(vec![0b1110_0000]);
        assert_matches::assert_matches!(
            PeerAddr::read_from(&mut bytes),
            Err(AddrError::UnknownKinds { .. })
        );
    }

    #[test]
    fn augment_adds_but_never_overwrites() {
        let mut addr = sample();
        let mut newer = PeerAddr::new();
        newer
            .set_mqtt(MqttEndpoint { dev_id: 77 })
            .set_sms(SmsEndpoint {
                phone: "+15555559999".into(),
                port: 3344,
            });

        assert!(addr.augment(&newer));
        assert_eq!(Some(&MqttEndpoint { dev_id: 77 }), addr.mqtt());
        // present endpoint keeps its specifics
        assert_eq!("+15555550123", addr.sms().unwrap().phone);

        // a second pass adds nothing
        assert!(!addr.augment(&newer));
    }

    #[test]
    fn retain_only() {
        let mut addr = sample();
        addr.retain_only(TransportKind::Sms);
        assert_eq!(Some(TransportKind::Sms), addr.first_kind());
        assert!(addr.relay().is_none());
        assert!(!addr.has(TransportKind::Relay));
    }
}
