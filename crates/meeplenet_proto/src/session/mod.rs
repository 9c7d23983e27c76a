//! See [`Session`].

mod recv;
mod send;

pub use recv::{Incoming, RecvError};
pub use send::SendError;

use crate::{
    addr::{MqttEndpoint, PeerAddr, TransportKind},
    host::{Host, TimerKind},
    queue::{MsgQueue, CHAT_CEILING},
    relay::{RelayPhase, RelayState},
    table::ChannelTable,
    ty::{ChannelId, ConnId, MsgSeq, RelayHostId, SaveToken},
};

/// Which side of the game this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// Assigns channel numbers and the connection identifier.
    Server,
    /// Receives its channel number from the first server reply.
    Client,
}

impl Role {
    /// Whether this is the server role.
    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    pub(crate) const fn of(is_server: bool) -> Self {
        if is_server {
            Self::Server
        } else {
            Self::Client
        }
    }
}

/// The reliable-messaging session of one game on one device.
///
/// Owns the channel table, the outbound queue, the relay conversation and the
/// retransmission schedule. Performs no I/O: every entry point borrows a
/// [`Host`] for sends, timers, clock, entropy and storage.
///
/// A session is created blank for a new game ([`Session::new`]) or restored
/// from a persisted blob ([`Session::from_stream`]). It is single-threaded
/// cooperative: the host must serialize calls into it.
#[derive(Debug)]
pub struct Session {
    pub(crate) conn_id: ConnId,
    pub(crate) role: Role,
    /// Highest channel number handed out so far; the allocator is sticky
    /// across resets.
    pub(crate) next_channel_no: u16,
    pub(crate) channel_seed: u16,
    pub(crate) addr: PeerAddr,
    pub(crate) table: ChannelTable,
    pub(crate) queue: MsgQueue,
    pub(crate) relay: RelayState,
    pub(crate) resend_backoff: u16,
    pub(crate) next_resend: u32,
    /// `[kind][direction]`; direction 0 = send, 1 = receive.
    pub(crate) disabled: [[bool; 2]; TransportKind::ALL.len()],
    pub(crate) last_save_token: Option<SaveToken>,
    /// Debug guard: a receive is outstanding between `check_incoming`
    /// returning a message and `msg_processed`.
    pub(crate) processing: bool,
}

/// Direction selector for the per-transport disable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outbound.
    Send,
    /// Inbound.
    Receive,
}

impl Direction {
    const fn index(self) -> usize {
        match self {
            Self::Send => 0,
            Self::Receive => 1,
        }
    }
}

impl Session {
    /// Creates a blank session for a new game.
    ///
    /// `players_here` and `players_total` describe this device's share of the
    /// game; the relay needs them to know when a room is complete.
    #[must_use]
    pub fn new(role: Role, players_here: u8, players_total: u8) -> Self {
        Self {
            conn_id: ConnId::NONE,
            role,
            next_channel_no: 0,
            channel_seed: 0,
            addr: PeerAddr::new(),
            table: ChannelTable::new(),
            queue: MsgQueue::new(),
            relay: RelayState::init(role.is_server(), players_here, players_total),
            resend_backoff: 0,
            next_resend: 0,
            disabled: [[false; 2]; TransportKind::ALL.len()],
            last_save_token: None,
            processing: false,
        }
    }

    /// Creates a blank server-role session.
    #[must_use]
    pub fn server(players_here: u8, players_total: u8) -> Self {
        Self::new(Role::Server, players_here, players_total)
    }

    /// Creates a blank client-role session.
    #[must_use]
    pub fn client(players_here: u8, players_total: u8) -> Self {
        Self::new(Role::Client, players_here, players_total)
    }

    /// This session's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The connection identifier, [`ConnId::NONE`] until assigned.
    #[must_use]
    pub const fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Sets the connection identifier.
    ///
    /// Only meaningful once, from the server-role host (or on a client that
    /// learned it out-of-band, e.g. from the invitation). Setting a different
    /// id than the current one is a host bug.
    pub fn set_conn_id(&mut self, conn_id: ConnId) {
        debug_assert!(conn_id.is_set());
        debug_assert!(!self.conn_id.is_set() || self.conn_id == conn_id);
        tracing::debug!(%conn_id, "connection id assigned");
        self.conn_id = conn_id;
    }

    /// The session's channel seed, generating it on first use.
    ///
    /// The seed's high bits are never zero once generated, so a zero value
    /// can always be read as "no seed yet".
    pub fn channel_seed(&mut self, host: &mut dyn Host) -> u16 {
        while ChannelId(self.channel_seed).seed_bits() == 0 {
            self.channel_seed = ChannelId(host.random_seed()).seed_bits();
            if ChannelId(self.channel_seed).seed_bits() != 0 {
                tracing::debug!(seed = %ChannelId(self.channel_seed), "made channel seed");
            }
        }
        self.channel_seed
    }

    /// Kicks off connectivity: opens the relay conversation if the relay
    /// transport is enabled, and tries one delivery pass for everything
    /// pending on the others.
    pub fn start(&mut self, host: &mut dyn Host) {
        let mut try_resend = false;
        for kind in self.addr.kinds().collect::<Vec<_>>() {
            match kind {
                TransportKind::Relay => {
                    if self.relay.phase == RelayPhase::Unconnected && !self.relay_connect(host) {
                        tracing::debug!("relay connect failed; arming reconnect timer");
                        self.arm_relay_reconnect(host);
                    }
                }
                TransportKind::Sms
                | TransportKind::Radio
                | TransportKind::Mqtt
                | TransportKind::Ip => try_resend = true,
            }
        }
        if try_resend {
            let _ = self.resend_all(host, None, false);
        }
    }

    /// Winds the session down: leaves the relay room and cancels both timers.
    /// After this, no time-driven activity remains; the session may be
    /// dropped or serialized.
    pub fn stop(&mut self, host: &mut dyn Host) {
        if self.addr.has(TransportKind::Relay) {
            self.relay_disconnect(host);
        }
        host.clear_timer(TimerKind::Resend);
        host.clear_timer(TimerKind::RelayReconnect);
    }

    /// Resets the session for a fresh game with the same participants:
    /// empties the queue and channel table, clears the connection id and
    /// seed, and restarts the relay conversation from scratch.
    ///
    /// The channel-number allocator is deliberately *not* rewound: devices
    /// may reconnect in a different order than they originally joined in,
    /// and a reused number would collide with a peer's surviving record.
    pub fn reset(&mut self, host: &mut dyn Host, role: Role, players_here: u8, players_total: u8) {
        if self.addr.has(TransportKind::Relay) {
            self.relay_disconnect(host);
        }
        self.queue.clear();
        host.count_changed(0);
        self.role = role;
        self.table.clear();
        if self.next_channel_no != 0 {
            tracing::debug!(
                next_channel_no = self.next_channel_no,
                "reset keeps allocator position",
            );
        }
        self.channel_seed = 0;
        self.conn_id = ConnId::NONE;
        self.relay = RelayState::init(role.is_server(), players_here, players_total);
    }

    /// The session's own address: the union of endpoints it can be reached
    /// on.
    #[must_use]
    pub const fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    /// Merges endpoints the host has learned about into the session's own
    /// address. The host is authoritative here, so changed specifics
    /// overwrite. Newly adding the relay kind opens the relay conversation.
    pub fn augment_host_addr(&mut self, host: &mut dyn Host, addr: &PeerAddr) {
        let adding_relay =
            addr.has(TransportKind::Relay) && !self.addr.has(TransportKind::Relay);
        self.addr.absorb(addr);
        if adding_relay {
            self.set_relay_phase(host, RelayPhase::Unconnected);
            if !self.relay_connect(host) {
                self.arm_relay_reconnect(host);
            }
        }
    }

    /// Records the broker device id a peer is reachable under, once the host
    /// learns it (typically from the invitation flow).
    pub fn add_mqtt_dev_id(&mut self, channel: ChannelId, dev_id: u64) {
        let mut addr = PeerAddr::new();
        addr.set_mqtt(MqttEndpoint { dev_id });
        let mut phones = |a: &str, b: &str| a == b;
        self.table
            .augment(channel, &addr, RelayHostId::NONE, &mut self.addr, &mut phones);
    }

    /// Removes a transport kind from the session's own address.
    pub fn drop_host_addr(&mut self, host: &mut dyn Host, kind: TransportKind) {
        if kind == TransportKind::Relay && self.addr.has(TransportKind::Relay) {
            self.relay_disconnect(host);
        }
        self.addr.remove(kind);
    }

    /// The host's transport layer reports that `kind` has failed. For the
    /// relay this drops the conversation and arms the fixed reconnect timer;
    /// other kinds need no action here, since their queue elements simply
    /// stay resident for the next resend pass.
    pub fn transport_failed(&mut self, host: &mut dyn Host, kind: TransportKind) {
        if kind == TransportKind::Relay
            && self.addr.has(TransportKind::Relay)
            && self.relay.phase != RelayPhase::Denied
        {
            self.relay_disconnect(host);
            self.arm_relay_reconnect(host);
        }
    }

    /// A host timer armed via [`Host::set_timer`] fired.
    pub fn timer_fired(&mut self, host: &mut dyn Host, kind: TimerKind) {
        match kind {
            TimerKind::Resend => {
                let _ = self.resend_all(host, None, false);
            }
            TimerKind::RelayReconnect => {
                // once denied, never retry; recovery is an explicit reset
                if self.relay.phase == RelayPhase::Denied {
                    return;
                }
                let connected = self.relay.phase >= RelayPhase::Connected;
                if !connected && !self.relay_connect(host) {
                    self.arm_relay_reconnect(host);
                }
            }
        }
    }

    /// Whether new chat traffic is acceptable: connected, in-session, and
    /// the queue is below its soft ceiling.
    #[must_use]
    pub fn can_chat(&self) -> bool {
        self.is_connected() && self.conn_id.is_set() && self.queue.len() < CHAT_CEILING
    }

    /// Whether the session has working connectivity on any enabled kind: a
    /// named relay room, or an established connection id elsewhere.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.addr.kinds().any(|kind| match kind {
            TransportKind::Relay => !self.relay.conn_name.is_empty(),
            TransportKind::Sms
            | TransportKind::Radio
            | TransportKind::Mqtt
            | TransportKind::Ip => self.conn_id.is_set(),
        })
    }

    /// Number of unacknowledged outbound messages.
    #[must_use]
    pub fn count_pending_packets(&self) -> usize {
        self.queue.len()
    }

    /// Visits every pending outbound frame, head to tail, without sending.
    pub fn pending_msgs(&self, mut visit: impl FnMut(&[u8], MsgSeq)) {
        for elem in self.queue.iter() {
            visit(&elem.frame, elem.seq);
        }
    }

    /// Disables or re-enables one direction of one transport kind. Disabled
    /// kinds are skipped by the send path and their inbound traffic is
    /// dropped.
    pub fn set_kind_disabled(&mut self, kind: TransportKind, dir: Direction, disabled: bool) {
        self.disabled[kind as usize][dir.index()] = disabled;
    }

    /// Whether one direction of one transport kind is disabled.
    #[must_use]
    pub const fn kind_disabled(&self, kind: TransportKind, dir: Direction) -> bool {
        self.disabled[kind as usize][dir.index()]
    }

    /// The host reports that the save it made with `token` has durably hit
    /// storage. If `token` is the most recently issued one, every record's
    /// saved cursor catches up with its received cursor, and an ack-only
    /// pass shares the news with the peers. A stale token advances nothing.
    pub fn save_succeeded(&mut self, host: &mut dyn Host, token: SaveToken) {
        if self.last_save_token != Some(token) {
            tracing::debug!(%token, "stale save token; cursors unchanged");
            return;
        }
        for rec in self.table.iter_mut() {
            if rec.last_saved != rec.last_recv {
                tracing::debug!(
                    channel = %rec.channel,
                    from = %rec.last_saved,
                    to = %rec.last_recv,
                    "advancing saved cursor",
                );
                rec.last_saved = rec.last_recv;
            }
        }
        self.ack_any(host);
    }

    pub(crate) fn notify_queue_changed(&self, host: &mut dyn Host) {
        host.count_changed(self.queue.len());
    }

    pub(crate) fn reset_backoff(&mut self) {
        if self.resend_backoff != 0 || self.next_resend != 0 {
            tracing::trace!("resetting resend backoff");
        }
        self.resend_backoff = 0;
        self.next_resend = 0;
    }
}
