//! A device's life-cycle on the central forwarding relay.
//!
//! The relay carries its own conversation (join a room, learn who else is
//! there, forward game messages) underneath the game protocol. The state
//! machine here is small and strict:
//!
//! ```text
//! Unconnected -- send Connect/Reconnect --> ConnectPending
//! ConnectPending -- ConnectResp --> Connected -- AllHere --> AllConnected
//! ConnectPending -- ReconnectResp --> Reconnected -- AllHere --> AllConnected
//! AllConnected -- peer gone --> Reconnected
//! any -- DisconnectYou --> Unconnected
//! any -- ConnectDenied --> Denied (terminal; recovery is an explicit reset)
//! ```

mod wire;

pub use wire::*;

use octs::Bytes;

use crate::{
    addr::TransportKind,
    host::{Host, TimerKind, TransportFlags},
    session::{Direction, Role, Session},
    ty::{ChannelId, ConnId, CookieId, RelayHostId},
};

/// Fixed cadence of the relay reconnect timer, seconds.
pub const RELAY_RECONNECT_SECS: u16 = 15;

/// Where a device stands in its relay conversation.
///
/// Ordered so that `phase >= Connected` means "the relay will forward for
/// us".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelayPhase {
    /// No conversation; the initial state, and the state after any
    /// disconnect.
    Unconnected,
    /// The relay refused us. Terminal: no retry until the session is reset.
    Denied,
    /// Connect or Reconnect sent, no response yet.
    ConnectPending,
    /// The relay accepted a fresh Connect.
    Connected,
    /// The relay accepted a Reconnect, or a peer dropped out of a complete
    /// room.
    Reconnected,
    /// Every sought player is present.
    AllConnected,
}

/// Relay-side state a session carries.
#[derive(Debug, Clone)]
pub(crate) struct RelayState {
    pub(crate) phase: RelayPhase,
    pub(crate) my_host_id: RelayHostId,
    /// Not persisted; only valid while connected.
    pub(crate) cookie_id: CookieId,
    /// Permanent name the relay gave this game; the key for reconnects.
    pub(crate) conn_name: String,
    /// Heartbeat interval the relay asked for; unused, kept for the wire.
    pub(crate) heartbeat: u16,
    pub(crate) players_here: u8,
    pub(crate) players_total: u8,
    /// Device identifier to register with the relay, `(id_type, id)`.
    pub(crate) dev_id: Option<(u8, String)>,
}

impl RelayState {
    pub(crate) fn init(is_server: bool, players_here: u8, players_total: u8) -> Self {
        Self {
            phase: RelayPhase::Unconnected,
            my_host_id: if is_server {
                RelayHostId::SERVER
            } else {
                RelayHostId::NONE
            },
            cookie_id: CookieId::NONE,
            conn_name: String::new(),
            heartbeat: 0,
            players_here,
            players_total,
            dev_id: None,
        }
    }
}

/// What the relay preprocessor left behind for the game layer.
#[derive(Debug)]
pub(crate) enum RelayGame {
    /// The frame was relay conversation; nothing further to parse.
    Consumed,
    /// The frame wrapped a game message, now at the read position.
    Game {
        /// Relay host id of the sending device.
        src: RelayHostId,
    },
}

impl Session {
    /// Registers the device identifier the relay should associate with this
    /// device, used on the next connect.
    pub fn set_dev_id(&mut self, id_type: u8, id: &str) {
        self.relay.dev_id = Some((id_type, id.to_owned()));
    }

    /// This session's relay identity, `connName/hostID`, once known.
    #[must_use]
    pub fn relay_id(&self) -> Option<String> {
        self.have_relay_id()
            .then(|| format_relay_id(&self.relay.conn_name, self.relay.my_host_id))
    }

    /// Formats the relay identity of the `index`-th peer, for the host's
    /// store-and-forward bookkeeping. On a client there is only one peer,
    /// the server; on the server, peers are numbered in join order.
    #[must_use]
    pub fn format_relay_id(&self, index: u8) -> Option<String> {
        if self.relay.conn_name.is_empty() {
            return None;
        }
        let mut host_id = RelayHostId::SERVER;
        if self.role.is_server() {
            host_id = RelayHostId(host_id.0.wrapping_add(1).wrapping_add(index));
        }
        Some(format_relay_id(&self.relay.conn_name, host_id))
    }

    pub(crate) fn have_relay_id(&self) -> bool {
        !self.relay.conn_name.is_empty() && self.relay.my_host_id != RelayHostId::NONE
    }

    pub(crate) fn set_relay_phase(&mut self, host: &mut dyn Host, phase: RelayPhase) {
        if self.relay.phase != phase {
            tracing::debug!(from = ?self.relay.phase, to = ?phase, "relay phase change");
            self.relay.phase = phase;
            host.relay_status(phase);
        }
    }

    pub(crate) fn arm_relay_reconnect(&mut self, host: &mut dyn Host) {
        host.set_timer(TimerKind::RelayReconnect, RELAY_RECONNECT_SECS);
    }

    /// Opens the relay conversation: Connect for a game with no relay name
    /// yet, Reconnect once one is held. Returns whether the request went
    /// out.
    pub(crate) fn relay_connect(&mut self, host: &mut dyn Host) -> bool {
        let Some(ep) = self.addr.relay().cloned() else {
            return true;
        };
        let seed = self.channel_seed(host);

        if host
            .transport_flags()
            .contains(TransportFlags::JOIN_VIA_REQUEST)
        {
            // the host has its own request/response join channel
            let dev_id = self
                .relay
                .dev_id
                .as_ref()
                .map(|(_, id)| id.clone())
                .unwrap_or_default();
            host.request_join(
                &dev_id,
                &ep.room,
                self.relay.players_here,
                self.relay.players_total,
                seed,
                0,
            );
            self.set_relay_phase(host, RelayPhase::ConnectPending);
            return true;
        }

        let req = ConnectReq {
            room: ep.room,
            seeks_public: ep.seeks_public,
            advertise: ep.advertise,
            players_here: self.relay.players_here,
            players_total: self.relay.players_total,
            seed,
            lang: 0,
            dev_id: self.relay.dev_id.clone(),
            client_index: 0,
        };
        let frame = if self.relay.conn_name.is_empty() {
            RelayFrame::Connect(req)
        } else {
            RelayFrame::Reconnect {
                req,
                host_id: self.relay.my_host_id,
                conn_name: self.relay.conn_name.clone(),
            }
        };
        let sent = self.send_relay_frame(host, &frame);
        if sent {
            self.set_relay_phase(host, RelayPhase::ConnectPending);
        }
        sent
    }

    /// Tells the relay we are leaving and falls back to Unconnected.
    pub(crate) fn relay_disconnect(&mut self, host: &mut dyn Host) {
        if self.relay.phase >= RelayPhase::Connected {
            let frame = RelayFrame::Disconnect {
                cookie_id: self.relay.cookie_id,
                host_id: self.relay.my_host_id,
            };
            let _ = self.send_relay_frame(host, &frame);
        }
        self.set_relay_phase(host, RelayPhase::Unconnected);
    }

    /// Sends one game message through the relay: by store-and-forward if the
    /// host supports it, otherwise through the live room. Returns the byte
    /// count of the game frame, or negative.
    pub(crate) fn send_game_msg_via_relay(
        &mut self,
        host: &mut dyn Host,
        channel: ChannelId,
        framed: &Bytes,
        msg_no: &str,
    ) -> i32 {
        let dest_id = self.relay_dest_id(channel);
        if dest_id == RelayHostId::NONE {
            tracing::debug!(%channel, "relay send skipped: no destination id yet");
            return -1;
        }
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let frame_len = framed.len() as i32;

        if self.have_relay_id()
            && host.transport_flags().contains(TransportFlags::HAS_NOCONN)
        {
            let relay_id = format_relay_id(&self.relay.conn_name, dest_id);
            let noconn = RelayFrame::MsgToRelayNoConn {
                src_id: self.relay.my_host_id,
                dest_id,
                payload: framed.clone(),
            };
            if host.send_no_conn(&noconn.to_bytes(), msg_no, &relay_id) {
                return frame_len;
            }
        }

        if self.relay.phase >= RelayPhase::Connected {
            let frame = RelayFrame::MsgToRelay {
                cookie_id: self.relay.cookie_id,
                src_id: self.relay.my_host_id,
                dest_id,
                payload: framed.clone(),
            };
            if self.send_relay_frame(host, &frame) {
                return frame_len;
            }
        } else {
            tracing::debug!("relay send skipped: not connected");
        }
        -1
    }

    /// Serializes and sends one relay control frame to the relay host.
    fn send_relay_frame(&mut self, host: &mut dyn Host, frame: &RelayFrame) -> bool {
        if self.kind_disabled(TransportKind::Relay, Direction::Send) {
            tracing::debug!("relay frame dropped: transport disabled");
            return false;
        }
        let bytes = frame.to_bytes();
        let sent = host.send(&bytes, "", &self.addr, TransportKind::Relay, self.conn_id.0);
        usize::try_from(sent).is_ok_and(|sent| sent == bytes.len())
    }

    /// Handles one datagram that arrived on the relay transport. Most frames
    /// are conversation and get consumed here; `MsgFromRelay*` leave a game
    /// message behind in `bytes`.
    pub(crate) fn relay_preprocess(
        &mut self,
        host: &mut dyn Host,
        bytes: &mut Bytes,
    ) -> Result<RelayGame, RelayWireError> {
        let frame = RelayFrame::read_from(bytes)?;
        let cmd = frame.cmd();
        tracing::trace!(?cmd, "relay frame");
        match frame {
            RelayFrame::ConnectResp(resp) => {
                self.got_connect_resp(host, &resp, false);
                let ack = RelayFrame::Ack {
                    dest_id: self.relay.my_host_id,
                };
                let _ = self.send_relay_frame(host, &ack);
            }
            RelayFrame::ReconnectResp(resp) => {
                self.got_connect_resp(host, &resp, true);
            }
            RelayFrame::AllHere { src_id, conn_name } => {
                if self.relay.my_host_id != RelayHostId::NONE && self.relay.my_host_id != src_id {
                    tracing::debug!(
                        from = %self.relay.my_host_id,
                        to = %src_id,
                        "relay changed our host id",
                    );
                }
                self.relay.my_host_id = src_id;
                self.replace_conn_name(conn_name);

                // everyone is reachable now; push out whatever is pending
                let _ = self.resend_all(host, None, false);

                if !self.conn_id.is_set() {
                    let room = self.relay_room();
                    host.relay_connected(&room, false, self.relay.my_host_id, true, 0);
                }
                self.set_relay_phase(host, RelayPhase::AllConnected);
            }
            RelayFrame::MsgFromRelay {
                cookie_id,
                src_id,
                dest_id,
                payload,
            } => {
                if dest_id == self.relay.my_host_id || cookie_id == self.relay.cookie_id {
                    if dest_id != self.relay.my_host_id {
                        tracing::debug!(
                            %dest_id,
                            ours = %self.relay.my_host_id,
                            "keeping relayed message though host id is not what we expected",
                        );
                    }
                    *bytes = payload;
                    return Ok(RelayGame::Game { src: src_id });
                }
                tracing::debug!(%dest_id, "dropping relayed message for someone else");
            }
            RelayFrame::MsgFromRelayNoConn {
                src_id, payload, ..
            } => {
                *bytes = payload;
                return Ok(RelayGame::Game { src: src_id });
            }
            RelayFrame::DisconnectOther { reason } => {
                if self.relay.phase > RelayPhase::Reconnected {
                    if self.relay.cookie_id == CookieId::NONE {
                        tracing::debug!("peer-gone with no cookie; dropping");
                    } else {
                        self.set_relay_phase(host, RelayPhase::Reconnected);
                        host.relay_error(reason);
                    }
                }
            }
            RelayFrame::DisconnectYou { reason } => {
                self.set_relay_phase(host, RelayPhase::Unconnected);
                host.relay_error(reason);
            }
            RelayFrame::Status { reason } => {
                host.relay_error(reason);
            }
            RelayFrame::ConnectDenied { reason } => {
                tracing::debug!(?reason, "relay denied connect");
                self.set_relay_phase(host, RelayPhase::Denied);
                if reason == RelayReason::NoReconn {
                    // the name is dead; a future connect must start fresh
                    let (here, total) = (self.relay.players_here, self.relay.players_total);
                    self.relay = RelayState::init(self.role.is_server(), here, total);
                } else {
                    host.relay_error(reason);
                }
            }
            RelayFrame::Connect(_)
            | RelayFrame::Reconnect { .. }
            | RelayFrame::Disconnect { .. }
            | RelayFrame::MsgToRelay { .. }
            | RelayFrame::MsgToRelayNoConn { .. }
            | RelayFrame::Ack { .. } => {
                tracing::warn!(?cmd, "device-bound socket got a relay-bound frame");
            }
        }
        Ok(RelayGame::Consumed)
    }

    /// A Connect or Reconnect response: adopt the relay's view of who we
    /// are, flipping our role if it disagrees with what we assumed.
    fn got_connect_resp(&mut self, host: &mut dyn Host, resp: &ConnectResp, reconnected: bool) {
        self.set_relay_phase(
            host,
            if reconnected {
                RelayPhase::Reconnected
            } else {
                RelayPhase::Connected
            },
        );

        if self.relay.my_host_id != resp.host_id {
            tracing::debug!(
                from = %self.relay.my_host_id,
                to = %resp.host_id,
                "relay assigned host id",
            );
            self.relay.my_host_id = resp.host_id;
        }

        let is_server_now = resp.host_id == RelayHostId::SERVER;
        if is_server_now != self.role.is_server() {
            tracing::debug!(is_server_now, "relay flipped our role");
            self.role = Role::of(is_server_now);
            let queue_len = self.queue.len();
            host.role_change(is_server_now);
            debug_assert_eq!(
                queue_len,
                self.queue.len(),
                "role_change callback must not send",
            );
            // the old role's channels and pending traffic are meaningless now
            self.queue.clear();
            host.count_changed(0);
            self.table.clear();
            self.conn_id = ConnId::NONE;
        }

        self.relay.cookie_id = resp.cookie_id;
        debug_assert!(resp.cookie_id != CookieId::NONE);
        self.relay.heartbeat = resp.heartbeat;

        self.replace_conn_name(resp.conn_name.clone());

        if resp.players_sought == resp.players_here {
            self.set_relay_phase(host, RelayPhase::AllConnected);
        }

        // no point notifying if the game is already in play over another
        // transport
        if !self.conn_id.is_set() {
            let room = self.relay_room();
            host.relay_connected(
                &room,
                reconnected,
                self.relay.my_host_id,
                false,
                resp.players_sought.saturating_sub(resp.players_here),
            );
        }

        // the relay will forward for us now; push out whatever is pending
        let _ = self.resend_all(host, None, false);
    }

    /// Relay host id a game message on `channel` should be forwarded to.
    fn relay_dest_id(&self, channel: ChannelId) -> RelayHostId {
        if channel.number() == 0 {
            return RelayHostId::SERVER;
        }
        let mut missing_relay = false;
        for rec in self.table.iter() {
            if rec.channel.seed_bits() != channel.seed_bits() {
                continue;
            }
            if rec.addr.relay().is_none() {
                missing_relay = true;
            } else {
                return rec.relay_host;
            }
        }
        // a client may hold a channel established over another transport
        // before the relay side has an id for it; the peer is the server
        if missing_relay && !self.role.is_server() {
            return RelayHostId::SERVER;
        }
        RelayHostId::NONE
    }

    fn relay_room(&self) -> String {
        self.addr
            .relay()
            .map(|ep| ep.room.clone())
            .unwrap_or_default()
    }

    fn replace_conn_name(&mut self, conn_name: String) {
        if !self.relay.conn_name.is_empty() && self.relay.conn_name != conn_name {
            tracing::warn!(
                old = %self.relay.conn_name,
                new = %conn_name,
                "relay replaced our game name",
            );
        }
        self.relay.conn_name = conn_name;
    }
}

fn format_relay_id(conn_name: &str, host_id: RelayHostId) -> String {
    format!("{conn_name}/{host_id}")
}
