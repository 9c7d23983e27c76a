//! Wire format of the relay control conversation.
//!
//! Every relay frame is a one-byte opcode followed by a fixed payload. Game
//! messages ride inside the `Msg*` frames; everything else is conversation
//! between a device and the relay itself. All multibyte fields are network
//! byte order; strings are nul-terminated.

use octs::{Buf, Bytes, BytesMut, Read, Write};

use crate::{
    ty::{CookieId, RelayHostId},
    util::{read_cstr, write_cstr, StrError},
};

/// Version of the relay conversation this build speaks.
pub const RELAY_PROTO_VERSION: u8 = 2;

/// Client software version advertised in connect requests.
pub const CLIENT_VERSION: u16 = 2;

/// One-byte opcodes of the relay conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RelayCmd {
    /// Device → relay: join a room for the first time.
    Connect = 1,
    /// Device → relay: rejoin a room it already has a name in.
    Reconnect = 2,
    /// Device → relay: leaving.
    Disconnect = 3,
    /// Relay → device: [`RelayCmd::Connect`] accepted.
    ConnectResp = 4,
    /// Relay → device: [`RelayCmd::Reconnect`] accepted.
    ReconnectResp = 5,
    /// Relay → device: every sought player is present.
    AllHere = 6,
    /// Relay → device: you have been disconnected.
    DisconnectYou = 7,
    /// Relay → device: another player dropped.
    DisconnectOther = 8,
    /// Relay → device: connect refused; terminal.
    ConnectDenied = 9,
    /// Device → relay: forward a game message.
    MsgToRelay = 10,
    /// Relay → device: a forwarded game message.
    MsgFromRelay = 11,
    /// Device → relay: store-and-forward game message, no live room.
    MsgToRelayNoConn = 12,
    /// Relay → device: game message delivered from store-and-forward.
    MsgFromRelayNoConn = 13,
    /// Device → relay: acknowledge receipt.
    Ack = 14,
    /// Relay → device: out-of-band status needing user attention.
    Status = 15,
}

impl RelayCmd {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Connect,
            2 => Self::Reconnect,
            3 => Self::Disconnect,
            4 => Self::ConnectResp,
            5 => Self::ReconnectResp,
            6 => Self::AllHere,
            7 => Self::DisconnectYou,
            8 => Self::DisconnectOther,
            9 => Self::ConnectDenied,
            10 => Self::MsgToRelay,
            11 => Self::MsgFromRelay,
            12 => Self::MsgToRelayNoConn,
            13 => Self::MsgFromRelayNoConn,
            14 => Self::Ack,
            15 => Self::Status,
            _ => return None,
        })
    }
}

/// Reason byte carried by denial, disconnect and status frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelayReason {
    /// No problem; placeholder.
    None,
    /// The device's protocol flags are too old.
    OldFlags,
    /// The device spoke a protocol version the relay refuses.
    BadProto,
    /// The relay is over capacity; try later.
    RelayBusy,
    /// The relay is shutting down.
    Shutdown,
    /// The room timed out waiting for players.
    Timeout,
    /// You missed too many heartbeats.
    HeartYou,
    /// Another device missed too many heartbeats.
    HeartOther,
    /// Connection to another device was lost.
    LostOther,
    /// Another device disconnected on purpose.
    OtherDiscon,
    /// No such room.
    NoRoom,
    /// Room name already taken.
    DupRoom,
    /// Too many players for the room.
    TooMany,
    /// The room was deleted.
    Deleted,
    /// The relay no longer allows reconnects to this room.
    NoReconn,
    /// The game is dead on the relay side.
    DeadGame,
    /// A reason byte this build does not know.
    Unknown(u8),
}

impl RelayReason {
    /// Wire value of this reason.
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::OldFlags => 1,
            Self::BadProto => 2,
            Self::RelayBusy => 3,
            Self::Shutdown => 4,
            Self::Timeout => 5,
            Self::HeartYou => 6,
            Self::HeartOther => 7,
            Self::LostOther => 8,
            Self::OtherDiscon => 9,
            Self::NoRoom => 10,
            Self::DupRoom => 11,
            Self::TooMany => 12,
            Self::Deleted => 13,
            Self::NoReconn => 14,
            Self::DeadGame => 15,
            Self::Unknown(raw) => raw,
        }
    }

    /// Reason for a wire value.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::OldFlags,
            2 => Self::BadProto,
            3 => Self::RelayBusy,
            4 => Self::Shutdown,
            5 => Self::Timeout,
            6 => Self::HeartYou,
            7 => Self::HeartOther,
            8 => Self::LostOther,
            9 => Self::OtherDiscon,
            10 => Self::NoRoom,
            11 => Self::DupRoom,
            12 => Self::TooMany,
            13 => Self::Deleted,
            14 => Self::NoReconn,
            15 => Self::DeadGame,
            raw => Self::Unknown(raw),
        }
    }
}

/// Body of [`RelayCmd::Connect`], and the common prefix of
/// [`RelayCmd::Reconnect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReq {
    /// Room to join.
    pub room: String,
    /// Whether the device seeks a public room.
    pub seeks_public: bool,
    /// Whether the room should be advertised publicly.
    pub advertise: bool,
    /// Players on this device.
    pub players_here: u8,
    /// Players in the whole game.
    pub players_total: u8,
    /// The device's channel seed, for duplicate elimination relay-side.
    pub seed: u16,
    /// Language code of the game dictionary.
    pub lang: u8,
    /// Optional device identifier: `(id_type, id)`.
    pub dev_id: Option<(u8, String)>,
    /// Index this device claims within the game, 0 when it does not care.
    pub client_index: u8,
}

/// Body of [`RelayCmd::ConnectResp`] / [`RelayCmd::ReconnectResp`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectResp {
    /// Host id the relay assigned this device.
    pub host_id: RelayHostId,
    /// Ephemeral room-instance cookie.
    pub cookie_id: CookieId,
    /// Heartbeat interval the relay wants, seconds; 0 = none.
    pub heartbeat: u16,
    /// Players the room is waiting for in total.
    pub players_sought: u8,
    /// Players currently present.
    pub players_here: u8,
    /// Permanent name of this game on the relay.
    pub conn_name: String,
    /// Echo of the device identifier, if one was registered.
    pub dev_id: Option<(u8, String)>,
}

/// A complete relay control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// See [`RelayCmd::Connect`].
    Connect(ConnectReq),
    /// See [`RelayCmd::Reconnect`].
    Reconnect {
        /// Connect fields.
        req: ConnectReq,
        /// Host id from the previous connection.
        host_id: RelayHostId,
        /// Permanent name from the previous connection.
        conn_name: String,
    },
    /// See [`RelayCmd::Disconnect`].
    Disconnect {
        /// Current room cookie.
        cookie_id: CookieId,
        /// This device's host id.
        host_id: RelayHostId,
    },
    /// See [`RelayCmd::ConnectResp`].
    ConnectResp(ConnectResp),
    /// See [`RelayCmd::ReconnectResp`].
    ReconnectResp(ConnectResp),
    /// See [`RelayCmd::AllHere`].
    AllHere {
        /// Host id of the device whose arrival completed the room.
        src_id: RelayHostId,
        /// Permanent name of the game.
        conn_name: String,
    },
    /// See [`RelayCmd::DisconnectYou`].
    DisconnectYou {
        /// Why.
        reason: RelayReason,
    },
    /// See [`RelayCmd::DisconnectOther`].
    DisconnectOther {
        /// Why.
        reason: RelayReason,
    },
    /// See [`RelayCmd::ConnectDenied`].
    ConnectDenied {
        /// Why.
        reason: RelayReason,
    },
    /// See [`RelayCmd::MsgToRelay`].
    MsgToRelay {
        /// Current room cookie.
        cookie_id: CookieId,
        /// Sending device.
        src_id: RelayHostId,
        /// Destination device.
        dest_id: RelayHostId,
        /// A framed game message.
        payload: Bytes,
    },
    /// See [`RelayCmd::MsgFromRelay`].
    MsgFromRelay {
        /// Room cookie the relay forwarded under.
        cookie_id: CookieId,
        /// Sending device.
        src_id: RelayHostId,
        /// Destination device.
        dest_id: RelayHostId,
        /// A framed game message.
        payload: Bytes,
    },
    /// See [`RelayCmd::MsgToRelayNoConn`].
    MsgToRelayNoConn {
        /// Sending device.
        src_id: RelayHostId,
        /// Destination device.
        dest_id: RelayHostId,
        /// A framed game message.
        payload: Bytes,
    },
    /// See [`RelayCmd::MsgFromRelayNoConn`].
    MsgFromRelayNoConn {
        /// Sending device.
        src_id: RelayHostId,
        /// Destination device.
        dest_id: RelayHostId,
        /// A framed game message.
        payload: Bytes,
    },
    /// See [`RelayCmd::Ack`].
    Ack {
        /// Device being acknowledged.
        dest_id: RelayHostId,
    },
    /// See [`RelayCmd::Status`].
    Status {
        /// Why.
        reason: RelayReason,
    },
}

/// Failed to parse a relay control frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayWireError {
    /// Input ended mid-frame.
    #[error("relay frame too short")]
    TooShort,
    /// The opcode byte is not one this build knows.
    #[error("unknown relay command {0}")]
    UnknownCmd(u8),
    /// A connect request spoke a protocol version this build refuses.
    #[error("unsupported relay protocol version {0}")]
    BadProto(u8),
    /// A string field was malformed.
    #[error("bad string field")]
    BadString(#[from] StrError),
}

fn write_dev_id(dst: &mut BytesMut, dev_id: Option<&(u8, String)>) {
    match dev_id {
        Some((id_type, id)) if *id_type != 0 => {
            let res = dst.write(id_type);
            debug_assert!(res.is_ok());
            write_cstr(dst, id);
        }
        _ => {
            let res = dst.write(&0u8);
            debug_assert!(res.is_ok());
        }
    }
}

fn read_dev_id(src: &mut Bytes) -> Result<Option<(u8, String)>, RelayWireError> {
    let id_type = read_u8(src)?;
    if id_type == 0 {
        return Ok(None);
    }
    Ok(Some((id_type, read_cstr(src)?)))
}

fn read_u8(src: &mut Bytes) -> Result<u8, RelayWireError> {
    src.read::<u8>().map_err(|_| RelayWireError::TooShort)
}

fn read_u16(src: &mut Bytes) -> Result<u16, RelayWireError> {
    src.read::<u16>().map_err(|_| RelayWireError::TooShort)
}

fn write_connect_req(dst: &mut BytesMut, req: &ConnectReq) {
    let res = dst.write(&RELAY_PROTO_VERSION);
    debug_assert!(res.is_ok());
    let res = dst.write(&CLIENT_VERSION);
    debug_assert!(res.is_ok());
    write_cstr(dst, &req.room);
    let res = dst
        .write(&u8::from(req.seeks_public))
        .and_then(|()| dst.write(&u8::from(req.advertise)))
        .and_then(|()| dst.write(&req.players_here))
        .and_then(|()| dst.write(&req.players_total))
        .and_then(|()| dst.write(&req.seed))
        .and_then(|()| dst.write(&req.lang));
    debug_assert!(res.is_ok());
    write_dev_id(dst, req.dev_id.as_ref());
    let res = dst.write(&req.client_index);
    debug_assert!(res.is_ok());
}

fn read_connect_req(src: &mut Bytes) -> Result<ConnectReq, RelayWireError> {
    let proto = read_u8(src)?;
    if proto != RELAY_PROTO_VERSION && proto != 1 {
        return Err(RelayWireError::BadProto(proto));
    }
    let _client_version = read_u16(src)?;
    let room = read_cstr(src)?;
    let seeks_public = read_u8(src)? != 0;
    let advertise = read_u8(src)? != 0;
    let players_here = read_u8(src)?;
    let players_total = read_u8(src)?;
    let seed = read_u16(src)?;
    let lang = read_u8(src)?;
    let dev_id = read_dev_id(src)?;
    let client_index = read_u8(src)?;
    Ok(ConnectReq {
        room,
        seeks_public,
        advertise,
        players_here,
        players_total,
        seed,
        lang,
        dev_id,
        client_index,
    })
}

fn write_connect_resp(dst: &mut BytesMut, resp: &ConnectResp) {
    let res = dst
        .write(&resp.host_id)
        .and_then(|()| dst.write(&resp.cookie_id))
        .and_then(|()| dst.write(&resp.heartbeat))
        .and_then(|()| dst.write(&resp.players_sought))
        .and_then(|()| dst.write(&resp.players_here));
    debug_assert!(res.is_ok());
    write_cstr(dst, &resp.conn_name);
    write_dev_id(dst, resp.dev_id.as_ref());
}

fn read_connect_resp(src: &mut Bytes) -> Result<ConnectResp, RelayWireError> {
    let host_id = RelayHostId(read_u8(src)?);
    let cookie_id = CookieId(read_u16(src)?);
    let heartbeat = read_u16(src)?;
    let players_sought = read_u8(src)?;
    let players_here = read_u8(src)?;
    let conn_name = read_cstr(src)?;
    let dev_id = read_dev_id(src)?;
    Ok(ConnectResp {
        host_id,
        cookie_id,
        heartbeat,
        players_sought,
        players_here,
        conn_name,
        dev_id,
    })
}

impl RelayFrame {
    /// The opcode of this frame.
    #[must_use]
    pub const fn cmd(&self) -> RelayCmd {
        match self {
            Self::Connect(_) => RelayCmd::Connect,
            Self::Reconnect { .. } => RelayCmd::Reconnect,
            Self::Disconnect { .. } => RelayCmd::Disconnect,
            Self::ConnectResp(_) => RelayCmd::ConnectResp,
            Self::ReconnectResp(_) => RelayCmd::ReconnectResp,
            Self::AllHere { .. } => RelayCmd::AllHere,
            Self::DisconnectYou { .. } => RelayCmd::DisconnectYou,
            Self::DisconnectOther { .. } => RelayCmd::DisconnectOther,
            Self::ConnectDenied { .. } => RelayCmd::ConnectDenied,
            Self::MsgToRelay { .. } => RelayCmd::MsgToRelay,
            Self::MsgFromRelay { .. } => RelayCmd::MsgFromRelay,
            Self::MsgToRelayNoConn { .. } => RelayCmd::MsgToRelayNoConn,
            Self::MsgFromRelayNoConn { .. } => RelayCmd::MsgFromRelayNoConn,
            Self::Ack { .. } => RelayCmd::Ack,
            Self::Status { .. } => RelayCmd::Status,
        }
    }

    /// Serializes this frame, opcode first.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        let res = dst.write(&(self.cmd() as u8));
        debug_assert!(res.is_ok());
        match self {
            Self::Connect(req) => write_connect_req(&mut dst, req),
            Self::Reconnect {
                req,
                host_id,
                conn_name,
            } => {
                write_connect_req(&mut dst, req);
                let res = dst.write(host_id);
                debug_assert!(res.is_ok());
                write_cstr(&mut dst, conn_name);
            }
            Self::Disconnect { cookie_id, host_id } => {
                let res = dst.write(cookie_id).and_then(|()| dst.write(host_id));
                debug_assert!(res.is_ok());
            }
            Self::ConnectResp(resp) | Self::ReconnectResp(resp) => {
                write_connect_resp(&mut dst, resp);
            }
            Self::AllHere { src_id, conn_name } => {
                let res = dst.write(src_id);
                debug_assert!(res.is_ok());
                write_cstr(&mut dst, conn_name);
            }
            Self::DisconnectYou { reason }
            | Self::DisconnectOther { reason }
            | Self::ConnectDenied { reason }
            | Self::Status { reason } => {
                let res = dst.write(&reason.to_raw());
                debug_assert!(res.is_ok());
            }
            Self::MsgToRelay {
                cookie_id,
                src_id,
                dest_id,
                payload,
            }
            | Self::MsgFromRelay {
                cookie_id,
                src_id,
                dest_id,
                payload,
            } => {
                let res = dst
                    .write(cookie_id)
                    .and_then(|()| dst.write(src_id))
                    .and_then(|()| dst.write(dest_id));
                debug_assert!(res.is_ok());
                let res = dst.write_from(payload.clone());
                debug_assert!(res.is_ok());
            }
            Self::MsgToRelayNoConn {
                src_id,
                dest_id,
                payload,
            }
            | Self::MsgFromRelayNoConn {
                src_id,
                dest_id,
                payload,
            } => {
                let res = dst.write(src_id).and_then(|()| dst.write(dest_id));
                debug_assert!(res.is_ok());
                let res = dst.write_from(payload.clone());
                debug_assert!(res.is_ok());
            }
            Self::Ack { dest_id } => {
                let res = dst.write(dest_id);
                debug_assert!(res.is_ok());
            }
        }
        dst.freeze()
    }

    /// Parses one frame from `src`, consuming it entirely for the `Msg*`
    /// frames (the remainder is the forwarded game message).
    pub fn read_from(src: &mut Bytes) -> Result<Self, RelayWireError> {
        let raw = read_u8(src)?;
        let cmd = RelayCmd::from_raw(raw).ok_or(RelayWireError::UnknownCmd(raw))?;
        Ok(match cmd {
            RelayCmd::Connect => Self::Connect(read_connect_req(src)?),
            RelayCmd::Reconnect => {
                let req = read_connect_req(src)?;
                let host_id = RelayHostId(read_u8(src)?);
                let conn_name = read_cstr(src)?;
                Self::Reconnect {
                    req,
                    host_id,
                    conn_name,
                }
            }
            RelayCmd::Disconnect => Self::Disconnect {
                cookie_id: CookieId(read_u16(src)?),
                host_id: RelayHostId(read_u8(src)?),
            },
            RelayCmd::ConnectResp => Self::ConnectResp(read_connect_resp(src)?),
            RelayCmd::ReconnectResp => Self::ReconnectResp(read_connect_resp(src)?),
            RelayCmd::AllHere => Self::AllHere {
                src_id: RelayHostId(read_u8(src)?),
                conn_name: read_cstr(src)?,
            },
            RelayCmd::DisconnectYou => Self::DisconnectYou {
                reason: RelayReason::from_raw(read_u8(src)?),
            },
            RelayCmd::DisconnectOther => Self::DisconnectOther {
                reason: RelayReason::from_raw(read_u8(src)?),
            },
            RelayCmd::ConnectDenied => Self::ConnectDenied {
                reason: RelayReason::from_raw(read_u8(src)?),
            },
            RelayCmd::MsgToRelay => Self::MsgToRelay {
                cookie_id: CookieId(read_u16(src)?),
                src_id: RelayHostId(read_u8(src)?),
                dest_id: RelayHostId(read_u8(src)?),
                payload: take_rest(src),
            },
            RelayCmd::MsgFromRelay => Self::MsgFromRelay {
                cookie_id: CookieId(read_u16(src)?),
                src_id: RelayHostId(read_u8(src)?),
                dest_id: RelayHostId(read_u8(src)?),
                payload: take_rest(src),
            },
            RelayCmd::MsgToRelayNoConn => Self::MsgToRelayNoConn {
                src_id: RelayHostId(read_u8(src)?),
                dest_id: RelayHostId(read_u8(src)?),
                payload: take_rest(src),
            },
            RelayCmd::MsgFromRelayNoConn => Self::MsgFromRelayNoConn {
                src_id: RelayHostId(read_u8(src)?),
                dest_id: RelayHostId(read_u8(src)?),
                payload: take_rest(src),
            },
            RelayCmd::Ack => Self::Ack {
                dest_id: RelayHostId(read_u8(src)?),
            },
            RelayCmd::Status => Self::Status {
                reason: RelayReason::from_raw(read_u8(src)?),
            },
        })
    }
}

fn take_rest(src: &mut Bytes) -> Bytes {
    let len = src.remaining();
    src.read_next(len).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &RelayFrame) {
        let mut bytes = frame.to_bytes();
        assert_eq!(*frame, RelayFrame::read_from(&mut bytes).unwrap());
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn connect_round_trip() {
        round_trip(&RelayFrame::Connect(ConnectReq {
            room: "kitchen".into(),
            seeks_public: false,
            advertise: true,
            players_here: 1,
            players_total: 2,
            seed: 0xA1B0,
            lang: 1,
            dev_id: Some((2, "device-77".into())),
            client_index: 0,
        }));
    }

    #[test]
    fn reconnect_round_trip() {
        round_trip(&RelayFrame::Reconnect {
            req: ConnectReq {
                room: "kitchen".into(),
                players_here: 1,
                players_total: 2,
                seed: 0xA1B0,
                ..ConnectReq::default()
            },
            host_id: RelayHostId(2),
            conn_name: "kitchen/8f3a".into(),
        });
    }

    #[test]
    fn resp_and_msg_round_trips() {
        round_trip(&RelayFrame::ConnectResp(ConnectResp {
            host_id: RelayHostId(2),
            cookie_id: CookieId(0x1234),
            heartbeat: 60,
            players_sought: 2,
            players_here: 1,
            conn_name: "kitchen/8f3a".into(),
            dev_id: None,
        }));
        round_trip(&RelayFrame::MsgFromRelay {
            cookie_id: CookieId(0x1234),
            src_id: RelayHostId(1),
            dest_id: RelayHostId(2),
            payload: Bytes::from_static(b"framed game message"),
        });
        round_trip(&RelayFrame::Ack {
            dest_id: RelayHostId(2),
        });
        round_trip(&RelayFrame::ConnectDenied {
            reason: RelayReason::DupRoom,
        });
    }

    #[test]
    fn unknown_cmd_is_rejected() {
        let mut bytes = Bytes::from(vec![0xFF, 0x00]);
        assert_eq!(
            Err(RelayWireError::UnknownCmd(0xFF)),
            RelayFrame::read_from(&mut bytes)
        );
    }
}
