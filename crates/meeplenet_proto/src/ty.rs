//! Definitions for types carried by the game-message protocol.
//!
//! This module only contains the type definitions themselves, to make it easy
//! to understand the whole protocol at a glance, and to have centralized
//! documentation on how the protocol works. The actual logic is implemented
//! in different modules.
//!
//! The layout of a single game message on the wire is:
//!
//! ```rust,ignore
//! struct GameFrame {
//!     marker: u16,        // optional, [`FRAME_MARKER`]
//!     flags: FrameFlags,  // present iff the marker is
//!     header: FrameHeader,
//!     payload: [u8],      // opaque, owned by the rules engine
//! }
//! ```
//!
//! The marker/flags prefix is emitted when [`EMIT_HEADER_FLAGS`] says so; a
//! receiver probes for the marker and, if absent, interprets the first four
//! bytes as the connection id. This keeps devices running older builds able
//! to talk to newer ones.

use bitflags::bitflags;
use derive_more::{Add, AddAssign, Display, From};

/// Probe value announcing that a [`FrameFlags`] word follows.
pub const FRAME_MARKER: u16 = 0xBEEF;

/// Protocol version carried in the low bits of [`FrameFlags`].
pub const PROTO_VERSION: u16 = 1;

/// Whether outbound frames carry the marker/flags prefix.
///
/// Kept as a constant rather than a config knob: all current builds emit it,
/// and the receive path tolerates both forms regardless.
pub const EMIT_HEADER_FLAGS: bool = true;

/// Sequence number of a game message on a single channel.
///
/// Sequences are assigned per channel, starting at `1` and strictly
/// monotone. `0` is reserved for the *initial* message: the one sent before
/// the remote peer has assigned us a channel number.
///
/// Unlike a transport-level packet sequence this is a [`u32`], so wraparound
/// is not a practical concern: board games exchange a few thousand moves at
/// most over their lifetime.
#[derive(
    Debug, Clone, Copy, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash, From, Add, AddAssign,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct MsgSeq(pub u32);

/// Identifier of a logical channel between two participants.
///
/// The low [`ChannelId::MASK`] bits are the *channel number* within the game
/// (`0` means "not yet assigned to a specific peer"); the remaining high bits
/// are a device-chosen *seed*, stable for the life of the session, used to
/// tell apart initial messages from different devices that cross on the
/// wire.
#[derive(Debug, Clone, Copy, Default, Display, PartialEq, Eq, Hash, From)]
#[display("{_0:#06x}")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct ChannelId(pub u16);

/// Session-wide connection identifier.
///
/// Zero until the server-role participant assigns one; thereafter shared by
/// every participant and carried in every frame.
#[derive(Debug, Clone, Copy, Default, Display, PartialEq, Eq, Hash, From)]
#[display("{_0:#010x}")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct ConnId(pub u32);

/// Opaque token the host presents when asking for serialization, and echoes
/// back once the bytes have durably hit storage.
#[derive(Debug, Clone, Copy, Default, Display, PartialEq, Eq, Hash, From)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SaveToken(pub u16);

/// Identifier the relay assigns to each device in a room.
///
/// `0` means unset; the server-role device is always `1`.
#[derive(Debug, Clone, Copy, Default, Display, PartialEq, Eq, Hash, From)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct RelayHostId(pub u8);

/// Ephemeral identifier the relay assigns to a connected room instance.
///
/// Not persisted: it is only valid while the relay connection lives.
#[derive(Debug, Clone, Copy, Default, Display, PartialEq, Eq, Hash, From)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct CookieId(pub u16);

bitflags! {
    /// Feature word following [`FRAME_MARKER`] on the wire.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u16 {
        /// Low bits carrying the sender's [`PROTO_VERSION`].
        const VERSION_MASK = 0x000F;
        /// The sender believes it holds the server role.
        const FROM_SERVER = 0x0010;
    }
}

/// Fixed header of every game message, after the optional marker/flags
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct FrameHeader {
    /// Connection identifier; [`ConnId::NONE`] on the very first message.
    pub conn_id: ConnId,
    /// Channel the message rides on.
    pub channel: ChannelId,
    /// Sequence of this message on its channel.
    pub seq: MsgSeq,
    /// Highest sequence the sender has durably saved from the other side.
    pub ack: MsgSeq,
}

impl MsgSeq {
    /// Sequence of an initial message, before a channel is established.
    pub const INITIAL: Self = Self(0);

    /// First in-session sequence.
    pub const ONE: Self = Self(1);

    /// The sequence directly after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl ChannelId {
    /// Bits of a [`ChannelId`] holding the channel number.
    ///
    /// This bounds how many peers one session can talk to: the server-role
    /// allocator hands out numbers `1..=MASK`.
    pub const MASK: u16 = 0x000F;

    /// Channel with no number and no seed; only ever seen before a session
    /// has generated its seed.
    pub const NONE: Self = Self(0);

    /// Gets the channel number within the game.
    #[must_use]
    pub const fn number(self) -> u16 {
        self.0 & Self::MASK
    }

    /// Gets the device seed bits, with the number bits cleared.
    #[must_use]
    pub const fn seed_bits(self) -> u16 {
        self.0 & !Self::MASK
    }

    /// Whether the number bits are still unassigned.
    #[must_use]
    pub const fn is_unassigned(self) -> bool {
        self.number() == 0
    }

    /// Returns this channel with its number bits replaced by `number`.
    #[must_use]
    pub const fn with_number(self, number: u16) -> Self {
        Self(self.seed_bits() | (number & Self::MASK))
    }

    /// Whether `self` and `other` agree when the seed bits are ignored,
    /// i.e. they name the same slot in the game, possibly minted by
    /// different devices.
    #[must_use]
    pub const fn same_number(self, other: Self) -> bool {
        self.number() == other.number()
    }
}

impl ConnId {
    /// "No session yet".
    pub const NONE: Self = Self(0);

    /// Whether a connection identifier has been assigned.
    #[must_use]
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl RelayHostId {
    /// Unset.
    pub const NONE: Self = Self(0);

    /// The id the relay reserves for the server-role device.
    pub const SERVER: Self = Self(1);
}

impl CookieId {
    /// Unset.
    pub const NONE: Self = Self(0);
}

impl FrameFlags {
    /// Builds the flag word a session with the given role emits.
    #[must_use]
    pub fn for_role(is_server: bool) -> Self {
        let mut flags = Self::from_bits_retain(PROTO_VERSION);
        if is_server {
            flags |= Self::FROM_SERVER;
        }
        flags
    }

    /// Gets the protocol version bits.
    #[must_use]
    pub const fn version(self) -> u16 {
        self.bits() & Self::VERSION_MASK.bits()
    }
}
