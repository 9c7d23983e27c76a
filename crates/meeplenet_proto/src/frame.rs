//! Building and parsing the framed game-message envelope.
//!
//! See [`FrameHeader`] for the layout. Validation that needs session state
//! (role bits, seed agreement, connection id) lives in the session's receive
//! path; this module only knows how to get bytes on and off the wire.

use std::convert::Infallible;

use octs::{BufTooShortOr, Bytes, BytesMut, Decode, Encode, FixedEncodeLen, Read, Write};

use crate::ty::{
    ChannelId, ConnId, CookieId, FrameFlags, FrameHeader, MsgSeq, RelayHostId, EMIT_HEADER_FLAGS,
    FRAME_MARKER,
};

/// Failed to parse a framed game message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Input ended before the fixed header was complete.
    #[error("frame too short")]
    TooShort,
}

macro_rules! transparent_codec {
    ($ty:ty, $base:ty) => {
        impl FixedEncodeLen for $ty {
            const ENCODE_LEN: usize = <$base as FixedEncodeLen>::ENCODE_LEN;
        }

        impl Encode for $ty {
            type Error = Infallible;

            fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
                dst.write(&self.0)
            }
        }

        impl Decode for $ty {
            type Error = Infallible;

            fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
                Ok(Self(src.read()?))
            }
        }
    };
}

transparent_codec!(MsgSeq, u32);
transparent_codec!(ChannelId, u16);
transparent_codec!(ConnId, u32);
transparent_codec!(RelayHostId, u8);
transparent_codec!(CookieId, u16);

impl FixedEncodeLen for FrameFlags {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for FrameFlags {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.bits())
    }
}

impl Decode for FrameFlags {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self::from_bits_retain(src.read()?))
    }
}

impl FixedEncodeLen for FrameHeader {
    const ENCODE_LEN: usize =
        ConnId::ENCODE_LEN + ChannelId::ENCODE_LEN + MsgSeq::ENCODE_LEN + MsgSeq::ENCODE_LEN;
}

impl Encode for FrameHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.conn_id)?;
        dst.write(&self.channel)?;
        dst.write(&self.seq)?;
        dst.write(&self.ack)?;
        Ok(())
    }
}

impl Decode for FrameHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            conn_id: src.read()?,
            channel: src.read()?,
            seq: src.read()?,
            ack: src.read()?,
        })
    }
}

/// Builds the full framed bytes for one game message: optional marker/flags
/// prefix, header, then the payload verbatim.
#[must_use]
pub fn build(flags: FrameFlags, header: FrameHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        FrameFlags::ENCODE_LEN * 2 + FrameHeader::ENCODE_LEN + payload.len(),
    );
    let write = |buf: &mut BytesMut| -> Result<(), BufTooShortOr<Infallible>> {
        if EMIT_HEADER_FLAGS {
            buf.write(&FRAME_MARKER)?;
            buf.write(&flags)?;
        }
        buf.write(&header)?;
        buf.write_from(payload)?;
        Ok(())
    };
    // BytesMut grows on demand, so the writes cannot fail
    let res = write(&mut buf);
    debug_assert!(res.is_ok());
    buf.freeze()
}

/// Parses the envelope off the front of `buf`, leaving `buf` at the payload.
///
/// Probes for [`FRAME_MARKER`]; if the first two bytes are not the marker the
/// read position rewinds and they are interpreted as the start of the
/// connection id. Returns the flags actually found ([`FrameFlags::empty`]
/// when the sender emitted none, i.e. a sender predating the marker).
///
/// # Errors
///
/// Errors if `buf` ends before the fixed header is complete.
pub fn read_envelope(buf: &mut Bytes) -> Result<(FrameFlags, FrameHeader), FrameError> {
    if buf.len() < FrameHeader::ENCODE_LEN {
        return Err(FrameError::TooShort);
    }

    let mut flags = FrameFlags::empty();
    let mut probe = buf.clone();
    if matches!(probe.read::<u16>(), Ok(marker) if marker == FRAME_MARKER) {
        let found = probe.read::<FrameFlags>().map_err(|_| FrameError::TooShort)?;
        *buf = probe;
        flags = found;
        if buf.len() < FrameHeader::ENCODE_LEN {
            return Err(FrameError::TooShort);
        }
    }

    let header = buf
        .read::<FrameHeader>()
        .map_err(|_| FrameError::TooShort)?;
    Ok((flags, header))
}
