//! Small codec helpers shared by the wire and persistence formats.

use octs::{Bytes, BytesMut, Read, Write};

/// Failed to read a string field off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StrError {
    /// Input ended mid-string.
    #[error("buffer too short")]
    TooShort,
    /// The bytes were not valid UTF-8.
    #[error("string is not valid UTF-8")]
    NotUtf8,
}

/// Writes a length-prefixed string: `u8` byte length, then the bytes.
///
/// Used by the persistence format. Strings longer than 255 bytes are
/// truncated at the prefix limit (none of the persisted fields can legally
/// get that long).
pub(crate) fn write_str8(dst: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= usize::from(u8::MAX));
    let len = u8::try_from(s.len()).unwrap_or(u8::MAX);
    let res = dst.write(&len);
    debug_assert!(res.is_ok());
    let res = dst.write_from(&s.as_bytes()[..usize::from(len)]);
    debug_assert!(res.is_ok());
}

/// Reads a string written by [`write_str8`].
pub(crate) fn read_str8(src: &mut Bytes) -> Result<String, StrError> {
    let len = src.read::<u8>().map_err(|_| StrError::TooShort)?;
    let bytes = src
        .read_next(usize::from(len))
        .map_err(|_| StrError::TooShort)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| StrError::NotUtf8)
}

/// Writes a nul-terminated string, the form the relay wire protocol uses.
pub(crate) fn write_cstr(dst: &mut BytesMut, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0));
    let res = dst.write_from(s.as_bytes());
    debug_assert!(res.is_ok());
    let res = dst.write(&0u8);
    debug_assert!(res.is_ok());
}

/// Reads a string written by [`write_cstr`], consuming the terminator.
pub(crate) fn read_cstr(src: &mut Bytes) -> Result<String, StrError> {
    let mut bytes = Vec::new();
    loop {
        let b = src.read::<u8>().map_err(|_| StrError::TooShort)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|_| StrError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use octs::Buf;

    use super::*;

    #[test]
    fn str8_round_trip() {
        let mut buf = BytesMut::new();
        write_str8(&mut buf, "kitchen table");
        write_str8(&mut buf, "");
        let mut bytes = buf.freeze();
        assert_eq!("kitchen table", read_str8(&mut bytes).unwrap());
        assert_eq!("", read_str8(&mut bytes).unwrap());
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn cstr_round_trip() {
        let mut buf = BytesMut::new();
        write_cstr(&mut buf, "room/4");
        let mut bytes = buf.freeze();
        assert_eq!("room/4", read_cstr(&mut bytes).unwrap());
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn truncated_strings() {
        let mut bytes = Bytes::from(vec![5, b'a', b'b']);
        assert_eq!(Err(StrError::TooShort), read_str8(&mut bytes));

        let mut bytes = Bytes::from(vec![b'a', b'b']);
        assert_eq!(Err(StrError::TooShort), read_cstr(&mut bytes));
    }
}
