//! In-process consumers used to exercise the racer without a real backend.

mod backend;
pub use backend::{Backend, Config, Context, Execution, Handle};

use crate::Error;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix written by [message].
pub const PREFIX_LEN: usize = 4;

/// Lay out `body` as auxiliary data understood by [Backend]: a little-endian `u32` length
/// prefix followed by the body, zero-padded to `len` bytes.
///
/// Fails with [Error::MessageTooLarge] if `body` (plus its prefix) does not fit in `len` bytes
/// or its length does not fit the prefix.
pub fn message(body: &[u8], len: usize) -> Result<Bytes, Error> {
    let too_large = || Error::MessageTooLarge {
        body: body.len(),
        len,
    };
    let prefix = u32::try_from(body.len()).map_err(|_| too_large())?;
    if body.len().checked_add(PREFIX_LEN).map_or(true, |needed| needed > len) {
        return Err(too_large());
    }
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32_le(prefix);
    buf.put_slice(body);
    buf.resize(len, 0);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_message_layout() {
        let page = message(b"hello", 16).unwrap();
        assert_eq!(page.len(), 16);
        assert_eq!(&page[..PREFIX_LEN], &5u32.to_le_bytes());
        assert_eq!(&page[PREFIX_LEN..9], b"hello");
        assert!(page[9..].iter().all(|byte| *byte == 0));
    }

    #[test_traced]
    fn test_message_too_large() {
        assert!(message(b"hello", 9).is_ok());
        assert!(matches!(
            message(b"hello", 8),
            Err(Error::MessageTooLarge { body: 5, len: 8 })
        ));
        assert!(matches!(
            message(b"", 3),
            Err(Error::MessageTooLarge { body: 0, len: 3 })
        ));
    }
}
