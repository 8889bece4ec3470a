//! Unsigned LEB128 varints used for frame headers

use bytes::BufMut;

/// Longest encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Outcome of reading a varint from a possibly incomplete buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Varint {
    /// A complete value and the number of bytes it occupied
    Value(u64, usize),
    /// The buffer ends in the middle of the varint
    Incomplete,
    /// More than ten bytes, or bits beyond 64
    Overflow,
}

/// Append `value` to `buf`
pub fn encode(mut value: u64, buf: &mut impl BufMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Number of bytes `encode` writes for `value`
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Read a varint from the front of `buf` without consuming it.
///
/// Non-minimal encodings such as `[0x80, 0x00]` are accepted.
pub fn decode(buf: &[u8]) -> Varint {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Varint::Overflow;
        }
        let low = u64::from(byte & 0x7f);
        // the tenth byte may only carry the single remaining bit
        if i == MAX_VARINT_LEN - 1 && low > 1 {
            return Varint::Overflow;
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Varint::Value(value, i + 1);
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Varint::Overflow
    } else {
        Varint::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_single_byte_values() {
        let mut buf = BytesMut::new();
        encode(0, &mut buf);
        encode(127, &mut buf);
        assert_eq!(&buf[..], &[0x00, 0x7f]);
    }

    #[test]
    fn test_multi_byte_value() {
        let mut buf = BytesMut::new();
        encode(300, &mut buf);
        assert_eq!(&buf[..], &[0xac, 0x02]);
        assert_eq!(decode(&buf), Varint::Value(300, 2));
        assert_eq!(encoded_len(300), 2);
    }

    #[test]
    fn test_max_value() {
        let mut buf = BytesMut::new();
        encode(u64::MAX, &mut buf);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(encoded_len(u64::MAX), MAX_VARINT_LEN);
        assert_eq!(decode(&buf), Varint::Value(u64::MAX, MAX_VARINT_LEN));
    }

    #[test]
    fn test_incomplete() {
        assert_eq!(decode(&[]), Varint::Incomplete);
        assert_eq!(decode(&[0x80, 0x80]), Varint::Incomplete);
    }

    #[test]
    fn test_non_minimal_accepted() {
        assert_eq!(decode(&[0x80, 0x00]), Varint::Value(0, 2));
    }

    #[test]
    fn test_overflow() {
        assert_eq!(decode(&[0xff; 11]), Varint::Overflow);
        let mut too_big = vec![0xff; 9];
        too_big.push(0x02);
        assert_eq!(decode(&too_big), Varint::Overflow);
    }
}
