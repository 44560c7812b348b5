//! SSH data type encoding (RFC 4251 Section 5).
//!
//! ```text
//! byte, boolean, uint32, uint64, string, mpint, name-list
//! ```
//!
//! Writers append to a [`BytesMut`]; [`Reader`] is a bounds-checked cursor
//! over a received payload.

use bytes::{BufMut, BytesMut};
use num_bigint::BigUint;
use tessera_platform::{TesseraError, TesseraResult};

/// Appends an SSH `string` (uint32 length + bytes).
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Appends a UTF-8 `string`.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Appends a `boolean`.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Appends a comma-separated `name-list`.
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, &names.join(","));
}

/// Appends an `mpint` from big-endian magnitude bytes.
pub fn put_mpint_bytes(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Appends an `mpint`.
pub fn put_mpint(buf: &mut BytesMut, value: &BigUint) {
    put_mpint_bytes(buf, &value.to_bytes_be());
}

/// Encodes unsigned big-endian bytes as an SSH `mpint`.
///
/// Leading zeros are stripped; a zero byte is prepended when the high bit is
/// set so the value stays positive. Zero encodes as an empty string.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let pad = trimmed[0] & 0x80 != 0;
    let length = trimmed.len() + usize::from(pad);

    let mut out = Vec::with_capacity(4 + length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Bounds-checked cursor over an SSH payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Starts reading after the leading message-type byte.
    pub fn after_type(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: usize::from(!data.is_empty()),
        }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    /// Returns true once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, n: usize, what: &str) -> TesseraResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                TesseraError::Protocol(format!(
                    "Truncated {}: need {} bytes at offset {}, have {}",
                    what,
                    n,
                    self.offset,
                    self.data.len().saturating_sub(self.offset)
                ))
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> TesseraResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a `boolean`.
    pub fn read_bool(&mut self) -> TesseraResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self) -> TesseraResult<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a `uint64`.
    pub fn read_u64(&mut self) -> TesseraResult<u64> {
        let b = self.take(8, "uint64")?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads `n` raw bytes.
    pub fn read_raw(&mut self, n: usize) -> TesseraResult<&'a [u8]> {
        self.take(n, "raw bytes")
    }

    /// Reads a `string` as raw bytes.
    pub fn read_bytes(&mut self) -> TesseraResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a `string` that must be valid UTF-8.
    pub fn read_string(&mut self) -> TesseraResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TesseraError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads a `name-list`.
    pub fn read_name_list(&mut self) -> TesseraResult<Vec<String>> {
        let list = self.read_string()?;
        if list.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(list.split(',').map(String::from).collect())
        }
    }

    /// Reads an `mpint`; negative values are rejected.
    pub fn read_mpint(&mut self) -> TesseraResult<BigUint> {
        let bytes = self.read_bytes()?;
        if bytes.first().is_some_and(|b| b & 0x80 != 0) {
            return Err(TesseraError::Protocol(
                "Negative mpint where a positive value was required".to_string(),
            ));
        }
        Ok(BigUint::from_bytes_be(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_mpint() {
        assert_eq!(encode_mpint(&[]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0x12, 0x34]), vec![0, 0, 0, 2, 0x12, 0x34]);
        assert_eq!(encode_mpint(&[0x80, 0x00]), vec![0, 0, 0, 3, 0, 0x80, 0x00]);
        assert_eq!(
            encode_mpint(&[0x00, 0x00, 0x12, 0x34]),
            vec![0, 0, 0, 2, 0x12, 0x34]
        );
    }

    #[test]
    fn test_reader_sequence() {
        let mut buf = BytesMut::new();
        buf.put_u8(94);
        buf.put_u32(7);
        put_string(&mut buf, "exec");
        put_bool(&mut buf, true);
        put_name_list(&mut buf, &["a".to_string(), "b".to_string()]);

        let mut r = Reader::after_type(&buf);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_string().unwrap(), "exec");
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_name_list().unwrap(), vec!["a", "b"]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_truncated() {
        let data = [0u8, 0, 0, 10, b'x'];
        let mut r = Reader::new(&data);
        let err = r.read_bytes().unwrap_err();
        assert!(matches!(err, TesseraError::Protocol(msg) if msg.contains("Truncated")));
    }

    #[test]
    fn test_reader_rejects_huge_length() {
        let data = [0xff, 0xff, 0xff, 0xff];
        let mut r = Reader::new(&data);
        assert!(r.read_bytes().is_err());
    }

    #[test]
    fn test_negative_mpint_rejected() {
        let data = [0, 0, 0, 1, 0x80];
        assert!(Reader::new(&data).read_mpint().is_err());
    }

    proptest! {
        #[test]
        fn prop_mpint_preserves_value(bytes in proptest::collection::vec(any::<u8>(), 0..80)) {
            let value = BigUint::from_bytes_be(&bytes);
            let mut buf = BytesMut::new();
            put_mpint(&mut buf, &value);
            let decoded = Reader::new(&buf).read_mpint().unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_reader_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut r = Reader::new(&bytes);
            let _ = r.read_string();
            let _ = r.read_mpint();
            let _ = r.read_name_list();
        }
    }
}
