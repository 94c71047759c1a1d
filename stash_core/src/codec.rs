//! Little-endian binary encoding shared by the state file, the snapshot
//! cache file and stream tree nodes.
//!
//! Strings are written as a `u32` byte length followed by UTF-8 bytes.
//! Booleans are a single byte, `0` or `1`.

use crate::error::{Error, Result};
use crate::hash::{HASH_SIZE, Hash};

/// Appends encoded values to a byte buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a collection length as an `i32`.
    pub fn write_len(&mut self, len: usize) {
        self.write_i32(len as i32);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_hash(&mut self, hash: &Hash) {
        self.buf.extend_from_slice(hash.as_bytes());
    }

    /// Write a length-prefixed byte blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Write raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Consume the encoder and return the encoded bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads values back out of an encoded byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// True once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Error::corrupted_state(format!(
                    "Unexpected end of data: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::corrupted_state(format!(
                "Invalid boolean byte: {}",
                other
            ))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read a collection length written by [`Encoder::write_len`].
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_i32()?;
        usize::try_from(len)
            .map_err(|_| Error::corrupted_state(format!("Negative length: {}", len)))
    }

    /// Read an entry count for entries of at least `min_entry_size` bytes
    /// each. A count the remaining input cannot hold is rejected, so it is
    /// safe to preallocate from.
    pub fn read_count(&mut self, min_entry_size: usize) -> Result<usize> {
        let count = self.read_len()?;
        let fits = count
            .checked_mul(min_entry_size.max(1))
            .is_some_and(|needed| needed <= self.remaining());
        if !fits {
            return Err(Error::corrupted_state(format!(
                "Count {} exceeds the {} remaining bytes",
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::corrupted_state(format!("Invalid UTF-8 in string: {}", e)))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        Ok(Hash::from_bytes(self.take_array::<HASH_SIZE>()?))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Read exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_values() {
        let hash = Hash::hash_bytes(b"codec");
        let mut enc = Encoder::new();
        enc.write_i32(-7);
        enc.write_bool(true);
        enc.write_u32(42);
        enc.write_str("Engine/Source");
        enc.write_hash(&hash);
        enc.write_i64(i64::MIN);
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_i32().unwrap(), -7);
        assert!(dec.read_bool().unwrap());
        assert_eq!(dec.read_u32().unwrap(), 42);
        assert_eq!(dec.read_str().unwrap(), "Engine/Source");
        assert_eq!(dec.read_hash().unwrap(), hash);
        assert_eq!(dec.read_i64().unwrap(), i64::MIN);
        assert!(dec.is_empty());
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut enc = Encoder::new();
        enc.write_str("truncated");
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            dec.read_str(),
            Err(Error::CorruptedState { .. })
        ));
    }

    #[test]
    fn test_invalid_bool_and_negative_len() {
        let mut dec = Decoder::new(&[2]);
        assert!(dec.read_bool().is_err());

        let bytes = (-1i32).to_le_bytes();
        let mut dec = Decoder::new(&bytes);
        assert!(dec.read_len().is_err());
    }

    #[test]
    fn test_count_bounded_by_remaining_bytes() {
        let mut enc = Encoder::new();
        enc.write_len(2);
        enc.write_raw(&[0u8; 8]);
        let bytes = enc.finish();
        assert_eq!(Decoder::new(&bytes).read_count(4).unwrap(), 2);
        assert!(Decoder::new(&bytes).read_count(5).is_err());

        let bytes = i32::MAX.to_le_bytes();
        let mut dec = Decoder::new(&bytes);
        assert!(matches!(
            dec.read_count(1),
            Err(Error::CorruptedState { .. })
        ));
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Property 1: Arbitrary truncation never panics, it errors or succeeds
        #[test]
        fn prop_truncation_never_panics(s in ".{0,64}", cut in 0usize..80) {
            let mut enc = Encoder::new();
            enc.write_str(&s);
            enc.write_u64(9);
            let bytes = enc.finish();
            let cut = cut.min(bytes.len());

            let mut dec = Decoder::new(&bytes[..cut]);
            let _ = dec.read_str().and_then(|_| dec.read_u64());
        }
    }
}
