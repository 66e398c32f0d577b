//! Append-and-slice byte accumulator used for command and data payloads.

use crate::error::Error;
use scroll::{Pread, BE, LE};

/// A growable byte buffer with little/big-endian helpers.
///
/// Writers append at the end; readers take a byte offset into the
/// accumulated bytes. Reads past the end are treated as malformed-protocol
/// failures rather than panics, since the offsets usually come straight out
/// of probe responses.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Grows or shrinks the buffer to `len` bytes, zero-filling new space.
    pub(crate) fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn read_u16_le(&self, offset: usize) -> Result<u16, Error> {
        self.data
            .pread_with(offset, LE)
            .map_err(|_| self.short_read(offset, 2))
    }

    pub fn read_u16_be(&self, offset: usize) -> Result<u16, Error> {
        self.data
            .pread_with(offset, BE)
            .map_err(|_| self.short_read(offset, 2))
    }

    pub fn read_u32_le(&self, offset: usize) -> Result<u32, Error> {
        self.data
            .pread_with(offset, LE)
            .map_err(|_| self.short_read(offset, 4))
    }

    pub fn read_u32_be(&self, offset: usize) -> Result<u32, Error> {
        self.data
            .pread_with(offset, BE)
            .map_err(|_| self.short_read(offset, 4))
    }

    fn short_read(&self, offset: usize, want: usize) -> Error {
        Error::Protocol(format!(
            "response too short: need {} bytes at offset {}, have {}",
            want,
            offset,
            self.data.len()
        ))
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn u32_le_round_trip() {
        for value in [0u32, 1, 0xdead_beef, u32::MAX] {
            let mut buf = Buffer::new();
            buf.write_u32_le(value);
            assert_eq!(buf.read_u32_le(0).unwrap(), value);
        }
    }

    #[test]
    fn u16_round_trip() {
        let mut buf = Buffer::new();
        buf.write_u16_le(0x1234);
        assert_eq!(buf.read_u16_le(0).unwrap(), 0x1234);
        assert_eq!(buf.read_u16_be(0).unwrap(), 0x3412);
    }

    #[test]
    fn little_endian_layout() {
        let mut buf = Buffer::new();
        buf.write_u32_le(0x0102_0304);
        assert_eq!(buf.bytes(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn big_endian_reader_reverses() {
        let mut buf = Buffer::new();
        buf.extend(&[0x20, 0xe5]);
        assert_eq!(buf.read_u16_be(0).unwrap(), 0x20e5);
        assert_eq!(buf.read_u16_le(0).unwrap(), 0xe520);
    }

    #[test]
    fn out_of_range_read_is_protocol_error() {
        let mut buf = Buffer::new();
        buf.write_u8(0xff);
        assert!(matches!(buf.read_u32_le(0), Err(Error::Protocol(_))));
        assert!(matches!(buf.read_u16_le(1), Err(Error::Protocol(_))));
    }
}
