//! Typed binary codec used by every frame and RPC body in the protocol.
//!
//! All multi-byte integers are big-endian. A [`Reader`] walks a borrowed
//! byte slice and every typed read is failable: on failure it returns
//! `None` and leaves the offset untouched, so a caller can map each miss
//! to a precise decode error. A [`Writer`] mirrors the reader, and a
//! [`Calculator`] pre-computes the exact capacity a writer needs so frame
//! encoding allocates once.

use uuid::Uuid;

use crate::crypto::{Key, BLOCK_SIZE, KEY_SIZE};

/// Reads values previously packed by a [`Writer`].
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, offset: 0 }
    }

    /// Borrows `len` bytes and advances, or returns `None` without advancing.
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let next = self.offset.checked_add(len)?;
        if next > self.buf.len() {
            return None;
        }
        let result = &self.buf[self.offset..next];
        self.offset = next;
        Some(result)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn uuid(&mut self) -> Option<Uuid> {
        self.take(16).map(|b| Uuid::from_slice(b).unwrap())
    }

    /// Reads a `u32` length prefix followed by that many bytes. The offset
    /// does not move unless both parts are present.
    pub fn bytes(&mut self) -> Option<&'a [u8]> {
        let start = self.offset;
        let size = self.u32()? as usize;
        match self.take(size) {
            Some(data) => Some(data),
            None => {
                self.offset = start;
                None
            }
        }
    }

    /// Like [`Reader::bytes`] but validates the content as UTF-8.
    pub fn string(&mut self) -> Option<String> {
        let start = self.offset;
        let data = self.bytes()?;
        match std::str::from_utf8(data) {
            Ok(s) => Some(s.to_owned()),
            Err(_) => {
                self.offset = start;
                None
            }
        }
    }

    pub fn key(&mut self) -> Option<Key> {
        self.take(Key::SIZE).map(|b| Key::from_bytes(b.try_into().unwrap()))
    }

    /// Returns the unread tail without copying or advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.offset..]
    }
}

/// Produces byte slices for a [`Reader`] to read.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates a writer with the given capacity, usually obtained from a
    /// [`Calculator`].
    pub fn with_capacity(cap: usize) -> Writer {
        Writer { buf: Vec::with_capacity(cap) }
    }

    pub fn u32(&mut self, value: u32) -> &mut Writer {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Writer {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn uuid(&mut self, value: Uuid) -> &mut Writer {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn key(&mut self, value: &Key) -> &mut Writer {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Writes the length of the slice as a `u32` followed by the slice.
    pub fn bytes(&mut self, value: &[u8]) -> &mut Writer {
        self.u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    /// Writes the length of the string as a `u32` followed by its bytes.
    pub fn string(&mut self, value: &str) -> &mut Writer {
        self.bytes(value.as_bytes())
    }

    /// Appends the slice with no length prefix.
    pub fn rest(&mut self, value: &[u8]) -> &mut Writer {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

/// Readable accounting of a [`Writer`]'s capacity. Saves the reallocation
/// without sprinkling magic constants at the encode sites.
#[derive(Default)]
pub struct Calculator {
    offset: usize,
}

impl Calculator {
    /// Accounts for padding up to the next multiple of `chunk`; always at
    /// least one byte, a full chunk when already aligned. This is exactly
    /// the size the cipher padding appends.
    pub fn pad(&mut self, chunk: usize) -> &mut Calculator {
        self.offset += chunk - (self.offset % chunk);
        self
    }

    pub fn u32(&mut self) -> &mut Calculator {
        self.offset += 4;
        self
    }

    pub fn u64(&mut self) -> &mut Calculator {
        self.offset += 8;
        self
    }

    pub fn uuid(&mut self) -> &mut Calculator {
        self.offset += 16;
        self
    }

    pub fn key(&mut self) -> &mut Calculator {
        self.offset += KEY_SIZE + BLOCK_SIZE * 2;
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Calculator {
        self.offset += 4 + value.len();
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Calculator {
        self.offset += 4 + value.len();
        self
    }

    pub fn rest(&mut self, value: &[u8]) -> &mut Calculator {
        self.offset += value.len();
        self
    }

    pub fn to_writer(&self) -> Writer {
        Writer::with_capacity(self.offset)
    }

    pub fn value(&self) -> usize {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_mixed_sequence() {
        let id = Uuid::new_v4();
        let key = Key::generate();

        let mut calc = Calculator::default();
        calc.u32()
            .uuid()
            .string("hello")
            .bytes(&[1, 2, 3])
            .u64()
            .key()
            .rest(&[9, 9]);

        let mut writer = calc.to_writer();
        writer
            .u32(0xDEAD_BEEF)
            .uuid(id)
            .string("hello")
            .bytes(&[1, 2, 3])
            .u64(u64::MAX - 1)
            .key(&key)
            .rest(&[9, 9]);

        assert_eq!(calc.value(), writer.buffer().len());

        let buf = writer.into_buffer();
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.u32(), Some(0xDEAD_BEEF));
        assert_eq!(reader.uuid(), Some(id));
        assert_eq!(reader.string().as_deref(), Some("hello"));
        assert_eq!(reader.bytes(), Some(&[1u8, 2, 3][..]));
        assert_eq!(reader.u64(), Some(u64::MAX - 1));
        assert_eq!(reader.key().map(|k| *k.as_bytes()), Some(*key.as_bytes()));
        assert_eq!(reader.rest(), &[9, 9]);
    }

    #[test]
    fn failed_read_does_not_advance() {
        let mut writer = Writer::with_capacity(8);
        writer.u32(7);
        let buf = writer.into_buffer();

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.uuid(), None);
        assert_eq!(reader.u64(), None);
        assert_eq!(reader.u32(), Some(7));
    }

    #[test]
    fn truncated_bytes_do_not_advance() {
        let mut writer = Writer::with_capacity(16);
        writer.u32(100).rest(&[1, 2, 3]);
        let buf = writer.into_buffer();

        let mut reader = Reader::new(&buf);
        // Length prefix promises 100 bytes, only 3 are present.
        assert_eq!(reader.bytes(), None);
        assert_eq!(reader.u32(), Some(100));
        assert_eq!(reader.rest(), &[1, 2, 3]);
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut writer = Writer::with_capacity(8);
        writer.bytes(&[0xFF, 0xFE]);
        let buf = writer.into_buffer();

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.string(), None);
        // Offset must be untouched so the caller can retry as raw bytes.
        assert_eq!(reader.bytes(), Some(&[0xFF, 0xFE][..]));
    }

    #[test]
    fn pad_rounds_to_next_multiple() {
        let mut calc = Calculator::default();
        calc.u32().pad(16);
        assert_eq!(calc.value(), 16);

        let mut aligned = Calculator::default();
        aligned.uuid().pad(16);
        // A full extra block when already aligned, like cipher padding.
        assert_eq!(aligned.value(), 32);
    }

    #[test]
    fn uuid_textual_forms_roundtrip() {
        let id = Uuid::new_v4();
        assert_eq!(Uuid::try_parse(&id.simple().to_string()).unwrap(), id);
        assert_eq!(Uuid::try_parse(&id.hyphenated().to_string()).unwrap(), id);
        assert!(Uuid::nil().is_nil());
    }

    #[test]
    fn empty_sized_reads() {
        let mut writer = Writer::with_capacity(8);
        writer.bytes(&[]).string("");
        let buf = writer.into_buffer();

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.bytes(), Some(&[][..]));
        assert_eq!(reader.string().as_deref(), Some(""));
        assert!(reader.rest().is_empty());
    }
}
