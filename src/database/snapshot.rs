//! # Snapshot Format
//!
//! Serialization of a whole dataset to its backing file. The layout is a
//! fixed 16-byte header followed by length-prefixed records until
//! end-of-file:
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic: "TkrzTINY"
//! 8       1     Format version (1)
//! 9       3     Reserved (zero)
//! 12      4     Bucket count hint (big-endian u32)
//! 16      ...   Records: varint key_len | varint value_len | key | value
//! ```
//!
//! Writers emit records in bucket-major insertion order at the moment of
//! serialization. Readers validate the magic and version, then ignore the
//! bucket hint and choose their own table size. Any truncated or oversized
//! field fails `BrokenData`; a snapshot is either parsed in full or
//! rejected.

use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::MAX_RECORD_LEN;
use crate::encoding::varint::{decode_varint, encode_varint, MAX_VARINT_LEN};
use crate::error::{Error, Result};

pub(crate) const SNAPSHOT_MAGIC: [u8; 8] = *b"TkrzTINY";
pub(crate) const SNAPSHOT_VERSION: u8 = 1;
pub(crate) const SNAPSHOT_HEADER_LEN: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct SnapshotHeader {
    magic: [u8; 8],
    version: u8,
    reserved: [u8; 3],
    bucket_hint: U32<BigEndian>,
}

const _: () = assert!(std::mem::size_of::<SnapshotHeader>() == SNAPSHOT_HEADER_LEN);

impl SnapshotHeader {
    pub(crate) fn new(bucket_hint: u32) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            reserved: [0; 3],
            bucket_hint: U32::new(bucket_hint),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(Error::broken_data("bad snapshot magic"));
        }
        if self.version != SNAPSHOT_VERSION {
            return Err(Error::broken_data(format!(
                "unsupported snapshot version: {}",
                self.version
            )));
        }
        Ok(())
    }

    pub(crate) fn bucket_hint(&self) -> u32 {
        self.bucket_hint.get()
    }
}

/// Appends one framed record to `buf`.
pub(crate) fn encode_record(key: &[u8], value: &[u8], buf: &mut Vec<u8>) {
    let mut scratch = [0u8; MAX_VARINT_LEN];
    let n = encode_varint(key.len() as u64, &mut scratch);
    buf.extend_from_slice(&scratch[..n]);
    let n = encode_varint(value.len() as u64, &mut scratch);
    buf.extend_from_slice(&scratch[..n]);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Streaming parser over a serialized snapshot.
#[derive(Debug)]
pub(crate) struct SnapshotReader<'a> {
    data: &'a [u8],
    pos: usize,
    bucket_hint: u32,
}

impl<'a> SnapshotReader<'a> {
    /// Parses and validates the header, leaving the cursor at the first
    /// record.
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        let header = SnapshotHeader::read_from_bytes(
            data.get(..SNAPSHOT_HEADER_LEN)
                .ok_or_else(|| Error::broken_data("snapshot shorter than its header"))?,
        )
        .map_err(|_| Error::broken_data("snapshot shorter than its header"))?;
        header.validate()?;
        Ok(Self {
            data,
            pos: SNAPSHOT_HEADER_LEN,
            bucket_hint: header.bucket_hint(),
        })
    }

    pub(crate) fn bucket_hint(&self) -> u32 {
        self.bucket_hint
    }

    /// Next `(key, value)` pair, or `None` at end-of-file.
    pub(crate) fn next_record(&mut self) -> Result<Option<(&'a [u8], &'a [u8])>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let (key_len, n) = decode_varint(&self.data[self.pos..])?;
        self.pos += n;
        let (value_len, n) = decode_varint(&self.data[self.pos..])?;
        self.pos += n;
        if key_len > MAX_RECORD_LEN as u64 || value_len > MAX_RECORD_LEN as u64 {
            return Err(Error::broken_data("record length out of range"));
        }
        let key_len = key_len as usize;
        let value_len = value_len as usize;
        let remaining = self.data.len() - self.pos;
        if key_len + value_len > remaining {
            return Err(Error::broken_data("truncated record"));
        }
        let key = &self.data[self.pos..self.pos + key_len];
        self.pos += key_len;
        let value = &self.data[self.pos..self.pos + value_len];
        self.pos += value_len;
        Ok(Some((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn snapshot_with(records: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut buf = SnapshotHeader::new(17).as_bytes().to_vec();
        for (key, value) in records {
            encode_record(key, value, &mut buf);
        }
        buf
    }

    #[test]
    fn header_layout_matches_contract() {
        let bytes = SnapshotHeader::new(0xAABBCCDD).as_bytes().to_vec();
        assert_eq!(bytes.len(), SNAPSHOT_HEADER_LEN);
        assert_eq!(&bytes[..8], b"TkrzTINY");
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..12], &[0, 0, 0]);
        assert_eq!(&bytes[12..], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn round_trip_records() {
        let buf = snapshot_with(&[(b"alpha", b"1"), (b"", b""), (b"key", b"value")]);
        let mut reader = SnapshotReader::new(&buf).unwrap();
        assert_eq!(reader.bucket_hint(), 17);
        assert_eq!(
            reader.next_record().unwrap(),
            Some((b"alpha".as_slice(), b"1".as_slice()))
        );
        assert_eq!(
            reader.next_record().unwrap(),
            Some((b"".as_slice(), b"".as_slice()))
        );
        assert_eq!(
            reader.next_record().unwrap(),
            Some((b"key".as_slice(), b"value".as_slice()))
        );
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut buf = snapshot_with(&[]);
        buf[0] = b'X';
        assert_eq!(
            SnapshotReader::new(&buf).unwrap_err().kind(),
            ErrorKind::BrokenData
        );

        let mut buf = snapshot_with(&[]);
        buf[8] = 9;
        assert_eq!(
            SnapshotReader::new(&buf).unwrap_err().kind(),
            ErrorKind::BrokenData
        );

        assert_eq!(
            SnapshotReader::new(&buf[..10]).unwrap_err().kind(),
            ErrorKind::BrokenData
        );
    }

    #[test]
    fn rejects_truncated_record() {
        let mut buf = snapshot_with(&[(b"abc", b"defg")]);
        buf.truncate(buf.len() - 2);
        let mut reader = SnapshotReader::new(&buf).unwrap();
        assert_eq!(
            reader.next_record().unwrap_err().kind(),
            ErrorKind::BrokenData
        );
    }
}
