//! Byte layout of the fast-scan metadata records.
//!
//! All integers are big-endian and every record has a fixed-size prefix. Magic numbers read as
//! ASCII: `HDR!`, `VOL!` and `EBA!`.
//!
//! ```text
//! Header       magic(4) free(4) used(4) scrub(4) erase(4) bad(4) vol(4) used_blocks(4)
//! BlockEntry   pnum(4) ec(4)
//! VolumeInfo   magic(4) vol_id(4) vol_type(1) pad(3) data_pad(4) used_ebs(4) last_eb_bytes(4)
//! LogicalMap   magic(4) entry_count(4) pnum(4) * entry_count
//! ```

use deku::prelude::*;

use crate::error::{FastscanError, RecordKind, Result};

pub const HDR_MAGIC: u32 = 0x48445221;
pub const VOL_MAGIC: u32 = 0x564F4C21;
pub const EBA_MAGIC: u32 = 0x45424121;

/// Logical map slot value for an unmapped LEB
pub const LEB_UNMAPPED: i32 = -1;

/// Common behaviour of the fixed-prefix records
pub trait Record: for<'a> DekuContainerRead<'a> + DekuContainerWrite {
    const KIND: RecordKind;

    /// Size of the fixed part of the record
    const SIZE: usize;

    /// Size of the whole record as it would be encoded
    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    /// Size of the variable part following the fixed prefix, as declared by the prefix
    fn body_len(_prefix: &[u8]) -> usize {
        0
    }
}

#[derive(Debug, Default, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"HDR!")]
pub struct MetadataHeader {
    pub free_count: u32,
    pub used_count: u32,
    pub scrub_count: u32,
    pub erase_count: u32,
    pub bad_count: u32,
    pub vol_count: u32,

    /// Size of the metadata region in LEBs, i.e. how many PEBs carry this generation
    pub used_blocks: u32,
}

impl Record for MetadataHeader {
    const KIND: RecordKind = RecordKind::Header;
    const SIZE: usize = 32;
}

impl MetadataHeader {
    /// Total number of block entries following the header
    pub fn block_entries(&self) -> u64 {
        [
            self.free_count,
            self.used_count,
            self.scrub_count,
            self.erase_count,
        ]
        .into_iter()
        .map(u64::from)
        .sum()
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct BlockEntry {
    pub pnum: u32,
    pub ec: u32,
}

impl Record for BlockEntry {
    const KIND: RecordKind = RecordKind::BlockEntry;
    const SIZE: usize = 8;
}

#[derive(Debug, Default, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"VOL!")]
pub struct VolumeInfo {
    pub vol_id: u32,
    pub vol_type: u8,
    pub padding: [u8; 3],
    pub data_pad: u32,
    pub used_ebs: u32,
    pub last_eb_bytes: u32,
}

impl Record for VolumeInfo {
    const KIND: RecordKind = RecordKind::VolumeInfo;
    const SIZE: usize = 24;
}

#[derive(Debug, Default, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"EBA!")]
pub struct LogicalMap {
    entry_count: u32,
    #[deku(count = "entry_count")]
    entries: Vec<i32>,
}

impl Record for LogicalMap {
    const KIND: RecordKind = RecordKind::LogicalMap;
    const SIZE: usize = 8;

    fn encoded_len(&self) -> usize {
        Self::SIZE + self.entries.len() * std::mem::size_of::<i32>()
    }

    fn body_len(prefix: &[u8]) -> usize {
        peek_be32(prefix, 4).map_or(0, |count| count as usize * std::mem::size_of::<i32>())
    }
}

impl LogicalMap {
    pub fn new(entries: Vec<i32>) -> Self {
        Self {
            entry_count: entries.len() as u32,
            entries,
        }
    }

    pub fn entries(&self) -> &[i32] {
        &self.entries
    }

    /// Mapped slots as `(lnum, pnum)`, skipping the unmapped sentinel (any negative value)
    pub fn mapped(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0u32..)
            .zip(self.entries.iter())
            .filter_map(|(lnum, &pnum)| u32::try_from(pnum).ok().map(|pnum| (lnum, pnum)))
    }
}

/// Decode one record of type `T` at `offset`, returning it with the offset just past it
///
/// The fixed prefix is bounds-checked before anything is parsed, so a truncated buffer never
/// yields a partial record.
pub fn decode<T: Record>(buf: &[u8], offset: usize) -> Result<(T, usize)> {
    let format_err = |detail: String| FastscanError::Format {
        kind: T::KIND,
        offset,
        detail,
    };

    let available = buf.len().saturating_sub(offset);
    if available < T::SIZE {
        return Err(format_err(format!(
            "needs {} bytes, only {available} left",
            T::SIZE
        )));
    }

    let input = &buf[offset..];
    let body = T::body_len(&input[..T::SIZE]);
    if available - T::SIZE < body {
        return Err(format_err(format!(
            "declares {body} more bytes, only {} left",
            available - T::SIZE
        )));
    }

    let ((rest, _), record) = T::from_bytes((input, 0)).map_err(|e| match e {
        DekuError::Incomplete(_) => format_err("record runs past end of buffer".into()),
        e => format_err(e.to_string()),
    })?;

    Ok((record, offset + input.len() - rest.len()))
}

/// Read the big-endian word at `offset` without decoding a record
pub fn peek_be32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..)?.get(..4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

/// Append-only writer over a fixed, pre-zeroed buffer
#[derive(Debug)]
pub struct RecordCursor {
    buf: Vec<u8>,
    pos: usize,
}

impl RecordCursor {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            pos: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Encode `record` at the current position and advance past it
    pub fn put<T: Record>(&mut self, record: &T) -> Result<()> {
        let end = self.pos + record.encoded_len();
        if end > self.buf.len() {
            return Err(FastscanError::Config(format!(
                "{} record at offset {} overflows {}-byte metadata buffer",
                T::KIND,
                self.pos,
                self.buf.len()
            )));
        }

        self.write_at(self.pos, record)?;
        self.pos = end;
        Ok(())
    }

    /// Overwrite an already-reserved record, e.g. to patch the header counts
    pub fn patch<T: Record>(&mut self, offset: usize, record: &T) -> Result<()> {
        if offset + record.encoded_len() > self.pos {
            return Err(FastscanError::Config(format!(
                "patching {} at offset {offset} beyond written data",
                T::KIND
            )));
        }
        self.write_at(offset, record)
    }

    fn write_at<T: Record>(&mut self, offset: usize, record: &T) -> Result<()> {
        let bytes = record.to_bytes().map_err(|e| FastscanError::Format {
            kind: T::KIND,
            offset,
            detail: e.to_string(),
        })?;
        self.buf[offset..][..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record_sizes() -> anyhow::Result<()> {
        assert_eq!(MetadataHeader::default().to_bytes()?.len(), MetadataHeader::SIZE);
        assert_eq!(BlockEntry::default().to_bytes()?.len(), BlockEntry::SIZE);
        assert_eq!(VolumeInfo::default().to_bytes()?.len(), VolumeInfo::SIZE);

        let map = LogicalMap::new(vec![4, LEB_UNMAPPED, 9]);
        assert_eq!(map.to_bytes()?.len(), map.encoded_len());
        assert_eq!(map.encoded_len(), 8 + 12);
        Ok(())
    }

    #[test]
    fn test_byte_layout() -> anyhow::Result<()> {
        let header = MetadataHeader {
            free_count: 1,
            used_count: 2,
            scrub_count: 3,
            erase_count: 4,
            bad_count: 5,
            vol_count: 6,
            used_blocks: 7,
        };
        let bytes = header.to_bytes()?;
        assert_eq!(peek_be32(&bytes, 0), Some(HDR_MAGIC));
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        assert_eq!(&bytes[28..32], &[0, 0, 0, 7]);

        let info = VolumeInfo {
            vol_id: 0x0102_0304,
            vol_type: 2,
            data_pad: 0x10,
            used_ebs: 0x20,
            last_eb_bytes: 0x30,
            ..Default::default()
        };
        let bytes = info.to_bytes()?;
        assert_eq!(peek_be32(&bytes, 0), Some(VOL_MAGIC));
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 2, 0, 0, 0]);
        assert_eq!(&bytes[12..24], &[0, 0, 0, 0x10, 0, 0, 0, 0x20, 0, 0, 0, 0x30]);

        let map = LogicalMap::new(vec![0x11, LEB_UNMAPPED]);
        let bytes = map.to_bytes()?;
        assert_eq!(peek_be32(&bytes, 0), Some(EBA_MAGIC));
        assert_eq!(&bytes[4..], &[0, 0, 0, 2, 0, 0, 0, 0x11, 0xFF, 0xFF, 0xFF, 0xFF]);
        Ok(())
    }

    #[test]
    fn test_decode_sequence() -> anyhow::Result<()> {
        let mut cursor = RecordCursor::new(128);
        cursor.put(&BlockEntry { pnum: 3, ec: 10 })?;
        cursor.put(&LogicalMap::new(vec![3, LEB_UNMAPPED, 5]))?;
        let end = cursor.position();
        let buf = cursor.into_inner();

        let (entry, offset) = decode::<BlockEntry>(&buf, 0)?;
        assert_eq!(entry, BlockEntry { pnum: 3, ec: 10 });
        let (map, offset) = decode::<LogicalMap>(&buf, offset)?;
        assert_eq!(offset, end);
        assert_eq!(map.mapped().collect::<Vec<_>>(), [(0, 3), (2, 5)]);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_bad_magic() -> anyhow::Result<()> {
        let mut bytes = VolumeInfo::default().to_bytes()?;
        bytes[3] ^= 0x01;
        let err = decode::<VolumeInfo>(&bytes, 0).unwrap_err();
        assert!(matches!(
            err,
            FastscanError::Format {
                kind: RecordKind::VolumeInfo,
                offset: 0,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn test_decode_rejects_truncation() -> anyhow::Result<()> {
        let bytes = MetadataHeader::default().to_bytes()?;
        for len in 0..bytes.len() {
            assert!(decode::<MetadataHeader>(&bytes[..len], 0).unwrap_err().is_corrupt());
        }

        // Prefix intact, but the slots are cut short
        let bytes = LogicalMap::new(vec![1, 2, 3]).to_bytes()?;
        let err = decode::<LogicalMap>(&bytes[..bytes.len() - 2], 0).unwrap_err();
        assert!(err.is_corrupt());
        Ok(())
    }

    #[test]
    fn test_cursor_capacity() -> anyhow::Result<()> {
        let mut cursor = RecordCursor::new(MetadataHeader::SIZE + 4);
        cursor.put(&MetadataHeader::default())?;
        let err = cursor.put(&BlockEntry::default()).unwrap_err();
        assert!(matches!(err, FastscanError::Config(_)));
        assert_eq!(cursor.position(), MetadataHeader::SIZE);

        cursor.patch(
            0,
            &MetadataHeader {
                vol_count: 9,
                ..Default::default()
            },
        )?;
        let (header, _) = decode::<MetadataHeader>(&cursor.into_inner(), 0)?;
        assert_eq!(header.vol_count, 9);
        Ok(())
    }
}
