//! Parsing and structural validation of a concatenated metadata buffer.
//!
//! Parsing fails closed: the first anomaly aborts with an error for which
//! [FastscanError::is_corrupt] holds, and nothing parsed so far is returned.

use super::records::{decode, BlockEntry, LogicalMap, MetadataHeader, Record, VolumeInfo};
use crate::error::{FastscanError, Result};

/// Every record of a metadata generation, in on-flash order
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ParsedMetadata {
    pub header: MetadataHeader,
    pub free: Vec<BlockEntry>,
    pub used: Vec<BlockEntry>,
    pub scrub: Vec<BlockEntry>,
    pub erase: Vec<BlockEntry>,
    pub volumes: Vec<(VolumeInfo, LogicalMap)>,
}

pub struct MetadataReader<'b> {
    buf: &'b [u8],
    offset: usize,
}

impl<'b> MetadataReader<'b> {
    /// Parse `buf`, which was assembled from `located_blocks` metadata PEBs
    pub fn parse(buf: &'b [u8], located_blocks: usize) -> Result<ParsedMetadata> {
        let mut reader = Self { buf, offset: 0 };

        let header: MetadataHeader = reader.record()?;
        tracing::debug!(?header, "read fastscan header");

        if header.used_blocks as usize != located_blocks {
            return Err(FastscanError::corrupt(format!(
                "header spans {} blocks, but {located_blocks} were located",
                header.used_blocks
            )));
        }

        let entry_bytes = header.block_entries() * BlockEntry::SIZE as u64;
        if entry_bytes > reader.remaining() as u64 {
            return Err(FastscanError::corrupt(format!(
                "header declares {} block entries, only {} bytes follow",
                header.block_entries(),
                reader.remaining()
            )));
        }

        let free = reader.entries(header.free_count)?;
        let used = reader.entries(header.used_count)?;
        let scrub = reader.entries(header.scrub_count)?;
        let erase = reader.entries(header.erase_count)?;

        let min_volume = VolumeInfo::SIZE + LogicalMap::SIZE;
        if header.vol_count as usize > reader.remaining() / min_volume {
            return Err(FastscanError::corrupt(format!(
                "header declares {} volumes, only {} bytes follow",
                header.vol_count,
                reader.remaining()
            )));
        }

        let mut volumes = Vec::with_capacity(header.vol_count as usize);
        for _ in 0..header.vol_count {
            let info: VolumeInfo = reader.record()?;
            let map: LogicalMap = reader.record()?;
            volumes.push((info, map));
        }

        tracing::debug!(
            bytes = reader.offset,
            volumes = volumes.len(),
            "parsed fastscan records"
        );

        Ok(ParsedMetadata {
            header,
            free,
            used,
            scrub,
            erase,
            volumes,
        })
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    fn record<T: Record>(&mut self) -> Result<T> {
        let (record, next) = decode(self.buf, self.offset)?;
        self.offset = next;
        Ok(record)
    }

    fn entries(&mut self, count: u32) -> Result<Vec<BlockEntry>> {
        (0..count).map(|_| self.record()).collect()
    }
}
