//! Serialization of the live state into a metadata generation.

use super::records::{BlockEntry, LogicalMap, MetadataHeader, Record, RecordCursor, VolumeInfo};
use super::state::{VolumeTable, WlEntry, WlState};
use super::FastscanConfig;
use crate::error::{FastscanError, Result};
use crate::nand::FlashLayout;

/// Size of the metadata region for a given device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MetadataLayout {
    pub leb_size: usize,

    /// Bytes in the region; always a whole number of LEBs
    pub size: usize,

    /// LEBs (and therefore PEBs) in the region
    pub used_blocks: u32,
}

impl MetadataLayout {
    /// Size the region for the worst case: every PEB listed in a block entry and mapped in some
    /// volume, with every volume slot populated.
    pub fn new(flash: &FlashLayout, config: &FastscanConfig) -> Result<Self> {
        let leb_size = flash.leb_size();
        if leb_size == 0 {
            return Err(FastscanError::Config(format!(
                "flash layout {flash:?} has no room for LEB data"
            )));
        }

        let pebs = flash.blocks as usize;
        let raw = MetadataHeader::SIZE
            + pebs * BlockEntry::SIZE
            + config.max_volumes * (VolumeInfo::SIZE + LogicalMap::SIZE)
            + pebs * std::mem::size_of::<i32>();
        let size = raw.next_multiple_of(leb_size);
        let used_blocks = (size / leb_size) as u32;

        if used_blocks > config.reserved_pebs {
            return Err(FastscanError::Config(format!(
                "metadata needs {used_blocks} LEBs of {leb_size} bytes, only {} PEBs reserved",
                config.reserved_pebs
            )));
        }

        Ok(Self {
            leb_size,
            size,
            used_blocks,
        })
    }

    /// The `index`th LEB-sized chunk of a region buffer
    pub fn chunk<'b>(&self, buf: &'b [u8], index: usize) -> &'b [u8] {
        &buf[index * self.leb_size..][..self.leb_size]
    }
}

/// Section counts of a serialized generation, for logging and tests
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SectionCounts {
    pub free: u32,
    pub used: u32,
    pub scrub: u32,
    pub erase: u32,
    pub volumes: u32,
}

pub struct MetadataWriter {
    layout: MetadataLayout,
}

impl MetadataWriter {
    pub fn new(layout: MetadataLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &MetadataLayout {
        &self.layout
    }

    /// Serialize a snapshot of `volumes` and `wl` into a zeroed buffer of exactly the region size.
    ///
    /// The caller must hold both locks for the whole call. The erase-pending section lists the
    /// erase work queue followed by `wl.fastscan_pebs`: the snapshot is always written to a new
    /// generation, so the one currently on flash is about to be retired.
    pub fn serialize(&self, volumes: &VolumeTable, wl: &WlState) -> Result<(Vec<u8>, SectionCounts)> {
        let mut cursor = RecordCursor::new(self.layout.size);
        let header_offset = cursor.position();
        cursor.put(&MetadataHeader::default())?;

        let mut counts = SectionCounts {
            free: put_entries(&mut cursor, &wl.free)?,
            used: put_entries(&mut cursor, &wl.used)?,
            scrub: put_entries(&mut cursor, &wl.scrub)?,
            erase: put_entries(&mut cursor, wl.erase_works().chain(&wl.fastscan_pebs))?,
            volumes: 0,
        };

        for volume in volumes.iter() {
            cursor.put(&VolumeInfo {
                vol_id: volume.vol_id,
                vol_type: volume.vol_type.into(),
                padding: Default::default(),
                data_pad: volume.data_pad,
                used_ebs: volume.used_ebs,
                last_eb_bytes: volume.last_eb_bytes,
            })?;
            cursor.put(&LogicalMap::new(volume.eba().to_vec()))?;
            counts.volumes += 1;
        }

        let header = MetadataHeader {
            free_count: counts.free,
            used_count: counts.used,
            scrub_count: counts.scrub,
            erase_count: counts.erase,
            bad_count: wl.bad_peb_count,
            vol_count: counts.volumes,
            used_blocks: self.layout.used_blocks,
        };
        cursor.patch(header_offset, &header)?;

        tracing::debug!(
            bytes = cursor.position(),
            region = self.layout.size,
            ?counts,
            bad = wl.bad_peb_count,
            "serialized fastscan snapshot"
        );

        Ok((cursor.into_inner(), counts))
    }
}

fn put_entries<'e>(
    cursor: &mut RecordCursor,
    entries: impl IntoIterator<Item = &'e WlEntry>,
) -> Result<u32> {
    let mut count = 0;
    for entry in entries {
        cursor.put(&BlockEntry {
            pnum: entry.pnum,
            ec: entry.ec,
        })?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fastscan::records::{decode, LEB_UNMAPPED};
    use crate::fastscan::state::{LiveVolume, PendingWork};
    use crate::ubi::VolType;

    const TEST_FLASH: FlashLayout = FlashLayout {
        blocks: 32,
        pages_per_block: 16,
        bytes_per_page: 128,
    };

    #[test]
    fn test_layout_sizing() -> anyhow::Result<()> {
        let layout = MetadataLayout::new(&TEST_FLASH, &FastscanConfig::default())?;
        // 32 + 32 * 8 + 129 * 32 + 32 * 4 = 4544 bytes, in 1792-byte LEBs
        assert_eq!(layout.leb_size, 1792);
        assert_eq!(layout.size, 3 * 1792);
        assert_eq!(layout.used_blocks, 3);

        let config = FastscanConfig {
            reserved_pebs: 2,
            ..Default::default()
        };
        assert!(matches!(
            MetadataLayout::new(&TEST_FLASH, &config),
            Err(FastscanError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_serialize_sections() -> anyhow::Result<()> {
        let mut wl = WlState {
            free: [WlEntry::new(7, 3), WlEntry::new(2, 5), WlEntry::new(9, 1)].into(),
            used: [WlEntry::new(4, 2), WlEntry::new(5, 2)].into(),
            scrub: [WlEntry::new(6, 8)].into(),
            fastscan_pebs: vec![WlEntry::new(30, 1)],
            bad_peb_count: 2,
            ..Default::default()
        };
        wl.works.push_back(PendingWork::WearLevel);
        wl.schedule_erase(WlEntry::new(11, 4), true);

        let mut volumes = VolumeTable::default();
        let mut volume = LiveVolume::new(3, VolType::Static, 3);
        volume.map(0, 4)?;
        volume.map(2, 5)?;
        volume.used_ebs = 2;
        volume.last_eb_bytes = 100;
        volumes.insert(volume)?;

        let layout = MetadataLayout::new(&TEST_FLASH, &FastscanConfig::default())?;
        let writer = MetadataWriter::new(layout);
        let (buf, counts) = writer.serialize(&volumes, &wl)?;
        assert_eq!(buf.len(), layout.size);
        assert_eq!(
            counts,
            SectionCounts {
                free: 3,
                used: 2,
                scrub: 1,
                erase: 2,
                volumes: 1,
            }
        );

        let (header, mut offset) = decode::<MetadataHeader>(&buf, 0)?;
        assert_eq!(
            header,
            MetadataHeader {
                free_count: 3,
                used_count: 2,
                scrub_count: 1,
                erase_count: 2,
                bad_count: 2,
                vol_count: 1,
                used_blocks: 3,
            }
        );

        let mut entries = Vec::new();
        for _ in 0..header.block_entries() {
            let (entry, next) = decode::<BlockEntry>(&buf, offset)?;
            entries.push((entry.pnum, entry.ec));
            offset = next;
        }
        // Free entries come out least-worn first; erase work precedes the retiring generation
        assert_eq!(
            entries,
            [(9, 1), (7, 3), (2, 5), (4, 2), (5, 2), (6, 8), (11, 4), (30, 1)]
        );

        let (info, offset) = decode::<VolumeInfo>(&buf, offset)?;
        assert_eq!((info.vol_id, info.vol_type, info.used_ebs), (3, 2, 2));
        assert_eq!(info.last_eb_bytes, 100);
        let (map, offset) = decode::<LogicalMap>(&buf, offset)?;
        assert_eq!(map.entries(), [4, LEB_UNMAPPED, 5]);

        assert!(buf[offset..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_serialize_overflow() -> anyhow::Result<()> {
        let wl = WlState {
            free: (0..200).map(|pnum| WlEntry::new(pnum, 0)).collect(),
            ..Default::default()
        };
        let layout = MetadataLayout {
            leb_size: 512,
            size: 1024,
            used_blocks: 2,
        };
        let err = MetadataWriter::new(layout)
            .serialize(&VolumeTable::default(), &wl)
            .unwrap_err();
        assert!(matches!(err, FastscanError::Config(_)));
        Ok(())
    }
}
