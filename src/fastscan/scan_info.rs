//! Reconstruction of the mount-time scan information from parsed metadata.

use std::collections::{BTreeMap, BTreeSet};

use super::locator::LocatedPeb;
use super::reader::ParsedMetadata;
use super::records::{BlockEntry, LogicalMap, VolumeInfo};
use crate::error::{FastscanError, Result};
use crate::ubi::{VolType, UBI_MAX_ERASECOUNTER};

/// A PEB as the scan found it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ScanLeb {
    pub pnum: u32,
    pub ec: u32,

    /// Listed in the scrub section: the data is good but the block should be rewritten
    pub scrub: bool,

    /// Logical block number, once a volume's logical map has claimed the PEB
    pub lnum: Option<u32>,
}

impl ScanLeb {
    fn new(entry: &BlockEntry, scrub: bool) -> Self {
        Self {
            pnum: entry.pnum,
            ec: entry.ec,
            scrub,
            lnum: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanVolume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub used_ebs: u32,
    pub data_pad: u32,

    /// Bytes in the last LEB of a static volume
    pub last_data_size: u32,

    /// Highest logical block number with a PEB behind it
    pub highest_lnum: u32,

    pub leb_count: u32,

    /// Size of the volume's logical map, mapped or not
    pub reserved_lebs: u32,

    pub lebs: BTreeMap<u32, ScanLeb>,
}

impl ScanVolume {
    fn new(info: &VolumeInfo, map: &LogicalMap) -> Result<Self> {
        let vol_type = VolType::try_from(info.vol_type).map_err(|_| {
            FastscanError::corrupt(format!(
                "volume {} has unknown type {}",
                info.vol_id, info.vol_type
            ))
        })?;

        Ok(Self {
            vol_id: info.vol_id,
            vol_type,
            used_ebs: info.used_ebs,
            data_pad: info.data_pad,
            last_data_size: info.last_eb_bytes,
            highest_lnum: 0,
            leb_count: 0,
            reserved_lebs: map.entries().len() as u32,
            lebs: BTreeMap::new(),
        })
    }

    fn insert(&mut self, lnum: u32, mut leb: ScanLeb) {
        leb.lnum = Some(lnum);
        self.lebs.insert(lnum, leb);
        self.highest_lnum = self.highest_lnum.max(lnum);
        self.leb_count += 1;
    }
}

/// Everything a mount needs from the scan, as restored from a metadata generation
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanInfo {
    pub free: Vec<ScanLeb>,
    pub erase: Vec<ScanLeb>,

    /// Always empty when restored from metadata; kept for parity with a full scan
    pub corrupted: Vec<ScanLeb>,
    pub alien: Vec<ScanLeb>,

    /// Used PEBs that no volume claimed
    pub used: Vec<ScanLeb>,

    pub volumes: BTreeMap<u32, ScanVolume>,

    pub ec_sum: u64,
    pub ec_count: u32,
    pub min_ec: u32,
    pub max_ec: u32,
    pub mean_ec: u32,

    pub bad_peb_count: u32,
    pub vols_found: u32,
    pub highest_vol_id: u32,

    /// PEBs holding data, claimed or not, scrub-flagged included
    pub used_peb_count: u32,
    pub scrub_peb_count: u32,

    /// The generation this was restored from
    pub metadata_pebs: Vec<LocatedPeb>,
}

impl Default for ScanInfo {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            erase: Vec::new(),
            corrupted: Vec::new(),
            alien: Vec::new(),
            used: Vec::new(),
            volumes: BTreeMap::new(),
            ec_sum: 0,
            ec_count: 0,
            min_ec: UBI_MAX_ERASECOUNTER,
            max_ec: 0,
            mean_ec: 0,
            bad_peb_count: 0,
            vols_found: 0,
            highest_vol_id: 0,
            used_peb_count: 0,
            scrub_peb_count: 0,
            metadata_pebs: Vec::new(),
        }
    }
}

impl ScanInfo {
    /// PEBs accounted for by the populations plus the bad-block count
    pub fn peb_total(&self) -> u64 {
        (self.free.len() + self.erase.len()) as u64
            + u64::from(self.used_peb_count)
            + u64::from(self.bad_peb_count)
    }

    /// Every PEB in the used population, whether a volume claimed it or not
    pub fn used_lebs(&self) -> impl Iterator<Item = &ScanLeb> {
        self.volumes
            .values()
            .flat_map(|vol| vol.lebs.values())
            .chain(&self.used)
    }

    fn account(&mut self, entry: &BlockEntry) -> Result<()> {
        if entry.ec > UBI_MAX_ERASECOUNTER {
            return Err(FastscanError::corrupt(format!(
                "PEB {} has erase counter {:#x}",
                entry.pnum, entry.ec
            )));
        }

        self.ec_sum += u64::from(entry.ec);
        self.ec_count += 1;
        self.min_ec = self.min_ec.min(entry.ec);
        self.max_ec = self.max_ec.max(entry.ec);
        Ok(())
    }
}

/// Turns a [ParsedMetadata] into a [ScanInfo], checking that every PEB is accounted for
pub struct ScanInfoBuilder {
    total_pebs: u32,
    seen: BTreeSet<u32>,
    info: ScanInfo,

    /// Used population not yet claimed by a volume, by PEB number
    unclaimed: BTreeMap<u32, ScanLeb>,
}

impl ScanInfoBuilder {
    /// `total_pebs` is the number of PEBs the populations must add up to: the device's PEBs, less
    /// those holding the metadata itself.
    pub fn new(total_pebs: u32) -> Self {
        Self {
            total_pebs,
            seen: BTreeSet::new(),
            info: ScanInfo::default(),
            unclaimed: BTreeMap::new(),
        }
    }

    pub fn build(mut self, parsed: ParsedMetadata) -> Result<ScanInfo> {
        for entry in &parsed.free {
            let leb = self.admit(entry, false)?;
            self.info.free.push(leb);
        }
        for entry in &parsed.used {
            let leb = self.admit(entry, false)?;
            self.unclaimed.insert(leb.pnum, leb);
        }
        for entry in &parsed.scrub {
            let leb = self.admit(entry, true)?;
            self.unclaimed.insert(leb.pnum, leb);
            self.info.scrub_peb_count += 1;
        }
        for entry in &parsed.erase {
            let leb = self.admit(entry, false)?;
            self.info.erase.push(leb);
        }

        let info = &mut self.info;
        if info.ec_count > 0 {
            info.mean_ec = (info.ec_sum / u64::from(info.ec_count)) as u32;
        }
        info.bad_peb_count = parsed.header.bad_count;
        info.used_peb_count = self.unclaimed.len() as u32;

        // Claiming only moves PEBs from unclaimed into a volume, so every check below sees the
        // same balance as the final one.
        for (vol_info, map) in &parsed.volumes {
            self.add_volume(vol_info, map)?;
            self.check_conservation()?;
        }
        self.check_conservation()?;

        let mut info = self.info;
        info.used = self.unclaimed.into_values().collect();
        tracing::info!(
            free = info.free.len(),
            used = info.used_peb_count,
            erase = info.erase.len(),
            bad = info.bad_peb_count,
            volumes = info.vols_found,
            mean_ec = info.mean_ec,
            "restored scan info from fastscan metadata"
        );
        Ok(info)
    }

    fn admit(&mut self, entry: &BlockEntry, scrub: bool) -> Result<ScanLeb> {
        if !self.seen.insert(entry.pnum) {
            return Err(FastscanError::corrupt(format!(
                "PEB {} is listed more than once",
                entry.pnum
            )));
        }
        self.info.account(entry)?;
        Ok(ScanLeb::new(entry, scrub))
    }

    fn add_volume(&mut self, vol_info: &VolumeInfo, map: &LogicalMap) -> Result<()> {
        let mut volume = ScanVolume::new(vol_info, map)?;
        if self.info.volumes.contains_key(&volume.vol_id) {
            return Err(FastscanError::corrupt(format!(
                "volume {} appears twice",
                volume.vol_id
            )));
        }

        for (lnum, pnum) in map.mapped() {
            match self.unclaimed.remove(&pnum) {
                Some(leb) => volume.insert(lnum, leb),
                None => tracing::debug!(
                    vol_id = volume.vol_id,
                    lnum,
                    pnum,
                    "logical map names a PEB outside the used population"
                ),
            }
        }

        self.info.vols_found += 1;
        self.info.highest_vol_id = self.info.highest_vol_id.max(volume.vol_id);
        self.info.volumes.insert(volume.vol_id, volume);
        Ok(())
    }

    fn check_conservation(&self) -> Result<()> {
        let info = &self.info;
        let claimed: u32 = info.volumes.values().map(|vol| vol.leb_count).sum();
        let used = u64::from(claimed) + self.unclaimed.len() as u64;
        let total = (info.free.len() + info.erase.len()) as u64 + used + u64::from(info.bad_peb_count);

        if total != u64::from(self.total_pebs) {
            tracing::warn!(
                free = info.free.len(),
                used,
                erase = info.erase.len(),
                bad = info.bad_peb_count,
                expected = self.total_pebs,
                "fastscan PEB count mismatch"
            );
            return Err(FastscanError::corrupt(format!(
                "populations account for {total} PEBs, device has {}",
                self.total_pebs
            )));
        }
        Ok(())
    }
}
