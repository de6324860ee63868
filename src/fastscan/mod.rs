//! Fast scan: persisting the translation layer's state so a mount doesn't need to read every PEB.
//!
//! A metadata generation is a handful of PEBs, all carrying VID headers for the reserved
//! [FASTSCAN_VOLUME_ID], whose LEBs concatenate into one buffer of records: a header, the free,
//! used, scrub and erase-pending block populations, then every volume's logical map.
//!
//! [update] snapshots a [LiveState] into a fresh generation; [rebuild] finds the newest generation
//! at mount and turns it back into a [ScanInfo], or reports why a full scan is needed instead.

use std::fmt;

pub mod locator;
pub mod reader;
pub mod records;
pub mod scan_info;
pub mod state;
pub mod writer;

pub use locator::LocatedPeb;
pub use scan_info::{ScanInfo, ScanLeb, ScanVolume};
pub use state::{LiveState, LiveVolume, PendingWork, VolumeTable, WlEntry, WlState};
pub use writer::{MetadataLayout, SectionCounts};

use crate::error::{FastscanError, Result};
use crate::nand::Nand;
use crate::ubi::{
    UbiIo, Vid, VolType, UBI_COMPAT_DELETE, UBI_INT_VOL_COUNT, UBI_LAYOUT_VOLUME_ID,
    UBI_MAX_VOLUMES,
};
use locator::{locate_generations, read_metadata};
use reader::MetadataReader;
use scan_info::ScanInfoBuilder;
use writer::MetadataWriter;

/// Internal volume whose VID headers mark metadata PEBs
pub const FASTSCAN_VOLUME_ID: u32 = UBI_LAYOUT_VOLUME_ID + 1;
pub const FASTSCAN_VOLUME_TYPE: VolType = VolType::Dynamic;
pub const FASTSCAN_VOLUME_COMPAT: u8 = UBI_COMPAT_DELETE;
pub const FASTSCAN_VOLUME_NAME: &str = "fastscan volume";

/// PEBs set aside to hold one generation
pub const FASTSCAN_PEB_COUNT: u32 = 4;

/// Metadata PEBs must sit below this PEB number
pub const FASTSCAN_SCAN_WINDOW: u32 = 128;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FastscanConfig {
    /// Most PEBs one generation may occupy
    pub reserved_pebs: u32,

    /// Number of PEBs, from PEB 0, searched for a generation (and eligible to host one)
    pub scan_window: u32,

    /// Volume slots the region is sized for, internal volumes included
    pub max_volumes: usize,
}

impl Default for FastscanConfig {
    fn default() -> Self {
        Self {
            reserved_pebs: FASTSCAN_PEB_COUNT,
            scan_window: FASTSCAN_SCAN_WINDOW,
            max_volumes: UBI_MAX_VOLUMES + UBI_INT_VOL_COUNT,
        }
    }
}

/// VID header for LEB `lnum` of a generation spanning `blocks` PEBs
pub fn marker_vid(lnum: u32, sqnum: u64, blocks: u32) -> Vid {
    Vid {
        vol_type: FASTSCAN_VOLUME_TYPE,
        compat: FASTSCAN_VOLUME_COMPAT,
        vol_id: FASTSCAN_VOLUME_ID,
        used_ebs: blocks,
        ..Default::default()
    }
    .lnum(lnum)
    .sqnum(sqnum)
}

/// Why [rebuild] could not restore the scan info
#[derive(Debug)]
pub enum FallbackReason {
    /// No PEB carries a metadata generation
    NoSnapshot,

    /// The generation's PEBs could not be read
    Unreadable(FastscanError),

    /// The generation was read, but failed validation
    Corrupt(FastscanError),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSnapshot => f.write_str("no fastscan metadata on flash"),
            Self::Unreadable(err) => write!(f, "fastscan metadata unreadable: {err}"),
            Self::Corrupt(err) => write!(f, "fastscan metadata rejected: {err}"),
        }
    }
}

#[derive(Debug)]
pub enum RebuildOutcome {
    Restored(ScanInfo),

    /// The caller must scan every PEB instead
    FullScanRequired(FallbackReason),
}

/// Restore the scan info from the newest metadata generation on `nand`
///
/// Missing, unreadable or corrupt metadata is not an error: it yields
/// [RebuildOutcome::FullScanRequired]. Only configuration problems are returned as `Err`.
pub fn rebuild<N: Nand>(nand: &mut N, config: &FastscanConfig) -> Result<RebuildOutcome> {
    let reason = match restore(nand, config) {
        Ok(Some(info)) => return Ok(RebuildOutcome::Restored(info)),
        Ok(None) => FallbackReason::NoSnapshot,
        Err(err @ FastscanError::Config(_)) => return Err(err),
        Err(err) if err.is_corrupt() => FallbackReason::Corrupt(err),
        Err(err) => FallbackReason::Unreadable(err),
    };

    tracing::warn!(%reason, "falling back to full scan");
    Ok(RebuildOutcome::FullScanRequired(reason))
}

fn restore<N: Nand>(nand: &mut N, config: &FastscanConfig) -> Result<Option<ScanInfo>> {
    let mut io = UbiIo::new(nand).map_err(|e| FastscanError::Config(format!("{e:#}")))?;

    let mut newest_err = None;
    for located in locate_generations(&mut io, config)? {
        match restore_generation(&mut io, located) {
            Ok(info) => {
                if let Some(err) = &newest_err {
                    tracing::warn!("newest fastscan generation rejected, using an older one: {err}");
                }
                return Ok(Some(info));
            }
            Err(err) => {
                tracing::debug!("fastscan generation rejected: {err}");
                if newest_err.is_none() {
                    newest_err = Some(err);
                }
            }
        }
    }

    newest_err.map_or(Ok(None), Err)
}

fn restore_generation<N: Nand>(io: &mut UbiIo<N>, located: Vec<LocatedPeb>) -> Result<ScanInfo> {
    let buf = read_metadata(io, &located)?;
    let parsed = MetadataReader::parse(&buf, located.len())?;

    let total_pebs = io.peb_count().saturating_sub(located.len() as u32);
    let mut info = ScanInfoBuilder::new(total_pebs).build(parsed)?;
    info.metadata_pebs = located;
    Ok(info)
}

/// A generation that [update] made durable
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Generation {
    /// PEBs now holding the metadata, in logical order
    pub pebs: Vec<WlEntry>,

    /// PEBs of the previous generation, now queued for erasure
    pub superseded: Vec<WlEntry>,

    pub counts: SectionCounts,
}

/// Write a fresh metadata generation describing `state`
///
/// The hosting PEBs are taken from the free population and the snapshot is serialized with both
/// locks held; the locks are dropped before anything is written. On success the previous
/// generation is queued for erasure. On a write failure it stays authoritative and the new PEBs
/// are queued for erasure instead.
pub fn update<N: Nand>(
    nand: &mut N,
    state: &LiveState,
    config: &FastscanConfig,
) -> Result<Generation> {
    let mut io = UbiIo::new(nand).map_err(|e| FastscanError::Config(format!("{e:#}")))?;
    let writer = MetadataWriter::new(MetadataLayout::new(&io.layout(), config)?);
    let layout = *writer.layout();
    let window = config.scan_window.min(io.peb_count());

    let (pebs, buf, counts) = {
        let (volumes, mut wl) = state.lock_all();

        let needed = layout.used_blocks as usize;
        let mut pebs = wl
            .take_free_below(window, needed)
            .map_err(|available| FastscanError::AllocationFailed { needed, available })?;
        pebs.sort_by_key(|entry| entry.pnum);

        match writer.serialize(&volumes, &wl) {
            Ok((buf, counts)) => (pebs, buf, counts),
            Err(err) => {
                wl.free.extend(pebs);
                return Err(err);
            }
        }
    };

    let rpt = howudoin::new()
        .label("Writing fastscan metadata")
        .set_len(pebs.len() as u64);

    // Highest LEB first, so the header becomes durable last
    for (lnum, entry) in pebs.iter().enumerate().rev() {
        let vid = marker_vid(lnum as u32, state.next_sqnum(), pebs.len() as u32);
        let written = io
            .write_block_header(entry.pnum, vid)
            .and_then(|()| io.write_block(entry.pnum, 0, layout.chunk(&buf, lnum)));

        if let Err(cause) = written {
            rpt.close();
            tracing::warn!(pnum = entry.pnum, lnum, "fastscan write failed: {cause:#}");

            let mut wl = state.lock_wl();
            for other in &pebs {
                wl.schedule_erase(*other, other.pnum == entry.pnum);
            }
            return Err(FastscanError::WriteFailed {
                pnum: entry.pnum,
                cause,
            });
        }

        tracing::debug!(pnum = entry.pnum, lnum, sqnum = vid.sqnum, "wrote fastscan block");
        rpt.inc();
    }
    rpt.close();

    let superseded = {
        let mut wl = state.lock_wl();
        let superseded = std::mem::replace(&mut wl.fastscan_pebs, pebs.clone());
        for entry in &superseded {
            wl.schedule_erase(*entry, false);
        }
        superseded
    };

    tracing::info!(
        pebs = ?pebs.iter().map(|entry| entry.pnum).collect::<Vec<_>>(),
        superseded = superseded.len(),
        "fastscan metadata updated"
    );

    Ok(Generation {
        pebs,
        superseded,
        counts,
    })
}
