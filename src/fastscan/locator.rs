//! Finding the PEBs of the current metadata generation and reading them back.

use super::{FastscanConfig, FASTSCAN_VOLUME_ID};
use crate::error::{FastscanError, Result};
use crate::nand::Nand;
use crate::ubi::{PebHeader, UbiIo};

/// A PEB carrying one LEB of a metadata generation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LocatedPeb {
    pub pnum: u32,

    /// Position of this block's payload in the metadata buffer
    pub lnum: u32,

    pub sqnum: u64,

    /// Erase counter from the EC header, if it has a valid one
    pub ec: Option<u64>,
}

#[derive(Debug, Copy, Clone)]
struct Candidate {
    peb: LocatedPeb,

    /// Generation size as announced by the block's VID header
    blocks: u32,
}

/// Scan the VID headers in the first `config.scan_window` PEBs for metadata blocks
///
/// Returns the blocks of the newest complete-looking generation in logical order, or an empty list
/// if the device holds no metadata at all. Bad blocks and blocks without a valid VID header are
/// skipped; any other read failure is an error.
pub fn locate<N: Nand>(io: &mut UbiIo<N>, config: &FastscanConfig) -> Result<Vec<LocatedPeb>> {
    Ok(locate_generations(io, config)?
        .into_iter()
        .next()
        .unwrap_or_default())
}

/// Like [locate], but returns every generation still on flash, newest first
///
/// An update that died after stamping its LEB 0 leaves a newest generation that fails to parse; the
/// older ones let the caller fall back to the last one that was completely written.
pub fn locate_generations<N: Nand>(
    io: &mut UbiIo<N>,
    config: &FastscanConfig,
) -> Result<Vec<Vec<LocatedPeb>>> {
    let window = config.scan_window.min(io.peb_count());
    let rpt = howudoin::new()
        .label("Locating fastscan blocks")
        .set_len(u64::from(window));

    let mut candidates = Vec::new();
    for pnum in 0..window {
        rpt.inc();

        let PebHeader::Vid(vid) = io.read_block_header(pnum).map_err(FastscanError::io(pnum))?
        else {
            continue;
        };
        if vid.vol_id != FASTSCAN_VOLUME_ID {
            continue;
        }

        let ec = io
            .read_ec_header(pnum)
            .map_err(FastscanError::io(pnum))?
            .map(|hdr| hdr.ec);
        tracing::debug!(pnum, lnum = vid.lnum, sqnum = vid.sqnum, "found fastscan block");

        candidates.push(Candidate {
            peb: LocatedPeb {
                pnum,
                lnum: vid.lnum,
                sqnum: vid.sqnum,
                ec,
            },
            blocks: vid.used_ebs,
        });
    }
    rpt.close();

    let generations = select_generations(&candidates);
    tracing::info!(
        candidates = candidates.len(),
        generations = generations.len(),
        located = generations.first().map_or(0, Vec::len),
        "fastscan block scan finished"
    );
    Ok(generations)
}

/// Group the located candidates into generations, newest first
///
/// Blocks are written highest LEB first, so each generation's LEB 0 carries its highest sequence
/// number. Every other LEB of a generation is the newest copy written before its LEB 0; copies
/// written after belong to a later update.
fn select_generations(candidates: &[Candidate]) -> Vec<Vec<LocatedPeb>> {
    let newest = |lnum: u32, below: u64| {
        candidates
            .iter()
            .filter(|c| c.peb.lnum == lnum && c.peb.sqnum < below)
            .max_by_key(|c| c.peb.sqnum)
    };

    let mut anchors: Vec<&Candidate> = candidates.iter().filter(|c| c.peb.lnum == 0).collect();
    if anchors.is_empty() && !candidates.is_empty() {
        tracing::warn!("fastscan blocks present, but none holds LEB 0");
    }
    anchors.sort_by_key(|c| std::cmp::Reverse(c.peb.sqnum));

    anchors
        .into_iter()
        .map(|anchor| {
            let mut generation = vec![anchor.peb];
            for lnum in 1..anchor.blocks {
                let Some(found) = newest(lnum, anchor.peb.sqnum) else {
                    tracing::warn!(
                        lnum,
                        expected = anchor.blocks,
                        "fastscan generation is incomplete"
                    );
                    break;
                };
                generation.push(found.peb);
            }
            generation
        })
        .collect()
}

/// Concatenate the LEBs of a located generation into one buffer
pub fn read_metadata<N: Nand>(io: &mut UbiIo<N>, located: &[LocatedPeb]) -> Result<Vec<u8>> {
    let leb_size = io.leb_size();
    let mut buf = vec![0; leb_size * located.len()];

    for (peb, chunk) in located.iter().zip(buf.chunks_exact_mut(leb_size)) {
        io.read_block(peb.pnum, 0, chunk)
            .map_err(FastscanError::io(peb.pnum))?;
    }

    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fastscan::marker_vid;
    use crate::nand::{FlashLayout, NandBlock, SimFault, SimNand};
    use crate::ubi::{Ec, Vid};

    const TEST_LAYOUT: FlashLayout = FlashLayout {
        blocks: 16,
        pages_per_block: 4,
        bytes_per_page: 64,
    };

    fn place(io: &mut UbiIo<SimNand>, pnum: u32, vid: Vid, fill: u8) -> anyhow::Result<()> {
        io.format_block(pnum, Ec::default().ec(u64::from(pnum) + 1))?;
        io.write_block_header(pnum, vid)?;
        io.write_block(pnum, 0, &vec![fill; io.leb_size()])
    }

    #[test]
    fn test_locate_generation() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.block(1)?.unwrap().mark_bad()?;
        let mut io = UbiIo::new(&mut nand)?;

        // A user-volume block in between is ignored
        place(&mut io, 2, marker_vid(0, 20, 3), 0xA0)?;
        place(&mut io, 3, Vid::default().lnum(1), 0x11)?;
        place(&mut io, 5, marker_vid(1, 19, 3), 0xA1)?;
        place(&mut io, 9, marker_vid(2, 18, 3), 0xA2)?;

        let located = locate(&mut io, &FastscanConfig::default())?;
        let pnums: Vec<u32> = located.iter().map(|p| p.pnum).collect();
        assert_eq!(pnums, [2, 5, 9]);
        assert_eq!(located[0].ec, Some(3));
        assert_eq!(located[2].lnum, 2);

        let buf = read_metadata(&mut io, &located)?;
        let leb_size = io.leb_size();
        assert_eq!(buf.len(), 3 * leb_size);
        assert!(buf[..leb_size].iter().all(|&b| b == 0xA0));
        assert!(buf[2 * leb_size..].iter().all(|&b| b == 0xA2));
        Ok(())
    }

    #[test]
    fn test_locate_prefers_newest() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut io = UbiIo::new(&mut nand)?;

        // Old generation, then a complete newer one, then an update that died before LEB 0
        place(&mut io, 0, marker_vid(0, 2, 2), 0)?;
        place(&mut io, 1, marker_vid(1, 1, 2), 0)?;
        place(&mut io, 6, marker_vid(1, 5, 2), 0)?;
        place(&mut io, 4, marker_vid(0, 6, 2), 0)?;
        place(&mut io, 7, marker_vid(1, 9, 2), 0)?;

        let located = locate(&mut io, &FastscanConfig::default())?;
        let pnums: Vec<u32> = located.iter().map(|p| p.pnum).collect();
        assert_eq!(pnums, [4, 6]);

        let generations = locate_generations(&mut io, &FastscanConfig::default())?;
        let pnums: Vec<Vec<u32>> = generations
            .iter()
            .map(|generation| generation.iter().map(|p| p.pnum).collect())
            .collect();
        assert_eq!(pnums, [vec![4, 6], vec![0, 1]]);
        Ok(())
    }

    #[test]
    fn test_locate_window_and_empty() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut io = UbiIo::new(&mut nand)?;
        assert!(locate(&mut io, &FastscanConfig::default())?.is_empty());

        // Outside the scan window
        place(&mut io, 12, marker_vid(0, 1, 1), 0)?;
        let config = FastscanConfig {
            scan_window: 8,
            ..Default::default()
        };
        assert!(locate(&mut io, &config)?.is_empty());
        assert_eq!(locate(&mut io, &FastscanConfig::default())?.len(), 1);

        // Only later LEBs survive
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut io = UbiIo::new(&mut nand)?;
        place(&mut io, 3, marker_vid(1, 1, 2), 0)?;
        assert!(locate(&mut io, &FastscanConfig::default())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_locate_read_error() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.inject_fault(5, SimFault::Read)?;
        let mut io = UbiIo::new(&mut nand)?;

        let err = locate(&mut io, &FastscanConfig::default()).unwrap_err();
        assert!(matches!(err, FastscanError::Io { pnum: 5, .. }));
        Ok(())
    }
}
