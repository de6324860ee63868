//! Inspect and exercise fast-scan metadata on a simulated NAND image.
//!
//! The image is a raw dump as written by `--sim-write`: every PEB back to back, bad blocks filled
//! with a marker byte.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ubi_fastscan::{
    fastscan::{
        self,
        locator::{locate, read_metadata},
        reader::MetadataReader,
        FastscanConfig, LiveState, LiveVolume, RebuildOutcome, ScanInfo, VolumeTable, WlEntry,
        WlState, FASTSCAN_PEB_COUNT, FASTSCAN_SCAN_WINDOW, FASTSCAN_VOLUME_ID,
        FASTSCAN_VOLUME_NAME,
    },
    nand::{FlashLayout, SimNand},
    ubi::{Ec, PebHeader, UbiIo, Vid, VolType, UBI_MAX_ERASECOUNTER},
};

#[derive(Args, Debug)]
struct NandOptions {
    /// Path to the NAND image to use; a fresh, erased NAND is simulated without it
    #[clap(long)]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES
    #[clap(long)]
    sim_layout: FlashLayout,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<SimNand> {
        let mut sim = SimNand::new(self.sim_layout);
        if let Some(path) = &self.sim_path {
            if path.exists() {
                sim.load(&mut File::open(path)?)?;
            }
        }
        Ok(sim)
    }

    fn cleanup(&self, mut nand: SimNand) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                nand.save(&mut File::create(path)?)?;
            }
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
struct ConfigOptions {
    /// Most PEBs one metadata generation may occupy
    #[clap(long, default_value_t = FASTSCAN_PEB_COUNT)]
    reserved_pebs: u32,

    /// How many PEBs, from PEB 0, may hold metadata
    #[clap(long, default_value_t = FASTSCAN_SCAN_WINDOW)]
    scan_window: u32,
}

impl From<&ConfigOptions> for FastscanConfig {
    fn from(value: &ConfigOptions) -> Self {
        Self {
            reserved_pebs: value.reserved_pebs,
            scan_window: value.scan_window,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Erase every good PEB and stamp it with an EC header
    Format {
        /// Erase counter to record
        #[clap(long, default_value_t = 0)]
        ec: u64,
    },

    /// Map LEBs of a volume onto free PEBs by writing their VID headers
    Populate {
        #[clap(long)]
        vol_id: u32,

        /// Number of LEBs, from LEB 0, to map
        #[clap(long)]
        lebs: u32,

        /// Create the volume as static rather than dynamic
        #[clap(long)]
        r#static: bool,
    },

    /// Scan every PEB header and write a metadata generation describing the result
    Update,

    /// List the PEBs holding the newest metadata generation; this is a read-only operation
    Locate,

    /// Print every record of the newest metadata generation; this is a read-only operation
    Dump,

    /// Restore the scan info from metadata and summarize it; this is a read-only operation
    Rebuild,
}

impl Command {
    fn execute(self, nand: &mut SimNand, config: &FastscanConfig) -> Result<()> {
        match self {
            Command::Format { ec } => {
                let mut io = UbiIo::new(nand)?;
                let rpt = howudoin::new()
                    .label("Formatting blocks")
                    .set_len(u64::from(io.peb_count()));
                for pnum in 0..io.peb_count() {
                    rpt.inc();
                    if !io.is_bad_block(pnum)? {
                        io.format_block(pnum, Ec::default().ec(ec))?;
                    }
                }
                rpt.close();
            }

            Command::Populate {
                vol_id,
                lebs,
                r#static,
            } => {
                let vol_type = match r#static {
                    true => VolType::Static,
                    false => VolType::Dynamic,
                };

                let state = scan_live_state(nand)?;
                {
                    let mut volumes = state.lock_volumes();
                    if volumes.get(vol_id).is_none() {
                        let mut volume = LiveVolume::new(vol_id, vol_type, lebs);
                        volume.used_ebs = lebs;
                        volumes.insert(volume)?;
                    }
                }

                let mut io = UbiIo::new(nand)?;
                for lnum in 0..lebs {
                    let entry = state.map_leb(vol_id, lnum)?;
                    let vid = Vid {
                        vol_type,
                        vol_id,
                        used_ebs: lebs,
                        ..Default::default()
                    }
                    .lnum(lnum)
                    .sqnum(state.next_sqnum());
                    io.write_block_header(entry.pnum, vid)?;
                    println!("{vol_id}:{lnum} => PEB {}", entry.pnum);
                }
            }

            Command::Update => {
                let state = scan_live_state(nand)?;
                let generation = fastscan::update(nand, &state, config)?;

                let pnums: Vec<u32> = generation.pebs.iter().map(|e| e.pnum).collect();
                let superseded: Vec<u32> = generation.superseded.iter().map(|e| e.pnum).collect();
                println!("Wrote generation to PEBs {pnums:?}");
                println!("Superseded: {superseded:?}");
                println!("{:?}", generation.counts);
            }

            Command::Locate => {
                let mut io = UbiIo::new(nand)?;
                for peb in locate(&mut io, config)? {
                    let ec = peb.ec.map_or("?".into(), |ec| ec.to_string());
                    println!(
                        "LEB {:2} => PEB {:4} (sqnum {}, ec {ec})",
                        peb.lnum, peb.pnum, peb.sqnum
                    );
                }
            }

            Command::Dump => {
                let mut io = UbiIo::new(nand)?;
                let located = locate(&mut io, config)?;
                ensure!(!located.is_empty(), "no {FASTSCAN_VOLUME_NAME} on flash");

                let buf = read_metadata(&mut io, &located)?;
                let parsed = MetadataReader::parse(&buf, located.len())?;
                println!("{:#?}", parsed.header);

                for (name, section) in [
                    ("free", &parsed.free),
                    ("used", &parsed.used),
                    ("scrub", &parsed.scrub),
                    ("erase", &parsed.erase),
                ] {
                    println!("{name}:");
                    for entry in section {
                        println!("  PEB {:4} ec {}", entry.pnum, entry.ec);
                    }
                }

                for (info, map) in &parsed.volumes {
                    println!(
                        "volume {} (type {}): used_ebs {}, data_pad {}, last_eb_bytes {}",
                        info.vol_id, info.vol_type, info.used_ebs, info.data_pad, info.last_eb_bytes
                    );
                    for (lnum, pnum) in map.mapped() {
                        println!("  LEB {lnum:4} => PEB {pnum}");
                    }
                }
            }

            Command::Rebuild => match fastscan::rebuild(nand, config)? {
                RebuildOutcome::Restored(info) => print_scan_info(&info),
                RebuildOutcome::FullScanRequired(reason) => {
                    println!("Full scan required: {reason}");
                }
            },
        };

        Ok(())
    }
}

/// Reconstruct the live state the slow way, by reading the headers of every PEB
fn scan_live_state(nand: &mut SimNand) -> Result<LiveState> {
    let mut io = UbiIo::new(nand)?;
    let rpt = howudoin::new()
        .label("Scanning headers")
        .set_len(u64::from(io.peb_count()));

    let mut wl = WlState::default();
    let mut mappings: BTreeMap<u32, (VolType, Vec<(u64, u32, WlEntry)>)> = BTreeMap::new();
    let mut max_sqnum = 0;

    for pnum in 0..io.peb_count() {
        rpt.inc();
        let header = io.read_block_header(pnum)?;
        if header == PebHeader::Bad {
            wl.bad_peb_count += 1;
            continue;
        }

        let ec = io.read_ec_header(pnum)?;
        let count = ec.map_or(0, |hdr| hdr.ec.min(u64::from(UBI_MAX_ERASECOUNTER)) as u32);
        let entry = WlEntry::new(pnum, count);

        match header {
            PebHeader::Vid(vid) if vid.vol_id == FASTSCAN_VOLUME_ID => {
                max_sqnum = max_sqnum.max(vid.sqnum);
                wl.fastscan_pebs.push(entry);
            }
            PebHeader::Vid(vid) => {
                max_sqnum = max_sqnum.max(vid.sqnum);
                mappings
                    .entry(vid.vol_id)
                    .or_insert((vid.vol_type, Vec::new()))
                    .1
                    .push((vid.sqnum, vid.lnum, entry));
            }
            _ if ec.is_some() => {
                wl.free.insert(entry);
            }
            _ => wl.schedule_erase(entry, false),
        }
    }
    rpt.close();

    let mut volumes = VolumeTable::default();
    for (vol_id, (vol_type, mut lebs)) in mappings {
        let reserved = lebs.iter().map(|&(_, lnum, _)| lnum + 1).max().unwrap_or(0);
        let mut volume = LiveVolume::new(vol_id, vol_type, reserved);
        volume.used_ebs = reserved;

        // Oldest first, so the newest copy of each LEB ends up mapped
        lebs.sort_by_key(|&(sqnum, _, _)| sqnum);
        for (_, lnum, entry) in lebs {
            wl.used.insert(entry);
            if let Some(old) = volume.map(lnum, entry.pnum)? {
                if let Some(stale) = wl.used.iter().find(|e| e.pnum == old).copied() {
                    wl.used.remove(&stale);
                    wl.schedule_erase(stale, false);
                }
            }
        }
        volumes.insert(volume)?;
    }

    tracing::info!(
        free = wl.free.len(),
        used = wl.used.len(),
        bad = wl.bad_peb_count,
        metadata = wl.fastscan_pebs.len(),
        "scanned PEB headers"
    );
    Ok(LiveState::new(volumes, wl).with_sqnum(max_sqnum))
}

fn print_scan_info(info: &ScanInfo) {
    let pnums: Vec<u32> = info.metadata_pebs.iter().map(|p| p.pnum).collect();
    println!("Restored from PEBs {pnums:?}");
    println!(
        "free {}, used {} (scrub {}), erase {}, bad {}",
        info.free.len(),
        info.used_peb_count,
        info.scrub_peb_count,
        info.erase.len(),
        info.bad_peb_count
    );
    println!(
        "erase counters: min {}, mean {}, max {} over {} PEBs",
        info.min_ec, info.mean_ec, info.max_ec, info.ec_count
    );
    for volume in info.volumes.values() {
        println!(
            "volume {} ({:?}): {} of {} LEBs mapped, highest LEB {}",
            volume.vol_id, volume.vol_type, volume.leb_count, volume.reserved_lebs, volume.highest_lnum
        );
    }
    if !info.used.is_empty() {
        println!("{} used PEBs belong to no volume", info.used.len());
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    config: ConfigOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut nand = args.nand.open()?;
    args.cmd.execute(&mut nand, &(&args.config).into())?;
    args.nand.cleanup(nand)?;
    Ok(())
}
