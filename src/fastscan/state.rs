//! The live translation-layer state that a metadata generation snapshots.
//!
//! Deciding which blocks are free, used, scrub-pending or erase-pending belongs to the
//! wear-leveling engine; this module only models the populations it maintains, so that the writer
//! has something to walk and tests have something to compare a rebuild against.
//!
//! Two locks guard the state: one for the volume table, one for the block populations and the
//! pending work queue. Code that needs both takes them through [LiveState::lock_all], which always
//! acquires the volume table first.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, ensure};

use super::records::LEB_UNMAPPED;
use crate::ubi::{VolType, UBI_INT_VOL_COUNT, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES};

/// A PEB tracked by the wear-leveling engine
///
/// Ordering is by erase counter first, so the populations iterate from least- to most-worn.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WlEntry {
    pub ec: u32,
    pub pnum: u32,
}

impl WlEntry {
    pub fn new(pnum: u32, ec: u32) -> Self {
        Self { ec, pnum }
    }
}

/// Background work queued for the wear-leveling thread
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PendingWork {
    /// Erase a PEB (optionally torture-testing it) before returning it to the free population
    Erase { entry: WlEntry, torture: bool },

    /// Move data from a worn-in block; carries no PEB that leaves the populations
    WearLevel,
}

/// Block populations and pending work
#[derive(Debug, Default)]
pub struct WlState {
    pub free: BTreeSet<WlEntry>,
    pub used: BTreeSet<WlEntry>,
    pub scrub: BTreeSet<WlEntry>,
    pub works: VecDeque<PendingWork>,
    pub bad_peb_count: u32,

    /// PEBs hosting the current metadata generation
    pub fastscan_pebs: Vec<WlEntry>,
}

impl WlState {
    /// Entries queued for erasure, in queue order
    pub fn erase_works(&self) -> impl Iterator<Item = &WlEntry> {
        self.works.iter().filter_map(|work| match work {
            PendingWork::Erase { entry, .. } => Some(entry),
            PendingWork::WearLevel => None,
        })
    }

    pub fn schedule_erase(&mut self, entry: WlEntry, torture: bool) {
        self.works.push_back(PendingWork::Erase { entry, torture });
    }

    /// Remove the least-worn free PEB
    pub fn take_free(&mut self) -> Option<WlEntry> {
        self.free.pop_first()
    }

    /// Remove the `count` least-worn free PEBs numbered below `limit`
    ///
    /// Takes nothing if there aren't enough; the error carries how many were eligible.
    pub fn take_free_below(&mut self, limit: u32, count: usize) -> Result<Vec<WlEntry>, usize> {
        let eligible: Vec<WlEntry> = self
            .free
            .iter()
            .filter(|entry| entry.pnum < limit)
            .copied()
            .collect();
        if eligible.len() < count {
            return Err(eligible.len());
        }

        let taken = eligible[..count].to_vec();
        for entry in &taken {
            self.free.remove(entry);
        }
        Ok(taken)
    }

    /// Number of PEBs accounted for, bad blocks included
    pub fn peb_total(&self) -> usize {
        self.free.len()
            + self.used.len()
            + self.scrub.len()
            + self.erase_works().count()
            + self.fastscan_pebs.len()
            + self.bad_peb_count as usize
    }
}

/// A volume as the live device sees it
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LiveVolume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub last_eb_bytes: u32,

    /// PEB of every reserved LEB, or [LEB_UNMAPPED]
    eba: Vec<i32>,
}

impl LiveVolume {
    pub fn new(vol_id: u32, vol_type: VolType, reserved_pebs: u32) -> Self {
        Self {
            vol_id,
            vol_type,
            used_ebs: 0,
            data_pad: 0,
            last_eb_bytes: 0,
            eba: vec![LEB_UNMAPPED; reserved_pebs as usize],
        }
    }

    pub fn reserved_pebs(&self) -> u32 {
        self.eba.len() as u32
    }

    pub fn eba(&self) -> &[i32] {
        &self.eba
    }

    pub fn lookup(&self, lnum: u32) -> Option<u32> {
        self.eba
            .get(lnum as usize)
            .and_then(|&pnum| u32::try_from(pnum).ok())
    }

    /// Point `lnum` at `pnum`, returning the PEB it previously mapped to
    pub fn map(&mut self, lnum: u32, pnum: u32) -> anyhow::Result<Option<u32>> {
        let pnum = i32::try_from(pnum)?;
        let Some(slot) = self.eba.get_mut(lnum as usize) else {
            bail!("LEB {lnum} beyond volume {} reservation", self.vol_id);
        };
        let old = std::mem::replace(slot, pnum);
        Ok(u32::try_from(old).ok())
    }

    pub fn unmap(&mut self, lnum: u32) -> Option<u32> {
        let slot = self.eba.get_mut(lnum as usize)?;
        u32::try_from(std::mem::replace(slot, LEB_UNMAPPED)).ok()
    }
}

/// Volume slots: user volumes by ID, then the internal volumes
#[derive(Debug, Clone)]
pub struct VolumeTable {
    slots: Vec<Option<LiveVolume>>,
}

impl Default for VolumeTable {
    fn default() -> Self {
        Self::new(UBI_MAX_VOLUMES)
    }
}

impl VolumeTable {
    /// A table with `user_slots` user-volume slots plus the internal volume slots
    pub fn new(user_slots: usize) -> Self {
        Self {
            slots: vec![None; user_slots + UBI_INT_VOL_COUNT],
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, vol_id: u32) -> Option<usize> {
        let user_slots = self.slots.len() - UBI_INT_VOL_COUNT;
        let slot = match vol_id.checked_sub(UBI_LAYOUT_VOLUME_ID) {
            Some(internal) => user_slots + internal as usize,
            None => vol_id as usize,
        };
        let in_range = match vol_id >= UBI_LAYOUT_VOLUME_ID {
            true => slot < self.slots.len(),
            false => slot < user_slots,
        };
        in_range.then_some(slot)
    }

    pub fn insert(&mut self, volume: LiveVolume) -> anyhow::Result<()> {
        let vol_id = volume.vol_id;
        let slot = self
            .slot_of(vol_id)
            .ok_or(anyhow::anyhow!("volume ID {vol_id} has no slot"))?;
        ensure!(self.slots[slot].is_none(), "volume {vol_id} already exists");
        self.slots[slot] = Some(volume);
        Ok(())
    }

    pub fn remove(&mut self, vol_id: u32) -> Option<LiveVolume> {
        let slot = self.slot_of(vol_id)?;
        self.slots[slot].take()
    }

    pub fn get(&self, vol_id: u32) -> Option<&LiveVolume> {
        self.slots[self.slot_of(vol_id)?].as_ref()
    }

    pub fn get_mut(&mut self, vol_id: u32) -> Option<&mut LiveVolume> {
        let slot = self.slot_of(vol_id)?;
        self.slots[slot].as_mut()
    }

    /// Populated slots, in slot order
    pub fn iter(&self) -> impl Iterator<Item = &LiveVolume> {
        self.slots.iter().flatten()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded data is plain bookkeeping with no invariant a panicking holder could break
    // halfway, so a poisoned lock is still usable.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the metadata writer snapshots
#[derive(Debug, Default)]
pub struct LiveState {
    volumes: Mutex<VolumeTable>,
    wl: Mutex<WlState>,
    sqnum: AtomicU64,
}

impl LiveState {
    pub fn new(volumes: VolumeTable, wl: WlState) -> Self {
        Self {
            volumes: Mutex::new(volumes),
            wl: Mutex::new(wl),
            sqnum: AtomicU64::new(0),
        }
    }

    /// Start handing out VID sequence numbers above `sqnum`
    pub fn with_sqnum(self, sqnum: u64) -> Self {
        self.sqnum.store(sqnum, Ordering::Relaxed);
        self
    }

    pub fn next_sqnum(&self) -> u64 {
        self.sqnum.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn lock_volumes(&self) -> MutexGuard<'_, VolumeTable> {
        lock(&self.volumes)
    }

    pub fn lock_wl(&self) -> MutexGuard<'_, WlState> {
        lock(&self.wl)
    }

    /// Take both locks, volume table first
    pub fn lock_all(&self) -> (MutexGuard<'_, VolumeTable>, MutexGuard<'_, WlState>) {
        let volumes = self.lock_volumes();
        let wl = self.lock_wl();
        (volumes, wl)
    }

    /// Map `lnum` of `vol_id` onto the least-worn free PEB, as a write to an unmapped LEB would.
    ///
    /// Any PEB previously mapped there is queued for erasure.
    pub fn map_leb(&self, vol_id: u32, lnum: u32) -> anyhow::Result<WlEntry> {
        let (mut volumes, mut wl) = self.lock_all();

        let volume = volumes
            .get_mut(vol_id)
            .ok_or(anyhow::anyhow!("no volume {vol_id}"))?;
        ensure!(lnum < volume.reserved_pebs(), "LEB {lnum} out of range");
        let entry = wl.take_free().ok_or(anyhow::anyhow!("no free PEBs"))?;

        let old = match volume.map(lnum, entry.pnum) {
            Ok(old) => old,
            Err(err) => {
                wl.free.insert(entry);
                return Err(err);
            }
        };

        if let Some(old) = old {
            let used = wl.used.iter().find(|e| e.pnum == old).copied();
            let scrub = wl.scrub.iter().find(|e| e.pnum == old).copied();
            if let Some(old_entry) = used {
                wl.used.remove(&old_entry);
                wl.schedule_erase(old_entry, false);
            } else if let Some(old_entry) = scrub {
                wl.scrub.remove(&old_entry);
                wl.schedule_erase(old_entry, false);
            }
        }

        wl.used.insert(entry);
        Ok(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh_state(pebs: u32) -> LiveState {
        let wl = WlState {
            free: (0..pebs).map(|pnum| WlEntry::new(pnum, 10 - pnum % 3)).collect(),
            ..Default::default()
        };
        let mut volumes = VolumeTable::default();
        volumes
            .insert(LiveVolume::new(0, VolType::Dynamic, 4))
            .unwrap();
        LiveState::new(volumes, wl)
    }

    #[test]
    fn test_free_order_by_wear() {
        let state = fresh_state(6);
        let mut wl = state.lock_wl();
        let order: Vec<u32> = std::iter::from_fn(|| wl.take_free().map(|e| e.pnum)).collect();
        // ECs are 10, 9, 8, 10, 9, 8 for PEBs 0..6
        assert_eq!(order, [2, 5, 1, 4, 0, 3]);
    }

    #[test]
    fn test_take_free_below() {
        let state = fresh_state(6);
        let mut wl = state.lock_wl();

        assert_eq!(wl.take_free_below(3, 4), Err(3));
        assert_eq!(wl.free.len(), 6);

        let taken: Vec<u32> = wl.take_free_below(4, 2).unwrap().iter().map(|e| e.pnum).collect();
        assert_eq!(taken, [2, 1]);
        assert_eq!(wl.free.len(), 4);
    }

    #[test]
    fn test_map_leb() -> anyhow::Result<()> {
        let state = fresh_state(6);

        let first = state.map_leb(0, 1)?;
        assert_eq!(first.pnum, 2);
        assert_eq!(state.lock_volumes().get(0).unwrap().lookup(1), Some(2));

        // Remapping queues the old PEB for erasure
        let second = state.map_leb(0, 1)?;
        assert_eq!(second.pnum, 5);
        {
            let wl = state.lock_wl();
            assert_eq!(wl.erase_works().copied().collect::<Vec<_>>(), [first]);
            assert_eq!(wl.used.iter().copied().collect::<Vec<_>>(), [second]);
            assert_eq!(wl.peb_total(), 6);
        }

        assert!(state.map_leb(0, 4).is_err());
        assert!(state.map_leb(1, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_map_leb_over_scrub() -> anyhow::Result<()> {
        let state = fresh_state(3);
        let scrubbed = WlEntry::new(7, 4);
        {
            let (mut volumes, mut wl) = state.lock_all();
            volumes.get_mut(0).unwrap().map(2, scrubbed.pnum)?;
            wl.scrub.insert(scrubbed);
        }

        let entry = state.map_leb(0, 2)?;
        let wl = state.lock_wl();
        assert!(wl.scrub.is_empty());
        assert_eq!(wl.erase_works().copied().collect::<Vec<_>>(), [scrubbed]);
        assert_eq!(wl.used.iter().copied().collect::<Vec<_>>(), [entry]);
        Ok(())
    }

    #[test]
    fn test_map_leb_failure_keeps_free() {
        let huge = WlEntry::new(0x8000_0000, 1);
        let wl = WlState {
            free: [huge].into_iter().collect(),
            ..Default::default()
        };
        let mut volumes = VolumeTable::default();
        volumes
            .insert(LiveVolume::new(0, VolType::Dynamic, 2))
            .unwrap();
        let state = LiveState::new(volumes, wl);

        assert!(state.map_leb(0, 0).is_err());
        let wl = state.lock_wl();
        assert_eq!(wl.free.iter().copied().collect::<Vec<_>>(), [huge]);
        assert!(wl.used.is_empty());
        assert_eq!(state.lock_volumes().get(0).unwrap().lookup(0), None);
    }

    #[test]
    fn test_volume_slots() -> anyhow::Result<()> {
        let mut table = VolumeTable::new(4);
        assert_eq!(table.slot_count(), 5);

        table.insert(LiveVolume::new(3, VolType::Static, 1))?;
        table.insert(LiveVolume::new(UBI_LAYOUT_VOLUME_ID, VolType::Dynamic, 2))?;
        assert!(table.insert(LiveVolume::new(3, VolType::Dynamic, 1)).is_err());
        assert!(table.insert(LiveVolume::new(4, VolType::Dynamic, 1)).is_err());
        assert!(table
            .insert(LiveVolume::new(UBI_LAYOUT_VOLUME_ID + 1, VolType::Dynamic, 1))
            .is_err());

        let ids: Vec<u32> = table.iter().map(|v| v.vol_id).collect();
        assert_eq!(ids, [3, UBI_LAYOUT_VOLUME_ID]);

        let volume = table.get_mut(3).unwrap();
        assert_eq!(volume.map(0, 17)?, None);
        assert_eq!(volume.map(0, 18)?, Some(17));
        assert_eq!(volume.unmap(0), Some(18));
        assert_eq!(volume.lookup(0), None);
        assert!(volume.map(1, 0).is_err());

        assert!(table.remove(3).is_some());
        assert!(table.get(3).is_none());
        Ok(())
    }
}
