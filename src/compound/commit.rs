//! Table re-serialization and write-out.
//!
//! Commit order matters for crash behavior: dirty body sectors go out
//! first, the header goes out last, so an interrupted commit leaves the
//! previous header (and therefore the previous consistent image) in
//! place. This is best-effort atomicity, not durability; callers needing
//! durability fsync the backing file themselves.

use super::Backing;
use super::engine::Engine;
use crate::consts::*;
use crate::directory::EntryType;
use crate::error::{Error, Result};
use crate::fat::{difat_ids_per_sector, difat_sectors_needed, fat_sectors_needed};
use crate::sector::SectorKind;
use std::io::{Read, Seek, SeekFrom, Write};

impl<F: Read + Seek> Engine<F> {
    /// Grow or shrink a table chain to hold `bytes`, re-threading the FAT
    /// and tagging every sector with `kind`.
    fn resize_table_chain(
        &mut self,
        mut chain: Vec<u32>,
        bytes: usize,
        kind: SectorKind,
    ) -> Result<Vec<u32>> {
        let sector_size = self.header.sector_size();
        let needed = bytes.div_ceil(sector_size);
        if needed < chain.len() {
            self.free_chain_tail(&chain, needed);
            chain.truncate(needed);
        }
        while chain.len() < needed {
            chain.push(self.acquire_sector(kind));
        }
        if !chain.is_empty() {
            self.link_chain(&chain);
        }
        for &id in &chain {
            self.sectors.slot_mut(id).set_kind(kind);
        }
        Ok(chain)
    }

    /// Re-serialize the mini FAT, the directory, the FAT and the DIFAT
    /// into their sector chains and bring the header up to date. After
    /// this, writing out dirty sectors plus the header yields a
    /// self-consistent image.
    pub(crate) fn prepare_tables(&mut self) -> Result<()> {
        self.note_range_lock();
        let sector_size = self.header.sector_size();

        // Mini FAT.
        let minifat_bytes = self.minifat.len() * 4;
        let current = self.chain(self.header.first_minifat_sector)?;
        let chain = self.resize_table_chain(current, minifat_bytes, SectorKind::Fat)?;
        for (index, &id) in chain.iter().enumerate() {
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            self.minifat.write_sector(index, payload);
            self.sectors.slot_mut(id).mark_dirty();
        }
        self.header.first_minifat_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.minifat_sector_count = chain.len() as u32;

        // Directory, padded to a whole sector with unallocated records
        // (all-zero bytes parse back as Invalid entries).
        let records_per_sector = sector_size / DIR_ENTRY_SIZE;
        let dir_bytes = self.directory.len() * DIR_ENTRY_SIZE;
        let current = self.chain(self.header.first_directory_sector)?;
        let chain = self.resize_table_chain(current, dir_bytes, SectorKind::Directory)?;
        let version = self.header.version;
        for (index, &id) in chain.iter().enumerate() {
            let mut scratch = vec![0u8; sector_size];
            for record in 0..records_per_sector {
                let sid = index * records_per_sector + record;
                if let Some(entry) = self.directory.get(sid) {
                    if entry.entry_type != EntryType::Invalid {
                        let offset = record * DIR_ENTRY_SIZE;
                        entry.write(&mut scratch[offset..offset + DIR_ENTRY_SIZE], version);
                    }
                }
            }
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            payload.copy_from_slice(&scratch);
            self.sectors.slot_mut(id).mark_dirty();
        }
        self.header.first_directory_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.directory_sector_count = chain.len() as u32;

        // FAT and DIFAT, sized iteratively: adding FAT sectors can add
        // sectors to cover, which can add DIFAT sectors, and so on until
        // the layout stabilizes.
        for _ in 0..8 {
            let mut changed = false;
            let needed_fat = fat_sectors_needed(self.sectors.len(), sector_size);
            while self.fat_sector_ids.len() < needed_fat {
                let id = self.acquire_sector(SectorKind::Fat);
                self.fat.set(id, FATSECT);
                self.fat_sector_ids.push(id);
                changed = true;
            }
            let needed_difat = difat_sectors_needed(self.fat_sector_ids.len(), sector_size);
            while self.difat_sector_ids.len() < needed_difat {
                let id = self.acquire_sector(SectorKind::Difat);
                self.fat.set(id, DIFSECT);
                self.difat_sector_ids.push(id);
                changed = true;
            }
            if !changed {
                break;
            }
        }

        // FAT payloads.
        let fat_ids = self.fat_sector_ids.clone();
        for (index, &id) in fat_ids.iter().enumerate() {
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            self.fat.write_sector(index, payload);
            let slot = self.sectors.slot_mut(id);
            slot.set_kind(SectorKind::Fat);
            slot.mark_dirty();
        }

        // DIFAT payloads: overflow FAT sector IDs plus the next-sector
        // pointer in the trailing four bytes.
        let difat_ids = self.difat_sector_ids.clone();
        let overflow: Vec<u32> = fat_ids
            .iter()
            .skip(HEADER_DIFAT_SLOTS)
            .copied()
            .collect();
        let ids_per_sector = difat_ids_per_sector(sector_size);
        for (index, &id) in difat_ids.iter().enumerate() {
            let begin = index * ids_per_sector;
            let end = ((index + 1) * ids_per_sector).min(overflow.len());
            let next = difat_ids.get(index + 1).copied().unwrap_or(ENDOFCHAIN);
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            payload.fill(0xFF);
            if begin < end {
                for (slot, &fat_id) in overflow[begin..end].iter().enumerate() {
                    let offset = slot * 4;
                    payload[offset..offset + 4].copy_from_slice(&fat_id.to_le_bytes());
                }
            }
            let tail = sector_size - 4;
            payload[tail..tail + 4].copy_from_slice(&next.to_le_bytes());
            let slot = self.sectors.slot_mut(id);
            slot.set_kind(SectorKind::Difat);
            slot.mark_dirty();
        }

        // Header fields.
        self.header.fat_sector_count = self.fat_sector_ids.len() as u32;
        let mut slots = [FREESECT; HEADER_DIFAT_SLOTS];
        for (slot, &id) in slots.iter_mut().zip(self.fat_sector_ids.iter()) {
            *slot = id;
        }
        self.header.difat = slots;
        self.header.first_difat_sector = self
            .difat_sector_ids
            .first()
            .copied()
            .unwrap_or(ENDOFCHAIN);
        self.header.difat_sector_count = self.difat_sector_ids.len() as u32;
        Ok(())
    }

    /// Write a complete fresh image to `out`: header first, then every
    /// sector in order, materializing unloaded payloads from the source.
    pub(crate) fn save_to<W: Write + Seek>(&mut self, out: &mut W) -> Result<()> {
        self.prepare_tables()?;
        let sector_size = self.header.sector_size();
        let mut header_buf = vec![0u8; sector_size];
        self.header.write(&mut header_buf);
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&header_buf)?;
        for id in 0..self.sectors.len() as u32 {
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            out.write_all(payload)?;
        }
        out.flush()?;
        Ok(())
    }
}

impl<F: Backing> Engine<F> {
    /// Flush the in-memory state back into the backing stream: tables
    /// first, then dirty sectors grouped into contiguous runs, then the
    /// header, then a truncate to the exact image length.
    pub(crate) fn commit(&mut self, release_memory: bool) -> Result<()> {
        self.prepare_tables()?;
        let sector_size = self.header.sector_size() as u64;
        let total = self.sectors.len() as u32;
        let mut id = 0u32;
        while id < total {
            let dirty = self.sectors.get(id).is_some_and(|s| s.is_dirty());
            if !dirty {
                id += 1;
                continue;
            }
            let run_start = id;
            let mut run = Vec::new();
            while id < total {
                match self.sectors.get(id) {
                    Some(sector) if sector.is_dirty() => {
                        let payload = sector
                            .payload()
                            .ok_or_else(|| Error::corrupted("dirty sector without payload"))?;
                        run.extend_from_slice(payload);
                        id += 1;
                    }
                    _ => break,
                }
            }
            self.backing
                .seek(SeekFrom::Start((run_start as u64 + 1) * sector_size))?;
            self.backing.write_all(&run)?;
            for written in run_start..id {
                let slot = self.sectors.slot_mut(written);
                slot.clear_dirty();
                if release_memory {
                    slot.evict();
                }
            }
        }

        let mut header_buf = vec![0u8; sector_size as usize];
        self.header.write(&mut header_buf);
        self.backing.seek(SeekFrom::Start(0))?;
        self.backing.write_all(&header_buf)?;
        self.backing.flush()?;
        self.backing.set_len((total as u64 + 1) * sector_size)?;
        Ok(())
    }
}
