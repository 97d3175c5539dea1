//! The storage engine behind a compound file.
//!
//! The engine owns the backing stream, the sparse sector index, both
//! allocation tables, and the directory arena. Every mutation happens in
//! memory first: sector buffers are marked dirty, FAT entries are updated
//! in the in-memory table, and commit re-serializes the tables and flushes
//! dirty sectors back to the backing stream.
//!
//! Chain traversal never trusts the file: every walk carries a visited set
//! and bounds-checks each step, so a hostile FAT can fail fast (strict
//! mode) or be truncated at the first bad link (lenient mode) but can
//! never loop.

use crate::compound::{ConfigFlags, UpdateMode};
use crate::consts::*;
use crate::directory::{DirectoryEntry, EntryType, validate_name};
use crate::error::{Error, Result};
use crate::fat::AllocTable;
use crate::header::{Header, Version};
use crate::rbtree;
use crate::sector::{SectorCollection, SectorKind};
use crate::view::StreamView;
use fixedbitset::FixedBitSet;
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};

pub(crate) struct Engine<F> {
    pub(crate) backing: F,
    pub(crate) header: Header,
    pub(crate) sectors: SectorCollection,
    pub(crate) fat: AllocTable,
    pub(crate) minifat: AllocTable,
    pub(crate) directory: Vec<DirectoryEntry>,
    /// Sector IDs currently holding the FAT, in table order.
    pub(crate) fat_sector_ids: Vec<u32>,
    /// Sector IDs currently holding the DIFAT overflow, in chain order.
    pub(crate) difat_sector_ids: Vec<u32>,
    pub(crate) flags: ConfigFlags,
    pub(crate) mode: UpdateMode,
    free_normal: VecDeque<u32>,
    free_mini: VecDeque<u32>,
    free_normal_scanned: bool,
    free_mini_scanned: bool,
    /// Storages whose sibling tree has been rebuilt in memory.
    children_loaded: FixedBitSet,
    pub(crate) range_lock: Option<u32>,
}

impl<F> Engine<F> {
    pub(crate) fn strict(&self) -> bool {
        !self.flags.contains(ConfigFlags::NO_VALIDATION)
    }

    fn recycle(&self) -> bool {
        self.flags.contains(ConfigFlags::SECTOR_RECYCLE)
    }

    fn erase_freed(&self) -> bool {
        self.flags.contains(ConfigFlags::ERASE_FREE_SECTORS)
    }

    /// Borrow a live directory entry; deleted or out-of-range SIDs fail
    /// with [`Error::NotFound`].
    pub(crate) fn entry(&self, sid: u32) -> Result<&DirectoryEntry> {
        let entry = self
            .directory
            .get(sid as usize)
            .ok_or_else(|| Error::NotFound(format!("directory entry {}", sid)))?;
        if entry.entry_type == EntryType::Invalid {
            return Err(Error::NotFound(format!(
                "directory entry {} has been deleted",
                sid
            )));
        }
        Ok(entry)
    }

    fn entry_mut(&mut self, sid: u32) -> &mut DirectoryEntry {
        &mut self.directory[sid as usize]
    }

    fn sector_size(&self) -> usize {
        self.header.sector_size()
    }

    fn cutoff(&self) -> u64 {
        self.header.mini_stream_cutoff as u64
    }

    /// Whether a stream of `size` bytes belongs in the mini stream.
    fn is_mini_size(&self, size: u64) -> bool {
        size < self.cutoff()
    }

    /// A fresh, empty engine around `backing` (create path).
    pub(crate) fn create(backing: F, version: Version, flags: ConfigFlags) -> Self {
        let header = Header::new(version);
        let mut sectors = SectorCollection::new(header.sector_size(), 0);
        if version == Version::V4 {
            sectors.set_limit(range_lock_slot(header.sector_size()) as usize + 1);
        }
        Engine {
            backing,
            header,
            sectors,
            fat: AllocTable::new(),
            minifat: AllocTable::new(),
            directory: vec![DirectoryEntry::root()],
            fat_sector_ids: Vec::new(),
            difat_sector_ids: Vec::new(),
            flags,
            mode: UpdateMode::Update,
            free_normal: VecDeque::new(),
            free_mini: VecDeque::new(),
            free_normal_scanned: false,
            free_mini_scanned: false,
            children_loaded: FixedBitSet::with_capacity(1),
            range_lock: None,
        }
    }
}

/// The sector ID covering the v4 range-lock offset.
fn range_lock_slot(sector_size: usize) -> u32 {
    (RANGE_LOCK_OFFSET / sector_size as u64 - 1) as u32
}

impl<F: Read + Seek> Engine<F> {
    /// Open an existing compound file: parse the header, size the sparse
    /// index, walk the DIFAT to the FAT, then load the directory. The mini
    /// FAT is loaded eagerly too; mini payloads stay lazy like everything
    /// else.
    pub(crate) fn open(mut backing: F, flags: ConfigFlags, mode: UpdateMode) -> Result<Self> {
        let file_len = backing.seek(SeekFrom::End(0))?;
        if file_len < HEADER_SIZE as u64 {
            return Err(Error::BadSignature);
        }
        backing.seek(SeekFrom::Start(0))?;
        let mut header_buf = [0u8; HEADER_SIZE];
        backing.read_exact(&mut header_buf)?;
        let header = Header::parse(&header_buf)?;

        let sector_size = header.sector_size();
        let sector_count = file_len
            .saturating_sub(sector_size as u64)
            .div_ceil(sector_size as u64) as usize;
        let mut sectors = SectorCollection::new(sector_size, sector_count);
        let mut range_lock = None;
        if header.version == Version::V4 {
            let reserved = range_lock_slot(sector_size);
            sectors.set_limit(reserved as usize + 1);
            if (reserved as usize) < sector_count {
                range_lock = Some(reserved);
            }
        }

        let mut engine = Engine {
            backing,
            header,
            sectors,
            fat: AllocTable::new(),
            minifat: AllocTable::new(),
            directory: Vec::new(),
            fat_sector_ids: Vec::new(),
            difat_sector_ids: Vec::new(),
            flags,
            mode,
            free_normal: VecDeque::new(),
            free_mini: VecDeque::new(),
            free_normal_scanned: false,
            free_mini_scanned: false,
            children_loaded: FixedBitSet::new(),
            range_lock,
        };
        engine.sectors.take_limit_event();
        engine.load_fat()?;
        engine.load_minifat()?;
        engine.load_directory()?;
        if let Some(reserved) = engine.range_lock {
            engine.fat.set(reserved, ENDOFCHAIN);
            engine.sectors.slot_mut(reserved).set_kind(SectorKind::RangeLock);
        }
        engine.children_loaded = FixedBitSet::with_capacity(engine.directory.len());
        Ok(engine)
    }

    /// Walk the DIFAT (header slots, then chained DIFAT sectors) and load
    /// every FAT sector into the in-memory table.
    fn load_fat(&mut self) -> Result<()> {
        let strict = self.strict();
        let sector_size = self.sector_size();
        let total = self.sectors.len();

        let mut fat_ids: Vec<u32> = Vec::new();
        for &slot in self.header.difat.iter() {
            if slot > MAXREGSECT {
                break;
            }
            fat_ids.push(slot);
        }

        // DIFAT overflow chain; many real files terminate it with FREESECT
        // instead of ENDOFCHAIN, so both are accepted as end markers.
        let mut visited = FixedBitSet::with_capacity(total);
        let mut current = self.header.first_difat_sector;
        let mut remaining = self.header.difat_sector_count;
        while remaining > 0 && current != ENDOFCHAIN && current != FREESECT {
            if current as usize >= total {
                if strict {
                    return Err(Error::corrupted(format!(
                        "DIFAT sector {} is out of range",
                        current
                    )));
                }
                break;
            }
            if visited.contains(current as usize) {
                if strict {
                    return Err(Error::corrupted(format!(
                        "cyclic DIFAT chain at sector {}",
                        current
                    )));
                }
                break;
            }
            visited.insert(current as usize);
            self.difat_sector_ids.push(current);

            let payload = self.sectors.materialize(current, &mut self.backing)?;
            let ids_per_sector = sector_size / 4 - 1;
            for index in 0..ids_per_sector {
                let offset = index * 4;
                let id = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
                if id > MAXREGSECT {
                    break;
                }
                fat_ids.push(id);
            }
            let tail = sector_size - 4;
            let next = u32::from_le_bytes(payload[tail..tail + 4].try_into().unwrap());
            self.sectors.slot_mut(current).set_kind(SectorKind::Difat);
            current = next;
            remaining -= 1;
        }

        fat_ids.truncate(self.header.fat_sector_count as usize);
        for &id in &fat_ids {
            if id as usize >= total {
                if strict {
                    return Err(Error::corrupted(format!(
                        "FAT sector {} is out of range",
                        id
                    )));
                }
                continue;
            }
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            let copied = payload.clone();
            self.fat.push_sector_entries(&copied);
            self.sectors.slot_mut(id).set_kind(SectorKind::Fat);
            self.fat_sector_ids.push(id);
        }
        Ok(())
    }

    fn load_minifat(&mut self) -> Result<()> {
        let start = self.header.first_minifat_sector;
        if start == ENDOFCHAIN || start == FREESECT || self.header.minifat_sector_count == 0 {
            return Ok(());
        }
        let chain = self.chain(start)?;
        for &id in &chain {
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            let copied = payload.clone();
            self.minifat.push_sector_entries(&copied);
            self.sectors.slot_mut(id).set_kind(SectorKind::Fat);
        }
        Ok(())
    }

    fn load_directory(&mut self) -> Result<()> {
        let strict = self.strict();
        let version = self.header.version;
        let sector_size = self.sector_size();
        let chain = self.chain(self.header.first_directory_sector)?;
        if chain.is_empty() {
            return Err(Error::corrupted("directory chain is empty"));
        }
        let records_per_sector = sector_size / DIR_ENTRY_SIZE;
        let mut directory = Vec::with_capacity(chain.len() * records_per_sector);
        for &id in &chain {
            let payload = self.sectors.materialize(id, &mut self.backing)?;
            let copied = payload.clone();
            for record in 0..records_per_sector {
                let offset = record * DIR_ENTRY_SIZE;
                let entry =
                    DirectoryEntry::parse(&copied[offset..offset + DIR_ENTRY_SIZE], version, strict)?;
                directory.push(entry);
            }
            self.sectors.slot_mut(id).set_kind(SectorKind::Directory);
        }
        if directory.is_empty() || directory[0].entry_type != EntryType::Root {
            return Err(Error::corrupted("missing root entry"));
        }
        // Tag the mini stream's backing chain while we know where it is.
        let root_start = directory[0].start_sector;
        self.directory = directory;
        for id in self.chain(root_start)? {
            self.sectors.slot_mut(id).set_kind(SectorKind::MiniStream);
        }
        Ok(())
    }

    /// Follow FAT links from `start` until ENDOFCHAIN. Rejects
    /// out-of-range successors, reserved markers inside the chain, and
    /// revisits (cycles); in lenient mode the chain is truncated at the
    /// first offense instead.
    pub(crate) fn chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let strict = self.strict();
        let total = self.sectors.len();
        let mut chain = Vec::new();
        if start == ENDOFCHAIN || start == FREESECT {
            return Ok(chain);
        }
        let mut visited = FixedBitSet::with_capacity(total);
        let mut current = start;
        while current != ENDOFCHAIN {
            if current > MAXREGSECT || current as usize >= total {
                if strict {
                    return Err(Error::corrupted(format!(
                        "sector chain references invalid sector {:#X}",
                        current
                    )));
                }
                break;
            }
            if visited.contains(current as usize) {
                if strict {
                    return Err(Error::corrupted(format!(
                        "cyclic sector chain at sector {}",
                        current
                    )));
                }
                break;
            }
            visited.insert(current as usize);
            chain.push(current);
            current = self.fat.get(current);
        }
        Ok(chain)
    }

    /// Follow mini-FAT links from `start`; same validation as
    /// [`chain`](Self::chain) against the mini table.
    pub(crate) fn mini_chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let strict = self.strict();
        let total = self.minifat.len();
        let mut chain = Vec::new();
        if start == ENDOFCHAIN || start == FREESECT {
            return Ok(chain);
        }
        let mut visited = FixedBitSet::with_capacity(total);
        let mut current = start;
        while current != ENDOFCHAIN {
            if current > MAXREGSECT || current as usize >= total {
                if strict {
                    return Err(Error::corrupted(format!(
                        "mini chain references invalid mini sector {:#X}",
                        current
                    )));
                }
                break;
            }
            if visited.contains(current as usize) {
                if strict {
                    return Err(Error::corrupted(format!(
                        "cyclic mini sector chain at {}",
                        current
                    )));
                }
                break;
            }
            visited.insert(current as usize);
            chain.push(current);
            current = self.minifat.get(current);
        }
        Ok(chain)
    }

    fn root_chain(&mut self) -> Result<Vec<u32>> {
        let start = self.directory[0].start_sector;
        self.chain(start)
    }

    // ---- allocation ----------------------------------------------------

    fn refresh_free_pools(&mut self) {
        if !self.recycle() {
            return;
        }
        if !self.free_normal_scanned {
            self.free_normal = self.fat.free_ids(self.sectors.len()).into();
            self.free_normal_scanned = true;
        }
        if !self.free_mini_scanned {
            self.free_mini = self.minifat.free_ids(self.minifat.len()).into();
            self.free_mini_scanned = true;
        }
    }

    /// Take a sector for `kind`: recycled from the free pool when enabled,
    /// otherwise appended. Recycled sectors are zeroed so their previous
    /// contents can never leak into a new chain.
    pub(crate) fn acquire_sector(&mut self, kind: SectorKind) -> u32 {
        self.refresh_free_pools();
        if self.recycle() {
            if let Some(id) = self.free_normal.pop_front() {
                let sector_size = self.sector_size();
                let slot = self.sectors.slot_mut(id);
                slot.set_kind(kind);
                slot.set_payload(vec![0u8; sector_size]);
                return id;
            }
        }
        let id = self.sectors.append(kind);
        self.note_range_lock();
        id
    }

    /// Record the reserved range-lock sector once the collection reports
    /// the size limit was crossed.
    pub(crate) fn note_range_lock(&mut self) {
        if self.sectors.take_limit_event() && self.range_lock.is_none() {
            let reserved = range_lock_slot(self.sector_size());
            self.fat.set(reserved, ENDOFCHAIN);
            self.range_lock = Some(reserved);
        }
    }

    /// Thread the FAT so `chain` reads back in order, terminated with
    /// ENDOFCHAIN.
    pub(crate) fn link_chain(&mut self, chain: &[u32]) {
        for window in chain.windows(2) {
            self.fat.set(window[0], window[1]);
        }
        if let Some(&last) = chain.last() {
            self.fat.set(last, ENDOFCHAIN);
        }
    }

    fn link_mini_chain(&mut self, chain: &[u32]) {
        for window in chain.windows(2) {
            self.minifat.set(window[0], window[1]);
        }
        if let Some(&last) = chain.last() {
            self.minifat.set(last, ENDOFCHAIN);
        }
    }

    /// Release `chain[keep..]` back to the free pool, terminating the kept
    /// prefix. With `ERASE_FREE_SECTORS` the released payloads are zeroed
    /// in the image as well.
    pub(crate) fn free_chain_tail(&mut self, chain: &[u32], keep: usize) {
        let erase = self.erase_freed();
        let sector_size = self.sector_size();
        for &id in &chain[keep..] {
            if erase {
                let slot = self.sectors.slot_mut(id);
                slot.set_payload(vec![0u8; sector_size]);
            }
            self.fat.set(id, FREESECT);
            self.sectors.slot_mut(id).set_kind(SectorKind::Data);
            if self.recycle() {
                self.free_normal.push_back(id);
            }
        }
        if keep > 0 && keep < chain.len() {
            self.fat.set(chain[keep - 1], ENDOFCHAIN);
        }
    }

    /// Mini-space counterpart of [`free_chain_tail`]; erasing zeroes the
    /// released 64-byte regions inside the mini stream's backing sectors.
    fn free_mini_tail(&mut self, chain: &[u32], keep: usize, root_chain: &[u32]) -> Result<()> {
        let erase = self.erase_freed();
        let sector_size = self.sector_size();
        for &id in &chain[keep..] {
            if erase {
                let offset = id as u64 * MINI_SECTOR_SIZE as u64;
                let backing_index = (offset / sector_size as u64) as usize;
                let within = (offset % sector_size as u64) as usize;
                if let Some(&sector_id) = root_chain.get(backing_index) {
                    let payload = self.sectors.materialize(sector_id, &mut self.backing)?;
                    payload[within..within + MINI_SECTOR_SIZE].fill(0);
                    self.sectors.slot_mut(sector_id).mark_dirty();
                }
            }
            self.minifat.set(id, FREESECT);
            if self.recycle() {
                self.free_mini.push_back(id);
            }
        }
        if keep > 0 && keep < chain.len() {
            self.minifat.set(chain[keep - 1], ENDOFCHAIN);
        }
        Ok(())
    }

    /// Take a mini sector, growing the mini FAT and the mini stream's
    /// backing chain as needed. Keeps the root entry's start/size fields
    /// in sync with the backing chain.
    fn acquire_mini_sector(&mut self, root_chain: &mut Vec<u32>) -> Result<u32> {
        self.refresh_free_pools();
        let sector_size = self.sector_size();
        let recycled = if self.recycle() {
            self.free_mini.pop_front()
        } else {
            None
        };
        let id = match recycled {
            Some(id) => id,
            None => {
                let id = self.minifat.len() as u32;
                self.minifat.set(id, ENDOFCHAIN);
                id
            }
        };

        // The backing chain must cover the mini sector's byte range; a
        // recycled mini ID can still point past the chain when the mini
        // FAT was parsed from a padded table sector.
        let needed_bytes = (id as u64 + 1) * MINI_SECTOR_SIZE as u64;
        let needed_sectors = needed_bytes.div_ceil(sector_size as u64) as usize;
        while root_chain.len() < needed_sectors {
            let sector = self.acquire_sector(SectorKind::MiniStream);
            root_chain.push(sector);
        }
        self.link_chain(root_chain);
        let root = &mut self.directory[0];
        root.start_sector = root_chain.first().copied().unwrap_or(ENDOFCHAIN);
        // The mini stream length is what its backing chain holds, which is
        // a multiple of 64 by construction.
        root.size = root_chain.len() as u64 * sector_size as u64;

        // Scrub the handed-out region; recycled regions hold old payload.
        let offset = id as u64 * MINI_SECTOR_SIZE as u64;
        let backing_index = (offset / sector_size as u64) as usize;
        let within = (offset % sector_size as u64) as usize;
        let sector_id = root_chain[backing_index];
        let payload = self.sectors.materialize(sector_id, &mut self.backing)?;
        payload[within..within + MINI_SECTOR_SIZE].fill(0);
        self.sectors.slot_mut(sector_id).mark_dirty();
        Ok(id)
    }

    // ---- stream data path ----------------------------------------------

    /// Read from a stream at `position`, clamped to the stream length.
    pub(crate) fn read_stream(&mut self, sid: u32, position: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self.entry(sid)?;
        if entry.entry_type != EntryType::Stream {
            return Err(Error::InvalidOperation(format!(
                "'{}' is not a stream",
                entry.name
            )));
        }
        let size = entry.size;
        let start = entry.start_sector;
        if self.is_mini_size(size) {
            let chain = self.mini_chain(start)?;
            let root_chain = self.root_chain()?;
            let mut view =
                StreamView::mini(&mut self.sectors, &mut self.backing, chain, root_chain, size);
            view.read_at(position, buf)
        } else {
            let chain = self.chain(start)?;
            let mut view = StreamView::normal(&mut self.sectors, &mut self.backing, chain, size, None);
            view.read_at(position, buf)
        }
    }

    /// Write into a stream at `position`, extending it (and promoting
    /// across the cutoff) when the write ends past the current length.
    pub(crate) fn write_stream(&mut self, sid: u32, position: u64, data: &[u8]) -> Result<()> {
        let entry = self.entry(sid)?;
        if entry.entry_type != EntryType::Stream {
            return Err(Error::InvalidOperation(format!(
                "'{}' is not a stream",
                entry.name
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let end = position + data.len() as u64;
        if end > entry.size {
            self.set_stream_length(sid, end)?;
        }
        let entry = self.entry(sid)?;
        let size = entry.size;
        let start = entry.start_sector;
        if self.is_mini_size(size) {
            let chain = self.mini_chain(start)?;
            let root_chain = self.root_chain()?;
            let mut view =
                StreamView::mini(&mut self.sectors, &mut self.backing, chain, root_chain, size);
            view.write_at(position, data)
        } else {
            let chain = self.chain(start)?;
            let mut view = StreamView::normal(&mut self.sectors, &mut self.backing, chain, size, None);
            view.write_at(position, data)
        }
    }

    /// Resize a stream. Depending on which side of the mini-stream cutoff
    /// the old and new lengths fall, this grows or shrinks the chain in
    /// place, promotes the payload out of the mini stream, or demotes it
    /// back in; promotion and demotion copy the kept bytes exactly.
    pub(crate) fn set_stream_length(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let entry = self.entry(sid)?;
        if entry.entry_type != EntryType::Stream {
            return Err(Error::InvalidOperation(format!(
                "'{}' is not a stream",
                entry.name
            )));
        }
        let old_len = entry.size;
        if old_len == new_len {
            return Ok(());
        }
        match (self.is_mini_size(old_len), self.is_mini_size(new_len)) {
            (false, false) => self.resize_normal(sid, new_len),
            (true, true) => self.resize_mini(sid, new_len),
            (true, false) => self.promote(sid, new_len),
            (false, true) => self.demote(sid, new_len),
        }
    }

    fn resize_normal(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let sector_size = self.sector_size() as u64;
        let old_len = self.directory[sid as usize].size;
        let start = self.directory[sid as usize].start_sector;
        let mut chain = self.chain(start)?;
        let needed = new_len.div_ceil(sector_size) as usize;
        if needed < chain.len() {
            self.free_chain_tail(&chain, needed);
            chain.truncate(needed);
        } else {
            self.refresh_free_pools();
            let queue = self.recycle().then_some(&mut self.free_normal);
            let mut view =
                StreamView::normal(&mut self.sectors, &mut self.backing, chain, old_len, queue);
            view.set_length(new_len)?;
            chain = view.into_chain();
            self.note_range_lock();
            self.link_chain(&chain);
        }
        let entry = self.entry_mut(sid);
        entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = new_len;
        Ok(())
    }

    fn resize_mini(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let unit = MINI_SECTOR_SIZE as u64;
        let old_len = self.directory[sid as usize].size;
        let start = self.directory[sid as usize].start_sector;
        let mut chain = self.mini_chain(start)?;
        let mut root_chain = self.root_chain()?;
        let needed = new_len.div_ceil(unit) as usize;
        if needed < chain.len() {
            self.free_mini_tail(&chain, needed, &root_chain)?;
            chain.truncate(needed);
        } else {
            if new_len > old_len && !chain.is_empty() {
                // Scrub the stale tail of the last occupied unit before the
                // stream grows over it.
                let mut view = StreamView::mini(
                    &mut self.sectors,
                    &mut self.backing,
                    chain.clone(),
                    root_chain.clone(),
                    old_len,
                );
                view.set_length(new_len.min(chain.len() as u64 * unit))?;
            }
            while chain.len() < needed {
                let id = self.acquire_mini_sector(&mut root_chain)?;
                chain.push(id);
            }
            self.link_mini_chain(&chain);
        }
        let entry = self.entry_mut(sid);
        entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = new_len;
        Ok(())
    }

    fn promote(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let old_len = self.directory[sid as usize].size;
        let start = self.directory[sid as usize].start_sector;
        let keep = old_len.min(new_len) as usize;

        let old_chain = self.mini_chain(start)?;
        let root_chain = self.root_chain()?;
        let mut data = vec![0u8; keep];
        {
            let mut view = StreamView::mini(
                &mut self.sectors,
                &mut self.backing,
                old_chain.clone(),
                root_chain.clone(),
                old_len,
            );
            view.read_at(0, &mut data)?;
        }
        self.free_mini_tail(&old_chain, 0, &root_chain)?;

        self.refresh_free_pools();
        let queue = self.recycle().then_some(&mut self.free_normal);
        let mut view = StreamView::normal(&mut self.sectors, &mut self.backing, Vec::new(), 0, queue);
        view.set_length(new_len)?;
        view.write_at(0, &data)?;
        let chain = view.into_chain();
        self.note_range_lock();
        self.link_chain(&chain);

        let entry = self.entry_mut(sid);
        entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = new_len;
        Ok(())
    }

    fn demote(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let old_len = self.directory[sid as usize].size;
        let start = self.directory[sid as usize].start_sector;
        let keep = old_len.min(new_len) as usize;

        let old_chain = self.chain(start)?;
        let mut data = vec![0u8; keep];
        {
            let mut view = StreamView::normal(
                &mut self.sectors,
                &mut self.backing,
                old_chain.clone(),
                old_len,
                None,
            );
            view.read_at(0, &mut data)?;
        }
        self.free_chain_tail(&old_chain, 0);

        let mut root_chain = self.root_chain()?;
        let needed = new_len.div_ceil(MINI_SECTOR_SIZE as u64) as usize;
        let mut chain = Vec::with_capacity(needed);
        while chain.len() < needed {
            let id = self.acquire_mini_sector(&mut root_chain)?;
            chain.push(id);
        }
        self.link_mini_chain(&chain);
        {
            let mut view = StreamView::mini(
                &mut self.sectors,
                &mut self.backing,
                chain.clone(),
                root_chain,
                new_len,
            );
            view.write_at(0, &data)?;
        }

        let entry = self.entry_mut(sid);
        entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
        entry.size = new_len;
        Ok(())
    }

    /// Release a stream's payload chain ahead of deleting its entry.
    fn free_stream_payload(&mut self, sid: u32) -> Result<()> {
        let entry = &self.directory[sid as usize];
        let size = entry.size;
        let start = entry.start_sector;
        if start == ENDOFCHAIN {
            return Ok(());
        }
        if self.is_mini_size(size) {
            let chain = self.mini_chain(start)?;
            let root_chain = self.root_chain()?;
            self.free_mini_tail(&chain, 0, &root_chain)?;
        } else {
            let chain = self.chain(start)?;
            self.free_chain_tail(&chain, 0);
        }
        let entry = self.entry_mut(sid);
        entry.start_sector = ENDOFCHAIN;
        entry.size = 0;
        Ok(())
    }

    // ---- directory path ------------------------------------------------

    /// Rebuild a storage's sibling tree on first access: DFS the raw
    /// on-disk links with validation, then re-insert every child into a
    /// fresh tree. Hostile link graphs either fail (strict) or contribute
    /// their reachable, well-formed subset (lenient).
    pub(crate) fn ensure_children_loaded(&mut self, parent: u32) -> Result<()> {
        let index = parent as usize;
        if self.children_loaded.contains(index) {
            return Ok(());
        }
        let strict = self.strict();
        let child_root = self.directory[index].child;
        let sids = rbtree::collect_siblings(&self.directory, child_root, strict)?;
        let mut root = NOSTREAM;
        for sid in sids {
            match rbtree::insert(&mut self.directory, root, sid) {
                Ok(new_root) => root = new_root,
                Err(Error::DuplicatedItem(name)) => {
                    if strict {
                        return Err(Error::corrupted(format!(
                            "duplicate sibling name '{}'",
                            name
                        )));
                    }
                }
                Err(other) => return Err(other),
            }
        }
        self.directory[index].child = root;
        self.children_loaded.grow(self.directory.len());
        self.children_loaded.insert(index);
        Ok(())
    }

    /// Exact-match child lookup under the invariant name ordering.
    pub(crate) fn find_child(&mut self, parent: u32, name: &str) -> Result<Option<u32>> {
        self.ensure_children_loaded(parent)?;
        let root = self.directory[parent as usize].child;
        Ok(rbtree::find(&self.directory, root, name))
    }

    /// The parent's children in tree order.
    pub(crate) fn children_in_order(&mut self, parent: u32) -> Result<Vec<u32>> {
        self.ensure_children_loaded(parent)?;
        let root = self.directory[parent as usize].child;
        Ok(rbtree::in_order(&self.directory, root))
    }

    /// Reuse the first Invalid directory slot, or grow the list.
    fn alloc_dir_slot(&mut self, entry: DirectoryEntry) -> u32 {
        for (sid, slot) in self.directory.iter_mut().enumerate().skip(1) {
            if slot.entry_type == EntryType::Invalid {
                *slot = entry;
                return sid as u32;
            }
        }
        self.directory.push(entry);
        self.children_loaded.grow(self.directory.len());
        (self.directory.len() - 1) as u32
    }

    /// Insert a new child entry under `parent` and return its SID.
    pub(crate) fn add_child(&mut self, parent: u32, entry: DirectoryEntry) -> Result<u32> {
        validate_name(&entry.name)?;
        self.entry(parent)?;
        self.ensure_children_loaded(parent)?;
        if !self.directory[parent as usize].is_storage_like() {
            return Err(Error::InvalidOperation(format!(
                "'{}' is not a storage",
                self.directory[parent as usize].name
            )));
        }
        let root = self.directory[parent as usize].child;
        if rbtree::find(&self.directory, root, &entry.name).is_some() {
            return Err(Error::DuplicatedItem(entry.name));
        }
        let sid = self.alloc_dir_slot(entry);
        let new_root = rbtree::insert(&mut self.directory, root, sid)?;
        self.directory[parent as usize].child = new_root;
        // Freshly created entries have no children to load.
        self.children_loaded.insert(sid as usize);
        Ok(sid)
    }

    /// Unhook the child named `name` from `parent`'s tree and return the
    /// slot now holding its payload. Deletion may relocate a sibling's
    /// record (successor splice), so the loaded-children bit travels with
    /// the payload.
    fn detach_child(&mut self, parent: u32, name: &str) -> Result<u32> {
        let sid = self
            .find_child(parent, name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let root = self.directory[parent as usize].child;
        let (new_root, freed) = rbtree::remove(&mut self.directory, root, name)?;
        self.directory[parent as usize].child = new_root;
        if freed != sid {
            self.children_loaded.grow(self.directory.len());
            let sid_loaded = self.children_loaded.contains(sid as usize);
            let freed_loaded = self.children_loaded.contains(freed as usize);
            self.children_loaded.set(sid as usize, freed_loaded);
            self.children_loaded.set(freed as usize, sid_loaded);
        }
        Ok(freed)
    }

    /// Delete a child by name. Storages are emptied recursively first;
    /// stream payload chains go back to the free pool. The record is
    /// marked Invalid and its SID becomes recyclable.
    pub(crate) fn delete_entry(&mut self, parent: u32, name: &str) -> Result<()> {
        let sid = self
            .find_child(parent, name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        match self.directory[sid as usize].entry_type {
            EntryType::Storage => {
                let child_names: Vec<String> = self
                    .children_in_order(sid)?
                    .into_iter()
                    .map(|child| self.directory[child as usize].name.clone())
                    .collect();
                for child_name in child_names {
                    self.delete_entry(sid, &child_name)?;
                }
            }
            EntryType::Stream => self.free_stream_payload(sid)?,
            EntryType::Root | EntryType::Invalid => {
                return Err(Error::InvalidOperation(format!(
                    "cannot delete '{}'",
                    name
                )));
            }
        }
        let freed = self.detach_child(parent, name)?;
        self.directory[freed as usize].clear();
        self.children_loaded.set(freed as usize, false);
        Ok(())
    }

    /// Rename a child. The comparison key changes, so the node is removed
    /// and re-inserted to keep the tree ordered.
    pub(crate) fn rename_entry(&mut self, parent: u32, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;
        self.find_child(parent, old)?
            .ok_or_else(|| Error::NotFound(old.to_string()))?;
        let root = self.directory[parent as usize].child;
        use crate::directory::cmp_names;
        use std::cmp::Ordering;
        if cmp_names(old, new) != Ordering::Equal
            && rbtree::find(&self.directory, root, new).is_some()
        {
            return Err(Error::DuplicatedItem(new.to_string()));
        }
        let freed = self.detach_child(parent, old)?;
        self.directory[freed as usize].name = new.to_string();
        let root = self.directory[parent as usize].child;
        let new_root = rbtree::insert(&mut self.directory, root, freed)?;
        self.directory[parent as usize].child = new_root;
        Ok(())
    }

    /// All stream paths in the file, depth first.
    pub(crate) fn walk_paths(&mut self) -> Result<Vec<Vec<String>>> {
        let mut out = Vec::new();
        let mut stack: Vec<(u32, Vec<String>)> = vec![(0, Vec::new())];
        while let Some((storage, path)) = stack.pop() {
            for sid in self.children_in_order(storage)? {
                let entry = &self.directory[sid as usize];
                let mut child_path = path.clone();
                child_path.push(entry.name.clone());
                match entry.entry_type {
                    EntryType::Stream => out.push(child_path),
                    EntryType::Storage => stack.push((sid, child_path)),
                    _ => {}
                }
            }
        }
        Ok(out)
    }
}
