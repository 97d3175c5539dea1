//! Sectors and the sparse sector index.
//!
//! The file body is an array of fixed-size sectors starting immediately
//! after the header, so sector `id` lives at byte offset
//! `(id + 1) * sector_size`. The collection keeps one slot per sector and
//! materializes payloads lazily from the backing stream; writes only touch
//! the in-memory buffers and set the dirty bit until commit.
//!
//! Slots are grouped into fixed-size chunks so that a file near the 4-GiB
//! limit never forces one giant contiguous reallocation.

use crate::error::Result;
use std::io::{Read, Seek, SeekFrom};

/// Slots per index chunk.
const SLOTS_PER_CHUNK: usize = 4096;

/// What a sector is used for. Tracked so table sectors can be re-serialized
/// in place and accounting stays checkable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SectorKind {
    /// Stream payload or any not-yet-classified sector.
    Data,
    /// Part of the normal chain backing the mini stream.
    MiniStream,
    /// Holds FAT or mini-FAT entries.
    Fat,
    /// Holds DIFAT entries.
    Difat,
    /// Holds directory records.
    Directory,
    /// The reserved v4 range-lock sector.
    RangeLock,
}

/// A single fixed-size sector: lazily loaded payload, dirty bit, kind tag.
#[derive(Debug)]
pub struct Sector {
    payload: Option<Vec<u8>>,
    dirty: bool,
    kind: SectorKind,
}

impl Sector {
    fn unloaded(kind: SectorKind) -> Self {
        Sector {
            payload: None,
            dirty: false,
            kind,
        }
    }

    /// The payload bytes, if materialized.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Replace the payload wholesale and mark the sector dirty.
    pub fn set_payload(&mut self, bytes: Vec<u8>) {
        self.payload = Some(bytes);
        self.dirty = true;
    }

    /// Drop the in-memory payload (used after commit to release memory).
    pub fn evict(&mut self) {
        debug_assert!(!self.dirty);
        self.payload = None;
    }

    /// Whether this sector must be rewritten on commit.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flag the sector for rewrite.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the rewrite flag once the bytes hit the backing stream.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// The sector's usage tag.
    pub fn kind(&self) -> SectorKind {
        self.kind
    }

    /// Re-tag the sector.
    pub fn set_kind(&mut self, kind: SectorKind) {
        self.kind = kind;
    }
}

/// Sparse, chunked index of every sector in the file.
#[derive(Debug)]
pub struct SectorCollection {
    chunks: Vec<Option<Vec<Sector>>>,
    len: usize,
    sector_size: usize,
    limit: Option<usize>,
    limit_hit: bool,
}

impl SectorCollection {
    /// An index over `len` existing sectors of `sector_size` bytes.
    pub fn new(sector_size: usize, len: usize) -> Self {
        SectorCollection {
            chunks: Vec::new(),
            len,
            sector_size,
            limit: None,
            limit_hit: false,
        }
    }

    /// Total number of sectors the file body spans.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The sector size this index was built for.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Arm the size-limit notification: when an append is about to create
    /// sector `count - 1`, that slot is reserved as a range-lock sector
    /// instead of being handed out, and the next
    /// [`take_limit_event`](Self::take_limit_event) returns true. Used by
    /// the controller to keep the v4 sector at offset 0x7FFFFF00 out of
    /// circulation.
    pub fn set_limit(&mut self, count: usize) {
        self.limit = Some(count);
        if self.len >= count {
            self.limit_hit = true;
        }
    }

    /// Consume the pending size-limit notification, if any.
    pub fn take_limit_event(&mut self) -> bool {
        std::mem::take(&mut self.limit_hit)
    }

    fn chunk_mut(&mut self, id: usize) -> &mut Vec<Sector> {
        let chunk_index = id / SLOTS_PER_CHUNK;
        if chunk_index >= self.chunks.len() {
            self.chunks.resize_with(chunk_index + 1, || None);
        }
        self.chunks[chunk_index].get_or_insert_with(|| {
            let mut slots = Vec::with_capacity(SLOTS_PER_CHUNK);
            slots.resize_with(SLOTS_PER_CHUNK, || Sector::unloaded(SectorKind::Data));
            slots
        })
    }

    /// Borrow a sector slot, if it is within bounds.
    pub fn get(&self, id: u32) -> Option<&Sector> {
        let id = id as usize;
        if id >= self.len {
            return None;
        }
        self.chunks
            .get(id / SLOTS_PER_CHUNK)?
            .as_ref()
            .map(|chunk| &chunk[id % SLOTS_PER_CHUNK])
    }

    /// Borrow a sector slot mutably, materializing its chunk. The sector
    /// payload itself may still be unloaded.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of bounds; callers validate IDs against
    /// [`len`](Self::len) first.
    pub fn slot_mut(&mut self, id: u32) -> &mut Sector {
        let index = id as usize;
        assert!(index < self.len, "sector {} out of bounds", id);
        let chunk = self.chunk_mut(index);
        &mut chunk[index % SLOTS_PER_CHUNK]
    }

    /// Append a fresh, zero-filled, dirty sector and return its ID.
    ///
    /// If the append would hand out the reserved slot armed via
    /// [`set_limit`](Self::set_limit), that slot is created as a
    /// [`SectorKind::RangeLock`] sector first and the caller receives the
    /// one after it.
    pub fn append(&mut self, kind: SectorKind) -> u32 {
        if let Some(limit) = self.limit {
            if self.len + 1 == limit {
                self.push_slot(SectorKind::RangeLock);
                self.limit_hit = true;
            }
        }
        self.push_slot(kind)
    }

    fn push_slot(&mut self, kind: SectorKind) -> u32 {
        let id = self.len;
        self.len += 1;
        let sector_size = self.sector_size;
        let chunk = self.chunk_mut(id);
        chunk[id % SLOTS_PER_CHUNK] = Sector {
            payload: Some(vec![0u8; sector_size]),
            dirty: true,
            kind,
        };
        id as u32
    }

    /// Materialize and borrow a sector's payload, reading it from the
    /// backing stream on first access. Offsets past the end of the backing
    /// stream read as zeroes (the sector was appended but never persisted).
    pub fn materialize<F: Read + Seek>(
        &mut self,
        id: u32,
        backing: &mut F,
    ) -> Result<&mut Vec<u8>> {
        let sector_size = self.sector_size;
        let index = id as usize;
        assert!(index < self.len, "sector {} out of bounds", id);
        let chunk = self.chunk_mut(index);
        let slot = &mut chunk[index % SLOTS_PER_CHUNK];
        if slot.payload.is_none() {
            let mut buf = vec![0u8; sector_size];
            let position = (id as u64 + 1) * sector_size as u64;
            let end = backing.seek(SeekFrom::End(0))?;
            if position < end {
                backing.seek(SeekFrom::Start(position))?;
                let available = ((end - position) as usize).min(sector_size);
                backing.read_exact(&mut buf[..available])?;
            }
            slot.payload = Some(buf);
        }
        Ok(slot.payload.as_mut().unwrap())
    }
}
