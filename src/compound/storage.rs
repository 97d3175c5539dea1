//! Storage handles and directory traversal.

use super::engine::Engine;
use crate::compound::stream::Stream;
use crate::directory::{DirectoryEntry, EntryType};
use crate::error::{Error, Result};
use crate::time::{filetime_now, filetime_to_datetime};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::io::{Read, Seek};
use std::rc::{Rc, Weak};

/// A storage entry in a compound file, much like a filesystem directory.
///
/// Handles stay valid across other mutations of the file but are
/// invalidated when the owning [`CompoundFile`](super::CompoundFile) is
/// closed or dropped; operations then fail with [`Error::Disposed`].
pub struct Storage<F> {
    engine: Weak<RefCell<Engine<F>>>,
    sid: u32,
}

impl<F> Clone for Storage<F> {
    fn clone(&self) -> Self {
        Storage {
            engine: self.engine.clone(),
            sid: self.sid,
        }
    }
}

/// A directory child, as handed to [`Storage::visit_entries`] closures.
pub enum Item<F> {
    /// A sub-storage.
    Storage(Storage<F>),
    /// A stream.
    Stream(Stream<F>),
}

impl<F> Item<F> {
    /// The entry's name.
    pub fn name(&self) -> Result<String> {
        match self {
            Item::Storage(storage) => storage.name(),
            Item::Stream(stream) => stream.name(),
        }
    }

    /// True for the storage variant.
    pub fn is_storage(&self) -> bool {
        matches!(self, Item::Storage(_))
    }

    /// True for the stream variant.
    pub fn is_stream(&self) -> bool {
        matches!(self, Item::Stream(_))
    }

    /// Borrow the storage handle, if this is one.
    pub fn as_storage(&self) -> Option<&Storage<F>> {
        match self {
            Item::Storage(storage) => Some(storage),
            Item::Stream(_) => None,
        }
    }

    /// Borrow the stream handle, if this is one.
    pub fn as_stream(&self) -> Option<&Stream<F>> {
        match self {
            Item::Stream(stream) => Some(stream),
            Item::Storage(_) => None,
        }
    }
}

impl<F> Storage<F> {
    pub(crate) fn new(engine: Weak<RefCell<Engine<F>>>, sid: u32) -> Self {
        Storage { engine, sid }
    }

    fn engine(&self) -> Result<Rc<RefCell<Engine<F>>>> {
        self.engine.upgrade().ok_or(Error::Disposed)
    }

    /// True for the root storage.
    pub fn is_root(&self) -> bool {
        self.sid == 0
    }

    /// The storage's name.
    pub fn name(&self) -> Result<String> {
        let rc = self.engine()?;
        let engine = rc.borrow();
        Ok(engine.entry(self.sid)?.name.clone())
    }

    /// The storage CLSID.
    pub fn clsid(&self) -> Result<[u8; 16]> {
        let rc = self.engine()?;
        let engine = rc.borrow();
        Ok(engine.entry(self.sid)?.clsid)
    }

    /// Set the storage CLSID (e.g. to mark a document type).
    pub fn set_clsid(&mut self, clsid: [u8; 16]) -> Result<()> {
        let rc = self.engine()?;
        let mut engine = rc.borrow_mut();
        engine.entry(self.sid)?;
        engine.directory[self.sid as usize].clsid = clsid;
        Ok(())
    }

    /// The user-defined state bits.
    pub fn state_bits(&self) -> Result<u32> {
        let rc = self.engine()?;
        let engine = rc.borrow();
        Ok(engine.entry(self.sid)?.state_bits)
    }

    /// Set the user-defined state bits.
    pub fn set_state_bits(&mut self, bits: u32) -> Result<()> {
        let rc = self.engine()?;
        let mut engine = rc.borrow_mut();
        engine.entry(self.sid)?;
        engine.directory[self.sid as usize].state_bits = bits;
        Ok(())
    }

    /// Creation time as raw FILETIME ticks (zero means not recorded).
    pub fn created(&self) -> Result<u64> {
        let rc = self.engine()?;
        let engine = rc.borrow();
        Ok(engine.entry(self.sid)?.created)
    }

    /// Modification time as raw FILETIME ticks.
    pub fn modified(&self) -> Result<u64> {
        let rc = self.engine()?;
        let engine = rc.borrow();
        Ok(engine.entry(self.sid)?.modified)
    }

    /// Creation time as a calendar timestamp, if recorded.
    pub fn created_utc(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(filetime_to_datetime(self.created()?))
    }

    /// Modification time as a calendar timestamp, if recorded.
    pub fn modified_utc(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(filetime_to_datetime(self.modified()?))
    }
}

impl<F: Read + Seek> Storage<F> {
    /// Create a new, empty stream in this storage.
    ///
    /// Fails with [`Error::InvalidArgument`] for an empty name, a name
    /// longer than 31 UTF-16 code units, or one containing `\ / : !`, and
    /// with [`Error::DuplicatedItem`] when the name is already taken.
    pub fn add_stream(&mut self, name: &str) -> Result<Stream<F>> {
        let rc = self.engine()?;
        let sid = rc
            .borrow_mut()
            .add_child(self.sid, DirectoryEntry::stream(name))?;
        Ok(Stream::new(self.engine.clone(), sid))
    }

    /// Create a new, empty sub-storage, stamped with the current time.
    pub fn add_storage(&mut self, name: &str) -> Result<Storage<F>> {
        let rc = self.engine()?;
        let entry = DirectoryEntry::storage(name, filetime_now());
        let sid = rc.borrow_mut().add_child(self.sid, entry)?;
        Ok(Storage::new(self.engine.clone(), sid))
    }

    /// Look up a stream by exact name.
    pub fn get_stream(&self, name: &str) -> Result<Stream<F>> {
        let rc = self.engine()?;
        let mut engine = rc.borrow_mut();
        let sid = engine
            .find_child(self.sid, name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if engine.directory[sid as usize].entry_type != EntryType::Stream {
            return Err(Error::NotFound(format!("'{}' is not a stream", name)));
        }
        Ok(Stream::new(self.engine.clone(), sid))
    }

    /// Look up a sub-storage by exact name.
    pub fn get_storage(&self, name: &str) -> Result<Storage<F>> {
        let rc = self.engine()?;
        let mut engine = rc.borrow_mut();
        let sid = engine
            .find_child(self.sid, name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if engine.directory[sid as usize].entry_type != EntryType::Storage {
            return Err(Error::NotFound(format!("'{}' is not a storage", name)));
        }
        Ok(Storage::new(self.engine.clone(), sid))
    }

    /// Non-failing lookup variant.
    pub fn try_stream(&self, name: &str) -> Option<Stream<F>> {
        self.get_stream(name).ok()
    }

    /// Non-failing lookup variant.
    pub fn try_storage(&self, name: &str) -> Option<Storage<F>> {
        self.get_storage(name).ok()
    }

    /// Delete a child by name. A storage is emptied recursively first; a
    /// stream's payload sectors go back to the free pool. The directory
    /// record is marked Invalid and its SID may be reused later.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let rc = self.engine()?;
        rc.borrow_mut().delete_entry(self.sid, name)
    }

    /// Rename a child. The new name obeys the same rules as
    /// [`add_stream`](Self::add_stream); renaming re-inserts the entry
    /// into the sibling tree because the comparison key changes.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let rc = self.engine()?;
        rc.borrow_mut().rename_entry(self.sid, old, new)
    }

    /// This storage's children in tree order.
    pub fn entries(&self) -> Result<Vec<Item<F>>> {
        let rc = self.engine()?;
        let level: Vec<(u32, EntryType)> = {
            let mut engine = rc.borrow_mut();
            let sids = engine.children_in_order(self.sid)?;
            sids.into_iter()
                .map(|sid| (sid, engine.directory[sid as usize].entry_type))
                .collect()
        };
        Ok(level
            .into_iter()
            .filter_map(|(sid, entry_type)| match entry_type {
                EntryType::Stream => Some(Item::Stream(Stream::new(self.engine.clone(), sid))),
                EntryType::Storage => Some(Item::Storage(Storage::new(self.engine.clone(), sid))),
                _ => None,
            })
            .collect())
    }

    /// Visit this storage's children in tree order. With `recursive`, each
    /// sub-storage's children are visited after the current level; the
    /// level is snapshotted first, so the closure may mutate the tree it
    /// is visiting.
    pub fn visit_entries<V: FnMut(Item<F>)>(&self, recursive: bool, mut visit: V) -> Result<()> {
        self.visit_inner(recursive, &mut visit)
    }

    fn visit_inner(&self, recursive: bool, visit: &mut dyn FnMut(Item<F>)) -> Result<()> {
        let level = self.entries()?;
        let mut sub_storages = Vec::new();
        for item in level {
            if recursive {
                if let Item::Storage(storage) = &item {
                    sub_storages.push(storage.clone());
                }
            }
            visit(item);
        }
        for storage in sub_storages {
            storage.visit_inner(recursive, visit)?;
        }
        Ok(())
    }
}
