//! The compound file controller and its public handles.
//!
//! A [`CompoundFile`] owns the backing stream and the whole in-memory
//! state; [`Storage`] and [`Stream`] handles reference entries by SID
//! through a weak pointer to the shared engine, so closing (or dropping)
//! the file invalidates every outstanding handle, which then fails with
//! [`Error::Disposed`](crate::Error::Disposed).
//!
//! All mutations are buffered in memory. Opening in update mode and
//! calling [`CompoundFile::commit`] rewrites the file in place; opening
//! read-only still allows in-memory edits (useful with
//! [`CompoundFile::save_to`]), and only `commit` enforces the mode.
//!
//! # Example
//!
//! ```
//! use compoundfs::CompoundFile;
//! use std::io::Cursor;
//!
//! # fn main() -> compoundfs::Result<()> {
//! let mut comp = CompoundFile::create(Cursor::new(Vec::new()))?;
//! let mut root = comp.root();
//! let mut stream = root.add_stream("MyStream")?;
//! stream.set_data(b"Hello, World!")?;
//!
//! let mut image = Cursor::new(Vec::new());
//! comp.save_to(&mut image)?;
//!
//! let comp = CompoundFile::open(image)?;
//! let stream = comp.stream(&["MyStream"])?;
//! assert_eq!(stream.data()?, b"Hello, World!");
//! # Ok(())
//! # }
//! ```

mod commit;
mod engine;
mod shrink;
mod storage;
mod stream;

#[cfg(test)]
mod tests;

pub use shrink::shrink;
pub use storage::{Item, Storage};
pub use stream::Stream;

use crate::error::{Error, Result};
use crate::header::Version;
use bitflags::bitflags;
use engine::Engine;
use std::cell::RefCell;
use std::io::{self, Cursor, Read, Seek, Write};
use std::rc::Rc;

bitflags! {
    /// Open-time configuration flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ConfigFlags: u32 {
        /// Reuse freed sectors before growing the file. Slower for
        /// append-heavy workloads, but keeps churning edits from growing
        /// the image.
        const SECTOR_RECYCLE = 1 << 0;
        /// Zero sector payloads when their chain is freed, so deleted data
        /// does not linger in the image.
        const ERASE_FREE_SECTORS = 1 << 1;
        /// Skip structural validation errors during load and traversal:
        /// suspicious sibling links are dropped and corrupt chains are
        /// truncated instead of failing. Traversal still never loops.
        const NO_VALIDATION = 1 << 2;
        /// Hand the backing stream back from [`CompoundFile::close`]
        /// instead of dropping it.
        const LEAVE_OPEN = 1 << 3;
    }
}

/// How a compound file was opened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateMode {
    /// Reads only; `commit` is rejected. In-memory mutation and
    /// `save_to` remain available.
    ReadOnly,
    /// Reads and in-place commits.
    Update,
}

/// Backing streams that can be committed to in place.
///
/// `std::io` has no truncation trait, so this adds one with a no-op
/// default; backings that cannot shrink simply keep their tail bytes,
/// which is harmless because the header and FAT define the valid prefix.
pub trait Backing: Read + Write + Seek {
    /// Truncate (or extend with zeroes) to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let _ = len;
        Ok(())
    }
}

impl Backing for std::fs::File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        std::fs::File::set_len(self, len)
    }
}

impl Backing for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

/// A compound file, backed by an underlying reader/writer such as a
/// [`File`](std::fs::File) or a [`Cursor`].
pub struct CompoundFile<F> {
    engine: Rc<RefCell<Engine<F>>>,
}

impl<F> CompoundFile<F> {
    fn wrap(engine: Engine<F>) -> Self {
        CompoundFile {
            engine: Rc::new(RefCell::new(engine)),
        }
    }

    /// The format version of this file.
    pub fn version(&self) -> Version {
        self.engine.borrow().header.version
    }

    /// The mode this file was opened in.
    pub fn update_mode(&self) -> UpdateMode {
        self.engine.borrow().mode
    }

    /// The root storage of this file.
    pub fn root(&self) -> Storage<F> {
        Storage::new(Rc::downgrade(&self.engine), 0)
    }

    /// Close the file, invalidating all outstanding handles. Returns the
    /// backing stream when [`ConfigFlags::LEAVE_OPEN`] was set, otherwise
    /// drops it.
    pub fn close(self) -> Result<Option<F>> {
        let leave_open = self
            .engine
            .borrow()
            .flags
            .contains(ConfigFlags::LEAVE_OPEN);
        let engine = self.unwrap_engine()?;
        Ok(leave_open.then_some(engine.backing))
    }

    /// Consume the file and return the backing stream unconditionally.
    pub fn into_inner(self) -> Result<F> {
        Ok(self.unwrap_engine()?.backing)
    }

    fn unwrap_engine(self) -> Result<Engine<F>> {
        match Rc::try_unwrap(self.engine) {
            Ok(cell) => Ok(cell.into_inner()),
            Err(_) => Err(Error::InvalidOperation(
                "compound file is still in use".into(),
            )),
        }
    }
}

impl<F: Read + Seek> CompoundFile<F> {
    /// Open an existing compound file read-only.
    pub fn open(backing: F) -> Result<Self> {
        Self::open_with(backing, ConfigFlags::empty())
    }

    /// Open an existing compound file read-only with explicit flags.
    pub fn open_with(backing: F, flags: ConfigFlags) -> Result<Self> {
        Engine::open(backing, flags, UpdateMode::ReadOnly).map(Self::wrap)
    }

    /// Look up a stream by path, e.g. `&["Storage", "Stream"]`.
    pub fn stream(&self, path: &[&str]) -> Result<Stream<F>> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| Error::InvalidArgument("stream path must not be empty".into()))?;
        self.descend(parents)?.get_stream(last)
    }

    /// Look up a storage by path; the empty path is the root.
    pub fn storage(&self, path: &[&str]) -> Result<Storage<F>> {
        self.descend(path)
    }

    fn descend(&self, path: &[&str]) -> Result<Storage<F>> {
        let mut storage = self.root();
        for name in path {
            storage = storage.get_storage(name)?;
        }
        Ok(storage)
    }

    /// All stream paths in the file, depth first.
    pub fn walk(&self) -> Result<Vec<Vec<String>>> {
        self.engine.borrow_mut().walk_paths()
    }

    /// Write a complete fresh image of the current state to `out`,
    /// without touching the backing stream. Valid in both modes.
    pub fn save_to<W: Write + Seek>(&mut self, out: &mut W) -> Result<()> {
        self.engine.borrow_mut().save_to(out)
    }
}

impl<F: Read + Write + Seek> CompoundFile<F> {
    /// Open an existing compound file in update mode.
    pub fn open_rw(backing: F) -> Result<Self> {
        Self::open_rw_with(backing, ConfigFlags::empty())
    }

    /// Open an existing compound file in update mode with explicit flags.
    pub fn open_rw_with(backing: F, flags: ConfigFlags) -> Result<Self> {
        Engine::open(backing, flags, UpdateMode::Update).map(Self::wrap)
    }

    /// Create a new, empty v3 compound file over `backing` (typically an
    /// empty file or buffer). Nothing is written until
    /// [`commit`](Self::commit) or [`save_to`](Self::save_to).
    pub fn create(backing: F) -> Result<Self> {
        Self::create_with_version(backing, Version::V3)
    }

    /// Create a new, empty compound file of the given version.
    pub fn create_with_version(backing: F, version: Version) -> Result<Self> {
        Self::create_with(backing, version, ConfigFlags::empty())
    }

    /// Create a new, empty compound file with explicit flags.
    pub fn create_with(backing: F, version: Version, flags: ConfigFlags) -> Result<Self> {
        Ok(Self::wrap(Engine::create(backing, version, flags)))
    }
}

impl<F: Backing> CompoundFile<F> {
    /// Write all buffered changes back into the backing stream.
    ///
    /// Only valid in update mode; read-only files reject the call with
    /// [`Error::InvalidOperation`] (in-memory changes are kept). With
    /// `release_memory`, sector payloads are dropped once written.
    pub fn commit(&mut self, release_memory: bool) -> Result<()> {
        let mut engine = self.engine.borrow_mut();
        if engine.mode != UpdateMode::Update {
            return Err(Error::InvalidOperation(
                "commit requires update mode".into(),
            ));
        }
        engine.commit(release_memory)
    }
}
