//! In-place compaction of v3 files.

use super::storage::{Item, Storage};
use super::{Backing, CompoundFile};
use crate::error::{Error, Result};
use crate::header::Version;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Compact a v3 compound file in place.
///
/// The source is opened read-only, its hierarchy is cloned into a fresh
/// empty file (dropping free sectors, recycled directory slots, and any
/// other slack), the clone is rendered into a scratch buffer, and the
/// buffer then overwrites the source. Stream bytes, names, CLSIDs and
/// state bits are preserved; the result is never larger than the source.
///
/// Fails with [`Error::InvalidOperation`] on v4 files.
pub fn shrink<F: Backing>(backing: &mut F) -> Result<()> {
    backing.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    backing.read_to_end(&mut bytes)?;

    let source = CompoundFile::open(Cursor::new(bytes))?;
    if source.version() == Version::V4 {
        return Err(Error::InvalidOperation(
            "shrink supports v3 files only".into(),
        ));
    }

    let mut compact = CompoundFile::create(Cursor::new(Vec::new()))?;
    {
        let source_root = source.root();
        let mut compact_root = compact.root();
        compact_root.set_clsid(source_root.clsid()?)?;
        compact_root.set_state_bits(source_root.state_bits()?)?;
        clone_tree(&source_root, &mut compact_root)?;
    }

    let mut image = Cursor::new(Vec::new());
    compact.save_to(&mut image)?;

    backing.seek(SeekFrom::Start(0))?;
    backing.write_all(image.get_ref())?;
    backing.flush()?;
    backing.set_len(image.get_ref().len() as u64)?;
    Ok(())
}

fn clone_tree<F, G>(source: &Storage<F>, target: &mut Storage<G>) -> Result<()>
where
    F: Read + Seek,
    G: Read + Seek,
{
    for item in source.entries()? {
        match item {
            Item::Stream(stream) => {
                let mut copy = target.add_stream(&stream.name()?)?;
                copy.set_data(&stream.data()?)?;
            }
            Item::Storage(storage) => {
                let mut copy = target.add_storage(&storage.name()?)?;
                copy.set_clsid(storage.clsid()?)?;
                copy.set_state_bits(storage.state_bits()?)?;
                clone_tree(&storage, &mut copy)?;
            }
        }
    }
    Ok(())
}
