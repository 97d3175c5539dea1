//! Stream handles.

use super::engine::Engine;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::io::{Read, Seek};
use std::rc::{Rc, Weak};

/// A stream entry in a compound file, much like a filesystem file.
///
/// Reads clamp to the stream length; writes past the end grow the stream,
/// transparently promoting it out of the mini stream when it crosses the
/// cutoff. All I/O is positioned, so a handle carries no cursor state.
pub struct Stream<F> {
    engine: Weak<RefCell<Engine<F>>>,
    sid: u32,
}

impl<F> Clone for Stream<F> {
    fn clone(&self) -> Self {
        Stream {
            engine: self.engine.clone(),
            sid: self.sid,
        }
    }
}

impl<F> Stream<F> {
    pub(crate) fn new(engine: Weak<RefCell<Engine<F>>>, sid: u32) -> Self {
        Stream { engine, sid }
    }

    fn engine(&self) -> Result<Rc<RefCell<Engine<F>>>> {
        self.engine.upgrade().ok_or(Error::Disposed)
    }

    /// The stream's name.
    pub fn name(&self) -> Result<String> {
        let rc = self.engine()?;
        let engine = rc.borrow();
        Ok(engine.entry(self.sid)?.name.clone())
    }

    /// Current length in bytes.
    pub fn len(&self) -> Result<u64> {
        let rc = self.engine()?;
        let engine = rc.borrow();
        Ok(engine.entry(self.sid)?.size)
    }

    /// True when the stream holds no bytes.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<F: Read + Seek> Stream<F> {
    /// Read up to `buf.len()` bytes at `position`; returns the number of
    /// bytes read, short only at end of stream.
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> Result<usize> {
        let rc = self.engine()?;
        rc.borrow_mut().read_stream(self.sid, position, buf)
    }

    /// Write `data` at `position`, growing the stream when the write ends
    /// past the current length.
    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        let rc = self.engine()?;
        rc.borrow_mut().write_stream(self.sid, position, data)
    }

    /// Append `data` at the current end of the stream.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let position = self.len()?;
        self.write_at(position, data)
    }

    /// Resize to exactly `length` bytes. Growth exposes zeroes; shrinking
    /// frees tail sectors. Crossing the mini-stream cutoff in either
    /// direction relocates the payload byte-exactly.
    pub fn resize(&mut self, length: u64) -> Result<()> {
        let rc = self.engine()?;
        rc.borrow_mut().set_stream_length(self.sid, length)
    }

    /// Replace the stream contents wholesale.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        self.resize(data.len() as u64)?;
        self.write_at(0, data)
    }

    /// Read the full stream contents.
    pub fn data(&self) -> Result<Vec<u8>> {
        let length = self.len()?;
        let mut buf = vec![0u8; length as usize];
        let read = self.read_at(0, &mut buf)?;
        if read as u64 != length {
            return Err(Error::corrupted(format!(
                "stream declares {} bytes but only {} are reachable",
                length, read
            )));
        }
        Ok(buf)
    }

    /// Replace this stream's contents with a byte-exact copy of
    /// `source`'s, which may belong to another compound file.
    pub fn copy_from(&mut self, source: &Stream<F>) -> Result<()> {
        let data = source.data()?;
        self.set_data(&data)
    }
}
