//! compoundfs - reading, modifying, and writing Compound File Binary
//! (OLE2 structured storage) containers
//!
//! A compound file is a hierarchical container of named byte streams
//! organized as storages (directories) and streams (files) inside one
//! physical file, per the [MS-CFB] specification. The format backs legacy
//! Office documents (.doc, .xls, .ppt), OLE property sets, MSI packages,
//! and many other Windows file types.
//!
//! # Features
//!
//! - **Read and write**: open existing files, create new ones, and commit
//!   changes in place or save a fresh image
//! - **Both versions**: v3 (512-byte sectors) and v4 (4096-byte sectors),
//!   including the v4 range-lock sector
//! - **Full storage engine**: FAT/mini-FAT/DIFAT management, the mini
//!   stream for small streams with transparent promotion and demotion
//!   across the 4096-byte cutoff, and red-black sibling trees kept
//!   byte-identical to the on-disk SIDs
//! - **Hostile-input safe**: every chain walk is bounds-checked and
//!   cycle-detected; lenient mode exposes the intact portion of a damaged
//!   file instead of failing
//!
//! # Example - creating a file
//!
//! ```
//! use compoundfs::CompoundFile;
//! use std::io::Cursor;
//!
//! # fn main() -> compoundfs::Result<()> {
//! let mut comp = CompoundFile::create(Cursor::new(Vec::new()))?;
//! let mut root = comp.root();
//!
//! let mut storage = root.add_storage("MyStorage")?;
//! let mut stream = storage.add_stream("MyStream")?;
//! stream.set_data(b"Hello, World!")?;
//!
//! let mut image = Cursor::new(Vec::new());
//! comp.save_to(&mut image)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example - reading an existing file
//!
//! ```no_run
//! use compoundfs::CompoundFile;
//! use std::fs::File;
//!
//! # fn main() -> compoundfs::Result<()> {
//! let comp = CompoundFile::open(File::open("report.xls")?)?;
//! for path in comp.walk()? {
//!     println!("stream: {}", path.join("/"));
//! }
//! let workbook = comp.stream(&["Workbook"])?;
//! println!("{} bytes", workbook.len()?);
//! # Ok(())
//! # }
//! ```
//!
//! # Example - updating in place
//!
//! ```no_run
//! use compoundfs::CompoundFile;
//! use std::fs::OpenOptions;
//!
//! # fn main() -> compoundfs::Result<()> {
//! let file = OpenOptions::new().read(true).write(true).open("report.xls")?;
//! let mut comp = CompoundFile::open_rw(file)?;
//! let mut workbook = comp.stream(&["Workbook"])?;
//! workbook.append(b"...")?;
//! comp.commit(false)?;
//! # Ok(())
//! # }
//! ```

/// Format constants: signatures, reserved sector IDs, entry types.
pub mod consts;

/// Error and result types.
mod error;

/// Windows FILETIME conversions.
pub mod time;

/// Header codec.
mod header;

/// Sectors and the sparse sector index.
mod sector;

/// FAT, mini-FAT and DIFAT tables.
mod fat;

/// Directory records and name ordering.
mod directory;

/// Red-black sibling trees over the directory arena.
mod rbtree;

/// Positioned byte access over sector chains.
mod view;

/// The compound file controller and entity handles.
mod compound;

pub use compound::{Backing, CompoundFile, ConfigFlags, Item, Storage, Stream, UpdateMode, shrink};
pub use directory::{EntryType, cmp_names, validate_name};
pub use error::{Error, Result};
pub use header::{Version, is_compound_file};
