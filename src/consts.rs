//! Constants for the Compound File Binary format.
//!
//! Values are taken from the [MS-CFB] specification. Reserved sector IDs
//! occupy the top of the 32-bit range and never collide with real sector
//! numbers, which are capped at [`MAXREGSECT`].

/// Magic bytes at the start of every compound file.
pub const SIGNATURE: &[u8; 8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

/// Minimal size of a well-formed v3 file: header + 1 FAT sector + 1
/// directory sector.
pub const MIN_COMPOUND_FILE_SIZE: usize = 1536;

/// Size of the fixed header block in bytes (the v4 header sector is padded
/// to 4096 with zeroes).
pub const HEADER_SIZE: usize = 512;

/// Size of a directory entry record in bytes.
pub const DIR_ENTRY_SIZE: usize = 128;

/// Mini sector size; fixed at 64 bytes for both versions.
pub const MINI_SECTOR_SIZE: usize = 64;

/// Default boundary below which streams live in the mini stream.
pub const MINI_STREAM_CUTOFF: u32 = 4096;

/// Number of DIFAT slots carried directly in the header.
pub const HEADER_DIFAT_SLOTS: usize = 109;

/// Maximum name length in UTF-16 code units, excluding the terminator.
pub const MAX_NAME_LEN: usize = 31;

// Reserved sector IDs.
/// Largest regular sector number.
pub const MAXREGSECT: u32 = 0xFFFFFFFA;
/// Marks a DIFAT sector in the FAT.
pub const DIFSECT: u32 = 0xFFFFFFFC;
/// Marks a FAT sector in the FAT.
pub const FATSECT: u32 = 0xFFFFFFFD;
/// Terminates a sector chain.
pub const ENDOFCHAIN: u32 = 0xFFFFFFFE;
/// An unallocated sector.
pub const FREESECT: u32 = 0xFFFFFFFF;

// Directory entry IDs.
/// Largest regular stream ID.
pub const MAXREGSID: u32 = 0xFFFFFFFA;
/// Absent sibling/child reference.
pub const NOSTREAM: u32 = 0xFFFFFFFF;

/// Name of the root directory entry.
pub const ROOT_ENTRY_NAME: &str = "Root Entry";

/// File offset of the v4 range-lock sector. Files larger than 2 GiB must
/// keep the sector covering this offset reserved.
pub const RANGE_LOCK_OFFSET: u64 = 0x7FFF_FF00;

/// Characters that must not appear in storage or stream names.
pub const FORBIDDEN_NAME_CHARS: [char; 4] = ['\\', '/', ':', '!'];
