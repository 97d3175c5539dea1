//! Directory entry records and name ordering.
//!
//! The directory is a flat list of 128-byte records addressed by SID; entry
//! 0 is always the Root Entry. Sibling relations between the children of a
//! storage form a red-black tree whose links are the `left`/`right`/`child`
//! SIDs persisted right here in the record (see the `rbtree` module for the
//! balancing operations).
//!
//! Name comparison follows [MS-CFB] 2.6.4: shorter names sort first, ties
//! are broken code unit by code unit after an invariant uppercase mapping.
//! This is deliberately not locale collation; files must sort identically
//! on every platform.

use crate::consts::*;
use crate::error::{Error, Result};
use crate::header::Version;
use std::cmp::Ordering;
use zerocopy::{FromBytes, LE, U16, U32, U64};
use zerocopy_derive::FromBytes as DeriveFromBytes;

/// Raw directory entry structure (128 bytes) as it appears on disk.
#[derive(Debug, Clone, DeriveFromBytes)]
#[repr(C)]
struct RawDirectoryEntry {
    /// Entry name in UTF-16LE (64 bytes, null-padded)
    name: [u8; 64],
    /// Length of name in bytes (including null terminator)
    name_len: U16<LE>,
    /// Entry type (0 = invalid, 1 = storage, 2 = stream, 5 = root)
    entry_type: u8,
    /// Node color (0 = red, 1 = black)
    color: u8,
    /// Left sibling SID
    left: U32<LE>,
    /// Right sibling SID
    right: U32<LE>,
    /// Child SID
    child: U32<LE>,
    /// CLSID (16 bytes)
    clsid: [u8; 16],
    /// State bits
    state_bits: U32<LE>,
    /// Creation time (FILETIME)
    created: U64<LE>,
    /// Modified time (FILETIME)
    modified: U64<LE>,
    /// Starting sector
    start_sector: U32<LE>,
    /// Stream size (low 32 bits only for v3)
    size: U64<LE>,
}

/// The kind of object a directory entry describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryType {
    /// Unallocated record, possibly padding or a recyclable slot.
    Invalid,
    /// A storage object, analogous to a directory.
    Storage,
    /// A stream object, analogous to a file.
    Stream,
    /// The root storage; owns the mini stream.
    Root,
}

impl EntryType {
    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(EntryType::Invalid),
            1 => Some(EntryType::Storage),
            2 => Some(EntryType::Stream),
            5 => Some(EntryType::Root),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            EntryType::Invalid => 0,
            EntryType::Storage => 1,
            EntryType::Stream => 2,
            EntryType::Root => 5,
        }
    }
}

/// Red-black color bit of a directory entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeColor {
    /// Red node.
    Red,
    /// Black node.
    Black,
}

/// An in-memory directory record.
///
/// Sibling links (`left`, `right`, `child`) are the persisted form of the
/// red-black tree; everything else is entry payload. The record's SID is
/// its index in the directory list.
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    /// Entry name (UTF-16 on disk, decoded here).
    pub name: String,
    /// What this record describes.
    pub entry_type: EntryType,
    /// Red-black color bit.
    pub color: NodeColor,
    /// Left sibling SID, or [`NOSTREAM`].
    pub left: u32,
    /// Right sibling SID, or [`NOSTREAM`].
    pub right: u32,
    /// Root of this entry's children tree, or [`NOSTREAM`].
    pub child: u32,
    /// Storage class ID; zero for streams.
    pub clsid: [u8; 16],
    /// User-defined state bits.
    pub state_bits: u32,
    /// Creation FILETIME; zero for streams.
    pub created: u64,
    /// Modification FILETIME; zero for streams.
    pub modified: u64,
    /// First sector of the payload chain, or [`ENDOFCHAIN`].
    pub start_sector: u32,
    /// Payload length in bytes. For the root this is the mini stream
    /// length, a multiple of 64.
    pub size: u64,
}

impl DirectoryEntry {
    /// A blank, unallocated record.
    pub fn invalid() -> Self {
        DirectoryEntry {
            name: String::new(),
            entry_type: EntryType::Invalid,
            color: NodeColor::Black,
            left: NOSTREAM,
            right: NOSTREAM,
            child: NOSTREAM,
            clsid: [0; 16],
            state_bits: 0,
            created: 0,
            modified: 0,
            start_sector: ENDOFCHAIN,
            size: 0,
        }
    }

    /// The Root Entry of a fresh file.
    pub fn root() -> Self {
        DirectoryEntry {
            name: ROOT_ENTRY_NAME.to_string(),
            entry_type: EntryType::Root,
            ..DirectoryEntry::invalid()
        }
    }

    /// A new, empty stream entry.
    pub fn stream(name: &str) -> Self {
        DirectoryEntry {
            name: name.to_string(),
            entry_type: EntryType::Stream,
            ..DirectoryEntry::invalid()
        }
    }

    /// A new, empty storage entry stamped with the given creation time.
    pub fn storage(name: &str, created: u64) -> Self {
        DirectoryEntry {
            name: name.to_string(),
            entry_type: EntryType::Storage,
            created,
            modified: created,
            ..DirectoryEntry::invalid()
        }
    }

    /// Parse a 128-byte record.
    ///
    /// With `strict` set, malformed type or color bytes and oversized name
    /// lengths are [`Error::CorruptedFile`]; otherwise the record degrades
    /// to an Invalid entry so the rest of the directory stays readable.
    pub fn parse(data: &[u8], version: Version, strict: bool) -> Result<Self> {
        let raw = RawDirectoryEntry::read_from_bytes(&data[..DIR_ENTRY_SIZE])
            .map_err(|_| Error::corrupted("directory record too short"))?;

        let entry_type = match EntryType::from_byte(raw.entry_type) {
            Some(entry_type) => entry_type,
            None if strict => {
                return Err(Error::corrupted(format!(
                    "invalid directory entry type {}",
                    raw.entry_type
                )));
            }
            None => return Ok(DirectoryEntry::invalid()),
        };
        if entry_type == EntryType::Invalid {
            return Ok(DirectoryEntry::invalid());
        }

        let name_len = raw.name_len.get() as usize;
        if name_len > 64 || name_len % 2 != 0 {
            if strict {
                return Err(Error::corrupted(format!(
                    "invalid directory name length {}",
                    name_len
                )));
            }
            return Ok(DirectoryEntry::invalid());
        }
        let name_bytes = &raw.name[..name_len.saturating_sub(2)];
        let (decoded, _, _) = encoding_rs::UTF_16LE.decode(name_bytes);
        let name = decoded.into_owned();

        let color = match raw.color {
            0 => NodeColor::Red,
            1 => NodeColor::Black,
            other if strict => {
                return Err(Error::corrupted(format!(
                    "invalid directory node color {}",
                    other
                )));
            }
            _ => NodeColor::Black,
        };

        // v3 writers are known to leave garbage in the high word of the
        // size field; mask it off instead of trusting it.
        let size = match version {
            Version::V3 => raw.size.get() & 0xFFFF_FFFF,
            Version::V4 => raw.size.get(),
        };

        Ok(DirectoryEntry {
            name,
            entry_type,
            color,
            left: raw.left.get(),
            right: raw.right.get(),
            child: raw.child.get(),
            clsid: raw.clsid,
            state_bits: raw.state_bits.get(),
            created: raw.created.get(),
            modified: raw.modified.get(),
            start_sector: raw.start_sector.get(),
            size,
        })
    }

    /// Serialize this record into a 128-byte buffer.
    pub fn write(&self, out: &mut [u8], version: Version) {
        debug_assert!(out.len() >= DIR_ENTRY_SIZE);
        out[..DIR_ENTRY_SIZE].fill(0);

        let utf16: Vec<u16> = self.name.encode_utf16().collect();
        debug_assert!(utf16.len() <= MAX_NAME_LEN);
        for (i, &unit) in utf16.iter().take(MAX_NAME_LEN).enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        let name_len = if self.entry_type == EntryType::Invalid {
            0u16
        } else {
            (utf16.len().min(MAX_NAME_LEN) as u16 + 1) * 2
        };
        out[64..66].copy_from_slice(&name_len.to_le_bytes());
        out[66] = self.entry_type.to_byte();
        out[67] = match self.color {
            NodeColor::Red => 0,
            NodeColor::Black => 1,
        };
        out[68..72].copy_from_slice(&self.left.to_le_bytes());
        out[72..76].copy_from_slice(&self.right.to_le_bytes());
        out[76..80].copy_from_slice(&self.child.to_le_bytes());
        out[80..96].copy_from_slice(&self.clsid);
        out[96..100].copy_from_slice(&self.state_bits.to_le_bytes());
        out[100..108].copy_from_slice(&self.created.to_le_bytes());
        out[108..116].copy_from_slice(&self.modified.to_le_bytes());
        out[116..120].copy_from_slice(&self.start_sector.to_le_bytes());
        let size = match version {
            Version::V3 => self.size & 0xFFFF_FFFF,
            Version::V4 => self.size,
        };
        out[120..128].copy_from_slice(&size.to_le_bytes());
    }

    /// True for storage-like entries (Storage or Root).
    pub fn is_storage_like(&self) -> bool {
        matches!(self.entry_type, EntryType::Storage | EntryType::Root)
    }

    /// Reset this record to the unallocated state so its SID can be
    /// recycled.
    pub fn clear(&mut self) {
        *self = DirectoryEntry::invalid();
    }
}

/// Validate a storage or stream name: non-empty, at most 31 UTF-16 code
/// units, and free of `\ / : !`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("name must not be empty".into()));
    }
    let units = name.encode_utf16().count();
    if units > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "name '{}' is {} UTF-16 code units, maximum is {}",
            name, units, MAX_NAME_LEN
        )));
    }
    if let Some(bad) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(Error::InvalidArgument(format!(
            "name contains forbidden character '{}'",
            bad
        )));
    }
    Ok(())
}

/// Invariant uppercase mapping for a UTF-16 code unit: ASCII letters fold
/// to uppercase, everything else compares verbatim.
fn fold_unit(unit: u16) -> u16 {
    if (b'a' as u16..=b'z' as u16).contains(&unit) {
        unit - 32
    } else {
        unit
    }
}

/// Compare two entry names by the directory ordering rule: UTF-16 length
/// first, then unit-by-unit after invariant uppercasing.
pub fn cmp_names(a: &str, b: &str) -> Ordering {
    let len_a = a.encode_utf16().count();
    let len_b = b.encode_utf16().count();
    match len_a.cmp(&len_b) {
        Ordering::Equal => a
            .encode_utf16()
            .map(fold_unit)
            .cmp(b.encode_utf16().map(fold_unit)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip() {
        let mut entry = DirectoryEntry::stream("Workbook");
        entry.start_sector = 12;
        entry.size = 9876;
        entry.left = 3;
        entry.right = NOSTREAM;
        entry.color = NodeColor::Red;
        entry.state_bits = 7;

        let mut buf = [0u8; DIR_ENTRY_SIZE];
        entry.write(&mut buf, Version::V3);
        let parsed = DirectoryEntry::parse(&buf, Version::V3, true).unwrap();

        assert_eq!(parsed.name, "Workbook");
        assert_eq!(parsed.entry_type, EntryType::Stream);
        assert_eq!(parsed.color, NodeColor::Red);
        assert_eq!(parsed.left, 3);
        assert_eq!(parsed.right, NOSTREAM);
        assert_eq!(parsed.start_sector, 12);
        assert_eq!(parsed.size, 9876);
        assert_eq!(parsed.state_bits, 7);
    }

    #[test]
    fn v3_masks_dirty_size_high_word() {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        DirectoryEntry::stream("S").write(&mut buf, Version::V3);
        // Scribble on the reserved high word the way old writers did.
        buf[124..128].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let parsed = DirectoryEntry::parse(&buf, Version::V3, true).unwrap();
        assert_eq!(parsed.size, 0);

        let parsed_v4 = DirectoryEntry::parse(&buf, Version::V4, true).unwrap();
        assert_eq!(parsed_v4.size, 0xDEAD_BEEF_0000_0000);
    }

    #[test]
    fn invalid_type_byte_is_strictness_dependent() {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        DirectoryEntry::stream("S").write(&mut buf, Version::V3);
        buf[66] = 9;
        assert!(matches!(
            DirectoryEntry::parse(&buf, Version::V3, true),
            Err(Error::CorruptedFile(_))
        ));
        let lenient = DirectoryEntry::parse(&buf, Version::V3, false).unwrap();
        assert_eq!(lenient.entry_type, EntryType::Invalid);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("Workbook").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(32)).is_err());
        assert!(validate_name(&"x".repeat(31)).is_ok());
        for bad in ["a/b", "a\\b", "a:b", "a!b"] {
            assert!(validate_name(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn ordering_is_length_first() {
        assert_eq!(cmp_names("Data", "1Table"), Ordering::Less);
        assert_eq!(cmp_names("1Table", "WordDocument"), Ordering::Less);
    }

    #[test]
    fn ordering_folds_ascii_case_only() {
        assert_eq!(cmp_names("abc", "ABC"), Ordering::Equal);
        assert_eq!(cmp_names("abc", "ABD"), Ordering::Less);
        // Non-ASCII units compare verbatim; no locale tailoring.
        assert_eq!(cmp_names("é", "É"), Ordering::Greater);
    }

    #[test]
    fn root_record_shape() {
        let root = DirectoryEntry::root();
        assert_eq!(root.entry_type, EntryType::Root);
        assert_eq!(root.start_sector, ENDOFCHAIN);
        assert_eq!(root.size, 0);
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        root.write(&mut buf, Version::V3);
        // "Root Entry" is 10 characters + terminator = 22 bytes.
        assert_eq!(u16::from_le_bytes([buf[64], buf[65]]), 22);
        assert_eq!(buf[66], 5);
    }
}
