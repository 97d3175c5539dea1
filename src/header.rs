//! Compound file header codec.
//!
//! The header occupies the first 512 bytes of the file (padded to 4096 for
//! v4) and locates every other structure: the directory chain, the FAT via
//! the 109 embedded DIFAT slots, the mini FAT, and the DIFAT overflow chain.
//!
//! Layout per [MS-CFB] section 2.2. All fields are little-endian.

use crate::consts::*;
use crate::error::{Error, Result};
use zerocopy::{FromBytes, LE, U16, U32};
use zerocopy_derive::FromBytes as DeriveFromBytes;

/// Raw header structure (512 bytes) as it appears on disk.
#[derive(DeriveFromBytes)]
#[repr(C)]
struct RawHeader {
    /// Signature `D0 CF 11 E0 A1 B1 1A E1`
    signature: [u8; 8],
    /// Header CLSID, always zero
    clsid: [u8; 16],
    /// Minor version (commonly 0x003E)
    minor_version: U16<LE>,
    /// Major version (3 or 4)
    major_version: U16<LE>,
    /// Byte-order marker, `FE FF` for little-endian
    byte_order: U16<LE>,
    /// Sector shift (9 for v3, 12 for v4)
    sector_shift: U16<LE>,
    /// Mini sector shift, always 6
    mini_sector_shift: U16<LE>,
    /// Reserved, zero
    reserved: [u8; 6],
    /// Directory sector count (zero for v3)
    directory_sector_count: U32<LE>,
    /// FAT sector count
    fat_sector_count: U32<LE>,
    /// First directory sector ID
    first_directory_sector: U32<LE>,
    /// Transaction signature (reserved)
    transaction_signature: U32<LE>,
    /// Mini stream cutoff, default 4096
    mini_stream_cutoff: U32<LE>,
    /// First mini FAT sector ID
    first_minifat_sector: U32<LE>,
    /// Mini FAT sector count
    minifat_sector_count: U32<LE>,
    /// First DIFAT sector ID
    first_difat_sector: U32<LE>,
    /// DIFAT sector count
    difat_sector_count: U32<LE>,
    /// The 109 header DIFAT slots, FREESECT-padded
    difat: [U32<LE>; HEADER_DIFAT_SLOTS],
}

/// The CFB format version, which fixes the sector size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Version {
    /// Version 3: 512-byte sectors, 32-bit stream sizes.
    V3,
    /// Version 4: 4096-byte sectors, 64-bit stream sizes.
    V4,
}

impl Version {
    /// Parse a major version number from the header.
    pub fn from_number(number: u16) -> Option<Version> {
        match number {
            3 => Some(Version::V3),
            4 => Some(Version::V4),
            _ => None,
        }
    }

    /// The major version number stored in the header.
    pub fn number(self) -> u16 {
        match self {
            Version::V3 => 3,
            Version::V4 => 4,
        }
    }

    /// The sector shift for this version (sector size = `1 << shift`).
    pub fn sector_shift(self) -> u16 {
        match self {
            Version::V3 => 9,
            Version::V4 => 12,
        }
    }

    /// The sector size in bytes.
    pub fn sector_size(self) -> usize {
        1 << self.sector_shift()
    }
}

/// Parsed header state, kept in sync with the rest of the engine and
/// rewritten last on commit.
#[derive(Clone, Debug)]
pub struct Header {
    /// Format version; fixes sector size and stream-size width.
    pub version: Version,
    /// Minor version, preserved verbatim on rewrite.
    pub minor_version: u16,
    /// Directory sector count; meaningful for v4 only.
    pub directory_sector_count: u32,
    /// Number of sectors holding the FAT.
    pub fat_sector_count: u32,
    /// Head of the directory chain.
    pub first_directory_sector: u32,
    /// Reserved transaction signature, preserved verbatim.
    pub transaction_signature: u32,
    /// Streams strictly smaller than this live in the mini stream.
    pub mini_stream_cutoff: u32,
    /// Head of the mini FAT chain.
    pub first_minifat_sector: u32,
    /// Number of sectors holding the mini FAT.
    pub minifat_sector_count: u32,
    /// First DIFAT overflow sector.
    pub first_difat_sector: u32,
    /// Number of DIFAT overflow sectors.
    pub difat_sector_count: u32,
    /// The 109 in-header DIFAT slots (FAT sector IDs, FREESECT-padded).
    pub difat: [u32; HEADER_DIFAT_SLOTS],
}

impl Header {
    /// A fresh header for an empty file of the given version.
    pub fn new(version: Version) -> Self {
        Header {
            version,
            minor_version: 0x003E,
            directory_sector_count: 0,
            fat_sector_count: 0,
            first_directory_sector: ENDOFCHAIN,
            transaction_signature: 0,
            mini_stream_cutoff: MINI_STREAM_CUTOFF,
            first_minifat_sector: ENDOFCHAIN,
            minifat_sector_count: 0,
            first_difat_sector: ENDOFCHAIN,
            difat_sector_count: 0,
            difat: [FREESECT; HEADER_DIFAT_SLOTS],
        }
    }

    /// Parse and validate a header from the first [`HEADER_SIZE`] bytes of
    /// the file.
    ///
    /// Fails with [`Error::BadSignature`] when the magic does not match,
    /// [`Error::UnsupportedVersion`] for major versions other than 3 or 4,
    /// and [`Error::CorruptedFile`] for inconsistent shift or byte-order
    /// fields.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::BadSignature);
        }
        let raw = RawHeader::read_from_bytes(&data[..HEADER_SIZE])
            .map_err(|_| Error::corrupted("header block too short"))?;

        if raw.signature != *SIGNATURE {
            return Err(Error::BadSignature);
        }
        let major = raw.major_version.get();
        let version = Version::from_number(major).ok_or(Error::UnsupportedVersion(major))?;
        if raw.byte_order.get() != 0xFFFE {
            return Err(Error::corrupted(format!(
                "invalid byte-order marker 0x{:04X}",
                raw.byte_order.get()
            )));
        }
        if raw.sector_shift.get() != version.sector_shift() {
            return Err(Error::corrupted(format!(
                "sector shift {} does not match version {}",
                raw.sector_shift.get(),
                major
            )));
        }
        if raw.mini_sector_shift.get() != 6 {
            return Err(Error::corrupted(format!(
                "unsupported mini sector shift {}",
                raw.mini_sector_shift.get()
            )));
        }

        let mut difat = [FREESECT; HEADER_DIFAT_SLOTS];
        for (slot, raw_slot) in difat.iter_mut().zip(raw.difat.iter()) {
            *slot = raw_slot.get();
        }

        Ok(Header {
            version,
            minor_version: raw.minor_version.get(),
            directory_sector_count: raw.directory_sector_count.get(),
            fat_sector_count: raw.fat_sector_count.get(),
            first_directory_sector: raw.first_directory_sector.get(),
            transaction_signature: raw.transaction_signature.get(),
            mini_stream_cutoff: raw.mini_stream_cutoff.get(),
            first_minifat_sector: raw.first_minifat_sector.get(),
            minifat_sector_count: raw.minifat_sector_count.get(),
            first_difat_sector: raw.first_difat_sector.get(),
            difat_sector_count: raw.difat_sector_count.get(),
            difat,
        })
    }

    /// Serialize the header into a sector-sized buffer.
    ///
    /// The buffer must hold at least [`HEADER_SIZE`] bytes; for v4 the
    /// caller passes a full 4096-byte buffer and the tail stays zero.
    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_SIZE);
        out[..HEADER_SIZE].fill(0);

        out[0..8].copy_from_slice(SIGNATURE);
        // CLSID at 8..24 stays zero.
        out[24..26].copy_from_slice(&self.minor_version.to_le_bytes());
        out[26..28].copy_from_slice(&self.version.number().to_le_bytes());
        out[28..30].copy_from_slice(&0xFFFEu16.to_le_bytes());
        out[30..32].copy_from_slice(&self.version.sector_shift().to_le_bytes());
        out[32..34].copy_from_slice(&6u16.to_le_bytes());
        // Reserved at 34..40 stays zero.
        let dir_count = match self.version {
            Version::V3 => 0,
            Version::V4 => self.directory_sector_count,
        };
        out[40..44].copy_from_slice(&dir_count.to_le_bytes());
        out[44..48].copy_from_slice(&self.fat_sector_count.to_le_bytes());
        out[48..52].copy_from_slice(&self.first_directory_sector.to_le_bytes());
        out[52..56].copy_from_slice(&self.transaction_signature.to_le_bytes());
        out[56..60].copy_from_slice(&self.mini_stream_cutoff.to_le_bytes());
        out[60..64].copy_from_slice(&self.first_minifat_sector.to_le_bytes());
        out[64..68].copy_from_slice(&self.minifat_sector_count.to_le_bytes());
        out[68..72].copy_from_slice(&self.first_difat_sector.to_le_bytes());
        out[72..76].copy_from_slice(&self.difat_sector_count.to_le_bytes());
        for (i, &slot) in self.difat.iter().enumerate() {
            let offset = 76 + i * 4;
            out[offset..offset + 4].copy_from_slice(&slot.to_le_bytes());
        }
    }

    /// Sector size implied by the version.
    pub fn sector_size(&self) -> usize {
        self.version.sector_size()
    }
}

/// Check whether a byte slice starts with the compound file signature.
pub fn is_compound_file(data: &[u8]) -> bool {
    data.len() >= MIN_COMPOUND_FILE_SIZE && &data[0..8] == SIGNATURE
}
