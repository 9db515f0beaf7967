use binrw::{BinRead, BinWrite};
use sha2::{Digest, Sha256};

/// Size of the common record header (length field plus tag)
pub(crate) const RECORD_HEADER_LEN: u64 = 8;
/// Smallest legal free record, a header plus the next pointer
pub(crate) const FREE_RECORD_MIN: u64 = 16;
/// Fixed part of a file record before the name (header, name length, digest)
pub(crate) const FILE_META_LEN: u64 = 44;
/// Fixed part of a directory record before the name (header, name length,
/// entry count, digest)
pub(crate) const DIR_META_LEN: u64 = 48;
/// Size of one directory entry (name hash plus child offset)
pub(crate) const DIR_ENTRY_LEN: u64 = 12;
/// Size of a root record carrying the customary two offsets
pub(crate) const ROOT_RECORD_LEN: u32 = 28;

/// The four byte tag identifying the type of a record.
///
/// Tags are stored as ASCII and are not length prefixed. A tag outside the
/// known set decodes as [`RecordTag::Unknown`] so a scan can size the region
/// from the header and step over it.
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordTag {
    /// Container root, points at the top level directory
    #[brw(magic = b"GGPK")]
    Root,
    /// Directory record
    #[brw(magic = b"PDIR")]
    Directory,
    /// File record
    #[brw(magic = b"FILE")]
    File,
    /// Free record, a member of the recycled space chain
    #[brw(magic = b"FREE")]
    Free,
    /// Any tag not covered above
    Unknown([u8; 4]),
}

impl RecordTag {
    /// Tag as it appears on disk, for diagnostics
    pub const fn name(&self) -> &'static str {
        match self {
            RecordTag::Root => "GGPK",
            RecordTag::Directory => "PDIR",
            RecordTag::File => "FILE",
            RecordTag::Free => "FREE",
            RecordTag::Unknown(_) => "unknown",
        }
    }
}

/// The header every record starts with.
///
/// `length` counts the whole record including this header, so the next
/// record always starts at `offset + length`.
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct RecordHeader {
    /// Total record length in bytes
    pub length: u32,
    /// Record type tag
    pub tag: RecordTag,
}

/// One child reference inside a directory record
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct DirEntry {
    /// CRC-32/BZIP2 of the lowercased UTF-8 child name
    pub name_hash: u32,
    /// Offset of the child record from the start of the container
    pub offset: u64,
}

/// Hash stored next to each directory entry.
///
/// The hash is computed over the lowercased UTF-8 name and is only a
/// pre-filter; the decoded name text is authoritative when resolving paths.
pub fn entry_name_hash(name: &str) -> u32 {
    crc::Crc::<u32>::new(&crc::CRC_32_BZIP2).checksum(name.to_lowercase().as_bytes())
}

/// Width in bytes of one name code unit for a container version.
///
/// Version 4 containers store names as UTF-32LE, everything else UTF-16LE.
pub(crate) const fn unit_width(version: u32) -> u64 {
    if version == 4 {
        4
    } else {
        2
    }
}

/// Number of code units `name` occupies on disk, including the terminator
pub(crate) fn name_units(name: &str, version: u32) -> u64 {
    let units = if version == 4 {
        name.chars().count() as u64
    } else {
        name.encode_utf16().count() as u64
    };
    units + 1
}

/// Encode `name` as it is stored on disk, including the NUL terminator
pub(crate) fn encode_name(name: &str, version: u32) -> Vec<u8> {
    if version == 4 {
        let mut bytes = Vec::with_capacity((name.chars().count() + 1) * 4);
        for c in name.chars() {
            bytes.extend_from_slice(&(c as u32).to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes
    } else {
        let mut bytes = Vec::with_capacity((name.len() + 1) * 2);
        for unit in name.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes
    }
}

/// Digest stored in a directory record, the SHA-256 of the encoded name
/// without its terminator
pub(crate) fn name_digest(name: &str, version: u32) -> [u8; 32] {
    let encoded = encode_name(name, version);
    let terminator = unit_width(version) as usize;
    Sha256::digest(&encoded[..encoded.len() - terminator]).into()
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use binrw::{BinRead, BinWrite};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_read_record_header() {
        #[rustfmt::skip]
        let data: [u8; 8] = [
            0x4B, 0x00, 0x00, 0x00, // Length (75)
            0x46, 0x49, 0x4C, 0x45, // Tag ("FILE")
        ];

        let mut reader = Cursor::new(&data);
        let header = RecordHeader::read(&mut reader).unwrap();

        assert_eq!(
            header,
            RecordHeader {
                length: 75,
                tag: RecordTag::File,
            }
        );
    }

    #[test]
    fn test_read_record_header_unknown_tag() {
        #[rustfmt::skip]
        let data: [u8; 8] = [
            0x10, 0x00, 0x00, 0x00, // Length (16)
            0x42, 0x4E, 0x44, 0x4C, // Tag ("BNDL")
        ];

        let mut reader = Cursor::new(&data);
        let header = RecordHeader::read(&mut reader).unwrap();

        assert_eq!(header.length, 16);
        assert_eq!(header.tag, RecordTag::Unknown(*b"BNDL"));
    }

    #[test]
    fn test_write_record_header() {
        let header = RecordHeader {
            length: 28,
            tag: RecordTag::Root,
        };

        let mut writer = Cursor::new(Vec::new());
        header.write(&mut writer).unwrap();

        #[rustfmt::skip]
        let expected: [u8; 8] = [
            0x1C, 0x00, 0x00, 0x00, // Length (28)
            0x47, 0x47, 0x50, 0x4B, // Tag ("GGPK")
        ];
        assert_eq!(writer.into_inner(), expected);
    }

    #[test]
    fn test_read_dir_entry() {
        #[rustfmt::skip]
        let data: [u8; 12] = [
            0xAA, 0x30, 0x7E, 0x52, // Name hash
            0x1C, 0x00, 0x00, 0x00, // Offset (28)
            0x00, 0x00, 0x00, 0x00,
        ];

        let mut reader = Cursor::new(&data);
        let entry = DirEntry::read(&mut reader).unwrap();

        assert_eq!(
            entry,
            DirEntry {
                name_hash: 0x527E30AA,
                offset: 28,
            }
        );
    }

    #[test]
    fn test_entry_name_hash() {
        // CRC-32/BZIP2 catalogue check value
        assert_eq!(entry_name_hash("123456789"), 0xFC891918);
        assert_eq!(entry_name_hash("hello.txt"), 0x527E30AA);
    }

    #[test]
    fn test_entry_name_hash_is_case_insensitive() {
        assert_eq!(
            entry_name_hash("Mushrooms.dds"),
            entry_name_hash("mushrooms.dds")
        );
    }

    #[test]
    fn test_encode_name_utf16() {
        assert_eq!(
            encode_name("ab", 3),
            vec![0x61, 0x00, 0x62, 0x00, 0x00, 0x00]
        );
        assert_eq!(name_units("ab", 3), 3);
    }

    #[test]
    fn test_encode_name_utf16_surrogate_pair() {
        // U+10437 encodes as two UTF-16 units
        assert_eq!(name_units("\u{10437}", 3), 3);
        assert_eq!(
            encode_name("\u{10437}", 3),
            vec![0x01, 0xD8, 0x37, 0xDC, 0x00, 0x00]
        );
    }

    #[test]
    fn test_encode_name_utf32() {
        assert_eq!(
            encode_name("ab", 4),
            vec![0x61, 0x00, 0x00, 0x00, 0x62, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(name_units("ab", 4), 3);
        assert_eq!(name_units("\u{10437}", 4), 2);
    }

    #[test]
    fn test_name_digest_of_empty_name() {
        // SHA-256 of the empty byte string, the digest of the unnamed
        // top level directory
        #[rustfmt::skip]
        let expected: [u8; 32] = [
            0xE3, 0xB0, 0xC4, 0x42, 0x98, 0xFC, 0x1C, 0x14,
            0x9A, 0xFB, 0xF4, 0xC8, 0x99, 0x6F, 0xB9, 0x24,
            0x27, 0xAE, 0x41, 0xE4, 0x64, 0x9B, 0x93, 0x4C,
            0xA4, 0x95, 0x99, 0x1B, 0x78, 0x52, 0xB8, 0x55,
        ];

        assert_eq!(name_digest("", 3), expected);
        assert_eq!(name_digest("", 4), expected);
    }
}
