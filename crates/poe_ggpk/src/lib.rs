//! This library handles reading from and creating **GGPK** files used by *Path of Exile*.
//!
//! # GGPK Container Format Documentation
//!
//! This crate provides utilities to read, extract and patch data in the **GGPK** container format
//! used by the game *Path of Exile*. The GGPK format is a custom binary format that stores the whole
//! asset tree of the game within a single file. GGPK files are typically identified with the `.ggpk`
//! extension.
//!
//! ## File Structure
//!
//! A GGPK file is a flat sequence of variable-length records that tile the file from offset zero to
//! its end, with no padding between them. Every record starts with the same 8 byte header:
//!
//! | Offset (bytes) | Field         | Description                                              |
//! |----------------|---------------|----------------------------------------------------------|
//! | 0x0000         | Length        | 4 bytes: Total record length, header included            |
//! | 0x0004         | Tag           | 4 bytes: ASCII record type, one of GGPK, PDIR, FILE, FREE|
//!
//! Records reference each other by absolute file offset, forming a directory tree on top of the
//! flat record sequence.
//!
//! ### Root Record (`GGPK`)
//!
//! The root record anchors the container. It is usually the first record, but the format only
//! requires that one exists; when several are present the one at the highest offset is current.
//!
//! | Offset (bytes) | Field         | Description                                              |
//! |----------------|---------------|----------------------------------------------------------|
//! | 0x0008         | Version       | 4 bytes: Format version                                  |
//! | 0x000C         | Offsets       | 8 bytes each: `(Length - 12) / 8` record offsets         |
//!
//! - **Version**: Decides the name encoding for the whole container. Version `4` stores names as
//!   UTF-32LE, every other version as UTF-16LE.
//! - **Offsets**: One offset points at the top level directory record. Another customarily points
//!   at the head of the free record chain, or is zero when the chain is empty. This library writes
//!   two offsets, directory first.
//!
//! ### Directory Record (`PDIR`)
//!
//! | Offset (bytes) | Field         | Description                                              |
//! |----------------|---------------|----------------------------------------------------------|
//! | 0x0008         | Name Length   | 4 bytes: Name length in code units, terminator included  |
//! | 0x000C         | Entry Count   | 4 bytes: Number of child entries                         |
//! | 0x0010         | Digest        | 32 bytes: SHA-256 of the encoded name                    |
//! | 0x0030         | Name          | NUL terminated name in the container encoding            |
//! | ...            | Entries       | 12 bytes each: Name hash (4) and child offset (8)        |
//!
//! - **Name Hash**: CRC-32/BZIP2 of the lowercased UTF-8 name. The hash is a lookup accelerator
//!   only; the decoded name is authoritative.
//! - **Child Offset**: Absolute offset of a `PDIR` or `FILE` record.
//!
//! The top level directory has an empty name. Entry order inside a directory is meaningful and is
//! preserved by this library.
//!
//! ### File Record (`FILE`)
//!
//! | Offset (bytes) | Field         | Description                                              |
//! |----------------|---------------|----------------------------------------------------------|
//! | 0x0008         | Name Length   | 4 bytes: Name length in code units, terminator included  |
//! | 0x000C         | Digest        | 32 bytes: SHA-256 of the payload                         |
//! | 0x002C         | Name          | NUL terminated name in the container encoding            |
//! | ...            | Payload       | Raw file bytes up to the end of the record               |
//!
//! The payload length is not stored, it is the record length minus the 44 byte metadata and the
//! encoded name.
//!
//! ### Free Record (`FREE`)
//!
//! | Offset (bytes) | Field         | Description                                              |
//! |----------------|---------------|----------------------------------------------------------|
//! | 0x0008         | Next Free     | 8 bytes: Offset of the next free record, zero at the tail|
//!
//! Free records are dead byte ranges left behind by in-place mutations, available for reuse. The
//! rest of the record body is meaningless. The chain exists for compatibility with other tools;
//! this library discovers free space by scanning and rewrites the chain after every mutation.
//!
//! ## Additional Information
//!
//! - **File Extension**: `.ggpk`
//! - **Endianness**: Little-endian for all multi-byte integers
//! - **Name Encodings**:
//!   - UTF-16LE (all versions except 4)
//!   - UTF-32LE (version 4)
//!

pub mod error;
pub mod freelist;
pub mod read;
pub mod tree;
pub mod types;
pub mod write;

pub use read::GgpkArchive;
pub use read::Verification;
pub use write::GgpkWriter;
