//! Types for reading GGPK containers
//!

use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Debug};
use std::io::{self, Read, Seek, SeekFrom};

use binrw::BinRead;
use bon::Builder;
use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::freelist::FreeSpaceIndex;
use crate::tree::{self, build_tree, DirectoryNode, Fault, FileNode, Node};
use crate::types::{
    unit_width, DirEntry, RecordHeader, RecordTag, DIR_ENTRY_LEN, DIR_META_LEN, FILE_META_LEN,
    FREE_RECORD_MIN, RECORD_HEADER_LEN,
};

/// Buffer size used when hashing payloads
const VERIFY_CHUNK: usize = 64 * 1024;

/// Decoded root record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRecord {
    pub offset: u64,
    pub length: u32,
    /// Format version. Version 4 containers encode names as UTF-32LE,
    /// everything else as UTF-16LE.
    pub version: u32,
    /// Offsets carried by the root. One points at the top level directory,
    /// another customarily at the head of the free chain.
    pub offsets: Vec<u64>,
}

/// Decoded directory record, without its children resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub offset: u64,
    pub length: u32,
    pub name: String,
    /// SHA-256 of the encoded directory name
    pub digest: [u8; 32],
    pub entries: Vec<DirEntry>,
}

/// Decoded file record. The payload itself is never buffered, only its
/// location inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub offset: u64,
    pub length: u32,
    pub name: String,
    /// SHA-256 of the payload
    pub digest: [u8; 32],
    pub payload_offset: u64,
    pub payload_len: u64,
}

/// Decoded free record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRecord {
    pub offset: u64,
    pub length: u32,
    /// Offset of the next record in the free chain, zero at the tail.
    /// The chain is carried for format fidelity only; free space is
    /// discovered by scanning.
    pub next_free: u64,
}

/// Any record decoded from a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Root(RootRecord),
    Directory(DirectoryRecord),
    File(FileRecord),
    Free(FreeRecord),
}

impl Record {
    /// Offset of the record inside the container
    pub fn offset(&self) -> u64 {
        match self {
            Record::Root(r) => r.offset,
            Record::Directory(r) => r.offset,
            Record::File(r) => r.offset,
            Record::Free(r) => r.offset,
        }
    }

    /// Total record length in bytes
    pub fn length(&self) -> u32 {
        match self {
            Record::Root(r) => r.length,
            Record::Directory(r) => r.length,
            Record::File(r) => r.length,
            Record::Free(r) => r.length,
        }
    }

    pub(crate) fn tag_name(&self) -> &'static str {
        match self {
            Record::Root(_) => "GGPK",
            Record::Directory(_) => "PDIR",
            Record::File(_) => "FILE",
            Record::Free(_) => "FREE",
        }
    }
}

/// When file payloads are checked against the digest stored in their record
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Verification {
    /// Verify each file the first time it is opened in this session.
    /// Later opens of the same record are served from a cache that is
    /// dropped whenever the container is mutated.
    #[default]
    FirstRead,
    /// Never verify implicitly. [`GgpkArchive::verify_path`] still works.
    Off,
}

/// Options for opening a container
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct GgpkArchiveOptions {
    /// Payload verification policy
    #[builder(default)]
    pub verification: Verification,
}

/// Counts collected by the opening scan.
///
/// The values are a snapshot of the container as it was opened and are not
/// updated by later mutations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Records walked in total, including free and skipped regions
    pub records: u64,
    /// Directory records
    pub directories: u64,
    /// File records
    pub files: u64,
    /// Root records
    pub roots: u64,
    /// Free records
    pub free_records: u64,
    /// Regions stepped over because of an unknown tag
    pub skipped: u64,
    /// Sum of all file payload sizes
    pub payload_bytes: u64,
    /// Bytes held by records that are not reachable from the winning root
    pub orphaned_bytes: u64,
}

/// A region the opening scan stepped over because of an unknown tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedRegion {
    pub offset: u64,
    pub length: u32,
    pub tag: [u8; 4],
}

/// A file entry opened for reading.
///
/// Implements [`Read`] and [`Seek`] over the payload bytes only. Reading
/// stops at the payload end; seeking beyond it fails.
pub struct GgpkFile<'a, W: Read + Seek> {
    data: FileNode,
    reader: PayloadReader<'a, W>,
}

impl<W: Read + Seek> Debug for GgpkFile<'_, W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GgpkFile({:#?})", self.data)
    }
}

impl<'a, W: Read + Seek> GgpkFile<'a, W> {
    /// Get the name of the file
    ///
    /// # Warnings
    ///
    /// It is dangerous to use this name directly when extracting a
    /// container. It may contain an absolute path (`/etc/shadow`), or break
    /// out of the current directory (`../runtime`). Carelessly writing to
    /// these paths allows an attacker to craft a container that will
    /// overwrite critical files.
    ///
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Get the size of the payload, in bytes
    pub fn size(&self) -> u64 {
        self.data.payload_len
    }

    /// Get the SHA-256 digest stored in the file record
    pub fn digest(&self) -> &[u8; 32] {
        &self.data.digest
    }

    /// Get the offset of the first payload byte inside the container
    pub fn data_start(&self) -> u64 {
        self.data.payload_offset
    }
}

impl<W: Read + Seek> Read for GgpkFile<'_, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<W: Read + Seek> Seek for GgpkFile<'_, W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

/// Reader over one payload region of the container
pub(crate) struct PayloadReader<'a, W: Read + Seek> {
    inner: &'a mut W,
    start: u64,
    len: u64,
    pos: u64,
}

impl<'a, W: Read + Seek> PayloadReader<'a, W> {
    #[instrument(skip(reader))]
    pub fn new(reader: &'a mut W, start: u64, len: u64) -> Result<Self> {
        reader.seek(SeekFrom::Start(start))?;
        Ok(PayloadReader {
            inner: reader,
            start,
            len,
            pos: 0,
        })
    }
}

impl<W: Read + Seek> Read for PayloadReader<'_, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let limit = remaining.min(buf.len() as u64) as usize;
        let read = self.inner.read(&mut buf[..limit])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl<W: Read + Seek> Seek for PayloadReader<'_, W> {
    #[instrument(skip(self), err)]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(n) => self.len as i128 + n as i128,
            SeekFrom::Current(n) => self.pos as i128 + n as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the payload",
            ));
        }
        if target > self.len as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                Error::PayloadBoundsExceeded {
                    offset: u64::try_from(target).unwrap_or(u64::MAX),
                    payload_len: self.len,
                },
            ));
        }
        let target = target as u64;
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(target)
    }
}

/// GGPK container reader
///
/// ```no_run
/// use std::io::prelude::*;
///
/// fn list_ggpk_contents(reader: impl Read + Seek) -> poe_ggpk::error::Result<()> {
///     let mut ggpk = poe_ggpk::GgpkArchive::new(reader)?;
///
///     let mut paths = Vec::new();
///     ggpk.root_dir().walk(&mut |path, node| {
///         if node.as_file().is_some() {
///             paths.push(path.to_owned());
///         }
///     });
///
///     for path in paths {
///         let mut file = ggpk.by_path(&path)?;
///         println!("{}: {} bytes", file.name(), file.size());
///         std::io::copy(&mut file, &mut std::io::stdout())?;
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct GgpkArchive<R> {
    pub(crate) reader: R,
    pub(crate) container_len: u64,
    pub(crate) version: u32,
    pub(crate) root_offset: u64,
    pub(crate) root_dir_slot: usize,
    pub(crate) free_head_slot: Option<usize>,
    pub(crate) root: Node,
    pub(crate) free: FreeSpaceIndex,
    pub(crate) faults: Vec<Fault>,
    pub(crate) skipped: Vec<SkippedRegion>,
    pub(crate) stats: ScanStats,
    pub(crate) verified: HashSet<u64>,
    pub(crate) verification: Verification,
}

impl<R> GgpkArchive<R> {
    /// Format version of the container
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Total size of the container in bytes
    pub fn container_len(&self) -> u64 {
        self.container_len
    }

    /// The top level directory
    pub fn root_dir(&self) -> &DirectoryNode {
        match &self.root {
            Node::Directory(dir) => dir,
            Node::File(_) => unreachable!("the root node is always a directory"),
        }
    }

    /// Resolve a `/` separated path to a node.
    ///
    /// Empty segments are skipped, so `""` and `"/"` both resolve to the
    /// top level directory. Matching is by exact decoded name.
    pub fn resolve(&self, path: &str) -> Result<&Node> {
        tree::resolve(&self.root, path)
    }

    /// Resolve a path that must end in a directory
    pub fn resolve_dir(&self, path: &str) -> Result<&DirectoryNode> {
        tree::resolve_dir(&self.root, path)
    }

    /// Resolve a path that must end in a file
    pub fn resolve_file(&self, path: &str) -> Result<&FileNode> {
        match tree::resolve(&self.root, path)? {
            Node::File(file) => Ok(file),
            Node::Directory(dir) => Err(Error::UnexpectedRecord {
                offset: dir.record_offset(),
                expected: "FILE",
                found: "PDIR",
            }),
        }
    }

    /// Subtrees that could not be resolved when the container was opened
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    /// Regions the opening scan stepped over because of an unknown tag
    pub fn skipped_regions(&self) -> &[SkippedRegion] {
        &self.skipped
    }

    /// Index of the recycled byte ranges of the container
    pub fn free_index(&self) -> &FreeSpaceIndex {
        &self.free
    }

    /// Counts collected by the opening scan
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// The payload verification policy this archive was opened with
    pub fn verification(&self) -> Verification {
        self.verification
    }

    /// Unwrap and return the inner reader object
    ///
    /// The position of the reader is undefined.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Seek> GgpkArchive<R> {
    /// Open a container with the default options
    pub fn new(reader: R) -> Result<GgpkArchive<R>> {
        Self::with_options(reader, GgpkArchiveOptions::default())
    }

    /// Open a container.
    ///
    /// The whole container is scanned record by record: the directory tree
    /// is rebuilt from the winning root record, free records are indexed
    /// and regions with unknown tags are stepped over. File payloads are
    /// not read.
    pub fn with_options(mut reader: R, options: GgpkArchiveOptions) -> Result<GgpkArchive<R>> {
        let container_len = reader.seek(SeekFrom::End(0))?;
        let outcome = scan(&mut reader, container_len)?;

        let root = outcome.latest_root.ok_or(Error::MissingRoot)?;
        let root_dir_slot = root
            .offsets
            .iter()
            .position(|offset| matches!(outcome.records.get(offset), Some(Record::Directory(_))))
            .ok_or(Error::MissingRoot)?;
        let free_head_slot = (0..root.offsets.len()).find(|slot| *slot != root_dir_slot);
        let top_offset = root.offsets[root_dir_slot];
        debug!(
            "root record at {:#x} (version {}), top level directory at {:#x}",
            root.offset, root.version, top_offset
        );

        let build = build_tree(outcome.records, top_offset)?;
        if !build.faults.is_empty() {
            warn!("{} subtree(s) could not be resolved", build.faults.len());
        }

        let mut stats = outcome.stats;
        stats.orphaned_bytes += build
            .leftover
            .values()
            .map(|record| record.length() as u64)
            .sum::<u64>();

        Ok(GgpkArchive {
            reader,
            container_len,
            version: root.version,
            root_offset: root.offset,
            root_dir_slot,
            free_head_slot,
            root: Node::Directory(build.root),
            free: outcome.free,
            faults: build.faults,
            skipped: outcome.skipped,
            stats,
            verified: HashSet::new(),
            verification: options.verification,
        })
    }

    /// Open the file at `path` for reading.
    ///
    /// Under [`Verification::FirstRead`] the payload is hashed and checked
    /// against the record digest before the handle is returned.
    pub fn by_path(&mut self, path: &str) -> Result<GgpkFile<'_, R>> {
        let node = match tree::resolve(&self.root, path)? {
            Node::File(file) => file,
            Node::Directory(dir) => {
                return Err(Error::UnexpectedRecord {
                    offset: dir.record_offset(),
                    expected: "FILE",
                    found: "PDIR",
                })
            }
        };

        if self.verification == Verification::FirstRead && !self.verified.contains(&node.offset) {
            verify_payload(&mut self.reader, node, path)?;
            self.verified.insert(node.offset);
        }

        let data = node.clone();
        Ok(GgpkFile {
            reader: PayloadReader::new(&mut self.reader, data.payload_offset, data.payload_len)?,
            data,
        })
    }

    /// Open a file node for reading.
    ///
    /// The node has to be cloned out of the tree first, since the handle
    /// borrows the archive:
    ///
    /// ```no_run
    /// # fn doit(ggpk: &mut poe_ggpk::GgpkArchive<std::fs::File>) -> poe_ggpk::error::Result<()> {
    /// let node = ggpk.resolve_file("data/mushrooms.dds")?.clone();
    /// let mut file = ggpk.open_node(&node)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open_node<'a>(&'a mut self, node: &'a FileNode) -> Result<GgpkFile<'a, R>> {
        if self.verification == Verification::FirstRead && !self.verified.contains(&node.offset) {
            verify_payload(&mut self.reader, node, node.name())?;
            self.verified.insert(node.offset);
        }

        let data = node.clone();
        Ok(GgpkFile {
            reader: PayloadReader::new(&mut self.reader, data.payload_offset, data.payload_len)?,
            data,
        })
    }

    /// Hash the payload at `path` and compare it against the record digest.
    ///
    /// Always recomputes, regardless of the verification policy.
    pub fn verify_path(&mut self, path: &str) -> Result<()> {
        let node = match tree::resolve(&self.root, path)? {
            Node::File(file) => file,
            Node::Directory(dir) => {
                return Err(Error::UnexpectedRecord {
                    offset: dir.record_offset(),
                    expected: "FILE",
                    found: "PDIR",
                })
            }
        };
        verify_payload(&mut self.reader, node, path)?;
        self.verified.insert(node.offset);
        Ok(())
    }

    /// Hash a file node's payload and compare it against the record digest
    pub fn verify_node(&mut self, node: &FileNode) -> Result<()> {
        verify_payload(&mut self.reader, node, node.name())?;
        self.verified.insert(node.offset);
        Ok(())
    }

    /// Read and bounds-check the record header at `offset`
    pub fn read_header_at(&mut self, offset: u64) -> Result<RecordHeader> {
        read_header(&mut self.reader, self.container_len, offset)
    }

    /// Decode the whole record at `offset`, using the container's name
    /// encoding. File payloads are located but not read.
    pub fn decode_record_at(&mut self, offset: u64) -> Result<Record> {
        let header = read_header(&mut self.reader, self.container_len, offset)?;
        decode_record(&mut self.reader, header, offset, self.version)
    }

    /// Raw read of `len` bytes at `offset`
    pub fn read_bytes_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if offset.checked_add(len).map_or(true, |end| end > self.container_len) {
            return Err(Error::OutOfBounds {
                offset,
                len,
                container_len: self.container_len,
            });
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0; len as usize];
        self.reader.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Walk the whole container and check that its records tile it without
    /// gap or overlap, and that the free space index mirrors the free
    /// records on disk.
    #[instrument(skip(self), err)]
    pub fn validate_partition(&mut self) -> Result<()> {
        let mut disk_free = BTreeMap::new();
        let mut offset = 0;
        while offset < self.container_len {
            let header = read_header(&mut self.reader, self.container_len, offset)?;
            if header.tag == RecordTag::Free {
                disk_free.insert(offset, header.length as u64);
            }
            offset += header.length as u64;
        }

        let mut indexed = self.free.iter();
        let mut on_disk = disk_free.into_iter();
        loop {
            match (indexed.next(), on_disk.next()) {
                (None, None) => return Ok(()),
                (Some((offset, size)), Some((disk_offset, disk_size))) => {
                    if offset != disk_offset || size != disk_size {
                        return Err(Error::BrokenPartition {
                            offset: offset.min(disk_offset),
                            reason: "free space index does not match the free records on disk",
                        });
                    }
                }
                (Some((offset, _)), None) => {
                    return Err(Error::BrokenPartition {
                        offset,
                        reason: "free space index entry without a free record",
                    })
                }
                (None, Some((offset, _))) => {
                    return Err(Error::BrokenPartition {
                        offset,
                        reason: "free record not tracked by the index",
                    })
                }
            }
        }
    }
}

struct ScanOutcome {
    records: BTreeMap<u64, Record>,
    free: FreeSpaceIndex,
    skipped: Vec<SkippedRegion>,
    latest_root: Option<RootRecord>,
    stats: ScanStats,
}

/// Walk every record from offset zero to the end of the container.
///
/// The name encoding is a property of the whole container, set by the
/// winning root record, which may sit behind the records it points at. The
/// first pass therefore reads only headers and root bodies; record bodies
/// are decoded in a second pass once the version is known. Unknown tags are
/// sized from their header and stepped over.
#[instrument(skip(reader), err)]
fn scan<R: Read + Seek>(reader: &mut R, container_len: u64) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome {
        records: BTreeMap::new(),
        free: FreeSpaceIndex::new(),
        skipped: Vec::new(),
        latest_root: None,
        stats: ScanStats::default(),
    };

    let mut headers = Vec::new();
    let mut offset = 0;
    while offset < container_len {
        let header = read_header(reader, container_len, offset)?;
        if header.tag == RecordTag::Root {
            let root = decode_root(reader, offset, header.length)?;
            outcome.stats.roots += 1;
            if let Some(stale) = outcome.latest_root.replace(root) {
                outcome.stats.orphaned_bytes += stale.length as u64;
            }
        }
        headers.push((offset, header));
        outcome.stats.records += 1;
        offset += header.length as u64;
    }

    let version = outcome.latest_root.as_ref().map_or(0, |root| root.version);

    for (offset, header) in headers {
        match header.tag {
            // decoded in the first pass
            RecordTag::Root => {}
            RecordTag::Directory => {
                reader.seek(SeekFrom::Start(offset + RECORD_HEADER_LEN))?;
                let dir = decode_directory(reader, offset, header.length, version)?;
                outcome.stats.directories += 1;
                outcome.records.insert(offset, Record::Directory(dir));
            }
            RecordTag::File => {
                reader.seek(SeekFrom::Start(offset + RECORD_HEADER_LEN))?;
                let file = decode_file(reader, offset, header.length, version)?;
                outcome.stats.files += 1;
                outcome.stats.payload_bytes += file.payload_len;
                outcome.records.insert(offset, Record::File(file));
            }
            RecordTag::Free => {
                reader.seek(SeekFrom::Start(offset + RECORD_HEADER_LEN))?;
                decode_free(reader, offset, header.length)?;
                outcome.stats.free_records += 1;
                outcome.free.insert_scanned(offset, header.length as u64);
            }
            RecordTag::Unknown(tag) => {
                warn!(
                    "skipping unknown record type `{}` at {:#x}",
                    tag.escape_ascii(),
                    offset
                );
                outcome.stats.skipped += 1;
                outcome.skipped.push(SkippedRegion {
                    offset,
                    length: header.length,
                    tag,
                });
            }
        }
    }

    Ok(outcome)
}

fn read_header<R: Read + Seek>(
    reader: &mut R,
    container_len: u64,
    offset: u64,
) -> Result<RecordHeader> {
    if offset
        .checked_add(RECORD_HEADER_LEN)
        .map_or(true, |end| end > container_len)
    {
        return Err(Error::TruncatedRecord { offset });
    }
    reader.seek(SeekFrom::Start(offset))?;
    let header = RecordHeader::read(reader)?;
    if (header.length as u64) < RECORD_HEADER_LEN
        || offset
            .checked_add(header.length as u64)
            .map_or(true, |end| end > container_len)
    {
        return Err(Error::CorruptHeader {
            offset,
            length: header.length,
        });
    }
    Ok(header)
}

/// Decode the record body following an already validated header. The
/// reader has to be positioned right after the header.
fn decode_record<R: Read + Seek>(
    reader: &mut R,
    header: RecordHeader,
    offset: u64,
    version: u32,
) -> Result<Record> {
    match header.tag {
        RecordTag::Root => Ok(Record::Root(decode_root(reader, offset, header.length)?)),
        RecordTag::Directory => Ok(Record::Directory(decode_directory(
            reader,
            offset,
            header.length,
            version,
        )?)),
        RecordTag::File => Ok(Record::File(decode_file(
            reader,
            offset,
            header.length,
            version,
        )?)),
        RecordTag::Free => Ok(Record::Free(decode_free(reader, offset, header.length)?)),
        RecordTag::Unknown(tag) => Err(Error::UnknownRecordType { offset, tag }),
    }
}

fn decode_root<R: Read>(reader: &mut R, offset: u64, length: u32) -> Result<RootRecord> {
    // version field plus at least one offset
    if length < 20 {
        return Err(Error::CorruptHeader { offset, length });
    }
    let version = reader.read_u32::<LittleEndian>()?;
    let count = (length as u64 - 12) / 8;
    let mut offsets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        offsets.push(reader.read_u64::<LittleEndian>()?);
    }
    Ok(RootRecord {
        offset,
        length,
        version,
        offsets,
    })
}

fn decode_directory<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    length: u32,
    version: u32,
) -> Result<DirectoryRecord> {
    let name_len = reader.read_u32::<LittleEndian>()?;
    let entry_count = reader.read_u32::<LittleEndian>()?;
    let mut digest = [0u8; 32];
    reader.read_exact(&mut digest)?;

    let need = DIR_META_LEN
        + name_len as u64 * unit_width(version)
        + entry_count as u64 * DIR_ENTRY_LEN;
    if need > length as u64 {
        return Err(Error::CorruptHeader { offset, length });
    }

    let name = decode_name(reader, offset, name_len, version)?;
    let entries = (0..entry_count)
        .map(|_| DirEntry::read(reader).map_err(Error::from))
        .collect::<Result<Vec<_>>>()?;

    Ok(DirectoryRecord {
        offset,
        length,
        name,
        digest,
        entries,
    })
}

fn decode_file<R: Read>(
    reader: &mut R,
    offset: u64,
    length: u32,
    version: u32,
) -> Result<FileRecord> {
    let name_len = reader.read_u32::<LittleEndian>()?;
    let mut digest = [0u8; 32];
    reader.read_exact(&mut digest)?;

    let meta = FILE_META_LEN + name_len as u64 * unit_width(version);
    if meta > length as u64 {
        return Err(Error::CorruptHeader { offset, length });
    }

    let name = decode_name(reader, offset, name_len, version)?;

    Ok(FileRecord {
        offset,
        length,
        name,
        digest,
        payload_offset: offset + meta,
        payload_len: length as u64 - meta,
    })
}

fn decode_free<R: Read>(reader: &mut R, offset: u64, length: u32) -> Result<FreeRecord> {
    if (length as u64) < FREE_RECORD_MIN {
        return Err(Error::CorruptHeader { offset, length });
    }
    let next_free = reader.read_u64::<LittleEndian>()?;
    Ok(FreeRecord {
        offset,
        length,
        next_free,
    })
}

/// Decode a name of `units` code units including the terminator. The
/// terminator is read and discarded, not enforced.
fn decode_name<R: Read>(reader: &mut R, offset: u64, units: u32, version: u32) -> Result<String> {
    if units == 0 {
        return Err(Error::InvalidName { offset });
    }
    let count = units as usize - 1;
    if unit_width(version) == 4 {
        let mut name = String::with_capacity(count);
        for _ in 0..count {
            let unit = reader.read_u32::<LittleEndian>()?;
            name.push(char::from_u32(unit).ok_or(Error::InvalidName { offset })?);
        }
        reader.read_u32::<LittleEndian>()?;
        Ok(name)
    } else {
        let mut units16 = Vec::with_capacity(count);
        for _ in 0..count {
            units16.push(reader.read_u16::<LittleEndian>()?);
        }
        reader.read_u16::<LittleEndian>()?;
        Ok(String::from_utf16(&units16)?)
    }
}

/// Stream a payload through SHA-256 and compare it with the record digest
fn verify_payload<R: Read + Seek>(reader: &mut R, file: &FileNode, path: &str) -> Result<()> {
    debug!("verifying `{}` ({} bytes)", path, file.payload_len);
    reader.seek(SeekFrom::Start(file.payload_offset))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; VERIFY_CHUNK];
    let mut remaining = file.payload_len;
    while remaining > 0 {
        let limit = remaining.min(VERIFY_CHUNK as u64) as usize;
        reader.read_exact(&mut buf[..limit])?;
        hasher.update(&buf[..limit]);
        remaining -= limit as u64;
    }

    let actual: [u8; 32] = hasher.finalize().into();
    if actual != file.digest {
        return Err(Error::IntegrityMismatch {
            path: path.to_owned(),
            expected: hex(&file.digest),
            actual: hex(&actual),
        });
    }
    Ok(())
}

pub(crate) fn hex(digest: &[u8]) -> String {
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod test {
    use std::io::{Cursor, Read, Seek, SeekFrom};

    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::types::{encode_name, entry_name_hash, name_digest, name_units};

    /// Assembles raw records so the tests can shape containers the writer
    /// never produces
    struct Fixture {
        bytes: Vec<u8>,
        version: u32,
    }

    impl Fixture {
        fn new(version: u32) -> Self {
            Fixture {
                bytes: Vec::new(),
                version,
            }
        }

        /// Two slot root record with zeroed offsets, to be patched once the
        /// target offsets are known
        fn root_placeholder(&mut self) -> u64 {
            let offset = self.bytes.len() as u64;
            self.bytes.extend_from_slice(&28u32.to_le_bytes());
            self.bytes.extend_from_slice(b"GGPK");
            self.bytes.extend_from_slice(&self.version.to_le_bytes());
            self.bytes.extend_from_slice(&[0; 16]);
            offset
        }

        fn patch_root(&mut self, root_at: u64, slots: [u64; 2]) {
            let at = root_at as usize + 12;
            self.bytes[at..at + 8].copy_from_slice(&slots[0].to_le_bytes());
            self.bytes[at + 8..at + 16].copy_from_slice(&slots[1].to_le_bytes());
        }

        fn dir(&mut self, name: &str, entries: &[(u32, u64)]) -> u64 {
            let offset = self.bytes.len() as u64;
            let encoded = encode_name(name, self.version);
            let length = 48 + encoded.len() + entries.len() * 12;
            self.bytes.extend_from_slice(&(length as u32).to_le_bytes());
            self.bytes.extend_from_slice(b"PDIR");
            self.bytes
                .extend_from_slice(&(name_units(name, self.version) as u32).to_le_bytes());
            self.bytes
                .extend_from_slice(&(entries.len() as u32).to_le_bytes());
            self.bytes
                .extend_from_slice(&name_digest(name, self.version));
            self.bytes.extend_from_slice(&encoded);
            for (hash, child) in entries {
                self.bytes.extend_from_slice(&hash.to_le_bytes());
                self.bytes.extend_from_slice(&child.to_le_bytes());
            }
            offset
        }

        fn file(&mut self, name: &str, payload: &[u8]) -> u64 {
            let digest: [u8; 32] = Sha256::digest(payload).into();
            self.file_with_digest(name, payload, digest)
        }

        fn file_with_digest(&mut self, name: &str, payload: &[u8], digest: [u8; 32]) -> u64 {
            let offset = self.bytes.len() as u64;
            let encoded = encode_name(name, self.version);
            let length = 44 + encoded.len() + payload.len();
            self.bytes.extend_from_slice(&(length as u32).to_le_bytes());
            self.bytes.extend_from_slice(b"FILE");
            self.bytes
                .extend_from_slice(&(name_units(name, self.version) as u32).to_le_bytes());
            self.bytes.extend_from_slice(&digest);
            self.bytes.extend_from_slice(&encoded);
            self.bytes.extend_from_slice(payload);
            offset
        }

        fn free(&mut self, size: u32, next: u64) -> u64 {
            let offset = self.bytes.len() as u64;
            self.bytes.extend_from_slice(&size.to_le_bytes());
            self.bytes.extend_from_slice(b"FREE");
            self.bytes.extend_from_slice(&next.to_le_bytes());
            self.bytes.resize(offset as usize + size as usize, 0);
            offset
        }

        fn raw(&mut self, tag: &[u8; 4], size: u32) -> u64 {
            let offset = self.bytes.len() as u64;
            self.bytes.extend_from_slice(&size.to_le_bytes());
            self.bytes.extend_from_slice(tag);
            self.bytes.resize(offset as usize + size as usize, 0xAB);
            offset
        }

        fn into_archive(self) -> Result<GgpkArchive<Cursor<Vec<u8>>>> {
            GgpkArchive::new(Cursor::new(self.bytes))
        }
    }

    fn minimal_container() -> Fixture {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let hello = fx.file("hello.txt", b"Hello World");
        let empty = fx.file("empty.bin", b"");
        let art = fx.dir("art", &[(entry_name_hash("empty.bin"), empty)]);
        let top = fx.dir(
            "",
            &[
                (entry_name_hash("hello.txt"), hello),
                (entry_name_hash("art"), art),
            ],
        );
        fx.patch_root(root_rec, [top, 0]);
        fx
    }

    #[test]
    fn test_open_minimal_container() -> Result<()> {
        let mut ggpk = minimal_container().into_archive()?;

        assert_eq!(ggpk.version(), 3);
        assert!(ggpk.faults().is_empty());
        assert!(ggpk.skipped_regions().is_empty());

        let stats = ggpk.stats();
        assert_eq!(stats.roots, 1);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 2);
        assert_eq!(stats.payload_bytes, 11);
        assert_eq!(stats.orphaned_bytes, 0);

        let mut file = ggpk.by_path("hello.txt")?;
        assert_eq!(file.name(), "hello.txt");
        assert_eq!(file.size(), 11);

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        assert_eq!(buffer, b"Hello World");

        let mut empty = ggpk.by_path("art/empty.bin")?;
        let mut buffer = Vec::new();
        empty.read_to_end(&mut buffer)?;
        assert!(buffer.is_empty());

        Ok(())
    }

    #[test]
    fn test_resolution_is_deterministic() -> Result<()> {
        let first = minimal_container().into_archive()?;
        let second = minimal_container().into_archive()?;

        let mut first_walk = Vec::new();
        first
            .root_dir()
            .walk(&mut |path, node| first_walk.push((path.to_owned(), node.record_offset())));
        let mut second_walk = Vec::new();
        second
            .root_dir()
            .walk(&mut |path, node| second_walk.push((path.to_owned(), node.record_offset())));

        assert_eq!(first_walk, second_walk);
        assert_eq!(
            first_walk.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            vec!["hello.txt", "art", "art/empty.bin"]
        );
        Ok(())
    }

    #[test]
    fn test_corrupted_payload_fails_on_first_read() -> Result<()> {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let bad = fx.file_with_digest("bad.bin", b"payload", [0xEE; 32]);
        let top = fx.dir("", &[(entry_name_hash("bad.bin"), bad)]);
        fx.patch_root(root_rec, [top, 0]);
        let bytes = fx.bytes;

        let mut ggpk = GgpkArchive::new(Cursor::new(bytes.clone()))?;
        let err = ggpk.by_path("bad.bin").unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));

        // the payload stays readable when verification is off
        let mut ggpk = GgpkArchive::with_options(
            Cursor::new(bytes),
            GgpkArchiveOptions::builder()
                .verification(Verification::Off)
                .build(),
        )?;
        let mut file = ggpk.by_path("bad.bin")?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        assert_eq!(buffer, b"payload");

        // but an explicit check still recomputes
        let err = ggpk.verify_path("bad.bin").unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_verification_is_cached_per_record() -> Result<()> {
        let mut ggpk = minimal_container().into_archive()?;

        ggpk.by_path("hello.txt")?;
        assert_eq!(ggpk.verified.len(), 1);
        ggpk.by_path("hello.txt")?;
        assert_eq!(ggpk.verified.len(), 1);
        Ok(())
    }

    #[test]
    fn test_highest_offset_root_wins() -> Result<()> {
        let mut fx = Fixture::new(3);
        let first_root = fx.root_placeholder();
        let old = fx.file("old.txt", b"old");
        let old_top = fx.dir("", &[(entry_name_hash("old.txt"), old)]);
        fx.patch_root(first_root, [old_top, 0]);

        let new = fx.file("new.txt", b"new");
        let new_top = fx.dir("", &[(entry_name_hash("new.txt"), new)]);
        let second_root = fx.root_placeholder();
        fx.patch_root(second_root, [new_top, 0]);

        let ggpk = fx.into_archive()?;
        assert!(ggpk.resolve("new.txt").is_ok());
        assert!(matches!(
            ggpk.resolve("old.txt"),
            Err(Error::NotFound { .. })
        ));
        // the superseded root, its directory and its file are dead weight
        assert!(ggpk.stats().orphaned_bytes > 0);
        assert_eq!(ggpk.stats().roots, 2);
        Ok(())
    }

    #[test]
    fn test_unknown_tag_is_stepped_over() -> Result<()> {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let junk = fx.raw(b"BNDL", 24);
        let file = fx.file("kept.txt", b"kept");
        let top = fx.dir("", &[(entry_name_hash("kept.txt"), file)]);
        fx.patch_root(root_rec, [top, 0]);

        let mut ggpk = fx.into_archive()?;
        assert_eq!(ggpk.skipped_regions().len(), 1);
        assert_eq!(ggpk.skipped_regions()[0].offset, junk);
        assert_eq!(&ggpk.skipped_regions()[0].tag, b"BNDL");
        assert!(ggpk.resolve("kept.txt").is_ok());
        ggpk.validate_partition()?;
        Ok(())
    }

    #[test]
    fn test_free_records_are_indexed() -> Result<()> {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let free_one = fx.free(32, 0);
        let file = fx.file("a.txt", b"a");
        let free_two = fx.free(64, 0);
        let top = fx.dir("", &[(entry_name_hash("a.txt"), file)]);
        fx.patch_root(root_rec, [top, free_one]);

        let mut ggpk = fx.into_archive()?;
        assert_eq!(ggpk.free_index().len(), 2);
        assert_eq!(ggpk.free_index().get(free_one), Some(32));
        assert_eq!(ggpk.free_index().get(free_two), Some(64));
        assert_eq!(ggpk.free_index().total_bytes(), 96);
        ggpk.validate_partition()?;
        Ok(())
    }

    #[test]
    fn test_record_overrunning_the_container_is_corrupt() {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let file = fx.file("a.txt", b"alpha");
        let top = fx.dir("", &[(entry_name_hash("a.txt"), file)]);
        fx.patch_root(root_rec, [top, 0]);

        // chop into the final record's body
        let mut bytes = fx.bytes;
        bytes.truncate(bytes.len() - 4);

        let err = GgpkArchive::new(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::CorruptHeader { .. }));
    }

    #[test]
    fn test_trailing_sliver_is_truncated() {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let top = fx.dir("", &[]);
        fx.patch_root(root_rec, [top, 0]);

        // five stray bytes cannot hold a record header
        let mut bytes = fx.bytes;
        let tail = bytes.len() as u64;
        bytes.extend_from_slice(&[0xFF; 5]);

        let err = GgpkArchive::new(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::TruncatedRecord { offset } if offset == tail));
    }

    #[test]
    fn test_container_without_root_record() {
        let mut fx = Fixture::new(3);
        fx.dir("", &[]);

        let err = fx.into_archive().unwrap_err();
        assert!(matches!(err, Error::MissingRoot));
    }

    #[test]
    fn test_root_without_directory_offset() {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let stray = fx.file("stray.txt", b"stray");
        // no slot points at a directory record
        fx.patch_root(root_rec, [stray, 0]);

        let err = fx.into_archive().unwrap_err();
        assert!(matches!(err, Error::MissingRoot));
    }

    #[test]
    fn test_utf32_names_in_version_4() -> Result<()> {
        let mut fx = Fixture::new(4);
        let root_rec = fx.root_placeholder();
        let file = fx.file("héllo wörld.txt", b"data");
        let top = fx.dir("", &[(entry_name_hash("héllo wörld.txt"), file)]);
        fx.patch_root(root_rec, [top, 0]);

        let mut ggpk = fx.into_archive()?;
        assert_eq!(ggpk.version(), 4);
        let mut file = ggpk.by_path("héllo wörld.txt")?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        assert_eq!(buffer, b"data");
        Ok(())
    }

    #[test]
    fn test_version_4_root_behind_its_records() -> Result<()> {
        // the winning root sits after the records it points at, so the
        // encoding it selects has to apply to names scanned before it
        let mut fx = Fixture::new(4);
        let file = fx.file("héllo.txt", b"data");
        let top = fx.dir("", &[(entry_name_hash("héllo.txt"), file)]);
        let root_rec = fx.root_placeholder();
        fx.patch_root(root_rec, [top, 0]);

        let mut ggpk = fx.into_archive()?;
        assert_eq!(ggpk.version(), 4);

        let mut file = ggpk.by_path("héllo.txt")?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        assert_eq!(buffer, b"data");
        Ok(())
    }

    #[test]
    fn test_payload_reader_seeks_within_bounds() -> Result<()> {
        let mut ggpk = minimal_container().into_archive()?;
        let mut file = ggpk.by_path("hello.txt")?;

        file.seek(SeekFrom::End(-5))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        assert_eq!(buffer, b"World");

        file.seek(SeekFrom::Start(6))?;
        let mut buffer = [0u8; 2];
        file.read_exact(&mut buffer)?;
        assert_eq!(&buffer, b"Wo");

        file.seek(SeekFrom::Current(-2))?;
        let mut buffer = [0u8; 2];
        file.read_exact(&mut buffer)?;
        assert_eq!(&buffer, b"Wo");

        // positioned exactly at the end reads nothing
        let at_end = file.seek(SeekFrom::End(0))?;
        assert_eq!(at_end, 11);
        assert_eq!(file.read(&mut [0u8; 4])?, 0);

        Ok(())
    }

    #[test]
    fn test_payload_reader_rejects_out_of_bounds_seeks() -> Result<()> {
        let mut ggpk = minimal_container().into_archive()?;
        let mut file = ggpk.by_path("hello.txt")?;

        let err = file.seek(SeekFrom::Start(12)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        let err = file.seek(SeekFrom::Current(-1)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        // reading past the bound comes up short instead of spilling into
        // the neighbouring record
        file.seek(SeekFrom::Start(8))?;
        let err = file.read_exact(&mut [0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        Ok(())
    }

    #[test]
    fn test_opening_a_directory_as_a_file() -> Result<()> {
        let mut ggpk = minimal_container().into_archive()?;

        let err = ggpk.by_path("art").unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedRecord {
                expected: "FILE",
                found: "PDIR",
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn test_decode_record_at_every_offset() -> Result<()> {
        let mut fx = Fixture::new(3);
        let root_rec = fx.root_placeholder();
        let file = fx.file("a.txt", b"alpha");
        let free = fx.free(24, 0);
        let top = fx.dir("", &[(entry_name_hash("a.txt"), file)]);
        fx.patch_root(root_rec, [top, free]);

        let mut ggpk = fx.into_archive()?;

        assert!(matches!(
            ggpk.decode_record_at(root_rec)?,
            Record::Root(RootRecord { version: 3, .. })
        ));
        match ggpk.decode_record_at(file)? {
            Record::File(record) => {
                assert_eq!(record.name, "a.txt");
                assert_eq!(record.payload_len, 5);
                assert_eq!(record.payload_offset, file + 44 + 12);
            }
            other => panic!("expected a file record, got {other:?}"),
        }
        assert!(matches!(
            ggpk.decode_record_at(free)?,
            Record::Free(FreeRecord { next_free: 0, .. })
        ));
        match ggpk.decode_record_at(top)? {
            Record::Directory(record) => {
                assert_eq!(record.name, "");
                assert_eq!(record.entries.len(), 1);
                assert_eq!(record.entries[0].offset, file);
            }
            other => panic!("expected a directory record, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn test_read_bytes_at_is_bounds_checked() -> Result<()> {
        let mut ggpk = minimal_container().into_archive()?;
        let len = ggpk.container_len();

        let bytes = ggpk.read_bytes_at(0, 4)?;
        assert_eq!(bytes, 28u32.to_le_bytes());

        let err = ggpk.read_bytes_at(len - 2, 4).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        let err = ggpk.read_bytes_at(u64::MAX, 1).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        Ok(())
    }

    #[test]
    fn test_digest_helpers() {
        assert_eq!(hex(&[0x00, 0xAB, 0x10]), "00ab10");
    }
}
