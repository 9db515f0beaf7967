//! Types for writing and mutating GGPK containers
//!

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;

use bon::Builder;
use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::{instrument, Level};

use crate::error::{Error, Result};
use crate::read::{GgpkArchive, Record};
use crate::tree::{self, join_path, DirectoryNode, FileNode, Node};
use crate::types::{
    encode_name, entry_name_hash, name_digest, name_units, unit_width, DIR_ENTRY_LEN,
    DIR_META_LEN, FILE_META_LEN, RECORD_HEADER_LEN, ROOT_RECORD_LEN,
};

/// Options for how the container should be written
#[derive(Debug, Clone, Copy, Builder)]
pub struct GgpkWriterOptions {
    /// Format version stamped into the root record. Version 4 containers
    /// encode names as UTF-32LE, everything else as UTF-16LE.
    #[builder(default = 3)]
    pub version: u32,
}

#[derive(Debug)]
enum SkelNode {
    Dir(SkelDir),
    File(u64),
}

/// Directory layout collected while files are streamed in. Children keep
/// their insertion order, which becomes the on-disk entry order.
#[derive(Debug, Default)]
struct SkelDir {
    children: IndexMap<String, SkelNode>,
}

struct PendingFile {
    record_offset: u64,
    meta_len: u64,
    hasher: Sha256,
    written: u64,
}

/// GGPK container generator
///
/// File records are streamed straight to the output. Directory records and
/// the root record are written by [`GgpkWriter::finish`], once every offset
/// is known.
///
/// ```
/// # fn doit() -> poe_ggpk::error::Result<()>
/// # {
/// # use poe_ggpk::GgpkWriter;
/// use std::io::Write;
/// use poe_ggpk::write::GgpkWriterOptions;
///
/// // We use a buffer here, though you'd normally use a `File`
/// let mut buf = [0; 65536];
/// let mut ggpk = GgpkWriter::new(std::io::Cursor::new(&mut buf[..]), GgpkWriterOptions::builder()
///            .version(3)
///            .build());
///
/// ggpk.start_file("data/hello_world.txt")?;
/// ggpk.write(b"Hello, World!")?;
///
/// // Apply the changes you've made.
/// ggpk.finish()?;
///
/// # Ok(())
/// # }
/// # doit().unwrap();
/// ```
pub struct GgpkWriter<W: Write + Seek> {
    inner: W,
    version: u32,
    cursor: u64,
    skeleton: SkelDir,
    current_file: Option<PendingFile>,
}

impl<W: Write + Seek> GgpkWriter<W> {
    /// Initializes the container.
    ///
    /// The first [`ROOT_RECORD_LEN`] bytes are reserved for the root record,
    /// which is written last. Before writing to this object, the
    /// [`GgpkWriter::start_file`] function should be called.
    pub fn new(inner: W, options: GgpkWriterOptions) -> GgpkWriter<W> {
        GgpkWriter {
            inner,
            version: options.version,
            cursor: ROOT_RECORD_LEN as u64,
            skeleton: SkelDir::default(),
            current_file: None,
        }
    }

    /// Returns true if a file is currently open for writing.
    pub const fn is_writing_file(&self) -> bool {
        self.current_file.is_some()
    }

    /// Start a new file at the `/` separated `path`.
    ///
    /// Missing parent directories are created. Any file still open is
    /// finished first.
    #[instrument(skip(self), err)]
    pub fn start_file(&mut self, path: &str) -> Result<()> {
        if self.is_writing_file() {
            self.finish_file()?;
        }

        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let name = segments
            .pop()
            .ok_or_else(|| Error::CustomError("file path is empty".to_string()))?;

        let record_offset = self.cursor;
        {
            let dir = skel_dir_mut(&mut self.skeleton, &segments, path)?;
            if dir.children.contains_key(name) {
                return Err(Error::DuplicateEntry {
                    path: path.to_owned(),
                });
            }
            dir.children
                .insert(name.to_owned(), SkelNode::File(record_offset));
        }

        // record length and digest are patched when the file is finished
        let encoded = encode_name(name, self.version);
        let meta_len = FILE_META_LEN + encoded.len() as u64;
        self.inner.seek(SeekFrom::Start(record_offset))?;
        self.inner.write_u32::<LittleEndian>(meta_len as u32)?;
        self.inner.write_all(b"FILE")?;
        self.inner
            .write_u32::<LittleEndian>(name_units(name, self.version) as u32)?;
        self.inner.write_all(&[0u8; 32])?;
        self.inner.write_all(&encoded)?;
        self.cursor += meta_len;

        self.current_file = Some(PendingFile {
            record_offset,
            meta_len,
            hasher: Sha256::new(),
            written: 0,
        });

        Ok(())
    }

    /// Add an empty directory and any missing parents.
    ///
    /// Directories holding files appear on their own, this is only needed
    /// for directories that would otherwise stay empty.
    #[instrument(skip(self), err)]
    pub fn add_directory(&mut self, path: &str) -> Result<()> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        skel_dir_mut(&mut self.skeleton, &segments, path)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn finish_file(&mut self) -> Result<()> {
        let pending = self
            .current_file
            .take()
            .expect("a file should be open when finishing one");

        let total = record_length(pending.meta_len + pending.written)?;
        let digest: [u8; 32] = pending.hasher.finalize().into();

        self.inner.seek(SeekFrom::Start(pending.record_offset))?;
        self.inner.write_u32::<LittleEndian>(total)?;
        self.inner
            .seek(SeekFrom::Start(pending.record_offset + 12))?;
        self.inner.write_all(&digest)?;
        self.inner.seek(SeekFrom::Start(self.cursor))?;

        Ok(())
    }

    /// Finish the last file, then write all directory records and the root
    /// record
    ///
    /// This will return the writer, but one should normally not append any data to the end of the file.
    #[instrument(skip(self), err)]
    pub fn finish(mut self) -> Result<W> {
        if self.is_writing_file() {
            self.finish_file()?;
        }

        let skeleton = mem::take(&mut self.skeleton);
        self.inner.seek(SeekFrom::Start(self.cursor))?;
        let top_offset = self.write_directory("", skeleton)?;

        let root = encode_root_record(self.version, &[top_offset, 0])?;
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(&root)?;

        Ok(self.inner)
    }

    /// Write the directory records below `dir`, contents before parents so
    /// every entry offset is known, and return the offset of `dir`'s record.
    fn write_directory(&mut self, name: &str, dir: SkelDir) -> Result<u64> {
        let mut entries = Vec::with_capacity(dir.children.len());
        for (child_name, child) in dir.children {
            let offset = match child {
                SkelNode::File(offset) => offset,
                SkelNode::Dir(sub) => self.write_directory(&child_name, sub)?,
            };
            entries.push((entry_name_hash(&child_name), offset));
        }

        let offset = self.cursor;
        let record = encode_dir_record(name, &entries, self.version)?;
        self.inner.write_all(&record)?;
        self.cursor += record.len() as u64;
        Ok(offset)
    }
}

impl<W: Write + Seek> Write for GgpkWriter<W> {
    #[instrument(skip_all, err, ret(level = Level::TRACE), fields(size=buf.len()) )]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_writing_file() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "No file has been started",
            ));
        }
        let written = self.inner.write(buf)?;
        let pending = self
            .current_file
            .as_mut()
            .expect("current file should be initialized by the time we write");
        pending.hasher.update(&buf[..written]);
        pending.written += written as u64;
        self.cursor += written as u64;
        Ok(written)
    }

    #[instrument(skip(self), err)]
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Descend into `segments`, creating missing directories on the way
fn skel_dir_mut<'a>(
    dir: &'a mut SkelDir,
    segments: &[&str],
    full_path: &str,
) -> Result<&'a mut SkelDir> {
    match segments.split_first() {
        None => Ok(dir),
        Some((segment, rest)) => {
            let child = dir
                .children
                .entry((*segment).to_string())
                .or_insert_with(|| SkelNode::Dir(SkelDir::default()));
            match child {
                SkelNode::Dir(sub) => skel_dir_mut(sub, rest, full_path),
                SkelNode::File(_) => Err(Error::NotADirectory {
                    path: full_path.to_owned(),
                }),
            }
        }
    }
}

/// Checked conversion into the u32 length field every record starts with
fn record_length(total: u64) -> Result<u32> {
    u32::try_from(total).map_err(|_| {
        Error::CustomError(format!(
            "record is too large for the length field ({total} bytes)"
        ))
    })
}

fn encode_root_record(version: u32, offsets: &[u64]) -> Result<Vec<u8>> {
    let length = record_length(12 + offsets.len() as u64 * 8)?;
    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.extend_from_slice(b"GGPK");
    bytes.extend_from_slice(&version.to_le_bytes());
    for offset in offsets {
        bytes.extend_from_slice(&offset.to_le_bytes());
    }
    Ok(bytes)
}

fn encode_dir_record(name: &str, entries: &[(u32, u64)], version: u32) -> Result<Vec<u8>> {
    let encoded = encode_name(name, version);
    let length = record_length(
        DIR_META_LEN + encoded.len() as u64 + entries.len() as u64 * DIR_ENTRY_LEN,
    )?;
    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.extend_from_slice(b"PDIR");
    bytes.extend_from_slice(&(name_units(name, version) as u32).to_le_bytes());
    bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&name_digest(name, version));
    bytes.extend_from_slice(&encoded);
    for (hash, offset) in entries {
        bytes.extend_from_slice(&hash.to_le_bytes());
        bytes.extend_from_slice(&offset.to_le_bytes());
    }
    Ok(bytes)
}

fn encode_file_record(
    name: &str,
    digest: &[u8; 32],
    payload: &[u8],
    version: u32,
) -> Result<Vec<u8>> {
    let encoded = encode_name(name, version);
    let length = record_length(FILE_META_LEN + encoded.len() as u64 + payload.len() as u64)?;
    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.extend_from_slice(b"FILE");
    bytes.extend_from_slice(&(name_units(name, version) as u32).to_le_bytes());
    bytes.extend_from_slice(digest);
    bytes.extend_from_slice(&encoded);
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

fn write_free_header<W: Write + Seek>(writer: &mut W, offset: u64, size: u64) -> Result<()> {
    let length = record_length(size)?;
    writer.seek(SeekFrom::Start(offset))?;
    writer.write_u32::<LittleEndian>(length)?;
    writer.write_all(b"FREE")?;
    // chain position is patched when the whole chain is rewritten
    writer.write_u64::<LittleEndian>(0)?;
    Ok(())
}

fn split_parent(path: &str) -> Option<(String, &str)> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let name = segments.pop()?;
    Some((segments.join("/"), name))
}

/// In-place mutations.
///
/// Every operation leaves the container tiled by valid records: replaced
/// and removed records become `FREE` records, new records reuse free blocks
/// first-fit and only grow the container when nothing fits. The free chain
/// and the root record are patched before the call returns.
impl<R: Read + Write + Seek> GgpkArchive<R> {
    /// Insert a new file at the `/` separated `path`.
    ///
    /// Missing parent directories are created.
    #[instrument(skip(self, payload), fields(size = payload.len()), err)]
    pub fn insert_file(&mut self, path: &str, payload: &[u8]) -> Result<()> {
        let (parent_path, name) = split_parent(path)
            .ok_or_else(|| Error::CustomError("file path is empty".to_string()))?;
        self.ensure_dir(&parent_path)?;
        {
            let dir = tree::resolve_dir(&self.root, &parent_path)?;
            if dir.children.contains_key(name) {
                return Err(Error::DuplicateEntry {
                    path: path.to_owned(),
                });
            }
        }

        let digest: [u8; 32] = Sha256::digest(payload).into();
        let record = encode_file_record(name, &digest, payload, self.version)?;
        let offset = self.place_record(&record)?;
        let meta = record.len() as u64 - payload.len() as u64;

        let node = FileNode {
            name: name.into(),
            offset,
            length: record.len() as u32,
            digest,
            payload_offset: offset + meta,
            payload_len: payload.len() as u64,
        };
        self.attach_child(&parent_path, name, Node::File(node))?;

        self.rewrite_free_chain()?;
        self.verified.clear();
        Ok(())
    }

    /// Replace the payload of the file at `path`.
    ///
    /// When the new record is exactly as long as the old one it is patched
    /// in place. Otherwise the new record is placed elsewhere, the parent
    /// entry repointed and the old record freed.
    #[instrument(skip(self, payload), fields(size = payload.len()), err)]
    pub fn replace_file(&mut self, path: &str, payload: &[u8]) -> Result<()> {
        let (parent_path, name) = split_parent(path)
            .ok_or_else(|| Error::CustomError("file path is empty".to_string()))?;
        let (old_offset, old_length) = {
            let file = self.resolve_file(path)?;
            (file.offset, file.length)
        };

        let digest: [u8; 32] = Sha256::digest(payload).into();
        let record = encode_file_record(name, &digest, payload, self.version)?;
        let meta = record.len() as u64 - payload.len() as u64;

        let offset = if record.len() as u64 == old_length as u64 {
            self.reader.seek(SeekFrom::Start(old_offset))?;
            self.reader.write_all(&record)?;
            old_offset
        } else {
            let offset = self.place_record(&record)?;
            let parent_offset = tree::resolve_dir(&self.root, &parent_path)?.offset;
            self.patch_entry_offset(parent_offset, old_offset, offset)?;
            self.release_record(old_offset, old_length as u64)?;
            offset
        };

        {
            let dir = tree::resolve_dir_mut(&mut self.root, &parent_path)?;
            match dir.children.get_mut(name) {
                Some(Node::File(file)) => {
                    file.offset = offset;
                    file.length = record.len() as u32;
                    file.digest = digest;
                    file.payload_offset = offset + meta;
                    file.payload_len = payload.len() as u64;
                }
                _ => unreachable!("the path resolved to a file above"),
            }
        }

        self.rewrite_free_chain()?;
        self.verified.clear();
        Ok(())
    }

    /// Remove the file or directory subtree at `path`.
    ///
    /// Every record below `path` becomes free space.
    #[instrument(skip(self), err)]
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (parent_path, name) = split_parent(path).ok_or_else(|| {
            Error::CustomError("the top level directory cannot be removed".to_string())
        })?;

        let node = self.detach_child(&parent_path, name)?;
        self.release_subtree(&node)?;

        self.rewrite_free_chain()?;
        self.verified.clear();
        Ok(())
    }

    /// Create the directory at `path` and any missing parents
    #[instrument(skip(self), err)]
    pub fn ensure_dir(&mut self, path: &str) -> Result<()> {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let mut created = false;
        let mut current = String::new();
        for segment in &segments {
            let exists = {
                let dir = tree::resolve_dir(&self.root, &current)?;
                match dir.children.get(segment.as_str()) {
                    Some(Node::Directory(_)) => true,
                    Some(Node::File(_)) => {
                        return Err(Error::NotADirectory {
                            path: join_path(&current, segment),
                        })
                    }
                    None => false,
                }
            };
            if !exists {
                let record = encode_dir_record(segment, &[], self.version)?;
                let offset = self.place_record(&record)?;
                let node = DirectoryNode {
                    name: segment.as_str().into(),
                    offset,
                    length: record.len() as u32,
                    digest: name_digest(segment, self.version),
                    children: IndexMap::new(),
                };
                self.attach_child(&current, segment, Node::Directory(node))?;
                created = true;
            }
            current = join_path(&current, segment);
        }

        if created {
            self.rewrite_free_chain()?;
            self.verified.clear();
        }
        Ok(())
    }

    /// Write `bytes` as one record, into free space when a block fits and
    /// appended at the end otherwise
    fn place_record(&mut self, bytes: &[u8]) -> Result<u64> {
        let len = bytes.len() as u64;
        if let Some(offset) = self.free.allocate(len) {
            self.reader.seek(SeekFrom::Start(offset))?;
            self.reader.write_all(bytes)?;
            // a split leaves the remainder indexed right behind the record
            if let Some(tail) = self.free.get(offset + len) {
                write_free_header(&mut self.reader, offset + len, tail)?;
            }
            Ok(offset)
        } else {
            let offset = self.container_len;
            self.reader.seek(SeekFrom::Start(offset))?;
            self.reader.write_all(bytes)?;
            self.container_len += len;
            Ok(offset)
        }
    }

    /// Turn the record at `offset` into free space and write the covering
    /// free record header
    fn release_record(&mut self, offset: u64, size: u64) -> Result<()> {
        let (start, len) = self.free.release(offset, size);
        write_free_header(&mut self.reader, start, len)
    }

    fn release_subtree(&mut self, node: &Node) -> Result<()> {
        let mut extents = Vec::new();
        collect_extents(node, &mut extents);
        for (offset, size) in extents {
            self.release_record(offset, size)?;
        }
        Ok(())
    }

    /// Append `node` to the children of the directory at `parent_path`,
    /// on disk and in the tree
    fn attach_child(&mut self, parent_path: &str, name: &str, node: Node) -> Result<()> {
        let mut entries: Vec<(u32, u64)> = {
            let dir = tree::resolve_dir(&self.root, parent_path)?;
            dir.children
                .iter()
                .map(|(child, n)| (entry_name_hash(child), n.record_offset()))
                .collect()
        };
        entries.push((entry_name_hash(name), node.record_offset()));

        self.relocate_parent(parent_path, &entries)?;

        let dir = tree::resolve_dir_mut(&mut self.root, parent_path)?;
        dir.children.insert(name.into(), node);
        Ok(())
    }

    /// Take `name` out of the children of the directory at `parent_path`,
    /// on disk and in the tree, and return the detached node
    fn detach_child(&mut self, parent_path: &str, name: &str) -> Result<Node> {
        let entries: Vec<(u32, u64)> = {
            let dir = tree::resolve_dir(&self.root, parent_path)?;
            if !dir.children.contains_key(name) {
                return Err(Error::NotFound {
                    path: join_path(parent_path, name),
                });
            }
            dir.children
                .iter()
                .filter(|(child, _)| child.as_ref() != name)
                .map(|(child, n)| (entry_name_hash(child), n.record_offset()))
                .collect()
        };

        self.relocate_parent(parent_path, &entries)?;

        let dir = tree::resolve_dir_mut(&mut self.root, parent_path)?;
        let node = dir
            .children
            .shift_remove(name)
            .expect("presence was checked before relocating");
        Ok(node)
    }

    /// Write the directory at `parent_path` with a new entry list and
    /// repoint whatever references it.
    ///
    /// Directory records are sized exactly for their entry count, so any
    /// entry change moves the record.
    fn relocate_parent(&mut self, parent_path: &str, entries: &[(u32, u64)]) -> Result<()> {
        let (old_offset, old_length, name) = {
            let dir = tree::resolve_dir(&self.root, parent_path)?;
            (dir.offset, dir.length, dir.name.to_string())
        };

        let record = encode_dir_record(&name, entries, self.version)?;
        let new_offset = self.place_record(&record)?;

        match split_parent(parent_path) {
            None => {
                // the top level directory is referenced from the root record
                let position = self.root_offset + 12 + self.root_dir_slot as u64 * 8;
                self.reader.seek(SeekFrom::Start(position))?;
                self.reader.write_u64::<LittleEndian>(new_offset)?;
            }
            Some((grandparent, _)) => {
                let gp_offset = tree::resolve_dir(&self.root, &grandparent)?.offset;
                self.patch_entry_offset(gp_offset, old_offset, new_offset)?;
            }
        }

        self.release_record(old_offset, old_length as u64)?;

        let dir = tree::resolve_dir_mut(&mut self.root, parent_path)?;
        dir.offset = new_offset;
        dir.length = record.len() as u32;
        Ok(())
    }

    /// Patch the entry pointing at `old_child` inside the directory record
    /// at `dir_offset`. Entries are matched by offset, which is unique.
    fn patch_entry_offset(&mut self, dir_offset: u64, old_child: u64, new_child: u64) -> Result<()> {
        let record = match self.decode_record_at(dir_offset)? {
            Record::Directory(record) => record,
            other => {
                return Err(Error::UnexpectedRecord {
                    offset: dir_offset,
                    expected: "PDIR",
                    found: other.tag_name(),
                })
            }
        };
        let index = record
            .entries
            .iter()
            .position(|entry| entry.offset == old_child)
            .ok_or_else(|| {
                Error::CustomError(format!(
                    "no entry for offset {old_child:#x} in the directory record at {dir_offset:#x}"
                ))
            })?;

        let position = dir_offset
            + DIR_META_LEN
            + name_units(&record.name, self.version) * unit_width(self.version)
            + index as u64 * DIR_ENTRY_LEN
            + 4;
        self.reader.seek(SeekFrom::Start(position))?;
        self.reader.write_u64::<LittleEndian>(new_child)?;
        Ok(())
    }

    /// Rewrite the on-disk free chain to list every free block in offset
    /// order, and point the root record at its head
    fn rewrite_free_chain(&mut self) -> Result<()> {
        let offsets: Vec<u64> = self.free.iter().map(|(offset, _)| offset).collect();
        for (index, &offset) in offsets.iter().enumerate() {
            let next = offsets.get(index + 1).copied().unwrap_or(0);
            self.reader.seek(SeekFrom::Start(offset + RECORD_HEADER_LEN))?;
            self.reader.write_u64::<LittleEndian>(next)?;
        }

        if let Some(slot) = self.free_head_slot {
            let head = offsets.first().copied().unwrap_or(0);
            let position = self.root_offset + 12 + slot as u64 * 8;
            self.reader.seek(SeekFrom::Start(position))?;
            self.reader.write_u64::<LittleEndian>(head)?;
        }
        Ok(())
    }
}

impl<R: Read + Seek> GgpkArchive<R> {
    /// Rewrite the container into `target`, dropping free records, orphans
    /// and skipped regions.
    ///
    /// Every payload is verified on the way out when the archive was opened
    /// with [`crate::Verification::FirstRead`].
    #[instrument(skip(self, target), err)]
    pub fn compact_to<W: Write + Seek>(&mut self, target: W) -> Result<W> {
        let mut writer = GgpkWriter::new(
            target,
            GgpkWriterOptions::builder().version(self.version).build(),
        );

        let mut nodes = Vec::new();
        self.root_dir().walk(&mut |path, node| match node {
            Node::Directory(_) => nodes.push((path.to_owned(), None)),
            Node::File(file) => nodes.push((path.to_owned(), Some(file.clone()))),
        });

        for (path, file) in nodes {
            match file {
                None => writer.add_directory(&path)?,
                Some(node) => {
                    writer.start_file(&path)?;
                    let mut source = self.open_node(&node)?;
                    io::copy(&mut source, &mut writer)?;
                }
            }
        }

        writer.finish()
    }
}

fn collect_extents(node: &Node, extents: &mut Vec<(u64, u64)>) {
    extents.push((node.record_offset(), node.record_len() as u64));
    if let Node::Directory(dir) = node {
        for child in dir.children.values() {
            collect_extents(child, extents);
        }
    }
}
