use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::warn;

use crate::error::{Error, Result};
use crate::read::{DirectoryRecord, FileRecord, Record};

/// One entry of the reconstructed directory tree
#[derive(Debug, Clone)]
pub enum Node {
    Directory(DirectoryNode),
    File(FileNode),
}

impl Node {
    /// Name of the entry inside its parent directory
    pub fn name(&self) -> &str {
        match self {
            Node::Directory(dir) => &dir.name,
            Node::File(file) => &file.name,
        }
    }

    /// Offset of the record backing this entry
    pub fn record_offset(&self) -> u64 {
        match self {
            Node::Directory(dir) => dir.offset,
            Node::File(file) => file.offset,
        }
    }

    /// Total length of the record backing this entry
    pub fn record_len(&self) -> u32 {
        match self {
            Node::Directory(dir) => dir.length,
            Node::File(file) => file.length,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            Node::Directory(dir) => Some(dir),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::Directory(_) => None,
            Node::File(file) => Some(file),
        }
    }
}

/// A directory and its children, in on-disk entry order
#[derive(Debug, Clone)]
pub struct DirectoryNode {
    pub(crate) name: Box<str>,
    pub(crate) offset: u64,
    pub(crate) length: u32,
    pub(crate) digest: [u8; 32],
    pub(crate) children: IndexMap<Box<str>, Node>,
}

impl DirectoryNode {
    /// Directory name, empty for the top level directory
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset of the backing directory record
    pub fn record_offset(&self) -> u64 {
        self.offset
    }

    /// Total length of the backing directory record
    pub fn record_len(&self) -> u32 {
        self.length
    }

    /// SHA-256 of the encoded directory name, as stored in the record
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Look up a direct child by name. Matching is by exact decoded text.
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    /// Direct children in on-disk entry order
    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.values()
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Visit every node below this directory in on-disk order, parents
    /// before their contents. The callback receives the path relative to
    /// this directory.
    pub fn walk(&self, f: &mut impl FnMut(&str, &Node)) {
        fn inner(dir: &DirectoryNode, prefix: &str, f: &mut impl FnMut(&str, &Node)) {
            for (name, node) in &dir.children {
                let path = join_path(prefix, name);
                f(&path, node);
                if let Node::Directory(child) = node {
                    inner(child, &path, f);
                }
            }
        }
        inner(self, "", f);
    }
}

/// A file entry of the reconstructed directory tree
#[derive(Debug, Clone)]
pub struct FileNode {
    pub(crate) name: Box<str>,
    pub(crate) offset: u64,
    pub(crate) length: u32,
    pub(crate) digest: [u8; 32],
    pub(crate) payload_offset: u64,
    pub(crate) payload_len: u64,
}

impl FileNode {
    /// File name inside its parent directory
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset of the backing file record
    pub fn record_offset(&self) -> u64 {
        self.offset
    }

    /// Total length of the backing file record
    pub fn record_len(&self) -> u32 {
        self.length
    }

    /// SHA-256 of the file payload, as stored in the record
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Offset of the first payload byte
    pub fn payload_offset(&self) -> u64 {
        self.payload_offset
    }

    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        self.payload_len
    }
}

impl From<FileRecord> for FileNode {
    fn from(record: FileRecord) -> Self {
        FileNode {
            name: record.name.into(),
            offset: record.offset,
            length: record.length,
            digest: record.digest,
            payload_offset: record.payload_offset,
            payload_len: record.payload_len,
        }
    }
}

/// A subtree that could not be resolved while building the tree.
///
/// `path` is the nearest directory that could still be resolved, `offset`
/// the record the broken entry points at. The rest of the tree is
/// unaffected by a fault.
#[derive(Debug)]
pub struct Fault {
    pub path: String,
    pub offset: u64,
    pub error: Error,
}

#[derive(Debug)]
pub(crate) struct TreeBuild {
    pub root: DirectoryNode,
    pub faults: Vec<Fault>,
    pub leftover: BTreeMap<u64, Record>,
}

/// Reconstruct the directory tree from the scanned records, consuming the
/// map. Records still in the map afterwards are unreachable from the root.
pub(crate) fn build_tree(
    mut records: BTreeMap<u64, Record>,
    top_offset: u64,
) -> Result<TreeBuild> {
    let top = match records.remove(&top_offset) {
        Some(Record::Directory(dir)) => dir,
        Some(other) => {
            return Err(Error::UnexpectedRecord {
                offset: top_offset,
                expected: "PDIR",
                found: other.tag_name(),
            })
        }
        None => return Err(Error::MissingRoot),
    };

    let mut faults = Vec::new();
    let mut ancestors = Vec::new();
    let root = build_directory(top, &mut records, "", &mut ancestors, &mut faults);

    Ok(TreeBuild {
        root,
        faults,
        leftover: records,
    })
}

fn build_directory(
    record: DirectoryRecord,
    records: &mut BTreeMap<u64, Record>,
    path: &str,
    ancestors: &mut Vec<u64>,
    faults: &mut Vec<Fault>,
) -> DirectoryNode {
    ancestors.push(record.offset);

    let mut children: IndexMap<Box<str>, Node> = IndexMap::with_capacity(record.entries.len());
    for entry in &record.entries {
        if ancestors.contains(&entry.offset) {
            warn!(
                "directory `{}` points back at ancestor record {:#x}",
                path, entry.offset
            );
            faults.push(Fault {
                path: path.to_owned(),
                offset: entry.offset,
                error: Error::SelfReferentialDirectory {
                    path: path.to_owned(),
                    offset: entry.offset,
                },
            });
            continue;
        }

        let node = match records.remove(&entry.offset) {
            Some(Record::Directory(dir)) => {
                let child_path = join_path(path, &dir.name);
                Node::Directory(build_directory(dir, records, &child_path, ancestors, faults))
            }
            Some(Record::File(file)) => Node::File(FileNode::from(file)),
            Some(other) => {
                let error = Error::UnexpectedRecord {
                    offset: entry.offset,
                    expected: "PDIR or FILE",
                    found: other.tag_name(),
                };
                // keep the record so its extent stays accounted for
                records.insert(entry.offset, other);
                warn!("directory `{}`: {}", path, error);
                faults.push(Fault {
                    path: path.to_owned(),
                    offset: entry.offset,
                    error,
                });
                continue;
            }
            None => {
                warn!(
                    "directory `{}` points at {:#x} which holds no usable record",
                    path, entry.offset
                );
                faults.push(Fault {
                    path: path.to_owned(),
                    offset: entry.offset,
                    error: Error::DanglingOffset {
                        path: path.to_owned(),
                        offset: entry.offset,
                    },
                });
                continue;
            }
        };

        let name: Box<str> = node.name().into();
        if let Some(previous) = children.insert(name, node) {
            faults.push(Fault {
                path: path.to_owned(),
                offset: previous.record_offset(),
                error: Error::DuplicateEntry {
                    path: join_path(path, previous.name()),
                },
            });
        }
    }

    ancestors.pop();

    DirectoryNode {
        name: record.name.into(),
        offset: record.offset,
        length: record.length,
        digest: record.digest,
        children,
    }
}

/// Walk `path` down from the root. Empty segments are skipped, so leading,
/// trailing and doubled slashes are all tolerated.
pub(crate) fn resolve<'t>(root: &'t Node, path: &str) -> Result<&'t Node> {
    let mut current = root;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let dir = match current {
            Node::Directory(dir) => dir,
            Node::File(_) => {
                return Err(Error::NotADirectory {
                    path: path.to_owned(),
                })
            }
        };
        current = dir.children.get(segment).ok_or_else(|| Error::NotFound {
            path: path.to_owned(),
        })?;
    }
    Ok(current)
}

pub(crate) fn resolve_dir<'t>(root: &'t Node, path: &str) -> Result<&'t DirectoryNode> {
    match resolve(root, path)? {
        Node::Directory(dir) => Ok(dir),
        Node::File(_) => Err(Error::NotADirectory {
            path: path.to_owned(),
        }),
    }
}

pub(crate) fn resolve_dir_mut<'t>(root: &'t mut Node, path: &str) -> Result<&'t mut DirectoryNode> {
    let mut current = root;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        match current {
            Node::Directory(dir) => {
                current = dir.children.get_mut(segment).ok_or_else(|| Error::NotFound {
                    path: path.to_owned(),
                })?;
            }
            Node::File(_) => {
                return Err(Error::NotADirectory {
                    path: path.to_owned(),
                })
            }
        }
    }
    match current {
        Node::Directory(dir) => Ok(dir),
        Node::File(_) => Err(Error::NotADirectory {
            path: path.to_owned(),
        }),
    }
}

pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_owned()
    } else {
        format!("{base}/{name}")
    }
}
