use miette::Diagnostic;
use thiserror::Error;

/// Error type for this crate
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// Transparent warpper for `std::io::Error`
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// Transparent warpper for `binrw::Error`
    #[error(transparent)]
    BinRWError(#[from] binrw::Error),
    /// Transparent warpper for `std::string::FromUtf16Error`
    #[error(transparent)]
    UTF16Error(#[from] std::string::FromUtf16Error),
    /// A record name field is structurally invalid, e.g. a zero length
    /// count or a code unit that is not a Unicode scalar value
    #[error("record at {offset:#x} has an invalid name field")]
    InvalidName { offset: u64 },
    /// Fewer bytes remain at `offset` than the smallest possible record
    #[error("record at {offset:#x} is truncated")]
    TruncatedRecord { offset: u64 },
    /// A record length field is smaller than the record's own layout
    /// requires, or the record would extend past the end of the container
    #[error("record at {offset:#x} has a corrupt header (length {length})")]
    CorruptHeader { offset: u64, length: u32 },
    /// A raw read was requested outside the container bounds
    #[error("read of {len} bytes at {offset:#x} is outside the container (length {container_len})")]
    OutOfBounds {
        offset: u64,
        len: u64,
        container_len: u64,
    },
    /// The four byte tag at `offset` is not one of the known record tags
    #[error("unknown record type `{}` at {offset:#x}", tag.escape_ascii())]
    UnknownRecordType { offset: u64, tag: [u8; 4] },
    /// A record decoded fine but is not the type required in this position
    #[error("expected a {expected} record at {offset:#x}, found {found}")]
    UnexpectedRecord {
        offset: u64,
        expected: &'static str,
        found: &'static str,
    },
    /// A directory entry points at an offset that holds no directory or
    /// file record
    #[error("directory `{path}` has an entry pointing at {offset:#x} which holds no usable record")]
    DanglingOffset { path: String, offset: u64 },
    /// A directory entry points back at one of its own ancestors
    #[error("directory `{path}` has an entry pointing back at ancestor record {offset:#x}")]
    SelfReferentialDirectory { path: String, offset: u64 },
    /// A seek was requested beyond the end of a file payload
    #[error("seek to {offset} is outside the payload (length {payload_len})")]
    PayloadBoundsExceeded { offset: u64, payload_len: u64 },
    /// A file payload does not hash to the digest stored in its record
    #[error("`{path}` failed integrity verification (expected {expected}, got {actual})")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    /// No entry exists at the requested path
    #[error("no entry at path `{path}`")]
    NotFound { path: String },
    /// A non-terminal path segment resolved to a file
    #[error("`{path}` is not a directory")]
    NotADirectory { path: String },
    /// An entry with this name already exists in the directory
    #[error("an entry already exists at `{path}`")]
    DuplicateEntry { path: String },
    /// The container holds no usable root record
    #[error("container has no usable root record")]
    MissingRoot,
    /// Record extents no longer tile the container without gap or overlap
    #[error("record extents do not partition the container: {reason} at {offset:#x}")]
    BrokenPartition { offset: u64, reason: &'static str },
    /// Custom error with message
    #[error("{0}")]
    CustomError(String),
}

/// Result warpper for this crate
pub type Result<T> = core::result::Result<T, Error>;
