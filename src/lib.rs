#![doc = include_str!("../README.md")]

pub mod compression;
pub mod io_utils;
pub mod lexer;
pub mod parse;
pub mod read;
pub mod records;
pub mod write;

mod chunk;
mod indexed;

use std::{borrow::Cow, collections::BTreeMap, fmt, sync::Arc};

use records::OpCode;

/// Magic bytes that delimit an MCAP file on both ends.
pub const MAGIC: &[u8] = &[0x89, b'M', b'C', b'A', b'P', 0x30, b'\r', b'\n'];

/// Compression options for chunks of channels, schemas, and messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compression {
    #[cfg(feature = "zstd")]
    Zstd,
    #[cfg(feature = "lz4")]
    Lz4,
}

/// A hint mapped onto the selected codec's own level scale.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    Fastest,
    #[default]
    Default,
    Better,
    Best,
}

/// Whether magic bytes failed to validate at the start or the end of the file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MagicLocation {
    Start,
    End,
}

impl fmt::Display for MagicLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MagicLocation::Start => write!(f, "start"),
            MagicLocation::End => write!(f, "end"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum McapError {
    #[error("expected magic bytes at {location} of file, got {observed:?}")]
    BadMagic {
        location: MagicLocation,
        observed: Vec<u8>,
    },
    #[error("{opcode:?} record declared {expected} bytes, but only {actual} remain")]
    TruncatedRecord {
        opcode: OpCode,
        expected: u64,
        actual: u64,
    },
    #[error("record body ended unexpectedly before the end of a field")]
    RecordTooShort,
    #[error("expected a {expected} record, got {found:?}")]
    UnexpectedToken {
        expected: &'static str,
        found: OpCode,
    },
    #[error("chunks cannot contain chunks")]
    NestedChunk,
    #[error("{opcode:?} record of {len} bytes exceeds the limit of {limit}")]
    RecordTooLarge {
        opcode: OpCode,
        len: u64,
        limit: u64,
    },
    #[error("chunk of {len} uncompressed bytes exceeds the limit of {limit}")]
    ChunkTooLarge { len: u64, limit: u64 },
    #[error("opcode 0x00 is reserved and invalid")]
    InvalidOpcode,
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),
    #[error("chunk CRC failed (expected {saved:08x}, calculated {calculated:08x})")]
    BadChunkCrc { saved: u32, calculated: u32 },
    #[error("attachment CRC failed (expected {saved:08x}, calculated {calculated:08x})")]
    BadAttachmentCrc { saved: u32, calculated: u32 },
    #[error("schema ID 0 is reserved for \"no schema\"")]
    InvalidSchemaId,
    #[error("channel `{0}` referenced schema {1}, which was not written earlier")]
    UnknownSchema(String, u16),
    #[error("message {0} referenced channel {1}, which was not written earlier")]
    UnknownChannel(u32, u16),
    #[error("schema `{0}` was written several times with different content")]
    ConflictingSchemas(String),
    #[error("channel `{0}` was written several times with different content")]
    ConflictingChannels(String),
    #[error("attachment data overflowed the declared size of {attachment_length} by {excess} bytes")]
    AttachmentTooLarge {
        excess: u64,
        attachment_length: u64,
    },
    #[error("attachment was declared as {expected} bytes, but {current} were streamed")]
    AttachmentIncomplete { expected: u64, current: u64 },
    #[error("no attachment is currently being written")]
    AttachmentNotInProgress,
    #[error("an attachment is currently being written")]
    AttachmentInProgress,
    #[error("length of {0} bytes is too large for this architecture")]
    TooLong(u64),
    #[error("an index or offset pointed outside the file, or at the wrong record")]
    BadIndex,
    #[error("file footer could not be parsed")]
    BadFooter,
    #[error("file has no summary section to index into")]
    NoIndexAvailable,
    #[error("log-time orders require indexed reading; unindexed reads are file-order only")]
    OrderRequiresIndex,
    #[error("all schema IDs are in use")]
    TooManySchemas,
    #[error("all channel IDs are in use")]
    TooManyChannels,
    #[error("file ended in the middle of a record")]
    UnexpectedEof,
    #[error("chunk ended in the middle of a record")]
    UnexpectedEoc,
    #[error("a chunk was both expanded and re-queued; its messages would duplicate")]
    RepushedChunk,
    #[error("decompression failed: {0}")]
    DecompressionError(String),
    #[error("string field was not valid UTF-8: {0}")]
    StringEncoding(#[from] std::str::Utf8Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type McapResult<T> = Result<T, McapError>;

/// Describes a schema used by one or more [Channel]s in an MCAP file.
///
/// The `data` holds the schema text or binary in the given `encoding`;
/// it is never interpreted by this library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema<'a> {
    pub id: u16,
    pub name: String,
    pub encoding: String,
    pub data: Cow<'a, [u8]>,
}

/// Describes a channel which [Message]s are published to in an MCAP file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel<'a> {
    pub id: u16,
    pub topic: String,
    pub schema: Option<Arc<Schema<'a>>>,
    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

/// An event in an MCAP file, published to a [Channel].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<'a> {
    pub channel: Arc<Channel<'a>>,
    pub sequence: u32,
    /// Time the message was received, in nanoseconds.
    /// Not required to be monotonic per-channel.
    pub log_time: u64,
    /// Time the message was published, in nanoseconds.
    pub publish_time: u64,
    pub data: Cow<'a, [u8]>,
}

/// An attachment and its metadata in an MCAP file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment<'a> {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
    pub data: Cow<'a, [u8]>,
}

pub use compression::{ChunkCompressor, Decompressor};
pub use lexer::{Lexer, LexerOptions};
pub use read::{
    read_attachment, read_footer, read_metadata, LinearMessageIter, MessageIter, Options,
    ReadOptions, ReadOrder, RecordIterator, Summary,
};
pub use write::{WriteOptions, Writer};
