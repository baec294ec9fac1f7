//! Raw records read from and written to an MCAP file.
//!
//! You probably want the higher-level interfaces, like [`Message`](crate::Message),
//! [`Channel`](crate::Channel), and [`Schema`](crate::Schema), read from iterators
//! like [`MessageIter`](crate::MessageIter).

use std::{borrow::Cow, collections::BTreeMap};

use crate::{McapError, McapResult};

/// Opcodes for MCAP file records.
///
/// "Records are identified by a single-byte opcode.
/// Record opcodes in the range 0x01-0x7F are reserved for future MCAP format usage.
/// 0x80-0xFF are reserved for application extensions and user proposals."
pub mod op {
    pub const HEADER: u8 = 0x01;
    pub const FOOTER: u8 = 0x02;
    pub const SCHEMA: u8 = 0x03;
    pub const CHANNEL: u8 = 0x04;
    pub const MESSAGE: u8 = 0x05;
    pub const CHUNK: u8 = 0x06;
    pub const MESSAGE_INDEX: u8 = 0x07;
    pub const CHUNK_INDEX: u8 = 0x08;
    pub const ATTACHMENT: u8 = 0x09;
    pub const ATTACHMENT_INDEX: u8 = 0x0A;
    pub const STATISTICS: u8 = 0x0B;
    pub const METADATA: u8 = 0x0C;
    pub const METADATA_INDEX: u8 = 0x0D;
    pub const SUMMARY_OFFSET: u8 = 0x0E;
    pub const DATA_END: u8 = 0x0F;
}

/// A record's single-byte opcode, as yielded by the [`Lexer`](crate::Lexer).
///
/// Opcode 0x00 is reserved and never produced; converting it fails with
/// [`McapError::InvalidOpcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Header,
    Footer,
    Schema,
    Channel,
    Message,
    Chunk,
    MessageIndex,
    ChunkIndex,
    Attachment,
    AttachmentIndex,
    Statistics,
    Metadata,
    MetadataIndex,
    SummaryOffset,
    DataEnd,
    /// An opcode this version of the library doesn't know about.
    UserOpcode(u8),
}

impl OpCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Header => op::HEADER,
            OpCode::Footer => op::FOOTER,
            OpCode::Schema => op::SCHEMA,
            OpCode::Channel => op::CHANNEL,
            OpCode::Message => op::MESSAGE,
            OpCode::Chunk => op::CHUNK,
            OpCode::MessageIndex => op::MESSAGE_INDEX,
            OpCode::ChunkIndex => op::CHUNK_INDEX,
            OpCode::Attachment => op::ATTACHMENT,
            OpCode::AttachmentIndex => op::ATTACHMENT_INDEX,
            OpCode::Statistics => op::STATISTICS,
            OpCode::Metadata => op::METADATA,
            OpCode::MetadataIndex => op::METADATA_INDEX,
            OpCode::SummaryOffset => op::SUMMARY_OFFSET,
            OpCode::DataEnd => op::DATA_END,
            OpCode::UserOpcode(o) => *o,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = McapError;

    fn try_from(value: u8) -> McapResult<Self> {
        Ok(match value {
            0x00 => return Err(McapError::InvalidOpcode),
            op::HEADER => OpCode::Header,
            op::FOOTER => OpCode::Footer,
            op::SCHEMA => OpCode::Schema,
            op::CHANNEL => OpCode::Channel,
            op::MESSAGE => OpCode::Message,
            op::CHUNK => OpCode::Chunk,
            op::MESSAGE_INDEX => OpCode::MessageIndex,
            op::CHUNK_INDEX => OpCode::ChunkIndex,
            op::ATTACHMENT => OpCode::Attachment,
            op::ATTACHMENT_INDEX => OpCode::AttachmentIndex,
            op::STATISTICS => OpCode::Statistics,
            op::METADATA => OpCode::Metadata,
            op::METADATA_INDEX => OpCode::MetadataIndex,
            op::SUMMARY_OFFSET => OpCode::SummaryOffset,
            op::DATA_END => OpCode::DataEnd,
            other => OpCode::UserOpcode(other),
        })
    }
}

/// A raw record from an MCAP file.
///
/// For records with large slices of binary data (schemas, messages, chunks...),
/// we use a [`Cow`] that can either borrow directly from the source buffer,
/// or hold its own copy if it was decompressed from a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record<'a> {
    Header(Header),
    Footer(Footer),
    Schema {
        header: SchemaHeader,
        data: Cow<'a, [u8]>,
    },
    Channel(Channel),
    Message {
        header: MessageHeader,
        data: Cow<'a, [u8]>,
    },
    Chunk {
        header: ChunkHeader,
        data: Cow<'a, [u8]>,
    },
    MessageIndex(MessageIndex),
    ChunkIndex(ChunkIndex),
    Attachment {
        header: AttachmentHeader,
        data: Cow<'a, [u8]>,
        crc: u32,
    },
    AttachmentIndex(AttachmentIndex),
    Statistics(Statistics),
    Metadata(Metadata),
    MetadataIndex(MetadataIndex),
    SummaryOffset(SummaryOffset),
    DataEnd(DataEnd),
    /// A record of unknown type
    Unknown {
        opcode: u8,
        data: Cow<'a, [u8]>,
    },
}

impl Record<'_> {
    pub fn opcode(&self) -> u8 {
        match &self {
            Record::Header(_) => op::HEADER,
            Record::Footer(_) => op::FOOTER,
            Record::Schema { .. } => op::SCHEMA,
            Record::Channel(_) => op::CHANNEL,
            Record::Message { .. } => op::MESSAGE,
            Record::Chunk { .. } => op::CHUNK,
            Record::MessageIndex(_) => op::MESSAGE_INDEX,
            Record::ChunkIndex(_) => op::CHUNK_INDEX,
            Record::Attachment { .. } => op::ATTACHMENT,
            Record::AttachmentIndex(_) => op::ATTACHMENT_INDEX,
            Record::Statistics(_) => op::STATISTICS,
            Record::Metadata(_) => op::METADATA,
            Record::MetadataIndex(_) => op::METADATA_INDEX,
            Record::SummaryOffset(_) => op::SUMMARY_OFFSET,
            Record::DataEnd(_) => op::DATA_END,
            Record::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Moves this value into a fully-owned variant with no borrows. This should be free for
    /// already-owned values.
    pub fn into_owned(self) -> Record<'static> {
        match self {
            Record::Header(header) => Record::Header(header),
            Record::Footer(footer) => Record::Footer(footer),
            Record::Schema { header, data } => Record::Schema {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::Channel(channel) => Record::Channel(channel),
            Record::Message { header, data } => Record::Message {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::Chunk { header, data } => Record::Chunk {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::MessageIndex(index) => Record::MessageIndex(index),
            Record::ChunkIndex(index) => Record::ChunkIndex(index),
            Record::Attachment { header, data, crc } => Record::Attachment {
                header,
                data: Cow::Owned(data.into_owned()),
                crc,
            },
            Record::AttachmentIndex(index) => Record::AttachmentIndex(index),
            Record::Statistics(statistics) => Record::Statistics(statistics),
            Record::Metadata(metadata) => Record::Metadata(metadata),
            Record::MetadataIndex(index) => Record::MetadataIndex(index),
            Record::SummaryOffset(offset) => Record::SummaryOffset(offset),
            Record::DataEnd(end) => Record::DataEnd(end),
            Record::Unknown { opcode, data } => Record::Unknown {
                opcode,
                data: Cow::Owned(data.into_owned()),
            },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Header {
    pub profile: String,
    pub library: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub summary_start: u64,
    pub summary_offset_start: u64,
    pub summary_crc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaHeader {
    pub id: u16,
    pub name: String,
    pub encoding: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u16,
    pub schema_id: u16,
    pub topic: String,
    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub channel_id: u16,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
}

impl MessageHeader {
    pub(crate) fn serialized_len(&self) -> u64 {
        2 + 4 + 8 + 8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub uncompressed_size: u64,
    /// 0 means the CRC was not computed.
    pub uncompressed_crc: u32,
    pub compression: String,
    pub compressed_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIndexEntry {
    pub log_time: u64,
    /// Offset of the message's record header in the chunk's **uncompressed** stream.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIndex {
    pub channel_id: u16,
    pub records: Vec<MessageIndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub chunk_start_offset: u64,
    /// Length of the entire chunk record, including its opcode and length prefix.
    pub chunk_length: u64,
    pub message_index_offsets: BTreeMap<u16, u64>,
    pub message_index_length: u64,
    pub compression: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentHeader {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentIndex {
    pub offset: u64,
    pub length: u64,
    pub log_time: u64,
    pub create_time: u64,
    pub data_size: u64,
    pub name: String,
    pub media_type: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub message_count: u64,
    pub schema_count: u16,
    pub channel_count: u32,
    pub attachment_count: u32,
    pub metadata_count: u32,
    pub chunk_count: u32,
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub channel_message_counts: BTreeMap<u16, u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataIndex {
    pub offset: u64,
    pub length: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryOffset {
    pub group_opcode: u8,
    pub group_start: u64,
    pub group_length: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DataEnd {
    pub data_section_crc: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_round_trip() {
        for byte in 0x01..=0xffu8 {
            let opcode = OpCode::try_from(byte).unwrap();
            assert_eq!(opcode.as_u8(), byte);
        }
        assert!(matches!(
            OpCode::try_from(0x00),
            Err(McapError::InvalidOpcode)
        ));
        assert_eq!(OpCode::try_from(0x10).unwrap(), OpCode::UserOpcode(0x10));
    }
}
