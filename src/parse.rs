//! Functions for parsing byte buffers into their MCAP record contents.
//!
//! Parsers never require exact consumption: trailing bytes added by future
//! format extensions are ignored. Any under-length input fails with
//! [`McapError::RecordTooShort`].

use std::{borrow::Cow, collections::BTreeMap};

use crate::{
    records::{self, OpCode, Record},
    McapError, McapResult,
};

pub fn parse_u16(data: &[u8]) -> McapResult<(u16, &[u8])> {
    if data.len() < 2 {
        return Err(McapError::RecordTooShort);
    }
    let (int_bytes, rest) = data.split_at(2);
    Ok((u16::from_le_bytes([int_bytes[0], int_bytes[1]]), rest))
}

pub fn parse_u32(data: &[u8]) -> McapResult<(u32, &[u8])> {
    if data.len() < 4 {
        return Err(McapError::RecordTooShort);
    }
    let (int_bytes, rest) = data.split_at(4);
    Ok((
        u32::from_le_bytes(int_bytes.try_into().expect("split_at returned 4 bytes")),
        rest,
    ))
}

pub fn parse_u64(data: &[u8]) -> McapResult<(u64, &[u8])> {
    if data.len() < 8 {
        return Err(McapError::RecordTooShort);
    }
    let (int_bytes, rest) = data.split_at(8);
    Ok((
        u64::from_le_bytes(int_bytes.try_into().expect("split_at returned 8 bytes")),
        rest,
    ))
}

fn split_checked(data: &[u8], len: u64) -> McapResult<(&[u8], &[u8])> {
    let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
    if data.len() < len {
        return Err(McapError::RecordTooShort);
    }
    Ok(data.split_at(len))
}

/// Parses a byte array with a `u32` length prefix.
pub fn parse_byte_array(data: &[u8]) -> McapResult<(&[u8], &[u8])> {
    let (len, data) = parse_u32(data)?;
    split_checked(data, len as u64)
}

/// Parses a byte array with a `u64` length prefix (message data, chunk records).
pub fn parse_long_byte_array(data: &[u8]) -> McapResult<(&[u8], &[u8])> {
    let (len, data) = parse_u64(data)?;
    split_checked(data, len)
}

pub fn parse_str(data: &[u8]) -> McapResult<(&str, &[u8])> {
    let (str_bytes, rest) = parse_byte_array(data)?;
    Ok((std::str::from_utf8(str_bytes)?, rest))
}

/// Parses a string map with a `u32` prefix holding the map's total length in
/// **bytes**, not entries.
pub fn parse_str_map(data: &[u8]) -> McapResult<(BTreeMap<String, String>, &[u8])> {
    let (len, data) = parse_u32(data)?;
    let (mut map_data, rest) = split_checked(data, len as u64)?;
    let mut result = BTreeMap::new();
    while !map_data.is_empty() {
        let (key, more) = parse_str(map_data)?;
        let (value, more) = parse_str(more)?;
        map_data = more;
        result.insert(key.into(), value.into());
    }
    Ok((result, rest))
}

/// Parses a `u16 -> u64` map with a `u32` byte-length prefix
/// (message index offsets, channel message counts).
pub fn parse_u16_u64_map(data: &[u8]) -> McapResult<(BTreeMap<u16, u64>, &[u8])> {
    let (len, data) = parse_u32(data)?;
    let (mut map_data, rest) = split_checked(data, len as u64)?;
    let mut result = BTreeMap::new();
    while !map_data.is_empty() {
        let (key, more) = parse_u16(map_data)?;
        let (value, more) = parse_u64(more)?;
        map_data = more;
        result.insert(key, value);
    }
    Ok((result, rest))
}

pub fn parse_header(data: &[u8]) -> McapResult<records::Header> {
    let (profile, data) = parse_str(data)?;
    let (library, _) = parse_str(data)?;
    Ok(records::Header {
        profile: profile.into(),
        library: library.into(),
    })
}

pub fn parse_footer(data: &[u8]) -> McapResult<records::Footer> {
    let (summary_start, data) = parse_u64(data)?;
    let (summary_offset_start, data) = parse_u64(data)?;
    let (summary_crc, _) = parse_u32(data)?;
    Ok(records::Footer {
        summary_start,
        summary_offset_start,
        summary_crc,
    })
}

/// Parses a schema record into its header and a slice borrowing the schema data.
pub fn parse_schema(data: &[u8]) -> McapResult<(records::SchemaHeader, &[u8])> {
    let (id, data) = parse_u16(data)?;
    let (name, data) = parse_str(data)?;
    let (encoding, data) = parse_str(data)?;
    let (schema_data, _) = parse_byte_array(data)?;
    Ok((
        records::SchemaHeader {
            id,
            name: name.into(),
            encoding: encoding.into(),
        },
        schema_data,
    ))
}

pub fn parse_channel(data: &[u8]) -> McapResult<records::Channel> {
    let (id, data) = parse_u16(data)?;
    let (schema_id, data) = parse_u16(data)?;
    let (topic, data) = parse_str(data)?;
    let (message_encoding, data) = parse_str(data)?;
    let (metadata, _) = parse_str_map(data)?;
    Ok(records::Channel {
        id,
        schema_id,
        topic: topic.into(),
        message_encoding: message_encoding.into(),
        metadata,
    })
}

/// Parses a message record, borrowing its payload from the source buffer.
///
/// The message's `data` field is the remainder of the record body; it has no
/// length prefix of its own.
pub fn parse_message(data: &[u8]) -> McapResult<(records::MessageHeader, &[u8])> {
    let (channel_id, data) = parse_u16(data)?;
    let (sequence, data) = parse_u32(data)?;
    let (log_time, data) = parse_u64(data)?;
    let (publish_time, data) = parse_u64(data)?;
    Ok((
        records::MessageHeader {
            channel_id,
            sequence,
            log_time,
            publish_time,
        },
        data,
    ))
}

/// Parses a message record, copying its payload into `data_buf` so the source
/// buffer can be reused. The buffer is cleared first; its capacity is kept.
pub fn parse_message_into(data: &[u8], data_buf: &mut Vec<u8>) -> McapResult<records::MessageHeader> {
    let (header, payload) = parse_message(data)?;
    data_buf.clear();
    data_buf.extend_from_slice(payload);
    Ok(header)
}

/// Parses a chunk record into its header and a slice borrowing the
/// (possibly compressed) `records` field.
pub fn parse_chunk(data: &[u8]) -> McapResult<(records::ChunkHeader, &[u8])> {
    let (message_start_time, data) = parse_u64(data)?;
    let (message_end_time, data) = parse_u64(data)?;
    let (uncompressed_size, data) = parse_u64(data)?;
    let (uncompressed_crc, data) = parse_u32(data)?;
    let (compression, data) = parse_str(data)?;
    let (records, _) = parse_long_byte_array(data)?;
    Ok((
        records::ChunkHeader {
            message_start_time,
            message_end_time,
            uncompressed_size,
            uncompressed_crc,
            compression: compression.into(),
            compressed_size: records.len() as u64,
        },
        records,
    ))
}

pub fn parse_message_index(data: &[u8]) -> McapResult<records::MessageIndex> {
    let (channel_id, data) = parse_u16(data)?;
    let (len, data) = parse_u32(data)?;
    let (mut entries_data, _) = split_checked(data, len as u64)?;
    let mut entries = Vec::with_capacity(entries_data.len() / 16);
    while !entries_data.is_empty() {
        let (log_time, more) = parse_u64(entries_data)?;
        let (offset, more) = parse_u64(more)?;
        entries_data = more;
        entries.push(records::MessageIndexEntry { log_time, offset });
    }
    Ok(records::MessageIndex {
        channel_id,
        records: entries,
    })
}

pub fn parse_chunk_index(data: &[u8]) -> McapResult<records::ChunkIndex> {
    let (message_start_time, data) = parse_u64(data)?;
    let (message_end_time, data) = parse_u64(data)?;
    let (chunk_start_offset, data) = parse_u64(data)?;
    let (chunk_length, data) = parse_u64(data)?;
    let (message_index_offsets, data) = parse_u16_u64_map(data)?;
    let (message_index_length, data) = parse_u64(data)?;
    let (compression, data) = parse_str(data)?;
    let (compressed_size, data) = parse_u64(data)?;
    let (uncompressed_size, _) = parse_u64(data)?;
    Ok(records::ChunkIndex {
        message_start_time,
        message_end_time,
        chunk_start_offset,
        chunk_length,
        message_index_offsets,
        message_index_length,
        compression: compression.into(),
        compressed_size,
        uncompressed_size,
    })
}

/// Parses an attachment record into its header, a slice borrowing the
/// attachment data, and the stored CRC (which covers the body from `log_time`
/// through the end of the data).
pub fn parse_attachment(data: &[u8]) -> McapResult<(records::AttachmentHeader, &[u8], u32)> {
    let (log_time, data) = parse_u64(data)?;
    let (create_time, data) = parse_u64(data)?;
    let (name, data) = parse_str(data)?;
    let (media_type, data) = parse_str(data)?;
    let (attachment_data, data) = parse_long_byte_array(data)?;
    let (crc, _) = parse_u32(data)?;
    Ok((
        records::AttachmentHeader {
            log_time,
            create_time,
            name: name.into(),
            media_type: media_type.into(),
        },
        attachment_data,
        crc,
    ))
}

pub fn parse_attachment_index(data: &[u8]) -> McapResult<records::AttachmentIndex> {
    let (offset, data) = parse_u64(data)?;
    let (length, data) = parse_u64(data)?;
    let (log_time, data) = parse_u64(data)?;
    let (create_time, data) = parse_u64(data)?;
    let (data_size, data) = parse_u64(data)?;
    let (name, data) = parse_str(data)?;
    let (media_type, _) = parse_str(data)?;
    Ok(records::AttachmentIndex {
        offset,
        length,
        log_time,
        create_time,
        data_size,
        name: name.into(),
        media_type: media_type.into(),
    })
}

pub fn parse_statistics(data: &[u8]) -> McapResult<records::Statistics> {
    let (message_count, data) = parse_u64(data)?;
    let (schema_count, data) = parse_u16(data)?;
    let (channel_count, data) = parse_u32(data)?;
    let (attachment_count, data) = parse_u32(data)?;
    let (metadata_count, data) = parse_u32(data)?;
    let (chunk_count, data) = parse_u32(data)?;
    let (message_start_time, data) = parse_u64(data)?;
    let (message_end_time, data) = parse_u64(data)?;
    let (channel_message_counts, _) = parse_u16_u64_map(data)?;
    Ok(records::Statistics {
        message_count,
        schema_count,
        channel_count,
        attachment_count,
        metadata_count,
        chunk_count,
        message_start_time,
        message_end_time,
        channel_message_counts,
    })
}

pub fn parse_metadata(data: &[u8]) -> McapResult<records::Metadata> {
    let (name, data) = parse_str(data)?;
    let (metadata, _) = parse_str_map(data)?;
    Ok(records::Metadata {
        name: name.into(),
        metadata,
    })
}

pub fn parse_metadata_index(data: &[u8]) -> McapResult<records::MetadataIndex> {
    let (offset, data) = parse_u64(data)?;
    let (length, data) = parse_u64(data)?;
    let (name, _) = parse_str(data)?;
    Ok(records::MetadataIndex {
        offset,
        length,
        name: name.into(),
    })
}

pub fn parse_summary_offset(data: &[u8]) -> McapResult<records::SummaryOffset> {
    if data.is_empty() {
        return Err(McapError::RecordTooShort);
    }
    let (opcode_byte, data) = data.split_at(1);
    let (group_start, data) = parse_u64(data)?;
    let (group_length, _) = parse_u64(data)?;
    Ok(records::SummaryOffset {
        group_opcode: opcode_byte[0],
        group_start,
        group_length,
    })
}

pub fn parse_data_end(data: &[u8]) -> McapResult<records::DataEnd> {
    let (data_section_crc, _) = parse_u32(data)?;
    Ok(records::DataEnd { data_section_crc })
}

/// Parses the content of an MCAP record from a buffer, without copying any
/// string or array fields. Use [`Record::into_owned`] for an owned copy.
pub fn parse_record(opcode: OpCode, body: &[u8]) -> McapResult<Record<'_>> {
    Ok(match opcode {
        OpCode::Header => Record::Header(parse_header(body)?),
        OpCode::Footer => Record::Footer(parse_footer(body)?),
        OpCode::Schema => {
            let (header, data) = parse_schema(body)?;
            Record::Schema {
                header,
                data: Cow::Borrowed(data),
            }
        }
        OpCode::Channel => Record::Channel(parse_channel(body)?),
        OpCode::Message => {
            let (header, data) = parse_message(body)?;
            Record::Message {
                header,
                data: Cow::Borrowed(data),
            }
        }
        OpCode::Chunk => {
            let (header, data) = parse_chunk(body)?;
            Record::Chunk {
                header,
                data: Cow::Borrowed(data),
            }
        }
        OpCode::MessageIndex => Record::MessageIndex(parse_message_index(body)?),
        OpCode::ChunkIndex => Record::ChunkIndex(parse_chunk_index(body)?),
        OpCode::Attachment => {
            let (header, data, crc) = parse_attachment(body)?;
            Record::Attachment {
                header,
                data: Cow::Borrowed(data),
                crc,
            }
        }
        OpCode::AttachmentIndex => Record::AttachmentIndex(parse_attachment_index(body)?),
        OpCode::Statistics => Record::Statistics(parse_statistics(body)?),
        OpCode::Metadata => Record::Metadata(parse_metadata(body)?),
        OpCode::MetadataIndex => Record::MetadataIndex(parse_metadata_index(body)?),
        OpCode::SummaryOffset => Record::SummaryOffset(parse_summary_offset(body)?),
        OpCode::DataEnd => Record::DataEnd(parse_data_end(body)?),
        OpCode::UserOpcode(opcode) => Record::Unknown {
            opcode,
            data: Cow::Borrowed(body),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings() {
        let (s, rest) = parse_str(b"\x04\0\0\0abcd!").unwrap();
        assert_eq!(s, "abcd");
        assert_eq!(rest, b"!");

        assert!(matches!(
            parse_str(b"\x05\0\0\0abcd"),
            Err(McapError::RecordTooShort)
        ));
        assert!(matches!(
            parse_str(b"\x04\0\0\0\xff\xfe\x00\x01"),
            Err(McapError::StringEncoding(_))
        ));
    }

    #[test]
    fn headers() {
        let h = parse_header(b"\x04\0\0\0abcd\x03\0\0\x00123").unwrap();
        assert_eq!(h.profile, "abcd");
        assert_eq!(h.library, "123");
    }

    #[test]
    fn str_maps() {
        // 22 bytes of map: ("foo" -> "bar"), with a trailing byte ignored.
        let buf = b"\x16\0\0\0\x03\0\0\0foo\x03\0\0\0bar\xff";
        let (map, rest) = parse_str_map(buf).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["foo"], "bar");
        assert_eq!(rest, b"\xff");

        // Embedded length runs past the buffer.
        assert!(matches!(
            parse_str_map(b"\x17\0\0\0\x03\0\0\0foo\x03\0\0\0bar"),
            Err(McapError::RecordTooShort)
        ));
    }

    #[test]
    fn messages_both_modes() {
        let body = b"\x2a\0\x07\0\0\0\x64\0\0\0\0\0\0\0\x65\0\0\0\0\0\0\0\x01\x02\x03";
        let (header, data) = parse_message(body).unwrap();
        assert_eq!(header.channel_id, 42);
        assert_eq!(header.sequence, 7);
        assert_eq!(header.log_time, 100);
        assert_eq!(header.publish_time, 101);
        assert_eq!(data, &[1, 2, 3]);

        let mut buf = Vec::new();
        let header2 = parse_message_into(body, &mut buf).unwrap();
        assert_eq!(header, header2);
        assert_eq!(buf, vec![1, 2, 3]);

        // A body shorter than the fixed header fields is an underflow.
        assert!(matches!(
            parse_message(&body[..20]),
            Err(McapError::RecordTooShort)
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut body = b"\x0a\0\0\0\0\0\0\0\x0b\0\0\0\0\0\0\0\x0c\0\0\0".to_vec();
        body.extend_from_slice(b"future extension");
        let footer = parse_footer(&body).unwrap();
        assert_eq!(footer.summary_start, 10);
        assert_eq!(footer.summary_offset_start, 11);
        assert_eq!(footer.summary_crc, 12);
    }
}
