//! Write MCAP files

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Write},
};

use crate::{
    chunk::ChunkBuilder,
    compression::ChunkCompressor,
    io_utils::CountingCrcWriter,
    records::{self, op, AttachmentHeader, MessageHeader},
    Attachment, Compression, CompressionLevel, McapError, McapResult, Message, Schema, MAGIC,
};

/// Serialization of individual records. Lengths are computed up front so the
/// framing can be emitted without seeking back.
pub(crate) mod ser {
    use super::*;
    use byteorder::{WriteBytesExt, LE};

    pub fn op_and_len<W: Write>(w: &mut W, opcode: u8, len: u64) -> io::Result<()> {
        w.write_u8(opcode)?;
        w.write_u64::<LE>(len)
    }

    fn string_len(s: &str) -> u64 {
        4 + s.len() as u64
    }

    fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
        w.write_u32::<LE>(s.len() as u32)?;
        w.write_all(s.as_bytes())
    }

    fn str_map_len(m: &BTreeMap<String, String>) -> u64 {
        m.iter()
            .map(|(k, v)| 8 + k.len() as u64 + v.len() as u64)
            .sum()
    }

    // Maps iterate in key order, keeping the output byte-deterministic.
    fn write_str_map<W: Write>(w: &mut W, m: &BTreeMap<String, String>) -> io::Result<()> {
        w.write_u32::<LE>(str_map_len(m) as u32)?;
        for (k, v) in m {
            write_string(w, k)?;
            write_string(w, v)?;
        }
        Ok(())
    }

    fn write_u16_u64_map<W: Write>(w: &mut W, m: &BTreeMap<u16, u64>) -> io::Result<()> {
        w.write_u32::<LE>((m.len() * 10) as u32)?;
        for (k, v) in m {
            w.write_u16::<LE>(*k)?;
            w.write_u64::<LE>(*v)?;
        }
        Ok(())
    }

    pub fn write_header<W: Write>(w: &mut W, h: &records::Header) -> io::Result<()> {
        op_and_len(w, op::HEADER, string_len(&h.profile) + string_len(&h.library))?;
        write_string(w, &h.profile)?;
        write_string(w, &h.library)
    }

    pub fn write_schema<W: Write>(
        w: &mut W,
        header: &records::SchemaHeader,
        data: &[u8],
    ) -> io::Result<()> {
        let len = 2 + string_len(&header.name) + string_len(&header.encoding) + 4 + data.len() as u64;
        op_and_len(w, op::SCHEMA, len)?;
        w.write_u16::<LE>(header.id)?;
        write_string(w, &header.name)?;
        write_string(w, &header.encoding)?;
        w.write_u32::<LE>(data.len() as u32)?;
        w.write_all(data)
    }

    pub fn write_channel<W: Write>(w: &mut W, c: &records::Channel) -> io::Result<()> {
        let len = 2
            + 2
            + string_len(&c.topic)
            + string_len(&c.message_encoding)
            + 4
            + str_map_len(&c.metadata);
        op_and_len(w, op::CHANNEL, len)?;
        w.write_u16::<LE>(c.id)?;
        w.write_u16::<LE>(c.schema_id)?;
        write_string(w, &c.topic)?;
        write_string(w, &c.message_encoding)?;
        write_str_map(w, &c.metadata)
    }

    pub fn write_message<W: Write>(
        w: &mut W,
        h: &MessageHeader,
        data: &[u8],
    ) -> io::Result<()> {
        op_and_len(w, op::MESSAGE, h.serialized_len() + data.len() as u64)?;
        w.write_u16::<LE>(h.channel_id)?;
        w.write_u32::<LE>(h.sequence)?;
        w.write_u64::<LE>(h.log_time)?;
        w.write_u64::<LE>(h.publish_time)?;
        w.write_all(data)
    }

    pub fn write_chunk<W: Write>(
        w: &mut W,
        h: &records::ChunkHeader,
        compressed: &[u8],
    ) -> io::Result<()> {
        let len = 8 + 8 + 8 + 4 + string_len(&h.compression) + 8 + compressed.len() as u64;
        op_and_len(w, op::CHUNK, len)?;
        w.write_u64::<LE>(h.message_start_time)?;
        w.write_u64::<LE>(h.message_end_time)?;
        w.write_u64::<LE>(h.uncompressed_size)?;
        w.write_u32::<LE>(h.uncompressed_crc)?;
        write_string(w, &h.compression)?;
        w.write_u64::<LE>(compressed.len() as u64)?;
        w.write_all(compressed)
    }

    pub fn write_message_index<W: Write>(
        w: &mut W,
        channel_id: u16,
        entries: &[records::MessageIndexEntry],
    ) -> io::Result<()> {
        let entries_len = (entries.len() * 16) as u64;
        op_and_len(w, op::MESSAGE_INDEX, 2 + 4 + entries_len)?;
        w.write_u16::<LE>(channel_id)?;
        w.write_u32::<LE>(entries_len as u32)?;
        for entry in entries {
            w.write_u64::<LE>(entry.log_time)?;
            w.write_u64::<LE>(entry.offset)?;
        }
        Ok(())
    }

    pub fn write_chunk_index<W: Write>(w: &mut W, i: &records::ChunkIndex) -> io::Result<()> {
        let len = 8
            + 8
            + 8
            + 8
            + 4
            + (i.message_index_offsets.len() * 10) as u64
            + 8
            + string_len(&i.compression)
            + 8
            + 8;
        op_and_len(w, op::CHUNK_INDEX, len)?;
        w.write_u64::<LE>(i.message_start_time)?;
        w.write_u64::<LE>(i.message_end_time)?;
        w.write_u64::<LE>(i.chunk_start_offset)?;
        w.write_u64::<LE>(i.chunk_length)?;
        write_u16_u64_map(w, &i.message_index_offsets)?;
        w.write_u64::<LE>(i.message_index_length)?;
        write_string(w, &i.compression)?;
        w.write_u64::<LE>(i.compressed_size)?;
        w.write_u64::<LE>(i.uncompressed_size)
    }

    pub fn write_attachment_index<W: Write>(
        w: &mut W,
        i: &records::AttachmentIndex,
    ) -> io::Result<()> {
        let len = 8 + 8 + 8 + 8 + 8 + string_len(&i.name) + string_len(&i.media_type);
        op_and_len(w, op::ATTACHMENT_INDEX, len)?;
        w.write_u64::<LE>(i.offset)?;
        w.write_u64::<LE>(i.length)?;
        w.write_u64::<LE>(i.log_time)?;
        w.write_u64::<LE>(i.create_time)?;
        w.write_u64::<LE>(i.data_size)?;
        write_string(w, &i.name)?;
        write_string(w, &i.media_type)
    }

    pub fn write_statistics<W: Write>(w: &mut W, s: &records::Statistics) -> io::Result<()> {
        let len = 8 + 2 + 4 + 4 + 4 + 4 + 8 + 8 + 4 + (s.channel_message_counts.len() * 10) as u64;
        op_and_len(w, op::STATISTICS, len)?;
        w.write_u64::<LE>(s.message_count)?;
        w.write_u16::<LE>(s.schema_count)?;
        w.write_u32::<LE>(s.channel_count)?;
        w.write_u32::<LE>(s.attachment_count)?;
        w.write_u32::<LE>(s.metadata_count)?;
        w.write_u32::<LE>(s.chunk_count)?;
        w.write_u64::<LE>(s.message_start_time)?;
        w.write_u64::<LE>(s.message_end_time)?;
        write_u16_u64_map(w, &s.channel_message_counts)
    }

    pub fn write_metadata<W: Write>(w: &mut W, m: &records::Metadata) -> io::Result<()> {
        let len = string_len(&m.name) + 4 + str_map_len(&m.metadata);
        op_and_len(w, op::METADATA, len)?;
        write_string(w, &m.name)?;
        write_str_map(w, &m.metadata)
    }

    pub fn write_metadata_index<W: Write>(
        w: &mut W,
        i: &records::MetadataIndex,
    ) -> io::Result<()> {
        op_and_len(w, op::METADATA_INDEX, 8 + 8 + string_len(&i.name))?;
        w.write_u64::<LE>(i.offset)?;
        w.write_u64::<LE>(i.length)?;
        write_string(w, &i.name)
    }

    pub fn write_summary_offset<W: Write>(
        w: &mut W,
        o: &records::SummaryOffset,
    ) -> io::Result<()> {
        op_and_len(w, op::SUMMARY_OFFSET, 1 + 8 + 8)?;
        w.write_u8(o.group_opcode)?;
        w.write_u64::<LE>(o.group_start)?;
        w.write_u64::<LE>(o.group_length)
    }

    pub fn write_attachment_prefix<W: Write>(
        w: &mut W,
        h: &AttachmentHeader,
        data_size: u64,
    ) -> io::Result<()> {
        w.write_u64::<LE>(h.log_time)?;
        w.write_u64::<LE>(h.create_time)?;
        write_string(w, &h.name)?;
        write_string(w, &h.media_type)?;
        w.write_u64::<LE>(data_size)
    }

    pub fn attachment_prefix_len(h: &AttachmentHeader) -> u64 {
        8 + 8 + string_len(&h.name) + string_len(&h.media_type) + 8
    }
}

/// Options for the [`Writer`].
pub struct WriteOptions {
    compression: Option<Compression>,
    compression_level: CompressionLevel,
    profile: String,
    library: String,
    override_library: bool,
    chunk_size: u64,
    use_chunks: bool,
    include_crc: bool,
    skip_start_magic: bool,
    skip_message_indexing: bool,
    skip_statistics: bool,
    skip_repeated_schemas: bool,
    skip_repeated_channel_infos: bool,
    skip_attachment_index: bool,
    skip_metadata_index: bool,
    skip_chunk_index: bool,
    skip_summary_offsets: bool,
    custom_compressor: Option<Box<dyn ChunkCompressor>>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            #[cfg(feature = "zstd")]
            compression: Some(Compression::Zstd),
            #[cfg(not(feature = "zstd"))]
            compression: None,
            compression_level: CompressionLevel::default(),
            profile: String::new(),
            library: String::new(),
            override_library: false,
            chunk_size: 1024 * 1024,
            use_chunks: true,
            include_crc: false,
            skip_start_magic: false,
            skip_message_indexing: false,
            skip_statistics: false,
            skip_repeated_schemas: false,
            skip_repeated_channel_infos: false,
            skip_attachment_index: false,
            skip_metadata_index: false,
            skip_chunk_index: false,
            skip_summary_offsets: false,
            custom_compressor: None,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the compression that should be used on chunks.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    /// Specifies the compression level hint passed to the chunk codec.
    pub fn compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    /// Specifies the profile that should be written to the Header record.
    pub fn profile<S: Into<String>>(mut self, profile: S) -> Self {
        self.profile = profile.into();
        self
    }

    /// Specifies a library string. By default it is appended to this crate's
    /// own identification; see [`override_library`](Self::override_library)
    /// to emit it verbatim.
    pub fn library<S: Into<String>>(mut self, library: S) -> Self {
        self.library = library.into();
        self
    }

    /// Emit exactly the caller-supplied library string instead of
    /// synthesizing one.
    pub fn override_library(mut self, override_library: bool) -> Self {
        self.override_library = override_library;
        self
    }

    /// Specifies the target uncompressed size of each chunk. This is a soft
    /// limit: a chunk is closed after the message that pushes it over, so one
    /// oversized message produces one oversized chunk.
    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Specifies whether to group schemas, channels, and messages into chunks.
    ///
    /// If `false`, they are written directly to the data section. This
    /// prevents compression and message indexing, but may be useful on small
    /// embedded systems that cannot afford the memory overhead of building
    /// chunks.
    pub fn use_chunks(mut self, use_chunks: bool) -> Self {
        self.use_chunks = use_chunks;
        self
    }

    /// Compute and write data-section, chunk, attachment, and summary CRCs.
    /// When disabled, all CRC fields are written as zero.
    pub fn include_crc(mut self, include_crc: bool) -> Self {
        self.include_crc = include_crc;
        self
    }

    /// Do not emit the starting magic, for appending to a partial write.
    /// The closing magic is still emitted.
    pub fn skip_start_magic(mut self, skip_start_magic: bool) -> Self {
        self.skip_start_magic = skip_start_magic;
        self
    }

    /// Omit message index records and the chunk indexes' references to them.
    pub fn skip_message_indexing(mut self, skip: bool) -> Self {
        self.skip_message_indexing = skip;
        self
    }

    pub fn skip_statistics(mut self, skip: bool) -> Self {
        self.skip_statistics = skip;
        self
    }

    pub fn skip_repeated_schemas(mut self, skip: bool) -> Self {
        self.skip_repeated_schemas = skip;
        self
    }

    pub fn skip_repeated_channel_infos(mut self, skip: bool) -> Self {
        self.skip_repeated_channel_infos = skip;
        self
    }

    pub fn skip_attachment_index(mut self, skip: bool) -> Self {
        self.skip_attachment_index = skip;
        self
    }

    pub fn skip_metadata_index(mut self, skip: bool) -> Self {
        self.skip_metadata_index = skip;
        self
    }

    pub fn skip_chunk_index(mut self, skip: bool) -> Self {
        self.skip_chunk_index = skip;
        self
    }

    pub fn skip_summary_offsets(mut self, skip: bool) -> Self {
        self.skip_summary_offsets = skip;
        self
    }

    /// Injects a chunk codec, overriding `compression`.
    pub fn custom_compressor(mut self, compressor: Box<dyn ChunkCompressor>) -> Self {
        self.custom_compressor = Some(compressor);
        self
    }

    /// Creates a [`Writer`] which writes to `w` using the given options.
    pub fn create<W: Write>(self, w: W) -> McapResult<Writer<W>> {
        Writer::with_options(w, self)
    }
}

#[derive(Hash, PartialEq, Eq)]
struct SchemaContent {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

#[derive(Hash, PartialEq, Eq)]
struct ChannelContent {
    topic: String,
    schema_id: u16,
    message_encoding: String,
    metadata: BTreeMap<String, String>,
}

struct AttachmentState {
    hasher: crc32fast::Hasher,
    record_offset: u64,
    data_size: u64,
    data_remaining: u64,
    header: AttachmentHeader,
}

/// Writes an MCAP file to the given [writer](Write).
///
/// Message payloads are routed into size-bounded compressed chunks unless
/// chunking is disabled; attachments and metadata are written through
/// directly. [`finish()`](Self::finish) closes the current chunk and writes
/// the summary section; otherwise it runs (and unwraps) on drop.
///
/// No [`Seek`](std::io::Seek) bound is needed: chunks are built in memory and
/// emitted once their sizes are known.
pub struct Writer<W: Write> {
    sink: Option<CountingCrcWriter<W>>,
    finished: bool,
    options: WriteOptions,
    chunk: ChunkBuilder,
    // Schemas and channels in first-written order, so the summary section is
    // reproducible for identical inputs.
    schemas: Vec<(records::SchemaHeader, Vec<u8>)>,
    schema_index: HashMap<u16, usize>,
    schema_contents: HashMap<SchemaContent, u16>,
    channels: Vec<records::Channel>,
    channel_index: HashMap<u16, usize>,
    channel_contents: HashMap<ChannelContent, u16>,
    next_schema_id: u16,
    next_channel_id: u16,
    chunk_indexes: Vec<records::ChunkIndex>,
    attachment_indexes: Vec<records::AttachmentIndex>,
    metadata_indexes: Vec<records::MetadataIndex>,
    /// Message start and end time, or None if there are no messages yet.
    message_bounds: Option<(u64, u64)>,
    channel_message_counts: BTreeMap<u16, u64>,
    attachment: Option<AttachmentState>,
}

impl<W: Write> Writer<W> {
    pub fn new(writer: W) -> McapResult<Self> {
        Self::with_options(writer, WriteOptions::default())
    }

    fn with_options(writer: W, mut opts: WriteOptions) -> McapResult<Self> {
        let mut sink = CountingCrcWriter::new(writer);
        if !opts.skip_start_magic {
            sink.write_all(MAGIC)?;
        }

        let library = if opts.override_library {
            opts.library.clone()
        } else {
            let base = format!("mcap-rs {}", env!("CARGO_PKG_VERSION"));
            if !opts.library.is_empty() && opts.library != base {
                format!("{}; {}", base, opts.library)
            } else {
                base
            }
        };
        ser::write_header(
            &mut sink,
            &records::Header {
                profile: opts.profile.clone(),
                library,
            },
        )?;

        let chunk = ChunkBuilder::new(
            opts.compression,
            opts.compression_level,
            opts.custom_compressor.take(),
        );

        Ok(Self {
            sink: Some(sink),
            finished: false,
            options: opts,
            chunk,
            schemas: Vec::new(),
            schema_index: HashMap::new(),
            schema_contents: HashMap::new(),
            channels: Vec::new(),
            channel_index: HashMap::new(),
            channel_contents: HashMap::new(),
            next_schema_id: 1,
            next_channel_id: 0,
            chunk_indexes: Vec::new(),
            attachment_indexes: Vec::new(),
            metadata_indexes: Vec::new(),
            message_bounds: None,
            channel_message_counts: BTreeMap::new(),
            attachment: None,
        })
    }

    /// `.expect()` message when we go to write and the sink is gone,
    /// which only happens after [`Writer::into_inner`].
    const WHERE_WRITER: &'static str = "Trying to write a record on a finished MCAP";

    fn sink(&mut self) -> &mut CountingCrcWriter<W> {
        assert!(!self.finished, "{}", Self::WHERE_WRITER);
        self.sink.as_mut().expect(Self::WHERE_WRITER)
    }

    fn check_no_attachment(&self) -> McapResult<()> {
        if self.attachment.is_some() {
            return Err(McapError::AttachmentInProgress);
        }
        Ok(())
    }

    /// Writes a schema record with a caller-assigned ID.
    ///
    /// The first write of an ID registers it; a later write with the same ID
    /// must carry identical content.
    pub fn write_schema(&mut self, schema: &Schema) -> McapResult<()> {
        self.check_no_attachment()?;
        if schema.id == 0 {
            return Err(McapError::InvalidSchemaId);
        }
        match self.schema_index.get(&schema.id) {
            Some(&at) => {
                let (header, data) = &self.schemas[at];
                if header.name != schema.name
                    || header.encoding != schema.encoding
                    || data[..] != schema.data[..]
                {
                    return Err(McapError::ConflictingSchemas(schema.name.clone()));
                }
            }
            None => {
                self.schema_index.insert(schema.id, self.schemas.len());
                self.schemas.push((
                    records::SchemaHeader {
                        id: schema.id,
                        name: schema.name.clone(),
                        encoding: schema.encoding.clone(),
                    },
                    schema.data.clone().into_owned(),
                ));
                self.schema_contents
                    .entry(SchemaContent {
                        name: schema.name.clone(),
                        encoding: schema.encoding.clone(),
                        data: schema.data.clone().into_owned(),
                    })
                    .or_insert(schema.id);
            }
        }
        let header = records::SchemaHeader {
            id: schema.id,
            name: schema.name.clone(),
            encoding: schema.encoding.clone(),
        };
        if self.options.use_chunks {
            self.chunk.write_schema(&header, &schema.data)
        } else {
            Ok(ser::write_schema(self.sink(), &header, &schema.data)?)
        }
    }

    /// Adds a schema, returning its ID. If a schema with the same content has
    /// been added already, its ID is returned without writing anything.
    pub fn add_schema(&mut self, name: &str, encoding: &str, data: &[u8]) -> McapResult<u16> {
        if let Some(&id) = self.schema_contents.get(&SchemaContent {
            name: name.into(),
            encoding: encoding.into(),
            data: data.into(),
        }) {
            return Ok(id);
        }
        while self.schema_index.contains_key(&self.next_schema_id) {
            if self.next_schema_id == u16::MAX {
                return Err(McapError::TooManySchemas);
            }
            self.next_schema_id += 1;
        }
        let id = self.next_schema_id;
        self.next_schema_id = self.next_schema_id.saturating_add(1);
        self.write_schema(&Schema {
            id,
            name: name.into(),
            encoding: encoding.into(),
            data: std::borrow::Cow::Owned(data.into()),
        })?;
        Ok(id)
    }

    /// Writes a channel record with a caller-assigned ID.
    ///
    /// `schema_id` must be 0 (no schema) or the ID of a schema written
    /// earlier. As with schemas, re-writing an ID requires identical content.
    pub fn write_channel(&mut self, channel: &records::Channel) -> McapResult<()> {
        self.check_no_attachment()?;
        if channel.schema_id != 0 && !self.schema_index.contains_key(&channel.schema_id) {
            return Err(McapError::UnknownSchema(
                channel.topic.clone(),
                channel.schema_id,
            ));
        }
        match self.channel_index.get(&channel.id) {
            Some(&at) => {
                if self.channels[at] != *channel {
                    return Err(McapError::ConflictingChannels(channel.topic.clone()));
                }
            }
            None => {
                self.channel_index.insert(channel.id, self.channels.len());
                self.channels.push(channel.clone());
                self.channel_contents
                    .entry(ChannelContent {
                        topic: channel.topic.clone(),
                        schema_id: channel.schema_id,
                        message_encoding: channel.message_encoding.clone(),
                        metadata: channel.metadata.clone(),
                    })
                    .or_insert(channel.id);
            }
        }
        if self.options.use_chunks {
            self.chunk.write_channel(channel)
        } else {
            Ok(ser::write_channel(self.sink(), channel)?)
        }
    }

    /// Adds a channel, returning its ID. If a channel with equivalent content
    /// was added previously, its ID is returned.
    ///
    /// Useful with subsequent calls to [`write_message`](Self::write_message).
    pub fn add_channel(
        &mut self,
        schema_id: u16,
        topic: &str,
        message_encoding: &str,
        metadata: &BTreeMap<String, String>,
    ) -> McapResult<u16> {
        if let Some(&id) = self.channel_contents.get(&ChannelContent {
            topic: topic.into(),
            schema_id,
            message_encoding: message_encoding.into(),
            metadata: metadata.clone(),
        }) {
            return Ok(id);
        }
        while self.channel_index.contains_key(&self.next_channel_id) {
            if self.next_channel_id == u16::MAX {
                return Err(McapError::TooManyChannels);
            }
            self.next_channel_id += 1;
        }
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.saturating_add(1);
        self.write_channel(&records::Channel {
            id,
            schema_id,
            topic: topic.into(),
            message_encoding: message_encoding.into(),
            metadata: metadata.clone(),
        })?;
        Ok(id)
    }

    /// Writes a message on a previously written channel.
    pub fn write_message(&mut self, header: &MessageHeader, data: &[u8]) -> McapResult<()> {
        self.check_no_attachment()?;
        if !self.channel_index.contains_key(&header.channel_id) {
            return Err(McapError::UnknownChannel(
                header.sequence,
                header.channel_id,
            ));
        }

        self.message_bounds = Some(match self.message_bounds {
            None => (header.log_time, header.log_time),
            Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
        });
        *self
            .channel_message_counts
            .entry(header.channel_id)
            .or_insert(0) += 1;

        if self.options.use_chunks {
            self.chunk.write_message(header, data)?;
            // The chunk size is a soft target: flush after the message that
            // pushed us over it.
            if self.chunk.uncompressed_size() > self.options.chunk_size {
                self.finish_chunk()?;
            }
        } else {
            ser::write_message(self.sink(), header, data)?;
        }
        Ok(())
    }

    /// Writes the given message, adding its channel (and schema) if they were
    /// not added already. The IDs in the provided channel and schema are used
    /// as the IDs in the resulting MCAP.
    pub fn write(&mut self, message: &Message) -> McapResult<()> {
        if let Some(schema) = message.channel.schema.as_ref() {
            match self.schema_index.get(&schema.id) {
                Some(&at) => {
                    let (header, data) = &self.schemas[at];
                    if header.name != schema.name
                        || header.encoding != schema.encoding
                        || data[..] != schema.data[..]
                    {
                        return Err(McapError::ConflictingSchemas(schema.name.clone()));
                    }
                }
                None => self.write_schema(schema)?,
            }
        }
        let schema_id = message.channel.schema.as_ref().map(|s| s.id).unwrap_or(0);
        let as_record = records::Channel {
            id: message.channel.id,
            schema_id,
            topic: message.channel.topic.clone(),
            message_encoding: message.channel.message_encoding.clone(),
            metadata: message.channel.metadata.clone(),
        };
        match self.channel_index.get(&message.channel.id) {
            Some(&at) => {
                if self.channels[at] != as_record {
                    return Err(McapError::ConflictingChannels(
                        message.channel.topic.clone(),
                    ));
                }
            }
            None => self.write_channel(&as_record)?,
        }
        self.write_message(
            &MessageHeader {
                channel_id: message.channel.id,
                sequence: message.sequence,
                log_time: message.log_time,
                publish_time: message.publish_time,
            },
            &message.data,
        )
    }

    /// Starts a streamed attachment. Finishes any current chunk first.
    ///
    /// This is a low-level API; for small attachments use
    /// [`write_attachment`](Self::write_attachment). Exactly
    /// `attachment_length` bytes must then be supplied via
    /// [`put_attachment_bytes`](Self::put_attachment_bytes) before
    /// [`finish_attachment`](Self::finish_attachment) is called.
    pub fn start_attachment(
        &mut self,
        attachment_length: u64,
        header: AttachmentHeader,
    ) -> McapResult<()> {
        self.check_no_attachment()?;
        self.finish_chunk()?;

        let prefix_len = ser::attachment_prefix_len(&header);
        let sink = self.sink.as_mut().expect(Self::WHERE_WRITER);
        let record_offset = sink.position();
        ser::op_and_len(
            sink,
            op::ATTACHMENT,
            prefix_len + attachment_length + 4,
        )?;

        // The attachment CRC covers the body from log_time through the end of
        // the data, so hash the prefix on the way out.
        let mut prefix = Vec::new();
        ser::write_attachment_prefix(&mut prefix, &header, attachment_length)?;
        sink.write_all(&prefix)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prefix);

        self.attachment = Some(AttachmentState {
            hasher,
            record_offset,
            data_size: attachment_length,
            data_remaining: attachment_length,
            header,
        });
        Ok(())
    }

    /// Writes bytes to the attachment started by
    /// [`start_attachment`](Self::start_attachment).
    pub fn put_attachment_bytes(&mut self, bytes: &[u8]) -> McapResult<()> {
        let Some(state) = &mut self.attachment else {
            return Err(McapError::AttachmentNotInProgress);
        };
        if bytes.len() as u64 > state.data_remaining {
            return Err(McapError::AttachmentTooLarge {
                excess: bytes.len() as u64 - state.data_remaining,
                attachment_length: state.data_size,
            });
        }
        state.data_remaining -= bytes.len() as u64;
        state.hasher.update(bytes);
        let sink = self.sink.as_mut().expect(Self::WHERE_WRITER);
        sink.write_all(bytes)?;
        Ok(())
    }

    /// Finishes the current attachment, writing its CRC and recording its
    /// index entry.
    pub fn finish_attachment(&mut self) -> McapResult<()> {
        let Some(state) = self.attachment.take() else {
            return Err(McapError::AttachmentNotInProgress);
        };
        if state.data_remaining != 0 {
            return Err(McapError::AttachmentIncomplete {
                expected: state.data_size,
                current: state.data_size - state.data_remaining,
            });
        }
        let crc = if self.options.include_crc {
            state.hasher.finalize()
        } else {
            0
        };
        let sink = self.sink.as_mut().expect(Self::WHERE_WRITER);
        use byteorder::{WriteBytesExt, LE};
        sink.write_u32::<LE>(crc)?;

        let length = sink.position() - state.record_offset;
        self.attachment_indexes.push(records::AttachmentIndex {
            offset: state.record_offset,
            length,
            log_time: state.header.log_time,
            create_time: state.header.create_time,
            data_size: state.data_size,
            name: state.header.name,
            media_type: state.header.media_type,
        });
        Ok(())
    }

    /// Writes an attachment. Finishes any current chunk first.
    pub fn write_attachment(&mut self, attachment: &Attachment) -> McapResult<()> {
        self.start_attachment(
            attachment.data.len() as u64,
            AttachmentHeader {
                log_time: attachment.log_time,
                create_time: attachment.create_time,
                name: attachment.name.clone(),
                media_type: attachment.media_type.clone(),
            },
        )?;
        self.put_attachment_bytes(&attachment.data)?;
        self.finish_attachment()
    }

    /// Writes a metadata record. Finishes any current chunk first.
    pub fn write_metadata(&mut self, metadata: &records::Metadata) -> McapResult<()> {
        self.check_no_attachment()?;
        self.finish_chunk()?;
        let sink = self.sink.as_mut().expect(Self::WHERE_WRITER);
        let offset = sink.position();
        ser::write_metadata(sink, metadata)?;
        self.metadata_indexes.push(records::MetadataIndex {
            offset,
            length: sink.position() - offset,
            name: metadata.name.clone(),
        });
        Ok(())
    }

    /// Finishes the current chunk, if we have one, and flushes the underlying
    /// [writer](Write).
    ///
    /// We finish the chunk to guarantee that the file can be streamed by
    /// future readers at least up to this point. Note that lossless
    /// compression schemes like LZ4 and Zstd improve as they go, so larger
    /// chunks will tend to compress better.
    pub fn flush(&mut self) -> McapResult<()> {
        self.check_no_attachment()?;
        self.finish_chunk()?;
        self.sink().flush()?;
        Ok(())
    }

    fn finish_chunk(&mut self) -> McapResult<()> {
        assert!(!self.finished, "{}", Self::WHERE_WRITER);
        let sink = self.sink.as_mut().expect(Self::WHERE_WRITER);
        if let Some(index) = self.chunk.finish(
            sink,
            self.options.include_crc,
            self.options.skip_message_indexing,
        )? {
            self.chunk_indexes.push(index);
        }
        Ok(())
    }

    /// Finishes any current chunk and writes out the data end, the summary
    /// section, and the footer.
    ///
    /// Subsequent calls to write methods will panic.
    pub fn finish(&mut self) -> McapResult<()> {
        if self.finished {
            // We already finished. Maybe we're dropping after the user did?
            return Ok(());
        }
        self.check_no_attachment()?;
        self.finish_chunk()?;

        use byteorder::{WriteBytesExt, LE};
        let include_crc = self.options.include_crc;
        let sink = self.sink.as_mut().expect(Self::WHERE_WRITER);

        // We're done with the data section. Its CRC covers everything from
        // the leading magic through DataEnd's own opcode and length.
        ser::op_and_len(sink, op::DATA_END, 4)?;
        let data_section_crc = if include_crc { sink.checksum() } else { 0 };
        sink.write_u32::<LE>(data_section_crc)?;

        // The summary CRC starts over from the section's first byte.
        let summary_start_pos = sink.position();
        sink.reset_crc();

        let mut offsets = Vec::new();

        if !self.options.skip_repeated_schemas && !self.schemas.is_empty() {
            let group_start = sink.position();
            for (header, data) in &self.schemas {
                ser::write_schema(sink, header, data)?;
            }
            offsets.push(records::SummaryOffset {
                group_opcode: op::SCHEMA,
                group_start,
                group_length: sink.position() - group_start,
            });
        }

        if !self.options.skip_repeated_channel_infos && !self.channels.is_empty() {
            let group_start = sink.position();
            for channel in &self.channels {
                ser::write_channel(sink, channel)?;
            }
            offsets.push(records::SummaryOffset {
                group_opcode: op::CHANNEL,
                group_start,
                group_length: sink.position() - group_start,
            });
        }

        if !self.options.skip_statistics {
            let group_start = sink.position();
            let message_bounds = self.message_bounds.unwrap_or((0, 0));
            ser::write_statistics(
                sink,
                &records::Statistics {
                    message_count: self.channel_message_counts.values().sum(),
                    schema_count: self.schemas.len() as u16,
                    channel_count: self.channels.len() as u32,
                    attachment_count: self.attachment_indexes.len() as u32,
                    metadata_count: self.metadata_indexes.len() as u32,
                    chunk_count: self.chunk_indexes.len() as u32,
                    message_start_time: message_bounds.0,
                    message_end_time: message_bounds.1,
                    channel_message_counts: std::mem::take(&mut self.channel_message_counts),
                },
            )?;
            offsets.push(records::SummaryOffset {
                group_opcode: op::STATISTICS,
                group_start,
                group_length: sink.position() - group_start,
            });
        }

        if !self.options.skip_chunk_index && !self.chunk_indexes.is_empty() {
            let group_start = sink.position();
            for index in &self.chunk_indexes {
                ser::write_chunk_index(sink, index)?;
            }
            offsets.push(records::SummaryOffset {
                group_opcode: op::CHUNK_INDEX,
                group_start,
                group_length: sink.position() - group_start,
            });
        }

        if !self.options.skip_attachment_index && !self.attachment_indexes.is_empty() {
            let group_start = sink.position();
            for index in &self.attachment_indexes {
                ser::write_attachment_index(sink, index)?;
            }
            offsets.push(records::SummaryOffset {
                group_opcode: op::ATTACHMENT_INDEX,
                group_start,
                group_length: sink.position() - group_start,
            });
        }

        if !self.options.skip_metadata_index && !self.metadata_indexes.is_empty() {
            let group_start = sink.position();
            for index in &self.metadata_indexes {
                ser::write_metadata_index(sink, index)?;
            }
            offsets.push(records::SummaryOffset {
                group_opcode: op::METADATA_INDEX,
                group_start,
                group_length: sink.position() - group_start,
            });
        }

        let summary_end_pos = sink.position();
        let summary_start = if summary_end_pos > summary_start_pos {
            summary_start_pos
        } else {
            0
        };

        let summary_offset_start = if !self.options.skip_summary_offsets && !offsets.is_empty() {
            let at = sink.position();
            for offset in &offsets {
                ser::write_summary_offset(sink, offset)?;
            }
            at
        } else {
            0
        };

        // Wat: the CRC in the footer _includes_ part of the footer.
        ser::op_and_len(sink, op::FOOTER, 20)?;
        sink.write_u64::<LE>(summary_start)?;
        sink.write_u64::<LE>(summary_offset_start)?;
        let summary_crc = if include_crc { sink.checksum() } else { 0 };
        sink.write_u32::<LE>(summary_crc)?;

        sink.write_all(MAGIC)?;
        sink.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Finishes the file (if needed) and returns the underlying writer.
    pub fn into_inner(mut self) -> McapResult<W> {
        self.finish()?;
        let sink = self.sink.take().expect(Self::WHERE_WRITER);
        Ok(sink.finalize().0)
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if self.sink.is_some() {
            self.finish().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn unknown_channel_is_rejected() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        let err = writer
            .write_message(
                &MessageHeader {
                    channel_id: 7,
                    sequence: 0,
                    log_time: 0,
                    publish_time: 0,
                },
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, McapError::UnknownChannel(0, 7)));
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        let err = writer
            .write_channel(&records::Channel {
                id: 0,
                schema_id: 3,
                topic: "/t".into(),
                message_encoding: "ros1".into(),
                metadata: BTreeMap::new(),
            })
            .unwrap_err();
        assert!(matches!(err, McapError::UnknownSchema(_, 3)));
    }

    #[test]
    fn conflicting_schema_ids_are_rejected() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        writer
            .write_schema(&Schema {
                id: 1,
                name: "a".into(),
                encoding: "e".into(),
                data: Cow::Borrowed(&[1]),
            })
            .unwrap();
        let err = writer
            .write_schema(&Schema {
                id: 1,
                name: "a".into(),
                encoding: "e".into(),
                data: Cow::Borrowed(&[2]),
            })
            .unwrap_err();
        assert!(matches!(err, McapError::ConflictingSchemas(_)));
    }

    #[test]
    fn attachment_size_must_match() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        writer
            .start_attachment(
                4,
                AttachmentHeader {
                    log_time: 0,
                    create_time: 0,
                    name: "file.bin".into(),
                    media_type: "application/octet-stream".into(),
                },
            )
            .unwrap();
        writer.put_attachment_bytes(&[1, 2]).unwrap();
        assert!(matches!(
            writer.finish_attachment(),
            Err(McapError::AttachmentIncomplete {
                expected: 4,
                current: 2
            })
        ));
    }

    #[test]
    fn attachment_overflow_is_rejected() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        writer
            .start_attachment(
                2,
                AttachmentHeader {
                    log_time: 0,
                    create_time: 0,
                    name: "file.bin".into(),
                    media_type: "application/octet-stream".into(),
                },
            )
            .unwrap();
        assert!(matches!(
            writer.put_attachment_bytes(&[1, 2, 3]),
            Err(McapError::AttachmentTooLarge {
                excess: 1,
                attachment_length: 2
            })
        ));
        // the failed put consumed nothing, so the attachment can still complete
        writer.put_attachment_bytes(&[1, 2]).unwrap();
        writer.finish_attachment().unwrap();
    }

    #[test]
    fn no_writes_while_attachment_is_streaming() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        writer
            .start_attachment(
                1,
                AttachmentHeader {
                    log_time: 0,
                    create_time: 0,
                    name: "a".into(),
                    media_type: "b".into(),
                },
            )
            .unwrap();
        assert!(matches!(
            writer.write_metadata(&records::Metadata::default()),
            Err(McapError::AttachmentInProgress)
        ));
        writer.put_attachment_bytes(&[0]).unwrap();
        writer.finish_attachment().unwrap();
    }
}
