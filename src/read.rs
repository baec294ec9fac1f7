//! Read MCAP files.
//!
//! The entry point for most consumers is [`MessageIter`], which parses the
//! summary section and serves range- and topic-filtered messages in the
//! requested order, falling back to a linear scan when the file carries no
//! index. [`Summary`], [`RecordIterator`], and the `read_*` helpers expose
//! the lower-level pieces.

use std::{
    borrow::Cow,
    collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap},
    fmt,
    io::{Read, Seek, SeekFrom},
    ops::Deref,
    sync::Arc,
};

use enumset::{EnumSet, EnumSetType};

use crate::{
    compression::Decompressor,
    indexed::IndexedMessageIter,
    lexer::{Lexer, LexerOptions},
    parse,
    records::{self, op, OpCode, Record},
    Attachment, Channel, MagicLocation, McapError, McapResult, Message, Schema, MAGIC,
};

/// Nonstandard reading options, e.g.,
/// to be more lenient when trying to recover incomplete/damaged files.
#[derive(EnumSetType, Debug)]
pub enum Options {
    /// Don't require the file to end with its magic bytes: stop at the end of
    /// the last complete record instead of failing on a truncated tail.
    IgnoreEndMagic,
}

/// The order in which [`MessageIter`] yields messages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrder {
    /// Yield messages in the order they are laid out in the file.
    #[default]
    File,
    /// Yield messages in `log_time` order. For equal log times, the message
    /// earlier in the file is yielded first.
    LogTime,
    /// Yield messages in reverse `log_time` order. For equal log times, the
    /// message later in the file is yielded first.
    ReverseLogTime,
}

pub type MetadataCallback = Box<dyn FnMut(&records::Metadata) -> McapResult<()>>;
pub type AttachmentCallback =
    Box<dyn FnMut(&records::AttachmentHeader, &[u8]) -> McapResult<()>>;

/// Options for [`MessageIter`] and [`LinearMessageIter`].
pub struct ReadOptions {
    pub(crate) start_time: Option<u64>,
    pub(crate) end_time: Option<u64>,
    pub(crate) topics: Option<BTreeSet<String>>,
    pub(crate) use_index: bool,
    pub(crate) order: ReadOrder,
    pub(crate) validate_chunk_crcs: bool,
    pub(crate) compute_attachment_crcs: bool,
    pub(crate) max_record_size: Option<usize>,
    pub(crate) max_decompressed_chunk_size: Option<usize>,
    pub(crate) metadata_callback: Option<MetadataCallback>,
    pub(crate) attachment_callback: Option<AttachmentCallback>,
    pub(crate) decompressors: Vec<Box<dyn Decompressor>>,
    pub(crate) flags: EnumSet<Options>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            topics: None,
            use_index: true,
            order: ReadOrder::default(),
            validate_chunk_crcs: false,
            compute_attachment_crcs: false,
            max_record_size: None,
            max_decompressed_chunk_size: None,
            metadata_callback: None,
            attachment_callback: None,
            decompressors: Vec::new(),
            flags: EnumSet::new(),
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield only messages with `log_time` on or after this time.
    pub fn log_time_on_or_after(mut self, start: u64) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Yield only messages with `log_time` before this time.
    pub fn log_time_before(mut self, end: u64) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Yield only messages from topics matching this set of strings.
    /// By default, all topics are yielded.
    pub fn include_topics<T: IntoIterator<Item = impl Deref<Target = str>>>(
        mut self,
        topics: T,
    ) -> Self {
        self.topics = Some(topics.into_iter().map(|t| t.to_owned()).collect());
        self
    }

    /// Whether to locate content through the summary section (the default).
    /// When disabled, only [`ReadOrder::File`] iteration is possible.
    pub fn use_index(mut self, use_index: bool) -> Self {
        self.use_index = use_index;
        self
    }

    /// Yield messages in the specified order (defaults to file order).
    pub fn with_order(mut self, order: ReadOrder) -> Self {
        self.order = order;
        self
    }

    /// Verify each chunk's CRC before yielding any of its records.
    pub fn validate_chunk_crcs(mut self, validate: bool) -> Self {
        self.validate_chunk_crcs = validate;
        self
    }

    /// Verify each attachment's CRC against its body.
    pub fn compute_attachment_crcs(mut self, compute: bool) -> Self {
        self.compute_attachment_crcs = compute;
        self
    }

    /// Fail on any record longer than this.
    pub fn max_record_size(mut self, limit: usize) -> Self {
        self.max_record_size = Some(limit);
        self
    }

    /// Fail on any chunk whose uncompressed content is longer than this.
    pub fn max_decompressed_chunk_size(mut self, limit: usize) -> Self {
        self.max_decompressed_chunk_size = Some(limit);
        self
    }

    /// Invoke the callback for each metadata record encountered.
    pub fn metadata_callback(mut self, callback: MetadataCallback) -> Self {
        self.metadata_callback = Some(callback);
        self
    }

    /// Invoke the callback for each attachment encountered, with its header
    /// and data.
    pub fn attachment_callback(mut self, callback: AttachmentCallback) -> Self {
        self.attachment_callback = Some(callback);
        self
    }

    /// Register a decompressor, overriding any built-in with the same name.
    pub fn with_decompressor(mut self, decompressor: Box<dyn Decompressor>) -> Self {
        self.decompressors.push(decompressor);
        self
    }

    /// Set nonstandard lenient-reading flags.
    pub fn with_flags(mut self, flags: EnumSet<Options>) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn lexer_options(&self) -> LexerOptions {
        LexerOptions {
            skip_start_magic: false,
            emit_chunks: false,
            validate_chunk_crcs: self.validate_chunk_crcs,
            compute_attachment_crcs: self.compute_attachment_crcs,
            max_record_size: self.max_record_size,
            max_decompressed_chunk_size: self.max_decompressed_chunk_size,
        }
    }
}

const FOOTER_LEN: u64 = 8 // summary start
    + 8 // summary offset start
    + 4; // summary section CRC
const FOOTER_RECORD_LEN: u64 = 1 // opcode
    + 8 // record length
    + FOOTER_LEN;

/// Reads the footer record, validating the magic bytes on both ends of the
/// file. Leaves the reader's position unspecified.
pub fn read_footer<R: Read + Seek>(reader: &mut R) -> McapResult<records::Footer> {
    let file_end = reader.seek(SeekFrom::End(0))?;
    // A file must be at least large enough for the two magics and a footer.
    if file_end < MAGIC.len() as u64 * 2 + FOOTER_RECORD_LEN {
        return Err(McapError::UnexpectedEof);
    }

    reader.seek(SeekFrom::Start(0))?;
    let mut start_magic = [0u8; 8];
    reader.read_exact(&mut start_magic)?;
    if start_magic != MAGIC {
        return Err(McapError::BadMagic {
            location: MagicLocation::Start,
            observed: start_magic.into(),
        });
    }

    reader.seek(SeekFrom::Start(file_end - MAGIC.len() as u64 - FOOTER_RECORD_LEN))?;
    let mut tail = [0u8; (FOOTER_RECORD_LEN + 8) as usize];
    reader.read_exact(&mut tail)?;
    if tail[tail.len() - 8..] != *MAGIC {
        return Err(McapError::BadMagic {
            location: MagicLocation::End,
            observed: tail[tail.len() - 8..].into(),
        });
    }
    let (&opcode, rest) = tail.split_first().expect("tail is statically sized");
    let (len, body) = parse::parse_u64(rest)?;
    if opcode != op::FOOTER || len != FOOTER_LEN {
        return Err(McapError::BadFooter);
    }
    parse::parse_footer(body)
}

/// Indexes of an MCAP file parsed from its (optional) summary section.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub stats: Option<records::Statistics>,
    /// Maps channel IDs to their channel
    pub channels: HashMap<u16, Arc<Channel<'static>>>,
    /// Maps schema IDs to their schema
    pub schemas: HashMap<u16, Arc<Schema<'static>>>,
    pub chunk_indexes: Vec<records::ChunkIndex>,
    pub attachment_indexes: Vec<records::AttachmentIndex>,
    pub metadata_indexes: Vec<records::MetadataIndex>,
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep the actual maps as HashMaps for constant-time lookups,
        // but order everything up before debug printing it here.
        let channels = self.channels.iter().collect::<BTreeMap<_, _>>();
        let schemas = self.schemas.iter().collect::<BTreeMap<_, _>>();

        f.debug_struct("Summary")
            .field("stats", &self.stats)
            .field("channels", &channels)
            .field("schemas", &schemas)
            .field("chunk_indexes", &self.chunk_indexes)
            .field("attachment_indexes", &self.attachment_indexes)
            .field("metadata_indexes", &self.metadata_indexes)
            .finish()
    }
}

impl Summary {
    /// Reads the summary section of the given seekable file, if it has one.
    pub fn read<R: Read + Seek>(reader: &mut R) -> McapResult<Option<Self>> {
        let footer = read_footer(reader)?;
        if footer.summary_start == 0 {
            return Ok(None);
        }

        reader.seek(SeekFrom::Start(footer.summary_start))?;
        let mut lexer = Lexer::new_with_options(
            reader,
            LexerOptions::default()
                .with_skip_start_magic(true)
                .with_emit_chunks(true),
        );

        let mut summary = Summary::default();
        let mut accumulator = ChannelAccumulator::default();
        let mut buf = Vec::new();
        loop {
            let opcode = match lexer.read_next(&mut buf)? {
                Some(opcode) => opcode,
                // The summary section must terminate with the footer.
                None => return Err(McapError::UnexpectedEof),
            };
            if opcode == OpCode::Footer {
                break;
            }
            match parse::parse_record(opcode, &buf)? {
                Record::Schema { header, data } => {
                    accumulator.add_schema(header, Cow::Owned(data.into_owned()))?
                }
                Record::Channel(channel) => accumulator.add_channel(channel)?,
                Record::Statistics(stats) => summary.stats = Some(stats),
                Record::ChunkIndex(index) => summary.chunk_indexes.push(index),
                Record::AttachmentIndex(index) => summary.attachment_indexes.push(index),
                Record::MetadataIndex(index) => summary.metadata_indexes.push(index),
                // Summary offsets only matter for readers that seek into the
                // summary instead of scanning it, as we just did.
                Record::SummaryOffset(_) => {}
                _other => {}
            }
        }

        summary.schemas = accumulator.schemas;
        summary.channels = accumulator.channels;
        Ok(Some(summary))
    }
}

/// Collects raw schema and channel records and wires them together into owned
/// [`Channel`] structs.
///
/// This can be useful for consumers of this crate building their own readers.
#[derive(Debug, Default)]
pub struct ChannelAccumulator<'a> {
    pub(crate) schemas: HashMap<u16, Arc<Schema<'a>>>,
    pub(crate) channels: HashMap<u16, Arc<Channel<'a>>>,
}

impl<'a> ChannelAccumulator<'a> {
    /// Adds a schema, to be referenced by later channels.
    pub fn add_schema(
        &mut self,
        header: records::SchemaHeader,
        data: Cow<'a, [u8]>,
    ) -> McapResult<()> {
        if header.id == 0 {
            return Err(McapError::InvalidSchemaId);
        }
        match self.schemas.entry(header.id) {
            Entry::Occupied(entry) => {
                // If we already have this schema, it must be identical.
                let schema = entry.get();
                if schema.name == header.name
                    && schema.encoding == header.encoding
                    && schema.data == data
                {
                    Ok(())
                } else {
                    Err(McapError::ConflictingSchemas(header.name))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Schema {
                    id: header.id,
                    name: header.name,
                    encoding: header.encoding,
                    data,
                }));
                Ok(())
            }
        }
    }

    /// Adds a channel, wiring it up with its previously added schema.
    pub fn add_channel(&mut self, chan: records::Channel) -> McapResult<()> {
        // The schema ID can be 0 for "no schema",
        // or must reference some previously-read schema.
        let schema = if chan.schema_id == 0 {
            None
        } else {
            match self.schemas.get(&chan.schema_id) {
                Some(s) => Some(s.clone()),
                None => return Err(McapError::UnknownSchema(chan.topic, chan.schema_id)),
            }
        };
        match self.channels.entry(chan.id) {
            Entry::Occupied(entry) => {
                // If we already have this channel, it must be identical.
                let channel = entry.get();
                if channel.topic == chan.topic
                    && channel.schema.as_ref().map(|s| s.id).unwrap_or(0) == chan.schema_id
                    && channel.message_encoding == chan.message_encoding
                    && channel.metadata == chan.metadata
                {
                    Ok(())
                } else {
                    Err(McapError::ConflictingChannels(chan.topic))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Channel {
                    id: chan.id,
                    topic: chan.topic,
                    schema,
                    message_encoding: chan.message_encoding,
                    metadata: chan.metadata,
                }));
                Ok(())
            }
        }
    }

    /// Gets the channel with the given ID.
    pub fn get(&self, chan_id: u16) -> Option<Arc<Channel<'a>>> {
        self.channels.get(&chan_id).cloned()
    }
}

/// Scans a file from start to end, returning each record.
///
/// Chunks are decompressed and their contents yielded in place unless the
/// lexer options say to emit them whole. This is mostly a building block for
/// higher-level readers.
pub struct RecordIterator<R: Read> {
    lexer: Lexer<R>,
    buf: Vec<u8>,
}

impl<R: Read> RecordIterator<R> {
    pub fn new(reader: R) -> Self {
        Self::new_with_options(reader, LexerOptions::default())
    }

    pub fn new_with_options(reader: R, options: LexerOptions) -> Self {
        Self {
            lexer: Lexer::new_with_options(reader, options),
            buf: Vec::new(),
        }
    }
}

impl<R: Read> Iterator for RecordIterator<R> {
    type Item = McapResult<Record<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lexer.read_next(&mut self.buf) {
            Ok(None) => None,
            Ok(Some(opcode)) => {
                Some(parse::parse_record(opcode, &self.buf).map(|record| record.into_owned()))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Reads all matching messages out of a non-seekable or summary-less file,
/// in file order.
///
/// Schemas and channels are collected as they stream past; messages citing a
/// channel that hasn't appeared yet are skipped, since the channel record is
/// unreachable for retroactive yield. Iteration stops at the end of the data
/// section.
pub struct LinearMessageIter<R: Read> {
    lexer: Lexer<R>,
    accumulator: ChannelAccumulator<'static>,
    start_time: Option<u64>,
    end_time: Option<u64>,
    topics: Option<BTreeSet<String>>,
    metadata_callback: Option<MetadataCallback>,
    attachment_callback: Option<AttachmentCallback>,
    tolerate_truncation: bool,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> LinearMessageIter<R> {
    pub fn new(reader: R, mut options: ReadOptions) -> McapResult<Self> {
        if options.order != ReadOrder::File {
            return Err(McapError::OrderRequiresIndex);
        }
        let mut lexer = Lexer::new_with_options(reader, options.lexer_options());
        for decompressor in options.decompressors.drain(..) {
            lexer = lexer.with_decompressor(decompressor);
        }
        Ok(Self {
            lexer,
            accumulator: ChannelAccumulator::default(),
            start_time: options.start_time,
            end_time: options.end_time,
            topics: options.topics.take(),
            metadata_callback: options.metadata_callback.take(),
            attachment_callback: options.attachment_callback.take(),
            tolerate_truncation: options.flags.contains(Options::IgnoreEndMagic),
            buf: Vec::new(),
            done: false,
        })
    }

    /// Gets the channel with the given ID, once its record has streamed past.
    pub fn get_channel(&self, channel_id: u16) -> Option<Arc<Channel<'static>>> {
        self.accumulator.get(channel_id)
    }

    fn next_inner(&mut self) -> McapResult<Option<Message<'static>>> {
        loop {
            let opcode = match self.lexer.read_next(&mut self.buf) {
                Ok(Some(opcode)) => opcode,
                Ok(None) => return Ok(None),
                Err(err) if self.tolerate_truncation && is_truncation(&err) => {
                    log::warn!("stopping at truncated tail: {err}");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            match opcode {
                OpCode::Schema => {
                    let (header, data) = parse::parse_schema(&self.buf)?;
                    self.accumulator
                        .add_schema(header, Cow::Owned(data.to_vec()))?;
                }
                OpCode::Channel => {
                    self.accumulator.add_channel(parse::parse_channel(&self.buf)?)?;
                }
                OpCode::Message => {
                    let (header, data) = parse::parse_message(&self.buf)?;
                    let Some(channel) = self.accumulator.get(header.channel_id) else {
                        log::debug!(
                            "skipping message on channel {} before its channel record",
                            header.channel_id
                        );
                        continue;
                    };
                    if let Some(topics) = &self.topics {
                        if !topics.contains(&channel.topic) {
                            continue;
                        }
                    }
                    if let Some(start) = self.start_time {
                        if header.log_time < start {
                            continue;
                        }
                    }
                    if let Some(end) = self.end_time {
                        if header.log_time >= end {
                            continue;
                        }
                    }
                    return Ok(Some(Message {
                        channel,
                        sequence: header.sequence,
                        log_time: header.log_time,
                        publish_time: header.publish_time,
                        data: Cow::Owned(data.to_vec()),
                    }));
                }
                OpCode::Metadata => {
                    if let Some(callback) = &mut self.metadata_callback {
                        callback(&parse::parse_metadata(&self.buf)?)?;
                    }
                }
                OpCode::Attachment => {
                    if let Some(callback) = &mut self.attachment_callback {
                        let (header, data, _crc) = parse::parse_attachment(&self.buf)?;
                        callback(&header, data)?;
                    }
                }
                _other => {}
            }
        }
    }
}

fn is_truncation(err: &McapError) -> bool {
    matches!(
        err,
        McapError::TruncatedRecord { .. }
            | McapError::UnexpectedEof
            | McapError::UnexpectedEoc
            | McapError::BadMagic {
                location: MagicLocation::End,
                ..
            }
    )
}

impl<R: Read> Iterator for LinearMessageIter<R> {
    type Item = McapResult<Message<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_inner() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

enum MessageIterInner<R: Read + Seek> {
    Indexed(IndexedMessageIter<R>),
    Linear(LinearMessageIter<R>),
}

/// Reads messages from an MCAP file, filtered by time range and topic, in
/// file, log-time, or reverse log-time order.
///
/// When the file has a summary, chunks are located through it and expanded
/// lazily; otherwise (or when `use_index` is off) the file is scanned
/// linearly, which permits only file order.
pub struct MessageIter<R: Read + Seek> {
    inner: MessageIterInner<R>,
}

impl<R: Read + Seek> MessageIter<R> {
    pub fn new(mut reader: R, options: ReadOptions) -> McapResult<Self> {
        if !options.use_index {
            if options.order != ReadOrder::File {
                return Err(McapError::OrderRequiresIndex);
            }
            reader.seek(SeekFrom::Start(0))?;
            return Ok(Self {
                inner: MessageIterInner::Linear(LinearMessageIter::new(reader, options)?),
            });
        }

        // A file too short to hold a footer can still be a valid (if empty or
        // interrupted) data section; serve it with a linear scan.
        let summary = match Summary::read(&mut reader) {
            Ok(summary) => summary,
            Err(McapError::UnexpectedEof) => None,
            Err(err) => return Err(err),
        };
        let inner = match summary {
            // Without chunk indexes there is nothing to seek to: a file-order
            // scan serves unchunked data sections, and the time orders have
            // no index to honor their guarantees with.
            Some(summary) if summary.chunk_indexes.is_empty() => {
                if options.order != ReadOrder::File {
                    return Err(McapError::NoIndexAvailable);
                }
                reader.seek(SeekFrom::Start(0))?;
                MessageIterInner::Linear(LinearMessageIter::new(reader, options)?)
            }
            Some(summary) => {
                MessageIterInner::Indexed(IndexedMessageIter::new(reader, summary, options)?)
            }
            None if options.order == ReadOrder::File => {
                reader.seek(SeekFrom::Start(0))?;
                MessageIterInner::Linear(LinearMessageIter::new(reader, options)?)
            }
            None => return Err(McapError::NoIndexAvailable),
        };
        Ok(Self { inner })
    }

    /// The parsed summary, when iterating through the index.
    pub fn summary(&self) -> Option<&Summary> {
        match &self.inner {
            MessageIterInner::Indexed(indexed) => Some(indexed.summary()),
            MessageIterInner::Linear(_) => None,
        }
    }
}

impl<R: Read + Seek> Iterator for MessageIter<R> {
    type Item = McapResult<Message<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            MessageIterInner::Indexed(indexed) => indexed.next(),
            MessageIterInner::Linear(linear) => linear.next(),
        }
    }
}

fn read_index_span<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    length: u64,
) -> McapResult<Vec<u8>> {
    let length: usize = length.try_into().map_err(|_| McapError::TooLong(length))?;
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0; length];
    if let Err(err) = reader.read_exact(&mut buf) {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(McapError::BadIndex);
        }
        return Err(err.into());
    }
    Ok(buf)
}

/// Reads the attachment referenced by the given summary index entry,
/// verifying its CRC when one is stored.
pub fn read_attachment<R: Read + Seek>(
    reader: &mut R,
    index: &records::AttachmentIndex,
) -> McapResult<Attachment<'static>> {
    read_attachment_with(reader, index, true)
}

/// As [`read_attachment`], with CRC verification under the caller's control.
/// The indexed iterator's attachment prefetch routes the reader's
/// `compute_attachment_crcs` option through here so both read paths agree.
pub(crate) fn read_attachment_with<R: Read + Seek>(
    reader: &mut R,
    index: &records::AttachmentIndex,
    compute_crc: bool,
) -> McapResult<Attachment<'static>> {
    let span = read_index_span(reader, index.offset, index.length)?;
    let mut lexer = Lexer::new_with_options(
        &span[..],
        LexerOptions::default()
            .with_skip_start_magic(true)
            .with_compute_attachment_crcs(compute_crc),
    );
    let mut buf = Vec::new();
    match lexer.read_next(&mut buf)? {
        Some(OpCode::Attachment) => {}
        _ => return Err(McapError::BadIndex),
    }
    let (header, data, _crc) = parse::parse_attachment(&buf)?;
    if !matches!(lexer.read_next(&mut Vec::new()), Ok(None)) {
        // Wut - multiple records in the indexed span?
        return Err(McapError::BadIndex);
    }
    Ok(Attachment {
        log_time: header.log_time,
        create_time: header.create_time,
        name: header.name,
        media_type: header.media_type,
        data: Cow::Owned(data.to_vec()),
    })
}

/// Reads the metadata record referenced by the given summary index entry.
pub fn read_metadata<R: Read + Seek>(
    reader: &mut R,
    index: &records::MetadataIndex,
) -> McapResult<records::Metadata> {
    let span = read_index_span(reader, index.offset, index.length)?;
    let mut lexer = Lexer::new_with_options(
        &span[..],
        LexerOptions::default().with_skip_start_magic(true),
    );
    let mut buf = Vec::new();
    match lexer.read_next(&mut buf)? {
        Some(OpCode::Metadata) => {}
        _ => return Err(McapError::BadIndex),
    }
    let metadata = parse::parse_metadata(&buf)?;
    if !matches!(lexer.read_next(&mut Vec::new()), Ok(None)) {
        return Err(McapError::BadIndex);
    }
    Ok(metadata)
}
