//! Index-driven message iteration.
//!
//! Chunks are located through the summary's chunk indexes and expanded
//! lazily: a chunk is decompressed only once the requested order may need a
//! message from it. Decompressed chunks live in a slot pool and are reused
//! once every message they held has been yielded, bounding peak memory to the
//! set of chunks whose time ranges overlap.

use std::{
    borrow::Cow,
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
    io::{Read, Seek, SeekFrom},
};

use crate::{
    compression::{get_decompressor, Decompressor},
    parse,
    read::{read_attachment_with, read_metadata, ReadOptions, ReadOrder, Summary},
    records::{self, op, OpCode},
    McapError, McapResult, Message,
};

struct ChunkSlot {
    buf: Vec<u8>,
    // Messages indexed in this slot but not yet yielded. The slot is free for
    // reuse once this reaches zero.
    outstanding: usize,
}

/// One element of the range-index heap: either a chunk that has not been
/// expanded yet, or a pointer to a message inside a decompressed chunk slot.
#[derive(Clone, Copy)]
enum HeapEntry {
    Chunk {
        index: usize,
    },
    Message {
        slot: usize,
        chunk: usize,
        offset: usize,
        log_time: u64,
    },
}

pub(crate) struct IndexedMessageIter<R: Read + Seek> {
    reader: R,
    summary: Summary,
    order: ReadOrder,
    start_time: Option<u64>,
    end_time: Option<u64>,
    // None yields every channel; Some yields only these IDs.
    channel_filter: Option<BTreeSet<u16>>,
    validate_chunk_crcs: bool,
    max_record_size: Option<usize>,
    max_decompressed_chunk_size: Option<usize>,
    decompressors: HashMap<String, Box<dyn Decompressor>>,
    // Chunk indexes that survived the time/topic pre-filter.
    chunk_indexes: Vec<records::ChunkIndex>,
    slots: Vec<ChunkSlot>,
    heap: Vec<HeapEntry>,
    // Compressed chunk bytes, reused between expansions.
    scratch: Vec<u8>,
    done: bool,
}

impl<R: Read + Seek> IndexedMessageIter<R> {
    pub(crate) fn new(
        mut reader: R,
        summary: Summary,
        mut options: ReadOptions,
    ) -> McapResult<Self> {
        // Indexed iteration never revisits metadata or attachment records, so
        // callbacks are served from the summary's indexes up front.
        if let Some(callback) = options.metadata_callback.as_mut() {
            for index in &summary.metadata_indexes {
                let metadata = read_metadata(&mut reader, index)?;
                callback(&metadata)?;
            }
        }
        if let Some(callback) = options.attachment_callback.as_mut() {
            for index in &summary.attachment_indexes {
                let attachment =
                    read_attachment_with(&mut reader, index, options.compute_attachment_crcs)?;
                let header = records::AttachmentHeader {
                    log_time: attachment.log_time,
                    create_time: attachment.create_time,
                    name: attachment.name.clone(),
                    media_type: attachment.media_type.clone(),
                };
                callback(&header, &attachment.data)?;
            }
        }

        let channel_filter = options.topics.take().map(|topics| {
            summary
                .channels
                .iter()
                .filter(|(_, channel)| topics.contains(&channel.topic))
                .map(|(&id, _)| id)
                .collect::<BTreeSet<u16>>()
        });

        let chunk_indexes: Vec<records::ChunkIndex> = summary
            .chunk_indexes
            .iter()
            .filter(|index| {
                if let Some(start) = options.start_time {
                    if index.message_end_time < start {
                        return false;
                    }
                }
                if let Some(end) = options.end_time {
                    if index.message_start_time >= end {
                        return false;
                    }
                }
                match &channel_filter {
                    // NOTE: a chunk with no message index offsets can't be
                    // rejected; the file may not include message indexing.
                    Some(ids) => {
                        index.message_index_offsets.is_empty()
                            || index.message_index_offsets.keys().any(|id| ids.contains(id))
                    }
                    None => true,
                }
            })
            .cloned()
            .collect();

        // Check all chunk indexes once so every later size conversion fits.
        for index in &chunk_indexes {
            if index.compressed_size > usize::MAX as u64 {
                return Err(McapError::TooLong(index.compressed_size));
            }
            if index.uncompressed_size > usize::MAX as u64 {
                return Err(McapError::TooLong(index.uncompressed_size));
            }
        }

        let mut decompressors = HashMap::new();
        for decompressor in options.decompressors.drain(..) {
            decompressors.insert(decompressor.name().to_string(), decompressor);
        }

        let mut iter = Self {
            reader,
            summary,
            order: options.order,
            start_time: options.start_time,
            end_time: options.end_time,
            channel_filter,
            validate_chunk_crcs: options.validate_chunk_crcs,
            max_record_size: options.max_record_size,
            max_decompressed_chunk_size: options.max_decompressed_chunk_size,
            decompressors,
            heap: Vec::with_capacity(chunk_indexes.len()),
            chunk_indexes,
            slots: Vec::new(),
            scratch: Vec::new(),
            done: false,
        };
        for index in 0..iter.chunk_indexes.len() {
            iter.heap_push(HeapEntry::Chunk { index })?;
        }
        Ok(iter)
    }

    pub(crate) fn summary(&self) -> &Summary {
        &self.summary
    }

    pub(crate) fn next(&mut self) -> Option<McapResult<Message<'static>>> {
        if self.done {
            return None;
        }
        loop {
            match self.heap_pop() {
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Ok(Some(HeapEntry::Chunk { index })) => {
                    if let Err(err) = self.expand_chunk(index) {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
                Ok(Some(HeapEntry::Message { slot, offset, .. })) => {
                    return Some(match self.yield_message(slot, offset) {
                        Ok(message) => Ok(message),
                        Err(err) => {
                            self.done = true;
                            Err(err)
                        }
                    });
                }
            }
        }
    }

    /// Seeks to the chunk, decompresses it into a free slot, and queues every
    /// in-range message it holds.
    fn expand_chunk(&mut self, index: usize) -> McapResult<()> {
        let chunk_index = &self.chunk_indexes[index];
        if let Some(limit) = self.max_record_size {
            if chunk_index.chunk_length > limit as u64 {
                return Err(McapError::RecordTooLarge {
                    opcode: OpCode::Chunk,
                    len: chunk_index.chunk_length,
                    limit: limit as u64,
                });
            }
        }
        if let Some(limit) = self.max_decompressed_chunk_size {
            if chunk_index.uncompressed_size > limit as u64 {
                return Err(McapError::ChunkTooLarge {
                    len: chunk_index.uncompressed_size,
                    limit: limit as u64,
                });
            }
        }
        if chunk_index.chunk_length < 9 {
            return Err(McapError::BadIndex);
        }
        let body_len: usize = (chunk_index.chunk_length - 9)
            .try_into()
            .map_err(|_| McapError::TooLong(chunk_index.chunk_length))?;

        self.reader
            .seek(SeekFrom::Start(chunk_index.chunk_start_offset))?;
        let mut framing = [0u8; 9];
        read_fully(&mut self.reader, &mut framing)?;
        let stored_len = u64::from_le_bytes(framing[1..9].try_into().expect("framing is 9 bytes"));
        if framing[0] != op::CHUNK || stored_len != body_len as u64 {
            return Err(McapError::BadIndex);
        }
        self.scratch.resize(body_len, 0);
        read_fully(&mut self.reader, &mut self.scratch)?;

        let (header, records_data) = parse::parse_chunk(&self.scratch)?;
        let uncompressed_size: usize = header
            .uncompressed_size
            .try_into()
            .map_err(|_| McapError::TooLong(header.uncompressed_size))?;

        let slot_index = find_or_make_chunk_slot(&mut self.slots, uncompressed_size);
        let slot = &mut self.slots[slot_index];
        if header.compression.is_empty() {
            slot.buf.clear();
            slot.buf.extend_from_slice(records_data);
        } else {
            let decompressor = get_decompressor(&mut self.decompressors, &header.compression)?;
            decompressor.decompress(records_data, &mut slot.buf, uncompressed_size)?;
        }

        if self.validate_chunk_crcs && header.uncompressed_crc != 0 {
            let calculated = crc32fast::hash(&slot.buf);
            if calculated != header.uncompressed_crc {
                return Err(McapError::BadChunkCrc {
                    saved: header.uncompressed_crc,
                    calculated,
                });
            }
        }

        let found = scan_slot(
            &self.slots[slot_index].buf,
            self.start_time,
            self.end_time,
            self.channel_filter.as_ref(),
        )?;
        self.slots[slot_index].outstanding = found.len();
        for (offset, log_time) in found {
            self.heap_push(HeapEntry::Message {
                slot: slot_index,
                chunk: index,
                offset,
                log_time,
            })?;
        }
        Ok(())
    }

    fn yield_message(&mut self, slot: usize, offset: usize) -> McapResult<Message<'static>> {
        let buf = &self.slots[slot].buf;
        let record = &buf[offset..];
        let len = u64::from_le_bytes(record[1..9].try_into().expect("scanned record header"));
        let (header, data) = parse::parse_message(&record[9..9 + len as usize])?;
        let channel = match self.summary.channels.get(&header.channel_id) {
            Some(channel) => channel.clone(),
            None => {
                return Err(McapError::UnknownChannel(
                    header.sequence,
                    header.channel_id,
                ))
            }
        };
        let message = Message {
            channel,
            sequence: header.sequence,
            log_time: header.log_time,
            publish_time: header.publish_time,
            data: Cow::Owned(data.to_vec()),
        };
        self.slots[slot].outstanding -= 1;
        Ok(message)
    }

    /// The priority key of a heap entry: `(time, chunk file offset, in-chunk
    /// offset)`. Ties on time fall back to file position, so forward orders
    /// yield the earlier-in-file message first and the reverse order the
    /// later one. Unexpanded chunks sort at their earliest (or, reversed,
    /// latest) possible message time.
    fn entry_key(&self, entry: &HeapEntry) -> (u64, u64, u64) {
        match entry {
            HeapEntry::Chunk { index } => {
                let chunk = &self.chunk_indexes[*index];
                match self.order {
                    ReadOrder::File => (0, chunk.chunk_start_offset, 0),
                    ReadOrder::LogTime => (chunk.message_start_time, chunk.chunk_start_offset, 0),
                    ReadOrder::ReverseLogTime => {
                        (chunk.message_end_time, chunk.chunk_start_offset, u64::MAX)
                    }
                }
            }
            HeapEntry::Message {
                chunk,
                offset,
                log_time,
                ..
            } => {
                let chunk = &self.chunk_indexes[*chunk];
                match self.order {
                    ReadOrder::File => (0, chunk.chunk_start_offset, *offset as u64),
                    ReadOrder::LogTime | ReadOrder::ReverseLogTime => {
                        (*log_time, chunk.chunk_start_offset, *offset as u64)
                    }
                }
            }
        }
    }

    /// `Less` means "yields first". Comparing a chunk against a message from
    /// that same chunk means the chunk was both expanded and re-queued, which
    /// would duplicate messages; it is reported instead of ordered.
    fn compare(&self, a: &HeapEntry, b: &HeapEntry) -> McapResult<Ordering> {
        match (a, b) {
            (HeapEntry::Chunk { index }, HeapEntry::Message { chunk, .. })
            | (HeapEntry::Message { chunk, .. }, HeapEntry::Chunk { index })
                if index == chunk =>
            {
                return Err(McapError::RepushedChunk);
            }
            _ => {}
        }
        let (key_a, key_b) = (self.entry_key(a), self.entry_key(b));
        Ok(match self.order {
            ReadOrder::ReverseLogTime => key_b.cmp(&key_a),
            ReadOrder::File | ReadOrder::LogTime => key_a.cmp(&key_b),
        })
    }

    fn compare_at(&self, i: usize, j: usize) -> McapResult<Ordering> {
        self.compare(&self.heap[i], &self.heap[j])
    }

    fn heap_push(&mut self, entry: HeapEntry) -> McapResult<()> {
        self.heap.push(entry);
        let mut at = self.heap.len() - 1;
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.compare_at(at, parent)? == Ordering::Less {
                self.heap.swap(at, parent);
                at = parent;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn heap_pop(&mut self) -> McapResult<Option<HeapEntry>> {
        if self.heap.is_empty() {
            return Ok(None);
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop().expect("heap is non-empty");
        let mut at = 0;
        loop {
            let left = 2 * at + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let first = if right < self.heap.len() && self.compare_at(right, left)? == Ordering::Less
            {
                right
            } else {
                left
            };
            if self.compare_at(first, at)? == Ordering::Less {
                self.heap.swap(first, at);
                at = first;
            } else {
                break;
            }
        }
        Ok(Some(top))
    }
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> McapResult<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            McapError::BadIndex
        } else {
            err.into()
        }
    })
}

/// Walks a decompressed chunk, returning `(offset, log_time)` for every
/// message that passes the filters.
fn scan_slot(
    buf: &[u8],
    start_time: Option<u64>,
    end_time: Option<u64>,
    channel_filter: Option<&BTreeSet<u16>>,
) -> McapResult<Vec<(usize, u64)>> {
    let mut found = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let record = &buf[offset..];
        if record.len() < 9 {
            return Err(McapError::UnexpectedEoc);
        }
        let opcode = record[0];
        if opcode == op::CHUNK {
            return Err(McapError::NestedChunk);
        }
        let len = u64::from_le_bytes(record[1..9].try_into().expect("9-byte record header"));
        let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
        if record.len() - 9 < len {
            return Err(McapError::UnexpectedEoc);
        }
        if opcode == op::MESSAGE {
            let (header, _data) = parse::parse_message(&record[9..9 + len])?;
            let in_range = start_time.map(|start| header.log_time >= start).unwrap_or(true)
                && end_time.map(|end| header.log_time < end).unwrap_or(true);
            let on_channel = channel_filter
                .map(|ids| ids.contains(&header.channel_id))
                .unwrap_or(true);
            if in_range && on_channel {
                found.push((offset, header.log_time));
            }
        }
        offset += 9 + len;
    }
    Ok(found)
}

/// Finds a slot with no outstanding messages, or grows the pool by one.
fn find_or_make_chunk_slot(slots: &mut Vec<ChunkSlot>, uncompressed_size: usize) -> usize {
    for (at, slot) in slots.iter_mut().enumerate() {
        if slot.outstanding == 0 {
            slot.buf.clear();
            slot.buf.reserve(uncompressed_size);
            return at;
        }
    }
    slots.push(ChunkSlot {
        buf: Vec::with_capacity(uncompressed_size),
        outstanding: 0,
    });
    slots.len() - 1
}
