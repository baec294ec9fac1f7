//! Accumulates schemas, channels, and messages into one compressed chunk.

use std::{collections::HashMap, io::Write};

use crate::{
    compression::{ChunkCompressor, Compressor},
    io_utils::CountingCrcWriter,
    records::{self, MessageHeader, MessageIndexEntry, SchemaHeader},
    write::ser,
    Compression, CompressionLevel, McapResult,
};

/// Builds chunk records in memory, tracking the per-channel message indices,
/// message time bounds, and the CRC of the uncompressed record stream.
///
/// The builder is reused across chunks: [`finish`](Self::finish) emits the
/// completed chunk and its message indices, then resets.
pub(crate) struct ChunkBuilder {
    compression: Option<Compression>,
    level: CompressionLevel,
    // An injected codec, parked here between chunks.
    custom: Option<Box<dyn ChunkCompressor>>,
    // The compressor for the in-progress chunk; None when the chunk is empty.
    active: Option<CountingCrcWriter<Compressor>>,
    // Per-channel (log_time, uncompressed offset) entries, in the order each
    // channel first appeared in this chunk.
    indexes: Vec<(u16, Vec<MessageIndexEntry>)>,
    index_slots: HashMap<u16, usize>,
    message_bounds: Option<(u64, u64)>,
}

impl ChunkBuilder {
    pub fn new(
        compression: Option<Compression>,
        level: CompressionLevel,
        custom: Option<Box<dyn ChunkCompressor>>,
    ) -> Self {
        Self {
            compression,
            level,
            custom,
            active: None,
            indexes: Vec::new(),
            index_slots: HashMap::new(),
            message_bounds: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none()
    }

    /// Bytes written to the uncompressed record stream so far.
    pub fn uncompressed_size(&self) -> u64 {
        self.active.as_ref().map(|a| a.position()).unwrap_or(0)
    }

    fn writer(&mut self) -> McapResult<&mut CountingCrcWriter<Compressor>> {
        if self.active.is_none() {
            let compressor = Compressor::new(self.compression, self.level, self.custom.take())?;
            self.active = Some(CountingCrcWriter::new(compressor));
        }
        Ok(self.active.as_mut().expect("compressor was just created"))
    }

    pub fn write_schema(&mut self, header: &SchemaHeader, data: &[u8]) -> McapResult<()> {
        Ok(ser::write_schema(self.writer()?, header, data)?)
    }

    pub fn write_channel(&mut self, channel: &records::Channel) -> McapResult<()> {
        Ok(ser::write_channel(self.writer()?, channel)?)
    }

    pub fn write_message(&mut self, header: &MessageHeader, data: &[u8]) -> McapResult<()> {
        self.message_bounds = Some(match self.message_bounds {
            None => (header.log_time, header.log_time),
            Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
        });

        let writer = self.writer()?;
        let offset = writer.position();
        ser::write_message(writer, header, data)?;

        let slot = *self
            .index_slots
            .entry(header.channel_id)
            .or_insert_with(|| {
                self.indexes.push((header.channel_id, Vec::new()));
                self.indexes.len() - 1
            });
        self.indexes[slot].1.push(MessageIndexEntry {
            log_time: header.log_time,
            offset,
        });
        Ok(())
    }

    /// Closes the compressor, writes the chunk record followed by one message
    /// index per channel (in channel insertion order), and resets the builder.
    ///
    /// Returns `None` if no records were written: empty chunks are never
    /// flushed.
    pub fn finish<W: Write>(
        &mut self,
        sink: &mut CountingCrcWriter<W>,
        include_crc: bool,
        skip_message_indexing: bool,
    ) -> McapResult<Option<records::ChunkIndex>> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };
        let uncompressed_size = active.position();
        let compression = active.get_mut().name().to_string();
        let (compressor, crc) = active.finalize();
        let uncompressed_crc = if include_crc { crc } else { 0 };
        let (compressed, custom) = compressor.finish()?;
        if custom.is_some() {
            self.custom = custom;
        }

        let (message_start_time, message_end_time) = self.message_bounds.take().unwrap_or((0, 0));
        let chunk_start_offset = sink.position();

        let header = records::ChunkHeader {
            message_start_time,
            message_end_time,
            uncompressed_size,
            uncompressed_crc,
            compression,
            compressed_size: compressed.len() as u64,
        };
        ser::write_chunk(sink, &header, &compressed)?;
        let chunk_end = sink.position();

        let mut message_index_offsets = std::collections::BTreeMap::new();
        if skip_message_indexing {
            self.indexes.clear();
        } else {
            for (channel_id, mut entries) in self.indexes.drain(..) {
                sort_entries(&mut entries);
                message_index_offsets.insert(channel_id, sink.position());
                ser::write_message_index(sink, channel_id, &entries)?;
            }
        }
        self.index_slots.clear();
        let message_index_length = sink.position() - chunk_end;

        Ok(Some(records::ChunkIndex {
            message_start_time,
            message_end_time,
            chunk_start_offset,
            chunk_length: chunk_end - chunk_start_offset,
            message_index_offsets,
            message_index_length,
            compression: header.compression,
            compressed_size: header.compressed_size,
            uncompressed_size,
        }))
    }
}

/// Insertion sort by `(log_time, offset)`. Entries arrive in offset order and
/// log times are usually nearly monotonic, so this is close to a single pass.
fn sort_entries(entries: &mut [MessageIndexEntry]) {
    for i in 1..entries.len() {
        let mut j = i;
        while j > 0
            && (entries[j].log_time, entries[j].offset)
                < (entries[j - 1].log_time, entries[j - 1].offset)
        {
            entries.swap(j, j - 1);
            j -= 1;
        }
    }
}
