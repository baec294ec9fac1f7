//! Reads MCAP records out of a [`std::io::Read`] implementation, one at a time.
//!
//! The lexer is the lowest-level reader in this crate: it produces
//! `(opcode, record body)` pairs and transparently descends into compressed
//! chunks unless asked to emit them whole. Semantic checks (channel wiring,
//! time filtering) are left to the readers in [`crate::read`].

use std::{
    collections::HashMap,
    io::{self, Read},
};

use byteorder::{ReadBytesExt, LE};

use crate::{
    compression::{get_decompressor, Decompressor},
    parse,
    records::{op, OpCode},
    MagicLocation, McapError, McapResult, MAGIC,
};

/// Options for initializing a [`Lexer`].
#[derive(Debug, Default, Clone)]
pub struct LexerOptions {
    /// If true, the lexer will not attempt to read or validate start magic.
    /// This is useful for lexing a summary section or other mid-file ranges.
    pub skip_start_magic: bool,
    /// If true, yield entire chunk records instead of descending into them.
    pub emit_chunks: bool,
    /// Fully decompress each chunk up front and verify its CRC (when stored
    /// as non-zero) before yielding any of its records.
    pub validate_chunk_crcs: bool,
    /// Verify the trailing CRC of each attachment record against its body.
    pub compute_attachment_crcs: bool,
    /// If Some(limit), any record longer than `limit` bytes is an error.
    pub max_record_size: Option<usize>,
    /// If Some(limit), any chunk whose uncompressed size exceeds `limit` is an error.
    pub max_decompressed_chunk_size: Option<usize>,
}

impl LexerOptions {
    pub fn with_skip_start_magic(mut self, skip_start_magic: bool) -> Self {
        self.skip_start_magic = skip_start_magic;
        self
    }

    pub fn with_emit_chunks(mut self, emit_chunks: bool) -> Self {
        self.emit_chunks = emit_chunks;
        self
    }

    pub fn with_validate_chunk_crcs(mut self, validate_chunk_crcs: bool) -> Self {
        self.validate_chunk_crcs = validate_chunk_crcs;
        self
    }

    pub fn with_compute_attachment_crcs(mut self, compute_attachment_crcs: bool) -> Self {
        self.compute_attachment_crcs = compute_attachment_crcs;
        self
    }

    pub fn with_max_record_size(mut self, max_record_size: usize) -> Self {
        self.max_record_size = Some(max_record_size);
        self
    }

    pub fn with_max_decompressed_chunk_size(mut self, max: usize) -> Self {
        self.max_decompressed_chunk_size = Some(max);
        self
    }
}

enum State {
    Start,
    Lexing,
    FooterSeen,
    End,
    Lost,
}

// The decompressed contents of the chunk currently being read.
struct ChunkStream {
    buf: Vec<u8>,
    pos: usize,
    // File offset of the chunk record's opcode byte.
    base_offset: u64,
}

/// Reads records out of a [`Read`] implementation one at a time into a
/// caller-supplied buffer. The main interface is [`Lexer::read_next`].
pub struct Lexer<R: Read> {
    reader: R,
    state: State,
    options: LexerOptions,
    chunk: Option<ChunkStream>,
    decompressors: HashMap<String, Box<dyn Decompressor>>,
    // compressed chunk bytes, reused between chunks
    scratch: Vec<u8>,
    file_offset: u64,
    last_offsets: (u64, Option<u64>),
}

impl<R: Read> Lexer<R> {
    /// Creates a new lexer with default options.
    pub fn new(reader: R) -> Self {
        Self::new_with_options(reader, LexerOptions::default())
    }

    pub fn new_with_options(reader: R, options: LexerOptions) -> Self {
        Self {
            reader,
            state: if options.skip_start_magic {
                State::Lexing
            } else {
                State::Start
            },
            options,
            chunk: None,
            decompressors: HashMap::new(),
            scratch: Vec::new(),
            file_offset: 0,
            last_offsets: (0, None),
        }
    }

    /// Registers a decompressor, overriding any built-in with the same name.
    pub fn with_decompressor(mut self, decompressor: Box<dyn Decompressor>) -> Self {
        self.decompressors
            .insert(decompressor.name().to_string(), decompressor);
        self
    }

    /// The offsets of the most recently returned record: its byte offset in
    /// the file (for in-chunk records, the offset of the containing chunk),
    /// and its offset within the chunk's uncompressed stream, if any.
    pub fn last_record_offsets(&self) -> (u64, Option<u64>) {
        self.last_offsets
    }

    /// Consumes the lexer, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads the body of the next record into `out`, returning its opcode.
    ///
    /// Returns `Ok(None)` once the footer has been read or the stream ends
    /// cleanly at a record boundary. After an error the lexer is terminal and
    /// also returns `Ok(None)`.
    pub fn read_next(&mut self, out: &mut Vec<u8>) -> McapResult<Option<OpCode>> {
        match self.next_inner(out) {
            Ok(token) => Ok(token),
            Err(err) => {
                self.state = State::Lost;
                Err(err)
            }
        }
    }

    fn next_inner(&mut self, out: &mut Vec<u8>) -> McapResult<Option<OpCode>> {
        loop {
            match self.state {
                State::Start => {
                    let mut magic = [0u8; 8];
                    if let Err(err) = self.reader.read_exact(&mut magic) {
                        if err.kind() == io::ErrorKind::UnexpectedEof {
                            return Err(McapError::BadMagic {
                                location: MagicLocation::Start,
                                observed: Vec::new(),
                            });
                        }
                        return Err(err.into());
                    }
                    self.file_offset += 8;
                    if magic != MAGIC {
                        return Err(McapError::BadMagic {
                            location: MagicLocation::Start,
                            observed: magic.into(),
                        });
                    }
                    self.state = State::Lexing;
                }
                State::Lexing => {
                    if self.chunk.is_some() {
                        if let Some(token) = self.next_chunk_record(out)? {
                            return Ok(Some(token));
                        }
                        // chunk exhausted, fall through to the outer stream
                        continue;
                    }
                    match self.next_outer_record(out)? {
                        Some(token) => return Ok(Some(token)),
                        None => continue,
                    }
                }
                State::FooterSeen | State::End | State::Lost => return Ok(None),
            }
        }
    }

    /// Reads the next record out of the current chunk's decompressed stream,
    /// or returns `Ok(None)` when the chunk is exhausted.
    fn next_chunk_record(&mut self, out: &mut Vec<u8>) -> McapResult<Option<OpCode>> {
        loop {
            let chunk = self.chunk.as_mut().expect("in chunk mode");
            let remaining = chunk.buf.len() - chunk.pos;
            if remaining == 0 {
                self.chunk = None;
                return Ok(None);
            }
            if remaining < 9 {
                return Err(McapError::UnexpectedEoc);
            }
            let opcode_byte = chunk.buf[chunk.pos];
            if opcode_byte == op::CHUNK {
                return Err(McapError::NestedChunk);
            }
            // Attachments are data-section records; a chunk may only hold
            // schemas, channels, and messages.
            if opcode_byte == op::ATTACHMENT {
                return Err(McapError::UnexpectedToken {
                    expected: "schema, channel, or message",
                    found: OpCode::Attachment,
                });
            }
            let opcode = OpCode::try_from(opcode_byte)?;
            let len = u64::from_le_bytes(
                chunk.buf[chunk.pos + 1..chunk.pos + 9]
                    .try_into()
                    .expect("9-byte record header"),
            );
            let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
            if remaining - 9 < len {
                return Err(McapError::UnexpectedEoc);
            }
            let record_pos = chunk.pos;
            chunk.pos += 9 + len;
            if let OpCode::UserOpcode(other) = opcode {
                log::debug!("skipping unknown opcode {other:#04x} inside chunk");
                continue;
            }
            self.last_offsets = (chunk.base_offset, Some(record_pos as u64));
            out.clear();
            out.extend_from_slice(&chunk.buf[record_pos + 9..record_pos + 9 + len]);
            return Ok(Some(opcode));
        }
    }

    /// Reads the next record header from the outer stream. Returns `Ok(None)`
    /// after entering a chunk or skipping an unknown record, so the caller
    /// loops.
    fn next_outer_record(&mut self, out: &mut Vec<u8>) -> McapResult<Option<OpCode>> {
        let record_start = self.file_offset;
        let opcode_byte = match self.read_byte()? {
            Some(b) => b,
            None => {
                // Clean EOF at a record boundary. Tolerated so that the data
                // section of an interrupted write can still be scanned.
                self.state = State::End;
                return Ok(None);
            }
        };
        if opcode_byte == MAGIC[0] {
            return self.expect_end_magic();
        }
        if opcode_byte == 0x00 {
            return Err(McapError::InvalidOpcode);
        }
        let opcode = OpCode::try_from(opcode_byte)?;
        let len = match self.reader.read_u64::<LE>() {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(McapError::TruncatedRecord {
                    opcode,
                    expected: 9,
                    actual: 1,
                })
            }
            Err(err) => return Err(err.into()),
        };
        self.file_offset += 8;

        if let OpCode::UserOpcode(other) = opcode {
            log::debug!("skipping unknown opcode {other:#04x} ({len} bytes)");
            self.skip_body(opcode, len)?;
            return Ok(None);
        }
        if opcode == OpCode::Chunk && !self.options.emit_chunks {
            self.enter_chunk(record_start, len)?;
            return Ok(None);
        }

        if let Some(limit) = self.options.max_record_size {
            if len > limit as u64 {
                return Err(McapError::RecordTooLarge {
                    opcode,
                    len,
                    limit: limit as u64,
                });
            }
        }
        self.read_body(opcode, len, out)?;

        if opcode == OpCode::Footer {
            self.state = State::FooterSeen;
        }
        if opcode == OpCode::Attachment && self.options.compute_attachment_crcs {
            self.check_attachment_crc(out)?;
        }
        self.last_offsets = (record_start, None);
        Ok(Some(opcode))
    }

    /// Parses a chunk record and switches the lexer onto its decompressed
    /// record stream.
    fn enter_chunk(&mut self, record_start: u64, len: u64) -> McapResult<()> {
        if let Some(limit) = self.options.max_record_size {
            if len > limit as u64 {
                return Err(McapError::RecordTooLarge {
                    opcode: OpCode::Chunk,
                    len,
                    limit: limit as u64,
                });
            }
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        self.read_body(OpCode::Chunk, len, &mut scratch)?;
        let result = self.enter_chunk_body(record_start, &scratch);
        self.scratch = scratch;
        result
    }

    fn enter_chunk_body(&mut self, record_start: u64, body: &[u8]) -> McapResult<()> {
        let (header, records) = parse::parse_chunk(body)?;
        if let Some(limit) = self.options.max_decompressed_chunk_size {
            if header.uncompressed_size > limit as u64 {
                return Err(McapError::ChunkTooLarge {
                    len: header.uncompressed_size,
                    limit: limit as u64,
                });
            }
        }
        let uncompressed_size: usize = header
            .uncompressed_size
            .try_into()
            .map_err(|_| McapError::TooLong(header.uncompressed_size))?;

        let buf = if header.compression.is_empty() {
            records.to_vec()
        } else {
            let decompressor = get_decompressor(&mut self.decompressors, &header.compression)?;
            let mut buf = Vec::new();
            decompressor.decompress(records, &mut buf, uncompressed_size)?;
            buf
        };

        if self.options.validate_chunk_crcs && header.uncompressed_crc != 0 {
            let calculated = crc32fast::hash(&buf);
            if calculated != header.uncompressed_crc {
                return Err(McapError::BadChunkCrc {
                    saved: header.uncompressed_crc,
                    calculated,
                });
            }
        }

        self.chunk = Some(ChunkStream {
            buf,
            pos: 0,
            base_offset: record_start,
        });
        Ok(())
    }

    fn check_attachment_crc(&self, body: &[u8]) -> McapResult<()> {
        if body.len() < 4 {
            return Err(McapError::RecordTooShort);
        }
        let (covered, crc_bytes) = body.split_at(body.len() - 4);
        let saved = u32::from_le_bytes(crc_bytes.try_into().expect("split_at returned 4 bytes"));
        if saved != 0 {
            let calculated = crc32fast::hash(covered);
            if saved != calculated {
                return Err(McapError::BadAttachmentCrc { saved, calculated });
            }
        }
        Ok(())
    }

    fn read_byte(&mut self) -> McapResult<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.file_offset += 1;
                    return Ok(Some(byte[0]));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Called when the first magic byte shows up in opcode position: the only
    /// legal continuation is the trailing magic.
    fn expect_end_magic(&mut self) -> McapResult<Option<OpCode>> {
        let mut tail = [0u8; 7];
        let mut observed = vec![MAGIC[0]];
        match self.reader.read_exact(&mut tail) {
            Ok(()) => {
                self.file_offset += 7;
                observed.extend_from_slice(&tail);
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(err) => return Err(err.into()),
        }
        if observed == MAGIC {
            self.state = State::End;
            return Ok(None);
        }
        Err(McapError::BadMagic {
            location: MagicLocation::End,
            observed,
        })
    }

    fn read_body(&mut self, opcode: OpCode, len: u64, out: &mut Vec<u8>) -> McapResult<()> {
        let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
        out.resize(len, 0);
        let mut filled = 0;
        while filled < len {
            match self.reader.read(&mut out[filled..]) {
                Ok(0) => {
                    return Err(McapError::TruncatedRecord {
                        opcode,
                        expected: len as u64,
                        actual: filled as u64,
                    })
                }
                Ok(n) => {
                    filled += n;
                    self.file_offset += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn skip_body(&mut self, opcode: OpCode, len: u64) -> McapResult<()> {
        let copied = io::copy(&mut (&mut self.reader).take(len), &mut io::sink())?;
        self.file_offset += copied;
        if copied < len {
            return Err(McapError::TruncatedRecord {
                opcode,
                expected: len,
                actual: copied,
            });
        }
        Ok(())
    }
}
