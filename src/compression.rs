//! Chunk codecs: compressors used by the [`Writer`](crate::Writer) and
//! decompressors used by the [`Lexer`](crate::Lexer) and indexed reads.
//!
//! Codecs are looked up by the compression name stored in each chunk:
//! `""` (identity), `"zstd"`, and `"lz4"` are built in; callers may inject
//! their own implementations of [`ChunkCompressor`] and [`Decompressor`] to
//! override or extend these.

use std::{
    collections::HashMap,
    io::{self, Write},
};

use crate::{Compression, CompressionLevel, McapError, McapResult};

/// A caller-supplied chunk compressor.
///
/// One instance is reused for the whole file: [`finish`](Self::finish)
/// finalizes the current frame, hands back its bytes, and leaves the codec
/// ready for the next chunk.
pub trait ChunkCompressor: Send {
    /// The compression string stored in chunks this codec produces.
    fn name(&self) -> &str;
    fn write(&mut self, data: &[u8]) -> McapResult<()>;
    /// Flush-and-finalize: returns a complete standalone frame and resets.
    fn finish(&mut self) -> McapResult<Vec<u8>>;
}

/// A caller-supplied chunk decompressor.
///
/// One instance per compression name is owned by each reader and moved from
/// chunk to chunk; [`reset`](Self::reset) is called before each use.
pub trait Decompressor: Send {
    /// The compression string this codec handles.
    fn name(&self) -> &str;
    /// Resets any internal stream state before a new chunk.
    fn reset(&mut self) -> McapResult<()>;
    /// Clears `dst` and fills it with exactly `uncompressed_size` bytes
    /// decompressed from `src`.
    fn decompress(
        &mut self,
        src: &[u8],
        dst: &mut Vec<u8>,
        uncompressed_size: usize,
    ) -> McapResult<()>;
}

#[cfg(feature = "zstd")]
struct ZstdDecompressor;

#[cfg(feature = "zstd")]
impl Decompressor for ZstdDecompressor {
    fn name(&self) -> &str {
        "zstd"
    }

    fn reset(&mut self) -> McapResult<()> {
        Ok(())
    }

    fn decompress(
        &mut self,
        src: &[u8],
        dst: &mut Vec<u8>,
        uncompressed_size: usize,
    ) -> McapResult<()> {
        dst.clear();
        dst.resize(uncompressed_size, 0);
        let wrote = zstd::zstd_safe::decompress(&mut dst[..], src)
            .map_err(|err| McapError::DecompressionError(zstd::zstd_safe::get_error_name(err).into()))?;
        if wrote != uncompressed_size {
            return Err(McapError::DecompressionError(format!(
                "zstd frame decompressed to {wrote} bytes, chunk declared {uncompressed_size}"
            )));
        }
        Ok(())
    }
}

#[cfg(feature = "lz4")]
struct Lz4Decompressor;

#[cfg(feature = "lz4")]
impl Decompressor for Lz4Decompressor {
    fn name(&self) -> &str {
        "lz4"
    }

    fn reset(&mut self) -> McapResult<()> {
        Ok(())
    }

    fn decompress(
        &mut self,
        src: &[u8],
        dst: &mut Vec<u8>,
        uncompressed_size: usize,
    ) -> McapResult<()> {
        use std::io::Read;
        dst.clear();
        dst.resize(uncompressed_size, 0);
        let mut decoder = lz4::Decoder::new(src)?;
        decoder.read_exact(&mut dst[..])?;
        Ok(())
    }
}

/// Finds the decompressor for `name`, creating a built-in on first use.
/// The identity compression `""` never reaches this lookup.
pub(crate) fn get_decompressor<'a>(
    decompressors: &'a mut HashMap<String, Box<dyn Decompressor>>,
    name: &str,
) -> McapResult<&'a mut Box<dyn Decompressor>> {
    if !decompressors.contains_key(name) {
        let built: Box<dyn Decompressor> = match name {
            #[cfg(feature = "zstd")]
            "zstd" => Box::new(ZstdDecompressor),
            #[cfg(feature = "lz4")]
            "lz4" => Box::new(Lz4Decompressor),
            other => return Err(McapError::UnsupportedCompression(other.into())),
        };
        decompressors.insert(name.to_string(), built);
    }
    let decompressor = decompressors
        .get_mut(name)
        .expect("decompressor was just inserted");
    decompressor.reset()?;
    Ok(decompressor)
}

fn zstd_level(level: CompressionLevel) -> i32 {
    match level {
        CompressionLevel::Fastest => 1,
        // 0 selects the library's own default
        CompressionLevel::Default => 0,
        CompressionLevel::Better => 11,
        CompressionLevel::Best => 19,
    }
}

fn lz4_level(level: CompressionLevel) -> u32 {
    match level {
        CompressionLevel::Fastest | CompressionLevel::Default => 0,
        CompressionLevel::Better => 6,
        CompressionLevel::Best => 12,
    }
}

/// The writer side of one chunk: compresses into an in-memory buffer that is
/// emitted once the chunk's final sizes are known.
pub(crate) enum Compressor {
    Null(Vec<u8>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::Encoder<'static, Vec<u8>>),
    #[cfg(feature = "lz4")]
    Lz4(lz4::Encoder<Vec<u8>>),
    Custom(Box<dyn ChunkCompressor>),
}

impl Compressor {
    pub fn new(
        compression: Option<Compression>,
        level: CompressionLevel,
        custom: Option<Box<dyn ChunkCompressor>>,
    ) -> McapResult<Self> {
        if let Some(custom) = custom {
            return Ok(Compressor::Custom(custom));
        }
        Ok(match compression {
            #[cfg(feature = "zstd")]
            Some(Compression::Zstd) => {
                #[allow(unused_mut)]
                let mut enc = zstd::Encoder::new(Vec::new(), zstd_level(level))?;
                #[cfg(not(target_arch = "wasm32"))]
                enc.multithread(num_cpus::get_physical() as u32)?;
                Compressor::Zstd(enc)
            }
            #[cfg(feature = "lz4")]
            Some(Compression::Lz4) => Compressor::Lz4(
                lz4::EncoderBuilder::new()
                    .level(lz4_level(level))
                    // Disable the block checksum for wider compatibility with MCAP tooling that
                    // includes a fault block checksum calculation. Since the MCAP spec includes a
                    // CRC for the compressed chunk this would be a superfluous check anyway.
                    .block_checksum(lz4::liblz4::BlockChecksum::NoBlockChecksum)
                    .build(Vec::new())?,
            ),
            #[cfg(not(any(feature = "zstd", feature = "lz4")))]
            Some(_) => unreachable!("`Compression` is an empty enum that cannot be instantiated"),
            None => Compressor::Null(Vec::new()),
        })
    }

    /// The compression string stored in the chunk record.
    pub fn name(&self) -> &str {
        match self {
            Compressor::Null(_) => "",
            #[cfg(feature = "zstd")]
            Compressor::Zstd(_) => "zstd",
            #[cfg(feature = "lz4")]
            Compressor::Lz4(_) => "lz4",
            Compressor::Custom(c) => c.name(),
        }
    }

    /// Finalizes the frame, returning the compressed bytes and, for injected
    /// codecs, the codec itself for reuse on the next chunk.
    pub fn finish(self) -> McapResult<(Vec<u8>, Option<Box<dyn ChunkCompressor>>)> {
        Ok(match self {
            Compressor::Null(buf) => (buf, None),
            #[cfg(feature = "zstd")]
            Compressor::Zstd(enc) => (enc.finish()?, None),
            #[cfg(feature = "lz4")]
            Compressor::Lz4(enc) => {
                let (buf, result) = enc.finish();
                result?;
                (buf, None)
            }
            Compressor::Custom(mut c) => {
                let buf = c.finish()?;
                (buf, Some(c))
            }
        })
    }
}

impl Write for Compressor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Null(w) => w.write(buf),
            #[cfg(feature = "zstd")]
            Compressor::Zstd(w) => w.write(buf),
            #[cfg(feature = "lz4")]
            Compressor::Lz4(w) => w.write(buf),
            Compressor::Custom(c) => match c.write(buf) {
                Ok(()) => Ok(buf.len()),
                Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Null(w) => w.flush(),
            #[cfg(feature = "zstd")]
            Compressor::Zstd(w) => w.flush(),
            #[cfg(feature = "lz4")]
            Compressor::Lz4(w) => w.flush(),
            Compressor::Custom(_) => Ok(()),
        }
    }
}
