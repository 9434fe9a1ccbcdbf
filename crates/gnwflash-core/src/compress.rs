//! Chunking, compression and hashing
//!
//! Images are cut into chunks the size of one context buffer. With LZMA
//! enabled each chunk is compressed as an LZMA1 ("alone") stream, preset 6
//! with a 16 KiB dictionary. The 13-byte stream header is dropped before
//! transfer: the firmware rebuilds it from the same fixed parameters. A
//! chunk is only sent compressed if that makes it strictly smaller, and
//! every compressed chunk is decompressed again on the host so the hash the
//! firmware checks after decompression is the hash of a verified round trip.
//!
//! Compression runs on a small pool of scoped worker threads. Only
//! [`CONTEXT_COUNT`] chunks can be in flight on the device, so the pool is
//! capped at that size; results are handed to the caller strictly in chunk
//! order.

use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;

use crossbeam_channel::{bounded, Receiver};
use sha2::{Digest, Sha256};
use xz2::stream::{LzmaOptions, Stream};

use crate::error::{Error, Result};
use crate::layout::CONTEXT_COUNT;

/// LZMA preset level
pub const LZMA_PRESET: u32 = 6;

/// LZMA dictionary size
pub const LZMA_DICT_SIZE: u32 = 16 << 10;

/// Length of the LZMA-alone header (properties, dictionary size, length)
pub const LZMA_HEADER_LEN: usize = 13;

// lc=3, lp=0, pb=2 as used by every preset
const LZMA_PROPERTIES: u8 = (2 * 5) * 9 + 3;

// Decoder memory limit, generous for a 16 KiB dictionary
const LZMA_MEMLIMIT: u64 = 64 << 20;

/// A SHA-256 digest
pub type Sha256Digest = [u8; 32];

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> Sha256Digest {
    Sha256::digest(data).into()
}

/// SHA-256 of the empty input, sent as the expected hash of erase requests
pub fn empty_sha256() -> Sha256Digest {
    sha256(&[])
}

/// Chunk compression method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Always send raw bytes
    None,
    /// LZMA1 when it saves space
    #[default]
    Lzma,
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(Self::None),
            "lzma" => Ok(Self::Lzma),
            _ => Err(Error::UnknownCompression(s.to_string())),
        }
    }
}

impl core::fmt::Display for Compression {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Lzma => f.write_str("lzma"),
        }
    }
}

fn codec_error(e: impl core::fmt::Display) -> Error {
    Error::Compression(e.to_string())
}

/// Compress `data`, returning the LZMA1 stream without its header
pub fn compress_lzma(data: &[u8]) -> Result<Vec<u8>> {
    let mut options = LzmaOptions::new_preset(LZMA_PRESET).map_err(codec_error)?;
    options.dict_size(LZMA_DICT_SIZE);
    let stream = Stream::new_lzma_encoder(&options).map_err(codec_error)?;

    let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
    encoder.write_all(data).map_err(codec_error)?;
    let mut out = encoder.finish().map_err(codec_error)?;

    if out.len() < LZMA_HEADER_LEN {
        return Err(Error::Compression("LZMA stream shorter than its header".into()));
    }
    out.drain(..LZMA_HEADER_LEN);
    Ok(out)
}

/// The header the firmware prepends before decoding
pub fn lzma_header() -> [u8; LZMA_HEADER_LEN] {
    let mut header = [0xFF; LZMA_HEADER_LEN];
    header[0] = LZMA_PROPERTIES;
    header[1..5].copy_from_slice(&LZMA_DICT_SIZE.to_le_bytes());
    // bytes 5..13 stay 0xFF: uncompressed length unknown, end marker present
    header
}

/// Decompress a header-less LZMA1 stream produced by [`compress_lzma`]
pub fn decompress_lzma(body: &[u8]) -> Result<Vec<u8>> {
    let stream = Stream::new_lzma_decoder(LZMA_MEMLIMIT).map_err(codec_error)?;
    let mut decoder = xz2::write::XzDecoder::new_stream(Vec::new(), stream);
    decoder.write_all(&lzma_header()).map_err(codec_error)?;
    decoder.write_all(body).map_err(codec_error)?;
    decoder.finish().map_err(codec_error)
}

/// Post-decompression integrity data of a compressed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decompressed {
    /// Length after decompression
    pub size: u32,
    /// SHA-256 of the round-tripped content
    pub sha256: Sha256Digest,
}

/// A chunk ready to be submitted to a transfer context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChunk {
    /// 0-based position in the image
    pub index: usize,
    /// Length of the chunk before compression
    pub original_len: usize,
    /// Bytes to place in the context buffer
    pub payload: Vec<u8>,
    /// Set when `payload` is compressed
    pub decompressed: Option<Decompressed>,
}

impl PreparedChunk {
    /// Whether the payload is compressed
    pub fn is_compressed(&self) -> bool {
        self.decompressed.is_some()
    }
}

/// Prepare one chunk with the given method
pub fn prepare_chunk(index: usize, data: &[u8], method: Compression) -> Result<PreparedChunk> {
    let raw = || PreparedChunk {
        index,
        original_len: data.len(),
        payload: data.to_vec(),
        decompressed: None,
    };

    if method == Compression::None || data.is_empty() {
        return Ok(raw());
    }

    let compressed = compress_lzma(data)?;
    if compressed.len() >= data.len() {
        log::trace!(
            "chunk {}: {} -> {} bytes, sending raw",
            index,
            data.len(),
            compressed.len()
        );
        return Ok(raw());
    }

    let round_trip = decompress_lzma(&compressed)?;
    if round_trip != data {
        return Err(Error::Compression(format!(
            "chunk {} does not survive a decompress round trip",
            index
        )));
    }

    log::trace!(
        "chunk {}: {} -> {} bytes",
        index,
        data.len(),
        compressed.len()
    );
    Ok(PreparedChunk {
        index,
        original_len: data.len(),
        payload: compressed,
        decompressed: Some(Decompressed {
            size: round_trip.len() as u32,
            sha256: sha256(&round_trip),
        }),
    })
}

/// Parallel chunk preparation
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    method: Compression,
    workers: usize,
}

impl Compressor {
    /// Create a compressor; `workers` is clamped to `1..=CONTEXT_COUNT`
    pub fn new(method: Compression, workers: usize) -> Self {
        Self {
            method,
            workers: workers.clamp(1, CONTEXT_COUNT),
        }
    }

    /// Effective worker count
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Prepare every chunk and hand them to `sink` in index order
    ///
    /// Stops at the first error from a worker or from `sink`.
    pub fn run<F>(&self, chunks: &[&[u8]], mut sink: F) -> Result<()>
    where
        F: FnMut(PreparedChunk) -> Result<()>,
    {
        if self.method == Compression::None || self.workers == 1 || chunks.len() <= 1 {
            for (index, data) in chunks.iter().enumerate() {
                sink(prepare_chunk(index, data, self.method)?)?;
            }
            return Ok(());
        }

        let method = self.method;
        std::thread::scope(|scope| {
            let (job_tx, job_rx) = bounded::<(usize, &[u8])>(self.workers);
            let (done_tx, done_rx) = bounded(self.workers);

            scope.spawn(move || {
                for job in chunks.iter().copied().enumerate() {
                    if job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            for _ in 0..self.workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for (index, data) in job_rx {
                        if done_tx.send((index, prepare_chunk(index, data, method))).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);

            // Dropping `done_rx` on return unblocks every worker.
            deliver_in_order(done_rx, chunks.len(), &mut sink)
        })
    }
}

fn deliver_in_order<F>(
    done_rx: Receiver<(usize, Result<PreparedChunk>)>,
    total: usize,
    sink: &mut F,
) -> Result<()>
where
    F: FnMut(PreparedChunk) -> Result<()>,
{
    let mut pending = BTreeMap::new();
    let mut next = 0;

    while next < total {
        let (index, result) = done_rx
            .recv()
            .map_err(|_| Error::Compression("compression workers stopped early".into()))?;
        pending.insert(index, result?);

        while let Some(chunk) = pending.remove(&next) {
            sink(chunk)?;
            next += 1;
        }
    }

    Ok(())
}
