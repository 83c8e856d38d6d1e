use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use base64::Engine;
use fabric_protocol::{ChunkFrame, CompressionCodec};
use rand::Rng;

use crate::error::{GatewayError, GatewayResult};

static TRANSFER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A transfer id for one outbound chunked send, in the same
/// sequence-plus-random-suffix shape as a connection id.
pub fn generate_transfer_id() -> String {
    let sequence = TRANSFER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let suffix: u32 = rand::thread_rng().gen();
    format!("xfer-{sequence:x}-{suffix:08x}")
}

/// Parses the `compression_preference` config knob into a [`CompressionCodec`].
/// An unrecognized value falls back to `None` rather than failing startup.
pub fn parse_codec(preference: &str) -> CompressionCodec {
    match preference.to_lowercase().as_str() {
        "gzip" => CompressionCodec::Gzip,
        "lz4" => CompressionCodec::Lz4,
        _ => CompressionCodec::None,
    }
}

fn encode_body(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_body(body: &str) -> GatewayResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| GatewayError::Validation(format!("invalid base64 chunk body: {e}")))
}

pub fn compress(bytes: &[u8], codec: CompressionCodec) -> GatewayResult<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(bytes.to_vec()),
        CompressionCodec::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(bytes)
                .map_err(GatewayError::TransientIo)?;
            encoder.finish().map_err(GatewayError::TransientIo)
        }
        CompressionCodec::Lz4 => Ok(lz4_flex::compress_prepend_size(bytes)),
    }
}

pub fn decompress(bytes: &[u8], codec: CompressionCodec) -> GatewayResult<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(bytes.to_vec()),
        CompressionCodec::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(GatewayError::TransientIo)?;
            Ok(out)
        }
        CompressionCodec::Lz4 => lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| GatewayError::Validation(format!("invalid lz4 frame: {e}"))),
    }
}

/// Splits a compressed large message into `ChunkFrame`s no larger than
/// `chunk_size_bytes` of post-compression payload each.
pub fn split_into_chunks(
    message_type: &str,
    transfer_id: &str,
    compressed: &[u8],
    codec: CompressionCodec,
    chunk_size_bytes: usize,
) -> Vec<ChunkFrame> {
    if compressed.is_empty() {
        return vec![ChunkFrame::new(message_type, transfer_id, 0, 1, codec, encode_body(compressed))];
    }
    let total_chunks = compressed.len().div_ceil(chunk_size_bytes) as u32;
    compressed
        .chunks(chunk_size_bytes)
        .enumerate()
        .map(|(index, chunk)| {
            ChunkFrame::new(
                message_type,
                transfer_id,
                index as u32,
                total_chunks,
                codec,
                encode_body(chunk),
            )
        })
        .collect()
}

/// Reassembles chunks received for one `transfer_id`, in arrival order, and
/// decompresses the joined bytes per the codec the sender declared.
pub struct ChunkAssembler {
    total_chunks: u32,
    codec: CompressionCodec,
    received: Vec<Option<Vec<u8>>>,
    started_at: Instant,
}

impl ChunkAssembler {
    pub fn new(total_chunks: u32, codec: CompressionCodec) -> Self {
        Self {
            total_chunks,
            codec,
            received: vec![None; total_chunks as usize],
            started_at: Instant::now(),
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Partial transfers that have sat incomplete past `timeout` are
    /// discarded rather than held onto indefinitely (§4.4).
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.started_at.elapsed() >= timeout
    }

    pub fn received_count(&self) -> u32 {
        self.received.iter().filter(|c| c.is_some()).count() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    pub fn accept(&mut self, frame: &ChunkFrame) -> GatewayResult<()> {
        if frame.total_chunks != self.total_chunks {
            return Err(GatewayError::Validation(format!(
                "chunk declares total_chunks={} but transfer started with {}",
                frame.total_chunks, self.total_chunks
            )));
        }
        let index = frame.chunk_index as usize;
        let Some(slot) = self.received.get_mut(index) else {
            return Err(GatewayError::Validation(format!(
                "chunk_index {} out of range for total_chunks {}",
                frame.chunk_index, self.total_chunks
            )));
        };
        *slot = Some(decode_body(&frame.body)?);
        Ok(())
    }

    pub fn finish(self) -> GatewayResult<Vec<u8>> {
        if !self.is_complete() {
            return Err(GatewayError::Validation(format!(
                "transfer incomplete: {}/{} chunks received",
                self.received_count(),
                self.total_chunks
            )));
        }
        let mut joined = Vec::new();
        for chunk in self.received.into_iter().flatten() {
            joined.extend_from_slice(&chunk);
        }
        decompress(&joined, self.codec)
    }
}
