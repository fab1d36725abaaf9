//! Binary wire codec for chunk transfer.
//!
//! Single chunk (upload body):
//!   [u32 sample_section_len, u32 log_section_len, u32 chunk_length, u32 record_size]
//!   sample section = presence (chunk_length × u32) ++ samples (chunk_length × record_size × f64)
//!   log section    = UTF-8 JSON array of `[counter, mediatime, payload]`
//!
//! Bundle (bulk load body):
//!   [u32 chunk_count] then per chunk
//!   [u32 presence_len, u32 sample_len, u32 chunk_length, u32 record_size]
//!   presence bytes, sample bytes, JSON log array (self-delimiting).
//!
//! All integers and floats are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BufferError, Result};
use crate::store::LogRecord;

pub const HEADER_LEN: usize = 16;

const PRESENCE_WIDTH: usize = 4;
const SAMPLE_WIDTH: usize = 8;

/// Decoded chunk, owning its columns.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedChunk {
    pub presence: Vec<u32>,
    pub samples: Vec<f64>,
    pub logs: Vec<LogRecord>,
    pub chunk_length: usize,
    pub record_size: usize,
}

impl UnpackedChunk {
    /// An all-empty chunk, used to pad gaps in a bundle.
    pub fn empty(chunk_length: usize, record_size: usize) -> Self {
        Self {
            presence: vec![0; chunk_length],
            samples: vec![0.0; chunk_length * record_size],
            logs: Vec::new(),
            chunk_length,
            record_size,
        }
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| BufferError::Codec(format!("{what} {value} exceeds u32")))
}

fn check_columns(presence: &[u32], samples: &[f64], chunk_length: usize, record_size: usize) -> Result<()> {
    if presence.len() != chunk_length {
        return Err(BufferError::Codec(format!(
            "presence has {} slots, chunk length is {chunk_length}",
            presence.len()
        )));
    }
    if samples.len() != chunk_length * record_size {
        return Err(BufferError::Codec(format!(
            "samples have {} values, expected {}",
            samples.len(),
            chunk_length * record_size
        )));
    }
    Ok(())
}

/// Byte lengths of the presence and sample sections for a decoded header.
fn section_lens(chunk_length: usize, record_size: usize) -> Result<(usize, usize)> {
    let overflow = || {
        BufferError::Codec(format!("header {chunk_length}x{record_size} overflows section length"))
    };
    let presence = chunk_length.checked_mul(PRESENCE_WIDTH).ok_or_else(overflow)?;
    let samples = chunk_length
        .checked_mul(record_size)
        .and_then(|n| n.checked_mul(SAMPLE_WIDTH))
        .ok_or_else(overflow)?;
    Ok((presence, samples))
}

fn put_columns(buf: &mut BytesMut, presence: &[u32], samples: &[f64]) {
    for &p in presence {
        buf.put_u32_le(p);
    }
    for &s in samples {
        buf.put_f64_le(s);
    }
}

fn take_columns(buf: &mut &[u8], chunk_length: usize, record_size: usize) -> (Vec<u32>, Vec<f64>) {
    let mut presence = Vec::with_capacity(chunk_length);
    for _ in 0..chunk_length {
        presence.push(buf.get_u32_le());
    }
    let mut samples = Vec::with_capacity(chunk_length * record_size);
    for _ in 0..chunk_length * record_size {
        samples.push(buf.get_f64_le());
    }
    (presence, samples)
}

/// Serialize one chunk for upload.
pub fn pack_chunk(
    samples: &[f64],
    presence: &[u32],
    logs: &[LogRecord],
    chunk_length: usize,
    record_size: usize,
) -> Result<Bytes> {
    check_columns(presence, samples, chunk_length, record_size)?;
    let log_bytes = serde_json::to_vec(logs)?;
    let sample_section = presence.len() * PRESENCE_WIDTH + samples.len() * SAMPLE_WIDTH;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + sample_section + log_bytes.len());
    buf.put_u32_le(to_u32(sample_section, "sample section")?);
    buf.put_u32_le(to_u32(log_bytes.len(), "log section")?);
    buf.put_u32_le(to_u32(chunk_length, "chunk length")?);
    buf.put_u32_le(to_u32(record_size, "record size")?);
    put_columns(&mut buf, presence, samples);
    buf.put_slice(&log_bytes);
    Ok(buf.freeze())
}

/// Inverse of [`pack_chunk`].
pub fn unpack_chunk(bytes: &[u8]) -> Result<UnpackedChunk> {
    let mut buf = bytes;
    if buf.remaining() < HEADER_LEN {
        return Err(BufferError::Codec(format!("chunk too short: {} bytes", bytes.len())));
    }
    let sample_section = buf.get_u32_le() as usize;
    let log_section = buf.get_u32_le() as usize;
    let chunk_length = buf.get_u32_le() as usize;
    let record_size = buf.get_u32_le() as usize;

    let expected = section_lens(chunk_length, record_size)
        .ok()
        .and_then(|(presence, samples)| presence.checked_add(samples));
    if expected != Some(sample_section) {
        return Err(BufferError::Codec(format!(
            "sample section is {sample_section} bytes, header implies {chunk_length}x{record_size}"
        )));
    }
    let body_len = sample_section
        .checked_add(log_section)
        .ok_or_else(|| BufferError::Codec("chunk body length overflows".into()))?;
    if buf.remaining() < body_len {
        return Err(BufferError::Codec(format!(
            "truncated chunk: {} bytes left, need {body_len}",
            buf.remaining()
        )));
    }

    let (presence, samples) = take_columns(&mut buf, chunk_length, record_size);
    let logs: Vec<LogRecord> = serde_json::from_slice(&buf[..log_section])?;
    Ok(UnpackedChunk {
        presence,
        samples,
        logs,
        chunk_length,
        record_size,
    })
}

/// Serialize an ordered list of chunks in bundle form.
pub fn pack_bundle(chunks: &[UnpackedChunk]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32_le(to_u32(chunks.len(), "chunk count")?);
    for chunk in chunks {
        check_columns(&chunk.presence, &chunk.samples, chunk.chunk_length, chunk.record_size)?;
        let log_bytes = serde_json::to_vec(&chunk.logs)?;
        buf.reserve(HEADER_LEN + chunk.presence.len() * PRESENCE_WIDTH + chunk.samples.len() * SAMPLE_WIDTH + log_bytes.len());
        buf.put_u32_le(to_u32(chunk.presence.len() * PRESENCE_WIDTH, "presence section")?);
        buf.put_u32_le(to_u32(chunk.samples.len() * SAMPLE_WIDTH, "sample section")?);
        buf.put_u32_le(to_u32(chunk.chunk_length, "chunk length")?);
        buf.put_u32_le(to_u32(chunk.record_size, "record size")?);
        put_columns(&mut buf, &chunk.presence, &chunk.samples);
        buf.put_slice(&log_bytes);
    }
    Ok(buf.freeze())
}

/// Decode a bundle into its chunks, in bundle order.
pub fn unpack_chunk_bundle(bytes: &[u8]) -> Result<Vec<UnpackedChunk>> {
    let mut buf = bytes;
    if buf.remaining() < 4 {
        return Err(BufferError::Codec("bundle missing chunk count".into()));
    }
    let count = buf.get_u32_le() as usize;
    let mut chunks = Vec::with_capacity(count.min(4096));

    for i in 0..count {
        if buf.remaining() < HEADER_LEN {
            return Err(BufferError::Codec(format!("bundle chunk {i}: truncated header")));
        }
        let presence_len = buf.get_u32_le() as usize;
        let sample_len = buf.get_u32_le() as usize;
        let chunk_length = buf.get_u32_le() as usize;
        let record_size = buf.get_u32_le() as usize;

        let (expected_presence, expected_samples) = section_lens(chunk_length, record_size)
            .map_err(|e| BufferError::Codec(format!("bundle chunk {i}: {e}")))?;
        if presence_len != expected_presence || sample_len != expected_samples {
            return Err(BufferError::Codec(format!(
                "bundle chunk {i}: section lengths {presence_len}/{sample_len} do not match {chunk_length}x{record_size}"
            )));
        }
        let body_len = presence_len
            .checked_add(sample_len)
            .ok_or_else(|| BufferError::Codec(format!("bundle chunk {i}: body length overflows")))?;
        if buf.remaining() < body_len {
            return Err(BufferError::Codec(format!("bundle chunk {i}: truncated body")));
        }
        let (presence, samples) = take_columns(&mut buf, chunk_length, record_size);

        let mut logs_stream =
            serde_json::Deserializer::from_slice(buf).into_iter::<Vec<LogRecord>>();
        let logs = match logs_stream.next() {
            Some(parsed) => parsed?,
            None => return Err(BufferError::Codec(format!("bundle chunk {i}: missing logs"))),
        };
        let consumed = logs_stream.byte_offset();
        buf.advance(consumed);

        chunks.push(UnpackedChunk {
            presence,
            samples,
            logs,
            chunk_length,
            record_size,
        });
    }
    Ok(chunks)
}
