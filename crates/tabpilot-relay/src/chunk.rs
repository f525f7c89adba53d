//! Transfer ids and the chunk codec.
//!
//! Payloads are split on raw UTF-8 byte boundaries and each slice is base64
//! encoded on its own, so a chunk may end in the middle of a multi-byte
//! character without corrupting anything: only the concatenation of all
//! decoded slices is interpreted as text.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use tabpilot_core::{PilotError, Result, TransferMeta};

/// Hex characters kept from the blake3 digest.
const ID_LEN: usize = 16;

/// Deterministic transfer id.
///
/// Identical key, payload, `docType` and salt always give the same id; a
/// fresh salt forces a new one. Other metadata does not participate.
pub fn stable_id(logical_key: &str, payload: &str, meta: &TransferMeta) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(logical_key.as_bytes());
    hasher.update(&[0]);
    hasher.update(meta.doc_type.as_deref().unwrap_or("").as_bytes());
    hasher.update(&[0]);
    hasher.update(meta.salt.as_deref().unwrap_or("").as_bytes());
    hasher.update(&[0]);
    hasher.update(payload.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..ID_LEN].to_string()
}

/// A random salt for forcing a new id on retry.
pub fn fresh_salt() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// One encoded slice of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: usize,
    pub data: String,
}

/// Split `payload` into base64 chunks of at most `chunk_size` raw bytes.
/// An empty payload yields no chunks.
pub fn split(payload: &str, chunk_size: usize) -> Vec<Chunk> {
    let size = chunk_size.max(1);
    payload
        .as_bytes()
        .chunks(size)
        .enumerate()
        .map(|(seq, bytes)| Chunk {
            seq,
            data: STANDARD.encode(bytes),
        })
        .collect()
}

/// Decode one chunk's data back to raw bytes.
pub fn decode(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| PilotError::Protocol(format!("invalid base64 chunk: {e}")))
}

/// Reassemble chunks (in any order) into the original text.
pub fn reassemble(chunks: &[Chunk]) -> Result<String> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.seq);

    for (expected, chunk) in ordered.iter().enumerate() {
        if chunk.seq != expected {
            return Err(PilotError::Protocol(format!(
                "chunk sequence gap: expected {expected}, found {}",
                chunk.seq
            )));
        }
    }

    let mut bytes = Vec::new();
    for chunk in ordered {
        bytes.extend(decode(&chunk.data)?);
    }
    String::from_utf8(bytes)
        .map_err(|e| PilotError::Protocol(format!("reassembled payload is not UTF-8: {e}")))
}
