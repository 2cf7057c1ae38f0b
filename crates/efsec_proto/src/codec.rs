//! Plaintext padding — applied inside the AEAD boundary.
//!
//! Outgoing plaintext is padded to fixed-size buckets before encryption so
//! the relay sees uniform-sized ciphertext. Format:
//!
//!   [original_len: u32 LE] [plaintext] [random padding]
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384, 65536. Payloads
//! larger than the top bucket are sent unpadded beyond the length prefix.

use crate::error::ProtoError;

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];

/// Pad plaintext to the next bucket boundary.
pub fn pad_to_bucket(plaintext: &[u8]) -> Vec<u8> {
    let needed = 4 + plaintext.len();
    let bucket = BUCKET_SIZES
        .iter()
        .copied()
        .find(|&b| b >= needed)
        .unwrap_or(needed);
    pad_to_size(plaintext, bucket)
}

/// Remove padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if padded.len() < 4 {
        return Err(ProtoError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(ProtoError::InvalidPadding(format!(
            "length prefix {len} exceeds padded size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

fn pad_to_size(plaintext: &[u8], target: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    // Random fill, not zeros: zero runs would leak through compression.
    let remaining = target.saturating_sub(out.len());
    if remaining > 0 {
        use rand::RngCore;
        let mut padding = vec![0u8; remaining];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    out
}
