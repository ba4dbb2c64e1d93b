//! Framed stream encryption for file bodies
//!
//! A single GCM invocation is capped in how much data it may process, so a
//! body is cut into fixed-size plaintext chunks and each chunk is sealed on
//! its own:
//!
//! ```text
//! frame_0 || frame_1 || ... || frame_n
//! frame_i = [16 bytes: random IV][ciphertext of chunk_i][16 bytes: tag]
//! AAD     = i (8 bytes, big-endian)
//! ```
//!
//! Every frame but the last carries exactly `chunk_size` plaintext bytes.
//! The last frame always carries fewer (possibly zero), so a stream that
//! stops on a frame boundary is detected as truncated.

use std::io::{Read, Write};

use shroud_core::{ShroudError, ShroudResult};

use crate::crypter::{open, seal};
use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// Default plaintext bytes per frame (500 MB).
pub const DEFAULT_CHUNK_SIZE: usize = 500_000_000;

/// Per-frame overhead: IV plus tag.
pub const FRAME_OVERHEAD: u64 = (IV_SIZE + TAG_SIZE) as u64;

/// Ciphertext length for a `plain_len`-byte payload.
pub fn encrypted_len(plain_len: u64, chunk_size: usize) -> u64 {
    let chunk = chunk_size.max(1) as u64;
    let frames = plain_len / chunk + 1;
    plain_len + frames * FRAME_OVERHEAD
}

pub(crate) fn encrypt_frames<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    chunk_size: usize,
    mut reader: R,
    mut writer: W,
) -> ShroudResult<u64> {
    let mut buf = Vec::new();
    let mut index: u64 = 0;
    let mut written: u64 = 0;

    loop {
        buf.clear();
        read_up_to(&mut reader, &mut buf, chunk_size)?;

        let frame = seal(key, &index.to_be_bytes(), &buf)?;
        writer.write_all(&frame)?;
        written += frame.len() as u64;

        if buf.len() < chunk_size {
            break;
        }
        index += 1;
    }

    writer.flush()?;
    tracing::trace!(frames = index + 1, bytes = written, "stream encrypted");
    Ok(written)
}

pub(crate) fn decrypt_frames<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    chunk_size: usize,
    mut reader: R,
    mut writer: W,
) -> ShroudResult<u64> {
    let full_frame = chunk_size + IV_SIZE + TAG_SIZE;
    let mut buf = Vec::new();
    let mut index: u64 = 0;
    let mut written: u64 = 0;

    loop {
        buf.clear();
        read_up_to(&mut reader, &mut buf, full_frame)?;

        if buf.len() < IV_SIZE + TAG_SIZE {
            return Err(ShroudError::Format(format!(
                "stream truncated at frame {index}: {} bytes",
                buf.len()
            )));
        }

        let plaintext = open(key, &index.to_be_bytes(), &buf)?;
        writer.write_all(&plaintext)?;
        written += plaintext.len() as u64;

        if plaintext.len() < chunk_size {
            let mut trailing = [0u8; 1];
            if reader.read(&mut trailing)? != 0 {
                return Err(ShroudError::Format(format!(
                    "trailing data after final frame {index}"
                )));
            }
            break;
        }
        index += 1;
    }

    writer.flush()?;
    Ok(written)
}

/// Fill `buf` with up to `limit` bytes, stopping early only at EOF.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> ShroudResult<()> {
    reader.by_ref().take(limit as u64).read_to_end(buf)?;
    Ok(())
}
