//! Salted content digest used as the dedup key
//!
//! BLAKE3 in keyed mode with a fixed salt key, read through the XOF to 20
//! bytes. The salt keeps digests from matching public hash databases; the
//! digest itself only ever leaves the client inside an encrypted blob.

use std::io::Read;
use std::path::Path;

use shroud_core::{ShroudError, ShroudResult};

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 20;

pub type Digest = [u8; DIGEST_LEN];

const SALT_KEY: [u8; 32] = *b"shroud content digest salt v1\0\0\0";

const READ_BUF: usize = 64 * 1024;

/// Digest an in-memory byte slice.
pub fn digest_bytes(data: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new_keyed(&SALT_KEY);
    hasher.update(data);
    finish(&hasher)
}

/// Digest a file with a streaming 64 KiB read loop.
pub fn digest_file(path: &Path) -> ShroudResult<Digest> {
    let mut file = std::fs::File::open(path).map_err(|e| ShroudError::local_io(path, e))?;

    let mut hasher = blake3::Hasher::new_keyed(&SALT_KEY);
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| ShroudError::local_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(finish(&hasher))
}

/// Reader adapter that digests every byte passing through it.
///
/// Lets a single read of a file feed both the encryptor and the digest.
pub struct DigestReader<R> {
    inner: R,
    hasher: blake3::Hasher,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new_keyed(&SALT_KEY),
        }
    }

    /// Digest of everything read so far.
    pub fn digest(&self) -> Digest {
        finish(&self.hasher)
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn finish(hasher: &blake3::Hasher) -> Digest {
    let mut out = [0u8; DIGEST_LEN];
    hasher.finalize_xof().fill(&mut out);
    out
}
