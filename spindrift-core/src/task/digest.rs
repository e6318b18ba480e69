//! Digest helpers: per-piece MD5, the aggregate task signature, and
//! incremental verification of streamed piece bodies.

use md5::{Digest as _, Md5};
use sha2::Sha256;

use super::TaskError;

/// Lowercase hex MD5 of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    to_hex(&Md5::digest(data))
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// Aggregate task signature: SHA-256 over the concatenation of the per-piece
/// MD5 hex strings in piece order.
pub fn piece_md5_sign<I, S>(md5s: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for md5 in md5s {
        hasher.update(md5.as_ref().as_bytes());
    }
    to_hex(&hasher.finalize())
}

/// Incremental MD5 check over a piece body arriving in chunks.
///
/// Feed every chunk through [`Md5Verifier::update`] and call
/// [`Md5Verifier::finish`] once the body is complete; the final call fails
/// when the computed digest does not match the advertised one.
pub struct Md5Verifier {
    hasher: Md5,
    expected: String,
}

impl Md5Verifier {
    /// Starts a verification against the advertised lowercase hex digest.
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            hasher: Md5::new(),
            expected: expected.into(),
        }
    }

    /// Absorbs the next body chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Completes the check.
    ///
    /// # Errors
    /// - `TaskError::DigestMismatch` - The body does not hash to the
    ///   advertised digest.
    pub fn finish(self) -> Result<(), TaskError> {
        let actual = to_hex(&self.hasher.finalize());
        if actual == self.expected {
            Ok(())
        } else {
            Err(TaskError::DigestMismatch {
                expected: self.expected,
                actual,
            })
        }
    }
}

fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_known_value() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn sign_concatenates_hex_strings() {
        let a = md5_hex(b"piece-0");
        let b = md5_hex(b"piece-1");
        let joined = format!("{a}{b}");
        assert_eq!(piece_md5_sign([&a, &b]), sha256_hex(joined.as_bytes()));
    }

    #[test]
    fn sign_is_order_sensitive() {
        let a = md5_hex(b"piece-0");
        let b = md5_hex(b"piece-1");
        assert_ne!(piece_md5_sign([&a, &b]), piece_md5_sign([&b, &a]));
    }

    #[test]
    fn verifier_accepts_chunked_body() {
        let mut verifier = Md5Verifier::new(md5_hex(b"hello world"));
        verifier.update(b"hello ");
        verifier.update(b"world");
        assert!(verifier.finish().is_ok());
    }

    #[test]
    fn verifier_rejects_altered_body() {
        let mut verifier = Md5Verifier::new(md5_hex(b"hello world"));
        verifier.update(b"hello_world");
        let err = verifier.finish().unwrap_err();
        assert!(matches!(err, TaskError::DigestMismatch { .. }));
    }
}
