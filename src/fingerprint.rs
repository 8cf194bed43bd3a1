//! Deterministic, collision-resistant naming of derived byte streams.

use sha2::{Digest, Sha256};

use crate::source::SourceIdentity;

/// Identifies a unique derived byte stream: `{driver id, driver-version tag,
/// parameter tuple, source identity}` hashed with SHA-256 and rendered as
/// lowercase hex, which doubles as the cache file's on-disk name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute a fingerprint from its canonical inputs.
    ///
    /// `parameters` is an already-canonicalized byte encoding of the
    /// driver's parameter tuple (e.g. `b"320"` for a bitrate, or the encoded
    /// cue track index for SplitTrack); callers own canonicalization so this
    /// function stays a pure function of its byte inputs.
    pub fn compute(
        driver_id: &str,
        driver_version: &str,
        parameters: &[u8],
        source: SourceIdentity,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(driver_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(driver_version.as_bytes());
        hasher.update([0u8]);
        hasher.update(parameters);
        hasher.update([0u8]);
        hasher.update(source.device.to_le_bytes());
        hasher.update(source.inode.to_le_bytes());
        hasher.update(source.mtime_nanos.to_le_bytes());
        hasher.update(source.size.to_le_bytes());
        Fingerprint(hasher.finalize().into())
    }

    /// Hex-encoded form, also the cache file's basename.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Reconstruct a fingerprint from its raw bytes, e.g. when re-reading a
    /// cache filename at startup. Not a hashing operation.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(size: u64) -> SourceIdentity {
        SourceIdentity {
            device: 1,
            inode: 2,
            mtime_nanos: 3,
            size,
        }
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let a = Fingerprint::compute("mp3", "v1", b"320", identity(100));
        let b = Fingerprint::compute("mp3", "v1", b"320", identity(100));
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn different_bitrate_different_fingerprint() {
        let a = Fingerprint::compute("mp3", "v1", b"320", identity(100));
        let b = Fingerprint::compute("mp3", "v1", b"192", identity(100));
        assert_ne!(a, b);
    }

    #[test]
    fn different_driver_version_different_fingerprint() {
        let a = Fingerprint::compute("mp3", "v1", b"320", identity(100));
        let b = Fingerprint::compute("mp3", "v2", b"320", identity(100));
        assert_ne!(a, b);
    }

    #[test]
    fn different_source_different_fingerprint() {
        let a = Fingerprint::compute("mp3", "v1", b"320", identity(100));
        let b = Fingerprint::compute("mp3", "v1", b"320", identity(200));
        assert_ne!(a, b);
    }

    #[test]
    fn hex_is_lowercase_and_fixed_width() {
        let fp = Fingerprint::compute("splittrack", "v1", b"1", identity(100));
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
