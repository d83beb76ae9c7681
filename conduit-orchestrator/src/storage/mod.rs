//! Durable artifact storage

pub mod cipher;
pub mod fs;

pub use cipher::ArtifactCipher;
pub use fs::{ArtifactMetadata, FsArtifactStore};

use sha2::{Digest, Sha256};

/// Hex-encoded sha256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
