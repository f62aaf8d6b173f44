//! Incremental content hashing for downloaded images.

use sha2::{Digest, Sha256, Sha512};

use super::types::{HashAlgorithm, Hashes};

/// Computes every supported digest over a stream in one pass.
#[derive(Default)]
pub struct ContentHasher {
    sha256: Sha256,
    sha512: Sha512,
    length: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.sha256.update(chunk);
        self.sha512.update(chunk);
        self.length += chunk.len() as u64;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Returns the total length and the hex digests.
    pub fn finish(self) -> (u64, Hashes) {
        let mut hashes = Hashes::new();
        hashes.insert(HashAlgorithm::Sha256, hex::encode(self.sha256.finalize()));
        hashes.insert(HashAlgorithm::Sha512, hex::encode(self.sha512.finalize()));
        (self.length, hashes)
    }
}

/// Hash a complete buffer.
pub fn hash_content(content: &[u8]) -> (u64, Hashes) {
    let mut hasher = ContentHasher::new();
    hasher.update(content);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.length(), 11);
        assert_eq!(hasher.finish(), hash_content(b"hello world"));
    }

    #[test]
    fn test_known_sha256() {
        let (length, hashes) = hash_content(b"abc");
        assert_eq!(length, 3);
        assert_eq!(
            hashes[&HashAlgorithm::Sha256],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
