use sha2::{Digest, Sha256};

/// Length of a hex encoded SHA-256 digest.
pub const HASH_LEN: usize = 64;

/// Hex encoded SHA-256 of the given bytes.
pub fn calculate_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Calculates the hash of an entire file by combining the hashes of all its blocks.
///
/// The block hashes are concatenated as text in order and hashed again, so the
/// result identifies the sequence of chunk identities and not the raw bytes.
pub fn calculate_file_hash<S: AsRef<str>>(blocks: &[S]) -> String {
    let mut hasher = Sha256::new();
    for block_hash in blocks {
        hasher.update(block_hash.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// A block hash is usable as a storage key only in the form produced by
/// [`calculate_hash`]: 64 lowercase hex digits.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
