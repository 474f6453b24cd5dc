//! ID generation for TrakFlow tasks and records.
//!
//! Task IDs are content-addressed rather than sequential so that agents working
//! offline on different branches never hand out the same ID.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::config::IdConfig;

/// Collisions tolerated at one length before the hash grows by a character.
const ATTEMPTS_PER_LENGTH: usize = 3;

/// Length of content hashes in hex characters.
const CONTENT_HASH_LEN: usize = 16;

/// Generate a unique task ID.
/// Format: "<prefix>-" + a prefix of SHA256(random UUID), `min_hash_length`
/// to `max_hash_length` hex chars, lengthened on repeated collisions.
pub fn generate_id(config: &IdConfig, existing_ids: &HashSet<String>) -> String {
    let mut length = config.min_hash_length;
    let mut collisions = 0;

    loop {
        let uuid = new_record_id();
        let digest = format!("{:x}", Sha256::digest(uuid.as_bytes()));
        let id = format!("{}-{}", config.prefix, &digest[..length]);

        if !existing_ids.contains(&id) {
            log::debug!("Allocated ID {} after {} collision(s)", id, collisions);
            return id;
        }

        collisions += 1;
        if collisions % ATTEMPTS_PER_LENGTH == 0 && length < config.max_hash_length {
            length += 1;
        }
    }
}

/// Hierarchical child ID: "<parent_id>.<index>".
pub fn generate_child_id(parent_id: &str, index: u32) -> String {
    format!("{}.{}", parent_id, index)
}

/// The parent part of a hierarchical ID, if it has one.
pub fn parent_id(child_id: &str) -> Option<&str> {
    child_id.rsplit_once('.').map(|(parent, _)| parent)
}

/// Check the `prefix-hex(.N)*` format.
pub fn is_valid_id(id: &str) -> bool {
    let mut parts = id.split('.');
    let Some(base) = parts.next() else {
        return false;
    };
    let Some((prefix, hash)) = base.split_once('-') else {
        return false;
    };

    let prefix_ok = !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_lowercase());
    let hash_ok = (IdConfig::MIN_HASH_LENGTH..=IdConfig::MAX_HASH_LENGTH).contains(&hash.len())
        && hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
    let suffixes_ok = parts.all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));

    prefix_ok && hash_ok && suffixes_ok
}

/// Stable digest over the canonical JSON encoding (object keys sorted).
pub fn content_hash(data: &serde_json::Value) -> String {
    let canonical = data.to_string();
    let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
    digest[..CONTENT_HASH_LEN].to_string()
}

/// Digest of raw bytes, same length as `content_hash`.
pub fn bytes_hash(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    digest[..CONTENT_HASH_LEN].to_string()
}

/// Fresh random UUID string for dependency/label/comment records.
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
