//! In-memory idempotency store
//!
//! Maps a scoped key to the payload hash and the response committed for it.
//! Entries expire after a TTL; expired entries are pruned on every access.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use metrics::counter;
use sha2::{Digest, Sha256};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone)]
struct IdempotencyRecord {
    hash: String,
    status: u16,
    body: Vec<u8>,
    created_at: Instant,
}

/// Result of looking up a key before running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Unknown key; run the handler.
    Miss,
    /// Same key and payload; return the committed response verbatim.
    Replay { status: u16, body: Vec<u8> },
    /// Same key with a different payload.
    Conflict,
}

#[derive(Debug)]
pub struct IdempotencyStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn replay_if_match(&self, key: &str, hash: &str) -> ReplayOutcome {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut entries, self.ttl);

        match entries.get(key) {
            None => ReplayOutcome::Miss,
            Some(record) if record.hash == hash => {
                counter!("services_idempotency_replays_total").increment(1);
                ReplayOutcome::Replay {
                    status: record.status,
                    body: record.body.clone(),
                }
            }
            Some(_) => {
                counter!("services_idempotency_conflicts_total").increment(1);
                ReplayOutcome::Conflict
            }
        }
    }

    /// Commit the response produced for `key`.
    pub fn store(&self, key: &str, hash: &str, status: u16, body: &[u8]) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut entries, self.ttl);
        entries.insert(
            key.to_string(),
            IdempotencyRecord {
                hash: hash.to_string(),
                status,
                body: body.to_vec(),
                created_at: Instant::now(),
            },
        );
    }

    /// Claim `key` once. Returns `false` when it was already claimed within the TTL.
    pub fn claim(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut entries, self.ttl);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(
            key.to_string(),
            IdempotencyRecord {
                hash: String::new(),
                status: 0,
                body: Vec::new(),
                created_at: Instant::now(),
            },
        );
        true
    }

    /// Drop a claim so the key can be retried.
    pub fn release(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut entries, self.ttl);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune(entries: &mut HashMap<String, IdempotencyRecord>, ttl: Duration) {
    entries.retain(|_, record| record.created_at.elapsed() < ttl);
}

/// `method|path|actor_id|idempotency_key`
pub fn scoped_key(method: &str, path: &str, actor_id: &str, key: &str) -> String {
    format!("{}|{}|{}|{}", method.to_ascii_uppercase(), path, actor_id, key)
}

/// Hex-encoded SHA-256 of the raw request body.
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
