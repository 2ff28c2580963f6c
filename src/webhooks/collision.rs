use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Отпечаток уведомления: SHA-256 от канонического JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(payload: &serde_json::Value) -> Self {
        let digest = Sha256::digest(payload.to_string().as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Fingerprint(bytes)
    }
}

// Записи не вытесняются и живут, пока жив приемник
#[derive(Debug, Default)]
pub struct CollisionDetector {
    seen: Mutex<HashSet<Fingerprint>>,
}

impl CollisionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_collision(&self, fingerprint: &Fingerprint) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }

    /// Запоминает отпечаток. `false`, если он уже был.
    pub fn remember(&self, fingerprint: Fingerprint) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
