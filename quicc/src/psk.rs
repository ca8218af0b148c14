//! PSK cache: resumption records keyed by server hostname.
//!
//! The cache outlives individual connections and is shared between them, so
//! the interface takes `&self`; implementations synchronize internally.

use std::collections::HashMap;
use std::sync::Mutex;

use quicc_quic::crypto::ResumptionRecord;

pub trait PskCache: Send + Sync {
    fn get(&self, hostname: &str) -> Option<ResumptionRecord>;
    fn put(&self, hostname: &str, record: ResumptionRecord);
    fn remove(&self, hostname: &str);
}

/// Process-local cache; suitable for tests and embeddings that do not
/// persist resumption state across restarts.
#[derive(Default)]
pub struct InMemoryPskCache {
    records: Mutex<HashMap<String, ResumptionRecord>>,
}

impl InMemoryPskCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PskCache for InMemoryPskCache {
    fn get(&self, hostname: &str) -> Option<ResumptionRecord> {
        self.records.lock().unwrap().get(hostname).cloned()
    }

    fn put(&self, hostname: &str, record: ResumptionRecord) {
        self.records.lock().unwrap().insert(hostname.to_owned(), record);
    }

    fn remove(&self, hostname: &str) {
        self.records.lock().unwrap().remove(hostname);
    }
}
