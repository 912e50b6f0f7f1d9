//! Per-connection byte baselines.
//!
//! Conntrack reports a connection's running byte total on every event.
//! Aggregation wants increments, so the last total seen per connection is
//! remembered and only the difference is accounted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::domain::FlowKey;

/// Connections remembered before the baselines are reset
const DEFAULT_CAPACITY: usize = 65_536;

/// Last byte total seen per connection, shared by all listeners of a source.
#[derive(Debug, Clone)]
pub struct ByteBaselines {
    last: Arc<Mutex<HashMap<FlowKey, u64>>>,
    capacity: usize,
}

impl ByteBaselines {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Remember at most `capacity` connections. When full, every baseline
    /// is forgotten and the next event of each connection counts its whole
    /// total again.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            last: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Bytes carried by `key` since its previous event.
    ///
    /// The first event of a connection counts its whole total. A total
    /// lower than the baseline means the tuple was reused by a new
    /// connection, which also counts in full.
    pub fn delta(&self, key: FlowKey, total: u64) -> u64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.len() >= self.capacity && !last.contains_key(&key) {
            warn!(
                "Tracking {} connections; resetting byte baselines",
                last.len()
            );
            last.clear();
        }

        match last.insert(key, total) {
            Some(previous) if total >= previous => total - previous,
            _ => total,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for ByteBaselines {
    fn default() -> Self {
        Self::new()
    }
}
