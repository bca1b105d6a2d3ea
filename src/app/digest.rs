//! Aggregation of terminal and handler failures for periodic reporting.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

/// How many transaction uuids are kept per failure kind
const MAX_SAMPLES: usize = 5;

/// Failures of one kind since the last drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEntry {
    pub count: u64,
    pub last_message: String,
    pub sample_uuids: Vec<Uuid>,
    pub first_seen: DateTime<Utc>,
}

/// Collects failures by kind until the next report.
///
/// Owned by one scheduler or consumer and shared by reference with the
/// tasks that record into it.
#[derive(Debug, Default)]
pub struct FailureDigest {
    entries: Mutex<BTreeMap<String, FailureEntry>>,
}

impl FailureDigest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: &str, transaction_uuid: Option<Uuid>, message: impl Into<String>) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries
            .entry(kind.to_string())
            .or_insert_with(|| FailureEntry {
                count: 0,
                last_message: String::new(),
                sample_uuids: Vec::new(),
                first_seen: Utc::now(),
            });
        entry.count += 1;
        entry.last_message = message.into();
        if let Some(uuid) = transaction_uuid {
            if entry.sample_uuids.len() < MAX_SAMPLES {
                entry.sample_uuids.push(uuid);
            }
        }
    }

    /// Total failures recorded since the last drain
    pub fn total(&self) -> u64 {
        match self.entries.lock() {
            Ok(guard) => guard.values().map(|e| e.count).sum(),
            Err(poisoned) => poisoned.into_inner().values().map(|e| e.count).sum(),
        }
    }

    /// Take everything recorded so far, leaving the digest empty
    pub fn drain(&self) -> BTreeMap<String, FailureEntry> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *entries)
    }

    /// Drain and emit one log line per failure kind
    pub fn report(&self, source: &str) -> usize {
        let entries = self.drain();
        for (kind, entry) in &entries {
            warn!(
                source = %source,
                kind = %kind,
                count = entry.count,
                since = %entry.first_seen,
                last_message = %entry.last_message,
                samples = ?entry.sample_uuids,
                "Failure digest"
            );
        }
        entries.len()
    }
}
