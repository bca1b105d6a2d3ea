//! Lease identifiers written into `transaction_meta` rows while a scheduler owns them.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Temporary exclusive ownership token for claimed rows.
///
/// Built from the claim time and the owning process id. Two leases are the
/// same lease only if both fields match; nothing orders or parses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId {
    pub epoch_millis: i64,
    pub process_id: i32,
}

impl LeaseId {
    #[must_use]
    pub fn new(epoch_millis: i64, process_id: i32) -> Self {
        Self {
            epoch_millis,
            process_id,
        }
    }

    /// Lease for a claim starting now
    #[must_use]
    pub fn generate(process_id: i32) -> Self {
        Self::new(Utc::now().timestamp_millis(), process_id)
    }

    /// Rebuild from the two nullable lock columns; half-set columns read as no lease
    #[must_use]
    pub fn from_columns(epoch_millis: Option<i64>, process_id: Option<i32>) -> Option<Self> {
        match (epoch_millis, process_id) {
            (Some(millis), Some(pid)) => Some(Self::new(millis, pid)),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.epoch_millis, self.process_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_equality_requires_both_fields() {
        let a = LeaseId::new(1_700_000_000_000, 3);
        assert_eq!(a, LeaseId::new(1_700_000_000_000, 3));
        assert_ne!(a, LeaseId::new(1_700_000_000_000, 4));
        assert_ne!(a, LeaseId::new(1_700_000_000_001, 3));
    }

    #[test]
    fn test_lease_display() {
        assert_eq!(LeaseId::new(1_700_000_000_123, 7).to_string(), "1700000000123.7");
    }

    #[test]
    fn test_from_columns() {
        assert_eq!(
            LeaseId::from_columns(Some(10), Some(2)),
            Some(LeaseId::new(10, 2))
        );
        assert_eq!(LeaseId::from_columns(None, Some(2)), None);
        assert_eq!(LeaseId::from_columns(Some(10), None), None);
        assert_eq!(LeaseId::from_columns(None, None), None);
    }

    #[test]
    fn test_generate_uses_process_id() {
        let lease = LeaseId::generate(42);
        assert_eq!(lease.process_id, 42);
        assert!(lease.epoch_millis > 0);
    }
}
