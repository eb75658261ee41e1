//! Distributed transaction identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies one branch of a distributed transaction.
///
/// `global_id` is shared by every branch of the same distributed transaction;
/// `branch_id` is unique per participant. Both are fresh 128-bit ULIDs and are
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalTransactionId {
    pub global_id: Ulid,
    pub branch_id: Ulid,
}

impl GlobalTransactionId {
    /// Generate the identifier of a new distributed transaction.
    pub fn generate() -> Self {
        Self {
            global_id: Ulid::new(),
            branch_id: Ulid::new(),
        }
    }

    /// Derive a fresh branch of the same distributed transaction.
    pub fn new_branch(&self) -> Self {
        Self {
            global_id: self.global_id,
            branch_id: Ulid::new(),
        }
    }

    /// Check whether two ids belong to the same distributed transaction.
    pub fn same_global(&self, other: &GlobalTransactionId) -> bool {
        self.global_id == other.global_id
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.global_id, self.branch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branches_share_global_id() {
        let root = GlobalTransactionId::generate();
        let a = root.new_branch();
        let b = root.new_branch();

        assert!(a.same_global(&b));
        assert_ne!(a.branch_id, b.branch_id);
        assert_ne!(a, b);
        assert!(!root.same_global(&GlobalTransactionId::generate()));
    }

    #[test]
    fn test_display_and_serde() {
        let xid = GlobalTransactionId::generate();
        let text = xid.to_string();
        assert!(text.starts_with(&xid.global_id.to_string()));

        let encoded = serde_json::to_string(&xid).unwrap();
        let decoded: GlobalTransactionId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, xid);
    }
}
