//! Transaction isolation levels.
//!
//! The four ANSI levels, ordered from weakest to strongest so that
//! "at or above READ COMMITTED" is a plain comparison.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Read Uncommitted isolation.
    ///
    /// Reads may observe writes of transactions that have not committed yet
    /// and may still roll back (dirty reads).
    ReadUncommitted,

    /// Read Committed isolation.
    ///
    /// Each read sees the most recently committed data at the time of the read.
    /// Two reads of the same row inside one transaction can differ if another
    /// transaction commits in between.
    #[default]
    ReadCommitted,

    /// Repeatable Read isolation.
    ///
    /// Once a row has been read, later reads of that row return the same
    /// value. Range reads can still pick up newly committed rows (phantoms).
    RepeatableRead,

    /// Serializable isolation.
    ///
    /// All reads come from the snapshot taken when the transaction began,
    /// including range reads.
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// Check if this isolation level reads from a per-transaction snapshot.
    pub fn uses_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }

    /// Check if writes should fail when another transaction committed the
    /// same row after this one began.
    pub fn first_updater_wins(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// Get a human-readable description of this isolation level.
    pub fn description(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "Reads may see uncommitted writes of other transactions",
            IsolationLevel::ReadCommitted => "Each read sees the latest committed data",
            IsolationLevel::RepeatableRead => "Rows read once keep their value; new rows may appear",
            IsolationLevel::Serializable => {
                "All reads see a consistent snapshot from transaction start"
            }
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['_', '-'], " ").as_str() {
            "READ UNCOMMITTED" | "READUNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" | "READCOMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" | "REPEATABLEREAD" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" | "SNAPSHOT" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}
