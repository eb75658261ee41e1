//! core type-safe names used by the store boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A row's column values.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A validated table name.
///
/// Valid names:
/// - 1-64 characters
/// - Alphanumeric, underscores, hyphens only
/// - Must start with a letter or underscore
/// - Cannot be reserved names (_xa, _system)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName(String);

impl TableName {
    /// reserved table names that can't be used
    const RESERVED: &'static [&'static str] = &["_xa", "_system"];

    /// create a new TableName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        let Some(first_char) = name.chars().next() else {
            return Err(InvalidNameError::Empty);
        };

        if name.len() > 64 {
            return Err(InvalidNameError::TooLong(name.len()));
        }

        if !first_char.is_ascii_alphabetic() && first_char != '_' {
            return Err(InvalidNameError::InvalidStart(first_char));
        }

        for (i, c) in name.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        if Self::RESERVED.contains(&name.to_lowercase().as_str()) {
            return Err(InvalidNameError::Reserved(name.to_string()));
        }

        Ok(())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated row key (primary key).
///
/// Ordering is plain string ordering; callers that lock several rows sort by
/// it to get a consistent acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    fn validate(key: &str) -> Result<(), InvalidNameError> {
        if key.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if key.len() > 128 {
            return Err(InvalidNameError::TooLong(key.len()));
        }

        for (i, c) in key.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a new ULID-based row key.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RowKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fully qualified row address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    pub table: TableName,
    pub key: RowKey,
}

impl RowId {
    pub fn new(table: TableName, key: RowKey) -> Self {
        Self { table, key }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// Identifier of an independent data store taking part in distributed work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNameError> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if let Some((position, c)) = id.chars().enumerate().find(|(_, c)| c.is_whitespace()) {
            return Err(InvalidNameError::InvalidCharacter { char: c, position });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self("memory".to_string())
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// error type for invalid names (tables, rows, stores)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(TableName::new("accounts").is_ok());
        assert!(TableName::new("_scratch").is_ok());
        assert!(TableName::new("isolation-probe_2").is_ok());

        assert_eq!(TableName::new(""), Err(InvalidNameError::Empty));
        assert_eq!(TableName::new("1abc"), Err(InvalidNameError::InvalidStart('1')));
        assert!(matches!(
            TableName::new("a b"),
            Err(InvalidNameError::InvalidCharacter { char: ' ', position: 1 })
        ));
        assert!(matches!(TableName::new("_XA"), Err(InvalidNameError::Reserved(_))));
        assert!(matches!(TableName::new("a".repeat(65)), Err(InvalidNameError::TooLong(65))));
    }

    #[test]
    fn test_row_key_ordering() {
        let mut keys = vec![
            RowKey::new("acct-2").unwrap(),
            RowKey::new("acct-1").unwrap(),
            RowKey::new("acct-3").unwrap(),
        ];
        keys.sort();
        let ordered: Vec<&str> = keys.iter().map(RowKey::as_str).collect();
        assert_eq!(ordered, vec!["acct-1", "acct-2", "acct-3"]);
    }

    #[test]
    fn test_generated_keys_are_valid() {
        let key = RowKey::generate();
        assert!(RowKey::new(key.as_str()).is_ok());
        assert_ne!(key, RowKey::generate());
    }

    #[test]
    fn test_store_id() {
        assert_eq!(StoreId::new("orders-db").unwrap().to_string(), "orders-db");
        assert!(StoreId::new("").is_err());
        assert!(StoreId::new("orders db").is_err());
    }
}
