//! Consistent lock ordering for application code.

use crate::store::{Connection, RowKey, StoreResult, TableName};

/// Lock `keys` of `table` in ascending key order.
///
/// Transactions that lock the rows they are about to change through this
/// helper, before reading them, cannot deadlock with each other on those
/// rows. Duplicate keys are locked once.
pub fn lock_rows_in_order(
    conn: &mut dyn Connection,
    table: &TableName,
    keys: &[RowKey],
) -> StoreResult<()> {
    let mut ordered: Vec<&RowKey> = keys.iter().collect();
    ordered.sort();
    ordered.dedup();
    for key in ordered {
        conn.lock_row(table, key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_locks_every_key_once() {
        let store = MemoryStore::new();
        let table = TableName::new("accounts").unwrap();
        let keys: Vec<RowKey> = ["b", "a", "b"]
            .iter()
            .map(|k| RowKey::new(*k).unwrap())
            .collect();

        let mut conn = store.connect();
        conn.set_auto_commit(false).unwrap();
        lock_rows_in_order(&mut conn, &table, &keys).unwrap();

        let owner = store.lock_owner(&table, &keys[0]);
        assert!(owner.is_some());
        assert_eq!(store.lock_owner(&table, &keys[1]), owner);

        conn.rollback().unwrap();
        assert_eq!(store.lock_owner(&table, &keys[0]), None);
    }
}
