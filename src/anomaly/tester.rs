//! Provokes read anomalies against a live store.
//!
//! Two connections are taken from the factory: an observer that reads inside
//! a transaction at the level under test, and a writer that changes the
//! scratch table between (or during) the observer's reads. The interleaving
//! is driven from one thread, which works because reads never wait on locks.

use serde_json::json;
use tracing::{debug, info};

use crate::anomaly::report::{Anomaly, IsolationTestReport, IsolationTestResult};
use crate::store::{
    Connection, ConnectionFactory, Row, RowKey, StoreError, StoreResult, TableName,
};
use crate::transaction::{IsolationLevel, SessionGuard, TransactionError, TransactionResult};

const PROBE_KEY: &str = "probe";
const PROBE_VALUE: i64 = 100;
const RANGE_KIND: &str = "range";

/// Scratch table used when none is configured.
pub const DEFAULT_PROBE_TABLE: &str = "isolation_probe";

/// Runs the dirty, non-repeatable and phantom read scenarios.
#[derive(Debug)]
pub struct IsolationAnomalyTester<F> {
    factory: F,
    table: TableName,
}

impl<F: ConnectionFactory> IsolationAnomalyTester<F> {
    pub fn new(factory: F) -> TransactionResult<Self> {
        let table = TableName::new(DEFAULT_PROBE_TABLE).map_err(StoreError::from)?;
        Ok(Self { factory, table })
    }

    /// Use `table` as the scratch table. Its contents are replaced.
    pub fn with_table(mut self, table: TableName) -> Self {
        self.table = table;
        self
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Run every scenario at `level`.
    ///
    /// Each scenario's observer transaction is rolled back and the observer's
    /// session settings are restored afterwards. The scratch table is emptied
    /// even when a scenario fails.
    pub fn test_isolation_level(
        &self,
        level: IsolationLevel,
    ) -> TransactionResult<IsolationTestReport> {
        let mut writer = self.factory.acquire()?;
        let mut observer = self.factory.acquire()?;

        self.seed(&mut writer)?;
        let results = self.run_scenarios(level, &mut observer, &mut writer);
        let cleared = self.clear(&mut writer);
        let results = results?;
        cleared?;

        let report = IsolationTestReport::new(level, results);
        info!(
            level = %level,
            detected = report.detected().count(),
            "isolation test finished"
        );
        Ok(report)
    }

    fn run_scenarios(
        &self,
        level: IsolationLevel,
        observer: &mut dyn Connection,
        writer: &mut dyn Connection,
    ) -> TransactionResult<Vec<IsolationTestResult>> {
        let mut results = Vec::with_capacity(Anomaly::ALL.len());
        for scenario in Anomaly::ALL {
            let (detected, description) = match scenario {
                Anomaly::DirtyRead => self.dirty_read(level, observer, writer)?,
                Anomaly::NonRepeatableRead => self.non_repeatable_read(level, observer, writer)?,
                Anomaly::PhantomRead => self.phantom_read(level, observer, writer)?,
            };
            debug!(level = %level, %scenario, detected, "scenario finished");
            results.push(IsolationTestResult {
                isolation_level: level,
                scenario,
                anomaly_detected: detected,
                description,
            });
        }
        Ok(results)
    }

    /// Observer reads the probe row while the writer holds an uncommitted
    /// change to it.
    fn dirty_read(
        &self,
        level: IsolationLevel,
        observer: &mut dyn Connection,
        writer: &mut dyn Connection,
    ) -> TransactionResult<(bool, String)> {
        let dirty_value = PROBE_VALUE * 10;
        observe(observer, level, |obs| {
            let mut pending = SessionGuard::begin(&mut *writer, IsolationLevel::ReadCommitted)?;
            let staged = pending
                .connection()
                .upsert(&self.table, &probe_key()?, value_row(dirty_value));
            let seen = staged
                .map_err(TransactionError::from)
                .and_then(|()| read_value(obs, &self.table, &probe_key()?));
            pending.rollback();
            let seen = seen?;

            Ok(if seen == dirty_value {
                (
                    true,
                    format!("read uncommitted value {seen} written by a concurrent transaction"),
                )
            } else {
                (
                    false,
                    format!("concurrent uncommitted write was not visible (read {seen})"),
                )
            })
        })
    }

    /// Observer reads the probe row twice around a committed update.
    fn non_repeatable_read(
        &self,
        level: IsolationLevel,
        observer: &mut dyn Connection,
        writer: &mut dyn Connection,
    ) -> TransactionResult<(bool, String)> {
        let updated = PROBE_VALUE * 2;
        let outcome = observe(observer, level, |obs| {
            let first = read_value(obs, &self.table, &probe_key()?)?;
            committed(&mut *writer, |w| {
                w.upsert(&self.table, &probe_key()?, value_row(updated))
            })?;
            let second = read_value(obs, &self.table, &probe_key()?)?;

            Ok(if first != second {
                (
                    true,
                    format!(
                        "first read returned {first}, second read after a concurrent commit \
                         returned {second}"
                    ),
                )
            } else {
                (
                    false,
                    format!("both reads returned {first} despite a concurrent commit of {updated}"),
                )
            })
        });

        // Put the probe back for the next scenario whatever happened.
        committed(writer, |w| {
            w.upsert(&self.table, &probe_key()?, value_row(PROBE_VALUE))
        })?;
        outcome
    }

    /// Observer counts a range twice around a committed insert into it.
    fn phantom_read(
        &self,
        level: IsolationLevel,
        observer: &mut dyn Connection,
        writer: &mut dyn Connection,
    ) -> TransactionResult<(bool, String)> {
        observe(observer, level, |obs| {
            let before = count_range(obs, &self.table)?;
            committed(&mut *writer, |w| {
                w.insert(&self.table, &RowKey::generate(), range_row(before as i64 + 1))
            })?;
            let after = count_range(obs, &self.table)?;

            Ok(if before != after {
                (
                    true,
                    format!("range count changed from {before} to {after} after a concurrent insert"),
                )
            } else {
                (
                    false,
                    format!("range count stayed at {before} despite a concurrent insert"),
                )
            })
        })
    }

    /// Replace the scratch table's contents with the probe row and two rows
    /// in the counted range.
    fn seed(&self, writer: &mut dyn Connection) -> TransactionResult<()> {
        let table = &self.table;
        committed(writer, |w| {
            clear_rows(w, table)?;
            w.insert(table, &probe_key()?, value_row(PROBE_VALUE))?;
            w.insert(table, &RowKey::new("range-1")?, range_row(1))?;
            w.insert(table, &RowKey::new("range-2")?, range_row(2))?;
            Ok(())
        })
    }

    fn clear(&self, writer: &mut dyn Connection) -> TransactionResult<()> {
        committed(writer, |w| clear_rows(w, &self.table))
    }
}

/// Run `f` in an observer transaction at `level` that is always rolled back.
fn observe<T>(
    observer: &mut dyn Connection,
    level: IsolationLevel,
    f: impl FnOnce(&mut dyn Connection) -> TransactionResult<T>,
) -> TransactionResult<T> {
    let mut session = SessionGuard::begin(observer, level)?;
    let outcome = f(session.connection());
    session.rollback();
    outcome
}

/// Run `f` in a committed READ COMMITTED transaction on the writer.
fn committed(
    writer: &mut dyn Connection,
    f: impl FnOnce(&mut dyn Connection) -> StoreResult<()>,
) -> TransactionResult<()> {
    let mut session = SessionGuard::begin(writer, IsolationLevel::ReadCommitted)?;
    match f(session.connection()) {
        Ok(()) => session.commit(),
        Err(err) => {
            session.rollback();
            Err(err.into())
        }
    }
}

fn clear_rows(conn: &mut dyn Connection, table: &TableName) -> StoreResult<()> {
    for (key, _) in conn.scan(table, &|_: &Row| true)? {
        conn.delete(table, &key)?;
    }
    Ok(())
}

fn probe_key() -> StoreResult<RowKey> {
    Ok(RowKey::new(PROBE_KEY)?)
}

fn value_row(value: i64) -> Row {
    let mut row = Row::new();
    row.insert("value".into(), json!(value));
    row
}

fn range_row(value: i64) -> Row {
    let mut row = value_row(value);
    row.insert("kind".into(), json!(RANGE_KIND));
    row
}

fn read_value(
    conn: &mut dyn Connection,
    table: &TableName,
    key: &RowKey,
) -> TransactionResult<i64> {
    conn.get(table, key)?
        .and_then(|row| row.get("value").and_then(|v| v.as_i64()))
        .ok_or_else(|| TransactionError::Internal(format!("probe row {table}/{key} is missing")))
}

fn count_range(conn: &mut dyn Connection, table: &TableName) -> TransactionResult<usize> {
    let in_range = |row: &Row| row.get("kind").and_then(|k| k.as_str()) == Some(RANGE_KIND);
    let rows = conn.scan(table, &in_range)?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConnectionPool, MemoryStore, PoolConfig};

    fn report(level: IsolationLevel) -> IsolationTestReport {
        IsolationAnomalyTester::new(MemoryStore::new())
            .unwrap()
            .test_isolation_level(level)
            .unwrap()
    }

    fn detected(report: &IsolationTestReport, scenario: Anomaly) -> bool {
        report.result(scenario).unwrap().anomaly_detected
    }

    #[test]
    fn test_read_uncommitted_sees_dirty_reads() {
        let report = report(IsolationLevel::ReadUncommitted);
        assert!(detected(&report, Anomaly::DirtyRead));
        assert!(detected(&report, Anomaly::NonRepeatableRead));
        assert!(detected(&report, Anomaly::PhantomRead));
        assert!(report.recommendations[0].contains("READ COMMITTED"));
    }

    #[test]
    fn test_dirty_reads_prevented_from_read_committed() {
        for level in [
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            let report = report(level);
            assert!(!detected(&report, Anomaly::DirtyRead), "{level}");
        }
    }

    #[test]
    fn test_read_committed_anomalies() {
        let report = report(IsolationLevel::ReadCommitted);
        assert!(detected(&report, Anomaly::NonRepeatableRead));
        assert!(detected(&report, Anomaly::PhantomRead));
        assert_eq!(report.recommendations.len(), 2);
    }

    #[test]
    fn test_repeatable_read_still_has_phantoms() {
        let report = report(IsolationLevel::RepeatableRead);
        assert!(!detected(&report, Anomaly::NonRepeatableRead));
        assert!(detected(&report, Anomaly::PhantomRead));
    }

    #[test]
    fn test_serializable_is_clean() {
        let report = report(IsolationLevel::Serializable);
        assert_eq!(report.detected().count(), 0);
        assert_eq!(report.results.len(), 3);
        assert!(report
            .results
            .iter()
            .all(|r| r.isolation_level == IsolationLevel::Serializable));
    }

    #[test]
    fn test_scratch_table_cleared_and_settings_restored() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default().max_connections(2));
        let table = TableName::new("scratch").unwrap();
        let tester = IsolationAnomalyTester::new(pool.clone())
            .unwrap()
            .with_table(table.clone());

        tester.test_isolation_level(IsolationLevel::RepeatableRead).unwrap();

        assert_eq!(pool.in_use(), 0);
        let mut a = pool.get().unwrap();
        let b = pool.get().unwrap();
        for conn in [&a, &b] {
            assert_eq!(conn.isolation_level(), IsolationLevel::ReadCommitted);
            assert!(conn.auto_commit());
        }
        assert!(a.scan(&table, &|_| true).unwrap().is_empty());
    }

    #[test]
    fn test_same_tester_runs_every_level() {
        let tester = IsolationAnomalyTester::new(MemoryStore::new()).unwrap();
        let dirty: Vec<bool> = IsolationLevel::ALL
            .iter()
            .map(|level| {
                let report = tester.test_isolation_level(*level).unwrap();
                detected(&report, Anomaly::DirtyRead)
            })
            .collect();
        assert_eq!(dirty, vec![true, false, false, false]);
    }
}
