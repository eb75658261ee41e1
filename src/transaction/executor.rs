//! Single-connection transaction boundary.

use tracing::{debug, warn};

use crate::store::{Connection, ConnectionFactory};
use crate::transaction::error::TransactionResult;
use crate::transaction::isolation::IsolationLevel;

/// Runs units of work inside a transaction at a requested isolation level.
///
/// Each `run` acquires its own connection from the factory, so one executor
/// can be shared by any number of threads.
#[derive(Debug, Clone)]
pub struct TransactionExecutor<F> {
    factory: F,
}

impl<F: ConnectionFactory> TransactionExecutor<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Execute `operation` in a transaction at `level`.
    ///
    /// Commits when the operation succeeds and rolls back when either the
    /// operation or the commit fails, returning that failure unchanged. The
    /// connection's isolation level and auto-commit flag are put back on
    /// every exit path, unwinding included.
    pub fn run<T, Op>(&self, level: IsolationLevel, operation: Op) -> TransactionResult<T>
    where
        Op: FnOnce(&mut dyn Connection) -> TransactionResult<T>,
    {
        let mut conn = self.factory.acquire()?;
        let mut session = SessionGuard::begin(&mut conn, level)?;

        match operation(session.connection()) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "operation failed, rolling back");
                session.rollback();
                Err(err)
            }
        }
    }
}

/// Transaction scope on a borrowed connection.
///
/// Remembers the session settings found on the connection, switches to an
/// explicit transaction at the requested level, and on drop rolls back
/// anything left open before restoring the remembered settings. Failures
/// while cleaning up are logged, never returned, so they cannot replace the
/// outcome of the work itself.
pub(crate) struct SessionGuard<'c> {
    conn: &'c mut dyn Connection,
    original_level: IsolationLevel,
    original_auto_commit: bool,
    finished: bool,
}

impl<'c> SessionGuard<'c> {
    pub(crate) fn begin(
        conn: &'c mut dyn Connection,
        level: IsolationLevel,
    ) -> TransactionResult<Self> {
        let original_level = conn.isolation_level();
        let original_auto_commit = conn.auto_commit();
        let mut guard = Self {
            conn,
            original_level,
            original_auto_commit,
            finished: false,
        };

        // An auto-commit connection has nothing open, so the level can be
        // switched before leaving auto-commit mode.
        let switched = guard
            .conn
            .set_isolation_level(level)
            .and_then(|()| guard.conn.set_auto_commit(false));
        if let Err(err) = switched {
            guard.finished = true;
            return Err(err.into());
        }
        debug!(level = %level, "transaction started");
        Ok(guard)
    }

    pub(crate) fn connection(&mut self) -> &mut dyn Connection {
        &mut *self.conn
    }

    /// Commit. A failed commit is followed by a rollback and then reported.
    pub(crate) fn commit(&mut self) -> TransactionResult<()> {
        self.finished = true;
        if let Err(err) = self.conn.commit() {
            warn!(error = %err, "commit failed, rolling back");
            if let Err(rollback_err) = self.conn.rollback() {
                warn!(error = %rollback_err, "rollback after failed commit also failed");
            }
            return Err(err.into());
        }
        debug!("transaction committed");
        Ok(())
    }

    pub(crate) fn rollback(&mut self) {
        self.finished = true;
        match self.conn.rollback() {
            Ok(()) => debug!("transaction rolled back"),
            Err(err) => warn!(error = %err, "rollback failed"),
        }
    }

    fn restore(&mut self) {
        if let Err(err) = self.conn.set_isolation_level(self.original_level) {
            warn!(error = %err, level = %self.original_level, "failed to restore isolation level");
        }
        if let Err(err) = self.conn.set_auto_commit(self.original_auto_commit) {
            warn!(error = %err, "failed to restore auto-commit");
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("transaction scope exited without commit or rollback, rolling back");
            self.rollback();
        }
        self.restore();
    }
}
