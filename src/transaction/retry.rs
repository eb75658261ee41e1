//! Deadlock-aware retry loop around [`TransactionExecutor`].
//!
//! Every attempt's result is classified into an [`AttemptOutcome`] by a
//! pluggable [`FailureClassifier`]; only `Retryable` outcomes are retried,
//! after a backoff sleep that a [`CancellationToken`] can cut short.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::store::{Connection, ConnectionFactory};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::executor::TransactionExecutor;
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::policy::RetryPolicy;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Fatal,
}

/// Decides whether a failure is a transient concurrency conflict.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &TransactionError) -> FailureKind;
}

/// Classifier keyed on SQLSTATE codes, with message matching as a fallback
/// for drivers that only report text.
#[derive(Debug, Clone, Default)]
pub struct SqlStateClassifier;

impl SqlStateClassifier {
    /// Deadlock, serialization failure and lock timeout (PostgreSQL style),
    /// plus MySQL's deadlock (1213) and lock wait timeout (1205).
    pub const RETRYABLE_CODES: [&'static str; 5] = ["40P01", "40001", "55P03", "1213", "1205"];

    const RETRYABLE_MESSAGES: [&'static str; 4] = [
        "deadlock",
        "lock timeout",
        "lock wait timeout",
        "could not serialize",
    ];
}

impl FailureClassifier for SqlStateClassifier {
    fn classify(&self, error: &TransactionError) -> FailureKind {
        if let Some(code) = error.sqlstate() {
            if Self::RETRYABLE_CODES.contains(&code) {
                return FailureKind::Retryable;
            }
        }

        // Walk the source chain so wrapped driver messages are seen too.
        let mut current: Option<&dyn std::error::Error> = Some(error);
        while let Some(err) = current {
            let message = err.to_string().to_lowercase();
            if Self::RETRYABLE_MESSAGES.iter().any(|m| message.contains(m)) {
                return FailureKind::Retryable;
            }
            current = err.source();
        }
        FailureKind::Fatal
    }
}

/// Classified result of one attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Ok(T),
    Retryable(TransactionError),
    Fatal(TransactionError),
}

impl<T> AttemptOutcome<T> {
    pub fn classify(result: TransactionResult<T>, classifier: &dyn FailureClassifier) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Ok(value),
            Err(err) => match classifier.classify(&err) {
                FailureKind::Retryable => AttemptOutcome::Retryable(err),
                FailureKind::Fatal => AttemptOutcome::Fatal(err),
            },
        }
    }
}

/// Cancellation signal shared between a retry loop and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake any sleeping waiter.
    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Block for up to `timeout`. Returns `true` if cancelled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.signal.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Result of a backoff pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    Elapsed,
    Cancelled,
}

/// Sleeps between attempts.
pub trait Backoff: Send + Sync {
    fn pause(&self, delay: Duration, token: &CancellationToken) -> Pause;
}

/// Blocks the calling thread, waking early on cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadBackoff;

impl Backoff for ThreadBackoff {
    fn pause(&self, delay: Duration, token: &CancellationToken) -> Pause {
        if token.wait_timeout(delay) {
            Pause::Cancelled
        } else {
            Pause::Elapsed
        }
    }
}

/// Re-runs transactions that fail with deadlocks or serialization conflicts.
///
/// The coordinator's own [`CancellationToken`] stays cancelled once
/// cancelled: every later [`run_with_retry`](Self::run_with_retry) returns
/// `Interrupted { attempts: 0 }` until a fresh token is installed with
/// [`with_cancellation`](Self::with_cancellation). To cancel one call
/// without affecting others, pass a token to
/// [`run_with_retry_cancellable`](Self::run_with_retry_cancellable).
pub struct DeadlockRetryCoordinator<F> {
    executor: TransactionExecutor<F>,
    isolation: IsolationLevel,
    classifier: Arc<dyn FailureClassifier>,
    backoff: Arc<dyn Backoff>,
    token: CancellationToken,
}

impl<F: ConnectionFactory> DeadlockRetryCoordinator<F> {
    pub fn new(executor: TransactionExecutor<F>) -> Self {
        Self {
            executor,
            isolation: IsolationLevel::default(),
            classifier: Arc::new(SqlStateClassifier),
            backoff: Arc::new(ThreadBackoff),
            token: CancellationToken::new(),
        }
    }

    /// Isolation level used by [`run_with_retry`](Self::run_with_retry).
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    pub fn with_classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// The token shared by every call that does not bring its own.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn executor(&self) -> &TransactionExecutor<F> {
        &self.executor
    }

    /// Run `operation` at the coordinator's isolation level, retrying
    /// retryable failures as `policy` allows.
    pub fn run_with_retry<T, Op>(&self, policy: &RetryPolicy, operation: Op) -> TransactionResult<T>
    where
        Op: FnMut(&mut dyn Connection) -> TransactionResult<T>,
    {
        self.run_with_retry_at(self.isolation, policy, operation)
    }

    /// Like [`run_with_retry`](Self::run_with_retry) at an explicit level.
    pub fn run_with_retry_at<T, Op>(
        &self,
        level: IsolationLevel,
        policy: &RetryPolicy,
        operation: Op,
    ) -> TransactionResult<T>
    where
        Op: FnMut(&mut dyn Connection) -> TransactionResult<T>,
    {
        self.run_with_retry_cancellable(level, policy, &self.token, operation)
    }

    /// Like [`run_with_retry_at`](Self::run_with_retry_at), interrupted by
    /// `token` instead of the coordinator's token.
    pub fn run_with_retry_cancellable<T, Op>(
        &self,
        level: IsolationLevel,
        policy: &RetryPolicy,
        token: &CancellationToken,
        mut operation: Op,
    ) -> TransactionResult<T>
    where
        Op: FnMut(&mut dyn Connection) -> TransactionResult<T>,
    {
        if token.is_cancelled() {
            return Err(TransactionError::Interrupted { attempts: 0 });
        }

        let mut attempt = 1;
        loop {
            let result = self.executor.run(level, &mut operation);
            match AttemptOutcome::classify(result, self.classifier.as_ref()) {
                AttemptOutcome::Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "transaction succeeded after retry");
                    }
                    return Ok(value);
                }
                AttemptOutcome::Fatal(err) => {
                    debug!(attempt, error = %err, "non-retryable failure");
                    return Err(err);
                }
                AttemptOutcome::Retryable(err) => {
                    if attempt >= policy.max_attempts() {
                        warn!(attempts = attempt, error = %err, "retry budget exhausted");
                        return Err(TransactionError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    let delay = policy.delay(attempt);
                    debug!(attempt, ?delay, error = %err, "retryable failure, backing off");
                    if self.backoff.pause(delay, token) == Pause::Cancelled {
                        info!(attempts = attempt, "retry interrupted");
                        return Err(TransactionError::Interrupted { attempts: attempt });
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl<F: std::fmt::Debug> std::fmt::Debug for DeadlockRetryCoordinator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockRetryCoordinator")
            .field("executor", &self.executor)
            .field("isolation", &self.isolation)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use serde_json::json;

    use crate::store::{MemoryStore, Row, RowKey, StoreConfig, StoreError, StoreId, TableName};
    use crate::transaction::executor::tests::{Event, RecordingFactory};
    use crate::transaction::lock_rows_in_order;

    /// Records requested delays without sleeping.
    #[derive(Clone, Default)]
    struct RecordingBackoff {
        delays: Arc<Mutex<Vec<Duration>>>,
        cancel_on_pause: bool,
    }

    impl Backoff for RecordingBackoff {
        fn pause(&self, delay: Duration, token: &CancellationToken) -> Pause {
            self.delays.lock().push(delay);
            if self.cancel_on_pause {
                token.cancel();
                return Pause::Cancelled;
            }
            Pause::Elapsed
        }
    }

    fn deadlock() -> TransactionError {
        StoreError::Deadlock {
            txn: 1,
            table: TableName::new("accounts").unwrap(),
            key: RowKey::new("1").unwrap(),
        }
        .into()
    }

    fn coordinator(backoff: RecordingBackoff) -> DeadlockRetryCoordinator<RecordingFactory> {
        DeadlockRetryCoordinator::new(TransactionExecutor::new(RecordingFactory::default()))
            .with_backoff(backoff)
    }

    #[test]
    fn test_classifier() {
        let classifier = SqlStateClassifier;
        assert_eq!(classifier.classify(&deadlock()), FailureKind::Retryable);

        let mysql = TransactionError::from(StoreError::Driver {
            sqlstate: "1213".into(),
            message: "Deadlock found when trying to get lock".into(),
        });
        assert_eq!(classifier.classify(&mysql), FailureKind::Retryable);

        let by_message = TransactionError::from(StoreError::Driver {
            sqlstate: "HY000".into(),
            message: "Lock wait timeout exceeded; try restarting transaction".into(),
        });
        assert_eq!(classifier.classify(&by_message), FailureKind::Retryable);

        let dup = TransactionError::from(StoreError::UniqueViolation {
            table: TableName::new("accounts").unwrap(),
            key: RowKey::new("1").unwrap(),
        });
        assert_eq!(classifier.classify(&dup), FailureKind::Fatal);
        assert_eq!(
            classifier.classify(&StoreError::ConnectionClosed.into()),
            FailureKind::Fatal
        );
    }

    #[test]
    fn test_exhausts_with_geometric_delays() {
        let backoff = RecordingBackoff::default();
        let coordinator = coordinator(backoff.clone());
        let calls = AtomicU32::new(0);

        let err = coordinator
            .run_with_retry(&RetryPolicy::default(), |_| -> TransactionResult<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(deadlock())
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *backoff.delays.lock(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        match err {
            TransactionError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.sqlstate(), Some("40P01"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fatal_error_not_retried() {
        let backoff = RecordingBackoff::default();
        let coordinator = coordinator(backoff.clone());
        let calls = AtomicU32::new(0);

        let err = coordinator
            .run_with_retry(&RetryPolicy::default(), |_| -> TransactionResult<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransactionError::aborted("insufficient funds"))
            })
            .unwrap_err();

        assert!(matches!(err, TransactionError::Aborted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backoff.delays.lock().is_empty());
    }

    #[test]
    fn test_succeeds_after_retry() {
        let backoff = RecordingBackoff::default();
        let coordinator = coordinator(backoff.clone());
        let mut calls = 0;

        let value = coordinator
            .run_with_retry(&RetryPolicy::default(), |_| {
                calls += 1;
                if calls == 1 {
                    Err(deadlock())
                } else {
                    Ok("done")
                }
            })
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls, 2);
        assert_eq!(*backoff.delays.lock(), vec![Duration::from_millis(100)]);
        // One rollback for the failed attempt, one commit for the second.
        let events = coordinator.executor().factory().events();
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == Event::Commit)
                .count(),
            1
        );
    }

    #[test]
    fn test_cancellation_during_backoff() {
        let coordinator = coordinator(RecordingBackoff {
            cancel_on_pause: true,
            ..Default::default()
        });

        let err = coordinator
            .run_with_retry(&RetryPolicy::default(), |_| -> TransactionResult<()> {
                Err(deadlock())
            })
            .unwrap_err();

        assert!(matches!(err, TransactionError::Interrupted { attempts: 1 }));
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let coordinator = coordinator(RecordingBackoff::default()).with_cancellation(token);
        let calls = AtomicU32::new(0);

        let err = coordinator
            .run_with_retry(&RetryPolicy::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, TransactionError::Interrupted { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_coordinator_token_stays_cancelled() {
        let coordinator = coordinator(RecordingBackoff {
            cancel_on_pause: true,
            ..Default::default()
        });
        let policy = RetryPolicy::default();

        let first = coordinator.run_with_retry(&policy, |_| -> TransactionResult<()> {
            Err(deadlock())
        });
        assert!(matches!(first, Err(TransactionError::Interrupted { attempts: 1 })));
        assert!(coordinator.cancellation_token().is_cancelled());

        let second = coordinator.run_with_retry(&policy, |_| Ok(()));
        assert!(matches!(second, Err(TransactionError::Interrupted { attempts: 0 })));

        let coordinator = coordinator.with_cancellation(CancellationToken::new());
        assert!(coordinator.run_with_retry(&policy, |_| Ok(())).is_ok());
    }

    #[test]
    fn test_per_call_token_leaves_coordinator_usable() {
        let coordinator = coordinator(RecordingBackoff {
            cancel_on_pause: true,
            ..Default::default()
        });
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();

        let err = coordinator
            .run_with_retry_cancellable(
                IsolationLevel::ReadCommitted,
                &policy,
                &token,
                |_| -> TransactionResult<()> { Err(deadlock()) },
            )
            .unwrap_err();

        assert!(matches!(err, TransactionError::Interrupted { attempts: 1 }));
        assert!(token.is_cancelled());
        assert!(!coordinator.cancellation_token().is_cancelled());
        assert_eq!(coordinator.run_with_retry(&policy, |_| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_thread_backoff_wakes_on_cancel() {
        let token = CancellationToken::new();
        let coordinator = DeadlockRetryCoordinator::new(TransactionExecutor::new(
            RecordingFactory::default(),
        ))
        .with_cancellation(token.clone());
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(30))
            .max_delay(Duration::from_secs(30))
            .build()
            .unwrap();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        let started = Instant::now();
        let err = coordinator
            .run_with_retry(&policy, |_| -> TransactionResult<()> { Err(deadlock()) })
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, TransactionError::Interrupted { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    fn accounts() -> TableName {
        TableName::new("accounts").unwrap()
    }

    fn balance_row(amount: i64) -> Row {
        json!({ "balance": amount }).as_object().cloned().unwrap()
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::with_config(
            StoreConfig::new(StoreId::new("bank").unwrap())
                .lock_wait_timeout(Duration::from_secs(10)),
        );
        let mut conn = store.connect();
        conn.insert(&accounts(), &RowKey::new("1").unwrap(), balance_row(1000))
            .unwrap();
        conn.insert(&accounts(), &RowKey::new("2").unwrap(), balance_row(2000))
            .unwrap();
        store
    }

    fn read_balance(conn: &mut dyn Connection, key: &RowKey) -> TransactionResult<i64> {
        let row = conn
            .get(&accounts(), key)?
            .ok_or_else(|| TransactionError::aborted(format!("account {key} not found")))?;
        row.get("balance")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| TransactionError::aborted("balance is not a number"))
    }

    fn move_funds(
        conn: &mut dyn Connection,
        from: &RowKey,
        to: &RowKey,
        amount: i64,
    ) -> TransactionResult<()> {
        let from_balance = read_balance(conn, from)?;
        let to_balance = read_balance(conn, to)?;
        conn.upsert(&accounts(), from, balance_row(from_balance - amount))?;
        conn.upsert(&accounts(), to, balance_row(to_balance + amount))?;
        Ok(())
    }

    fn final_balances(store: &MemoryStore) -> (Row, Row) {
        (
            store
                .committed_row(&accounts(), &RowKey::new("1").unwrap())
                .unwrap(),
            store
                .committed_row(&accounts(), &RowKey::new("2").unwrap())
                .unwrap(),
        )
    }

    #[test]
    fn test_ordered_opposite_transfers_never_retry() {
        let store = seeded_store();
        let coordinator = DeadlockRetryCoordinator::new(TransactionExecutor::new(store.clone()));
        let barrier = Barrier::new(2);
        let attempts = AtomicU32::new(0);
        let one = RowKey::new("1").unwrap();
        let two = RowKey::new("2").unwrap();

        thread::scope(|s| {
            for (from, to, amount) in [(&one, &two, 100), (&two, &one, 50)] {
                let coordinator = &coordinator;
                let barrier = &barrier;
                let attempts = &attempts;
                s.spawn(move || {
                    barrier.wait();
                    coordinator
                        .run_with_retry(&RetryPolicy::default(), |conn| {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            lock_rows_in_order(conn, &accounts(), &[from.clone(), to.clone()])?;
                            move_funds(conn, from, to, amount)
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(final_balances(&store), (balance_row(950), balance_row(2050)));
    }

    #[test]
    fn test_unordered_transfers_deadlock_then_recover() {
        let store = seeded_store();
        let coordinator = DeadlockRetryCoordinator::new(TransactionExecutor::new(store.clone()));
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        let barrier = Barrier::new(2);
        let attempts = AtomicU32::new(0);
        let one = RowKey::new("1").unwrap();
        let two = RowKey::new("2").unwrap();

        thread::scope(|s| {
            for (from, to, amount) in [(&one, &two, 100), (&two, &one, 50)] {
                let coordinator = &coordinator;
                let barrier = &barrier;
                let attempts = &attempts;
                let policy = &policy;
                s.spawn(move || {
                    let mut first = true;
                    coordinator
                        .run_with_retry(policy, |conn| {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            // Source row first, then meet the other thread so
                            // both hold one lock and want the other's.
                            conn.lock_row(&accounts(), from)?;
                            if std::mem::take(&mut first) {
                                barrier.wait();
                            }
                            conn.lock_row(&accounts(), to)?;
                            move_funds(conn, from, to, amount)
                        })
                        .unwrap();
                });
            }
        });

        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(final_balances(&store), (balance_row(950), balance_row(2050)));
    }
}
