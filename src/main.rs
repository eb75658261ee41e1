//! txcoord command-line interface.
//!
//! Runs the coordinators against in-memory stores.
//!
//! # Commands
//!
//! - `isolation-report` - Probe read anomalies per isolation level
//! - `transfer-demo` - Concurrent opposite transfers with deadlock retry
//! - `twopc-demo` - Two-phase commit across four stores

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use txcoord::anomaly::IsolationAnomalyTester;
use txcoord::config::Config;
use txcoord::distributed::{
    DistributedOperation, DistributedResult, DistributedTransactionCoordinator, FileOutcomeLog,
    InMemoryOutcomeLog, OutcomeLog,
};
use txcoord::store::{Connection, ConnectionPool, MemoryStore, Row, RowKey, StoreId, TableName};
use txcoord::transaction::{
    lock_rows_in_order, DeadlockRetryCoordinator, IsolationLevel, TransactionError,
    TransactionExecutor, TransactionResult,
};

type CliResult = Result<(), Box<dyn Error>>;

/// Transaction coordination toolkit.
#[derive(Parser)]
#[command(name = "txcoord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe dirty, non-repeatable and phantom reads
    IsolationReport {
        /// Test only this level (default: all four)
        #[arg(short, long)]
        level: Option<IsolationLevel>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run two opposite transfers concurrently
    TransferDemo {
        /// Lock rows in transfer order instead of ascending key order
        #[arg(long)]
        unordered: bool,
    },

    /// Run a two-phase commit across orders, billing, audit and reports
    TwopcDemo {
        /// Make this store vote to roll back at prepare
        #[arg(long, value_parser = WRITERS)]
        reject: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::IsolationReport { level, json } => isolation_report(&config, level, json),
        Commands::TransferDemo { unordered } => transfer_demo(&config, unordered),
        Commands::TwopcDemo { reject } => twopc_demo(&config, reject),
    }
}

fn isolation_report(config: &Config, level: Option<IsolationLevel>, json: bool) -> CliResult {
    let store = MemoryStore::with_config(config.store_config(StoreId::default()));
    let pool = ConnectionPool::new(store, config.pool_config());
    let tester = IsolationAnomalyTester::new(pool)?;

    let levels = match level {
        Some(level) => vec![level],
        None => IsolationLevel::ALL.to_vec(),
    };
    let reports = levels
        .into_iter()
        .map(|level| tester.test_isolation_level(level))
        .collect::<TransactionResult<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{report}");
        }
    }
    Ok(())
}

fn accounts() -> Result<TableName, Box<dyn Error>> {
    Ok(TableName::new("accounts")?)
}

fn balance_row(amount: i64) -> Row {
    let mut row = Row::new();
    row.insert("balance".into(), json!(amount));
    row
}

fn balance(conn: &mut dyn Connection, table: &TableName, key: &RowKey) -> TransactionResult<i64> {
    conn.get(table, key)?
        .and_then(|row| row.get("balance").and_then(Value::as_i64))
        .ok_or_else(|| TransactionError::aborted(format!("account {key} not found")))
}

fn transfer_demo(config: &Config, unordered: bool) -> CliResult {
    let table = accounts()?;
    let one = RowKey::new("1")?;
    let two = RowKey::new("2")?;

    let store = MemoryStore::with_config(config.store_config(StoreId::new("bank")?));
    {
        let mut conn = store.connect();
        conn.insert(&table, &one, balance_row(1000))?;
        conn.insert(&table, &two, balance_row(2000))?;
    }

    let pool = ConnectionPool::new(store.clone(), config.pool_config());
    let coordinator = DeadlockRetryCoordinator::new(TransactionExecutor::new(pool))
        .with_isolation(config.store.default_isolation);
    let policy = config.retry_policy()?;
    let attempts = AtomicU32::new(0);
    let barrier = Barrier::new(2);

    let outcomes: Vec<TransactionResult<()>> = thread::scope(|s| {
        let handles: Vec<_> = [(&one, &two, 100), (&two, &one, 50)]
            .into_iter()
            .map(|(from, to, amount)| {
                let (coordinator, attempts, barrier, table) =
                    (&coordinator, &attempts, &barrier, &table);
                s.spawn(move || {
                    let mut first = true;
                    coordinator.run_with_retry(&policy, |conn| {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        if unordered {
                            conn.lock_row(table, from)?;
                            if std::mem::take(&mut first) {
                                barrier.wait();
                            }
                            conn.lock_row(table, to)?;
                        } else {
                            lock_rows_in_order(conn, table, &[from.clone(), to.clone()])?;
                        }
                        let from_balance = balance(conn, table, from)?;
                        let to_balance = balance(conn, table, to)?;
                        conn.upsert(table, from, balance_row(from_balance - amount))?;
                        conn.upsert(table, to, balance_row(to_balance + amount))?;
                        Ok(())
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(TransactionError::Internal("transfer thread panicked".into()))
                })
            })
            .collect()
    });
    for outcome in outcomes {
        outcome?;
    }

    let mut conn = store.connect();
    let total_attempts = attempts.load(Ordering::SeqCst);
    info!(attempts = total_attempts, "transfers finished");
    println!("account 1: {}", balance(&mut conn, &table, &one)?);
    println!("account 2: {}", balance(&mut conn, &table, &two)?);
    println!("attempts:  {} ({} retries)", total_attempts, total_attempts.saturating_sub(2));
    Ok(())
}

/// Stores that write in the two-phase commit demo. A fourth store,
/// `reports`, only reads and votes read-only.
const WRITERS: [&str; 3] = ["orders", "billing", "audit"];

fn twopc_demo(config: &Config, reject: Option<String>) -> CliResult {
    let result = run_twopc(config, reject.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_twopc(config: &Config, reject: Option<&str>) -> Result<DistributedResult, Box<dyn Error>> {
    let log: Arc<dyn OutcomeLog> = match &config.outcome_log {
        Some(path) => Arc::new(FileOutcomeLog::open(path)?),
        None => Arc::new(InMemoryOutcomeLog::new()),
    };
    let mut coordinator = DistributedTransactionCoordinator::new(log);

    let table = TableName::new("entries")?;
    let key = RowKey::new("order-1")?;
    let mut stores = Vec::new();
    for name in WRITERS.into_iter().chain(["reports"]) {
        let store = MemoryStore::with_config(config.store_config(StoreId::new(name)?));
        coordinator.register(Arc::new(store.clone()));
        stores.push(store);
    }

    let recovery = coordinator.recover_pending_transactions()?;
    info!(recovered = recovery.recovered_count, "startup recovery finished");

    // A rejecting store already holds the entry, so its insert fails and the
    // branch can only vote to roll back.
    if let Some(name) = reject {
        let store = stores
            .iter()
            .find(|s| s.store_id().as_str() == name && WRITERS.contains(&name))
            .ok_or_else(|| {
                format!("cannot reject {name}: expected one of {}", WRITERS.join(", "))
            })?;
        store.connect().insert(&table, &key, Row::new())?;
    }

    let mut op = DistributedOperation::new();
    for store in &stores {
        op = op.participant(store.store_id().clone());
    }
    let payloads = [
        json!({ "amount": 40 }),
        json!({ "amount": -40 }),
        json!({ "event": "transfer", "amount": 40 }),
    ];
    for (store, payload) in stores.iter().zip(payloads) {
        let (table, key) = (table.clone(), key.clone());
        op = op.step(store.store_id().clone(), move |conn| {
            let row = payload.as_object().cloned().unwrap_or_default();
            match conn.insert(&table, &key, row) {
                Ok(()) => Ok(json!({ "inserted": key.as_str() })),
                Err(err) => Ok(json!({ "failed": err.to_string() })),
            }
        });
    }
    if let Some(reports) = stores.last() {
        let (table, key) = (table.clone(), key.clone());
        op = op.step(reports.store_id().clone(), move |conn| {
            Ok(json!({ "seen": conn.get(&table, &key)?.is_some() }))
        });
    }

    Ok(coordinator.execute_distributed(op)?)
}
