//! Isolation level characterization.
//!
//! [`IsolationAnomalyTester`] checks which read anomalies a store actually
//! lets through at a given isolation level, rather than trusting the level's
//! name.
//!
//! ```
//! use txcoord::anomaly::{Anomaly, IsolationAnomalyTester};
//! use txcoord::store::MemoryStore;
//! use txcoord::transaction::IsolationLevel;
//!
//! let tester = IsolationAnomalyTester::new(MemoryStore::new()).unwrap();
//! let report = tester.test_isolation_level(IsolationLevel::ReadCommitted).unwrap();
//! assert!(!report.result(Anomaly::DirtyRead).unwrap().anomaly_detected);
//! ```

mod report;
mod tester;

pub use report::{Anomaly, IsolationTestReport, IsolationTestResult};
pub use tester::{IsolationAnomalyTester, DEFAULT_PROBE_TABLE};
