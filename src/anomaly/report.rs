//! Anomaly scenarios and their reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transaction::IsolationLevel;

/// Read anomalies the tester can provoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Anomaly {
    DirtyRead,
    NonRepeatableRead,
    PhantomRead,
}

impl Anomaly {
    pub const ALL: [Anomaly; 3] = [
        Anomaly::DirtyRead,
        Anomaly::NonRepeatableRead,
        Anomaly::PhantomRead,
    ];

    /// Weakest ANSI level that rules the anomaly out.
    pub fn minimum_preventing_level(&self) -> IsolationLevel {
        match self {
            Anomaly::DirtyRead => IsolationLevel::ReadCommitted,
            Anomaly::NonRepeatableRead => IsolationLevel::RepeatableRead,
            Anomaly::PhantomRead => IsolationLevel::Serializable,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::DirtyRead => write!(f, "dirty read"),
            Anomaly::NonRepeatableRead => write!(f, "non-repeatable read"),
            Anomaly::PhantomRead => write!(f, "phantom read"),
        }
    }
}

/// Outcome of one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationTestResult {
    pub isolation_level: IsolationLevel,
    pub scenario: Anomaly,
    pub anomaly_detected: bool,
    pub description: String,
}

/// All scenario results for one isolation level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationTestReport {
    pub isolation_level: IsolationLevel,
    pub results: Vec<IsolationTestResult>,
    pub recommendations: Vec<String>,
}

impl IsolationTestReport {
    pub(crate) fn new(isolation_level: IsolationLevel, results: Vec<IsolationTestResult>) -> Self {
        let mut recommendations: Vec<String> = results
            .iter()
            .filter(|r| r.anomaly_detected)
            .map(|r| {
                format!(
                    "{} observed at {}: use {} or stronger to prevent it",
                    r.scenario,
                    isolation_level,
                    r.scenario.minimum_preventing_level()
                )
            })
            .collect();
        if recommendations.is_empty() {
            recommendations.push(format!("No anomalies observed at {isolation_level}"));
        }

        Self {
            isolation_level,
            results,
            recommendations,
        }
    }

    pub fn result(&self, scenario: Anomaly) -> Option<&IsolationTestResult> {
        self.results.iter().find(|r| r.scenario == scenario)
    }

    pub fn detected(&self) -> impl Iterator<Item = Anomaly> + '_ {
        self.results
            .iter()
            .filter(|r| r.anomaly_detected)
            .map(|r| r.scenario)
    }
}

impl fmt::Display for IsolationTestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Isolation level: {}", self.isolation_level)?;
        for result in &self.results {
            let verdict = if result.anomaly_detected {
                "DETECTED"
            } else {
                "prevented"
            };
            writeln!(f, "  {:<20} {:<9} {}", result.scenario, verdict, result.description)?;
        }
        writeln!(f, "Recommendations:")?;
        for line in &self.recommendations {
            writeln!(f, "  - {line}")?;
        }
        Ok(())
    }
}
