//! Durable record of two-phase commit decisions.
//!
//! Only commit decisions are written. A prepared branch whose global id has
//! no commit decision is rolled back during recovery (presumed abort), so
//! the coordinator must record the decision before telling any participant
//! to commit.
//!
//! File format: one JSON object per line.
//!
//! ```text
//! {"event":"commit","global_id":"01J...","participants":["orders","billing"],"at":"2025-..."}
//! {"event":"complete","global_id":"01J...","at":"2025-..."}
//! ```
//!
//! A final line without its newline is what a crash in the middle of an
//! append leaves behind. Replay drops it if it does not parse; a bad line
//! anywhere else is reported as corruption. Opening the log rewrites it with
//! only the outstanding decisions whenever it holds anything else.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::store::StoreId;

/// Outcome log failures.
#[derive(Debug, Error)]
pub enum OutcomeLogError {
    #[error("outcome log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode outcome log entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt outcome log entry at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// A logged commit decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDecision {
    pub global_id: Ulid,
    pub participants: Vec<StoreId>,
    pub decided_at: DateTime<Utc>,
}

/// Decision store consulted by the coordinator and by recovery.
pub trait OutcomeLog: Send + Sync {
    /// Durably record that `global_id` will commit. Must not return before
    /// the record would survive a crash.
    fn record_commit(&self, global_id: Ulid, participants: &[StoreId])
        -> Result<(), OutcomeLogError>;

    /// The commit decision for `global_id`, if one is outstanding.
    fn decision(&self, global_id: &Ulid) -> Result<Option<CommitDecision>, OutcomeLogError>;

    /// Forget `global_id` once every branch has been resolved.
    fn complete(&self, global_id: &Ulid) -> Result<(), OutcomeLogError>;

    /// Commit decisions that have not been completed yet.
    fn outstanding(&self) -> Result<Vec<CommitDecision>, OutcomeLogError>;
}

/// Outcome log kept in process memory. Decisions do not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeLog {
    decisions: Mutex<BTreeMap<Ulid, CommitDecision>>,
}

impl InMemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutcomeLog for InMemoryOutcomeLog {
    fn record_commit(
        &self,
        global_id: Ulid,
        participants: &[StoreId],
    ) -> Result<(), OutcomeLogError> {
        self.decisions.lock().insert(
            global_id,
            CommitDecision {
                global_id,
                participants: participants.to_vec(),
                decided_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn decision(&self, global_id: &Ulid) -> Result<Option<CommitDecision>, OutcomeLogError> {
        Ok(self.decisions.lock().get(global_id).cloned())
    }

    fn complete(&self, global_id: &Ulid) -> Result<(), OutcomeLogError> {
        self.decisions.lock().remove(global_id);
        Ok(())
    }

    fn outstanding(&self) -> Result<Vec<CommitDecision>, OutcomeLogError> {
        Ok(self.decisions.lock().values().cloned().collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogEntry {
    Commit {
        global_id: Ulid,
        participants: Vec<StoreId>,
        at: DateTime<Utc>,
    },
    Complete {
        global_id: Ulid,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct Replay {
    decisions: BTreeMap<Ulid, CommitDecision>,
    entries: usize,
    /// The last line was cut short or lacks its newline.
    unterminated: bool,
}

#[derive(Debug)]
struct FileState {
    file: File,
    decisions: BTreeMap<Ulid, CommitDecision>,
}

/// Append-only JSON-lines outcome log. Every entry is flushed and synced to
/// disk before the call returns; the file is replayed on open.
#[derive(Debug)]
pub struct FileOutcomeLog {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileOutcomeLog {
    /// Open (or create) the log at `path` and replay it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OutcomeLogError> {
        let path = path.as_ref().to_path_buf();
        let replay = if path.exists() {
            Self::replay(&path)?
        } else {
            Replay::default()
        };
        let decisions = replay.decisions;
        if replay.unterminated || replay.entries > decisions.len() {
            Self::rewrite(&path, &decisions)?;
            debug!(
                path = %path.display(),
                dropped = replay.entries - decisions.len(),
                "outcome log compacted"
            );
        }

        let file = Self::open_append(&path)?;
        info!(
            path = %path.display(),
            outstanding = decisions.len(),
            "outcome log opened"
        );
        Ok(Self {
            path,
            state: Mutex::new(FileState { file, decisions }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file with only the outstanding decisions.
    pub fn compact(&self) -> Result<(), OutcomeLogError> {
        let mut state = self.state.lock();
        Self::rewrite(&self.path, &state.decisions)?;
        state.file = Self::open_append(&self.path)?;
        debug!(
            path = %self.path.display(),
            outstanding = state.decisions.len(),
            "outcome log compacted"
        );
        Ok(())
    }

    fn open_append(path: &Path) -> Result<File, OutcomeLogError> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn replay(path: &Path) -> Result<Replay, OutcomeLogError> {
        let bytes = std::fs::read(path)?;
        let mut replay = Replay::default();
        let mut lines = bytes.split(|b| *b == b'\n').enumerate().peekable();

        while let Some((index, line)) = lines.next() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let last = lines.peek().is_none();
            let entry: LogEntry = match serde_json::from_slice(line) {
                Ok(entry) => entry,
                Err(source) if last => {
                    warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %source,
                        "dropping torn outcome log tail"
                    );
                    replay.unterminated = true;
                    break;
                }
                Err(source) => {
                    return Err(OutcomeLogError::Corrupt {
                        path: path.to_path_buf(),
                        line: index + 1,
                        source,
                    });
                }
            };
            replay.unterminated = last;
            replay.entries += 1;

            let decisions = &mut replay.decisions;
            match entry {
                LogEntry::Commit {
                    global_id,
                    participants,
                    at,
                } => {
                    decisions.insert(
                        global_id,
                        CommitDecision {
                            global_id,
                            participants,
                            decided_at: at,
                        },
                    );
                }
                LogEntry::Complete { global_id, .. } => {
                    decisions.remove(&global_id);
                }
            }
        }
        Ok(replay)
    }

    fn rewrite(
        path: &Path,
        decisions: &BTreeMap<Ulid, CommitDecision>,
    ) -> Result<(), OutcomeLogError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)?;
        for decision in decisions.values() {
            let entry = LogEntry::Commit {
                global_id: decision.global_id,
                participants: decision.participants.clone(),
                at: decision.decided_at,
            };
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn append(file: &mut File, entry: &LogEntry) -> Result<(), OutcomeLogError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

impl OutcomeLog for FileOutcomeLog {
    fn record_commit(
        &self,
        global_id: Ulid,
        participants: &[StoreId],
    ) -> Result<(), OutcomeLogError> {
        let decided_at = Utc::now();
        let mut state = self.state.lock();
        Self::append(
            &mut state.file,
            &LogEntry::Commit {
                global_id,
                participants: participants.to_vec(),
                at: decided_at,
            },
        )?;
        state.decisions.insert(
            global_id,
            CommitDecision {
                global_id,
                participants: participants.to_vec(),
                decided_at,
            },
        );
        debug!(%global_id, "commit decision logged");
        Ok(())
    }

    fn decision(&self, global_id: &Ulid) -> Result<Option<CommitDecision>, OutcomeLogError> {
        Ok(self.state.lock().decisions.get(global_id).cloned())
    }

    fn complete(&self, global_id: &Ulid) -> Result<(), OutcomeLogError> {
        let mut state = self.state.lock();
        if !state.decisions.contains_key(global_id) {
            return Ok(());
        }
        Self::append(
            &mut state.file,
            &LogEntry::Complete {
                global_id: *global_id,
                at: Utc::now(),
            },
        )?;
        state.decisions.remove(global_id);
        Ok(())
    }

    fn outstanding(&self) -> Result<Vec<CommitDecision>, OutcomeLogError> {
        Ok(self.state.lock().decisions.values().cloned().collect())
    }
}
