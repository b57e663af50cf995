//! Cycle journal: one JSON line per state change, flushed before the change
//! takes effect elsewhere. On startup the journal tells us whether a cycle
//! was cut short, which stages it had committed, and whether the execution
//! stage had already been entered.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum WalEntry {
    CycleStart {
        cycle_id: String,
        ts: u64,
    },
    StageCommit {
        cycle_id: String,
        stage: String,
        ts: u64,
    },
    /// Written immediately before the execution agent is invoked. Present
    /// without a matching execution commit means orders may be in flight,
    /// so the cycle must never be replayed.
    ExecToken {
        cycle_id: String,
        key: String,
        ts: u64,
    },
    CycleEnd {
        cycle_id: String,
        disposition: String,
        ts: u64,
    },
}

/// A cycle the journal shows as started but not ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredCycle {
    pub cycle_id: String,
    pub committed: Vec<String>,
    pub exec_started: bool,
}

pub struct CycleWal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CycleWal {
    pub fn open(path: &str) -> Result<Self, PipelineError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<(), PipelineError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| PipelineError::Wal(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Scan the journal for a cycle that started but never ended. A torn
    /// final line (crash mid-write) is skipped, not an error.
    pub fn recover(&self) -> Result<Option<RecoveredCycle>, PipelineError> {
        Self::recover_from(&self.path)
    }

    pub fn recover_from(path: &Path) -> Result<Option<RecoveredCycle>, PipelineError> {
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut open: Option<RecoveredCycle> = None;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: WalEntry = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(_) => continue,
            };
            match entry {
                WalEntry::CycleStart { cycle_id, .. } => {
                    open = Some(RecoveredCycle {
                        cycle_id,
                        committed: Vec::new(),
                        exec_started: false,
                    });
                }
                WalEntry::StageCommit { cycle_id, stage, .. } => {
                    if let Some(rec) = open.as_mut() {
                        if rec.cycle_id == cycle_id {
                            rec.committed.push(stage);
                        }
                    }
                }
                WalEntry::ExecToken { cycle_id, .. } => {
                    if let Some(rec) = open.as_mut() {
                        if rec.cycle_id == cycle_id {
                            rec.exec_started = true;
                        }
                    }
                }
                WalEntry::CycleEnd { cycle_id, .. } => {
                    if open.as_ref().map(|r| r.cycle_id == cycle_id).unwrap_or(false) {
                        open = None;
                    }
                }
            }
        }
        Ok(open)
    }
}
