//! Job ledger.
//!
//! Tracks the status of each repetition of a job and persists it to JSON in
//! the job directory, so `status` can report on a job from another process.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Ledger file name inside the job directory.
pub const LEDGER_FILE: &str = "job_state.json";

/// Status of one repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionStatus {
    /// Registered but not started.
    Pending,
    /// Started; also what a crashed harness leaves behind.
    Running,
    /// Finished with a passing record.
    Passed,
    /// Timed out or aborted; see `errors`.
    Failed,
}

/// State of a single repetition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepetitionState {
    /// Current status.
    pub status: RepetitionStatus,
    /// Local time the repetition was last started.
    pub started_at: Option<String>,
    /// Local time the repetition last finished, passed or failed.
    pub finished_at: Option<String>,
    /// Path of the repetition's result record, once written.
    pub output: Option<PathBuf>,
    /// Error messages from failed attempts, each prefixed by its phase.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Default for RepetitionState {
    fn default() -> Self {
        Self {
            status: RepetitionStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            errors: Vec::new(),
        }
    }
}

/// Persistent state for all repetitions of a job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobState {
    /// Job identifier given on the command line.
    pub job_id: String,
    /// Scenario the job runs.
    pub varying_param_key: String,
    /// Keyed by repetition number.
    pub repetitions: BTreeMap<usize, RepetitionState>,
    /// Ledger format version.
    #[serde(default = "default_version")]
    pub version: u32,
}

impl JobState {
    #[must_use]
    pub fn count(&self, status: RepetitionStatus) -> usize {
        self.repetitions
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

fn default_version() -> u32 {
    1
}

/// Reads and updates the ledger with file locking.
pub struct JobLedger {
    pub path: PathBuf,
}

impl JobLedger {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Ledger of the job stored in `job_dir`.
    #[must_use]
    pub fn for_job_dir(job_dir: &Path) -> Self {
        Self::new(job_dir.join(LEDGER_FILE))
    }

    /// Load the ledger, or an empty one if the file doesn't exist.
    pub fn load(&self) -> Result<JobState, LedgerError> {
        if !self.path.exists() {
            return Ok(JobState::default());
        }

        let file = File::open(&self.path).map_err(|e| LedgerError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;

        let state = serde_json::from_reader(BufReader::new(&file))
            .map_err(|e| LedgerError::Parse(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Update the ledger with a closure while holding an exclusive lock.
    pub fn update<F>(&self, f: F) -> Result<JobState, LedgerError>
    where
        F: FnOnce(&mut JobState),
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| LedgerError::Io(self.path.clone(), e))?;

        file.lock_exclusive()
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;

        let mut state: JobState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| LedgerError::Parse(self.path.clone(), e.to_string()))?
        } else {
            JobState::default()
        };

        f(&mut state);

        file.set_len(0)
            .map_err(|e| LedgerError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| LedgerError::Io(self.path.clone(), e))?;

        serde_json::to_writer_pretty(&file, &state)
            .map_err(|e| LedgerError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Register `nreps` repetitions, keeping any state already recorded.
    pub fn initialize(
        &self,
        job_id: &str,
        varying_param_key: &str,
        nreps: usize,
    ) -> Result<JobState, LedgerError> {
        self.update(|state| {
            state.job_id = job_id.to_string();
            state.varying_param_key = varying_param_key.to_string();
            for rep in 0..nreps {
                state.repetitions.entry(rep).or_default();
            }
        })
    }

    pub fn mark_started(&self, rep: usize) -> Result<(), LedgerError> {
        self.update(|state| {
            let entry = state.repetitions.entry(rep).or_default();
            entry.status = RepetitionStatus::Running;
            entry.started_at = Some(now_timestamp());
            entry.finished_at = None;
        })?;
        Ok(())
    }

    pub fn mark_passed(&self, rep: usize, output: &Path) -> Result<(), LedgerError> {
        self.update(|state| {
            let entry = state.repetitions.entry(rep).or_default();
            entry.status = RepetitionStatus::Passed;
            entry.output = Some(output.to_path_buf());
            entry.finished_at = Some(now_timestamp());
        })?;
        Ok(())
    }

    /// Mark a repetition failed. `output` is set when a record was still
    /// written, as for a scheduler timeout.
    pub fn mark_failed(
        &self,
        rep: usize,
        error: &str,
        output: Option<&Path>,
    ) -> Result<(), LedgerError> {
        self.update(|state| {
            let entry = state.repetitions.entry(rep).or_default();
            entry.status = RepetitionStatus::Failed;
            entry.errors.push(error.to_string());
            entry.output = output.map(Path::to_path_buf);
            entry.finished_at = Some(now_timestamp());
        })?;
        Ok(())
    }
}

/// Current local time for ledger entries.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to read/write ledger {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock ledger {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse ledger {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write ledger {0}: {1}")]
    Write(PathBuf, String),
}
