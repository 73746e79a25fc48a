//! Filesystem-backed job queue shared by producers and the host.
//!
//! Layout under the queue root:
//!
//! ```text
//! jobs/        producer-writable, host-readable
//! processing/  host-only; jobs that have been claimed and forwarded
//! results/     host-writable, producer-readable
//! ```
//!
//! Cross-process coordination relies only on create-new (job and result
//! files) and rename (claim). Files are never rewritten in place, and a
//! result file is never overwritten once it exists.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::error::Category;

use crate::job::{JobDescriptor, JobId, JobResult};

pub const JOBS_DIR: &str = "jobs";
pub const PROCESSING_DIR: &str = "processing";
pub const RESULTS_DIR: &str = "results";

const CLAIM_ATTEMPTS: u32 = 5;
const CLAIM_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create queue directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    #[error("failed to serialize job {id}: {source}")]
    Serialize {
        id: JobId,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("job {0} vanished before it could be claimed")]
    Vanished(JobId),
}

#[derive(Debug, thiserror::Error)]
#[error("no result for job {id} after {timeout:?}")]
pub struct ResultTimeout {
    pub id: JobId,
    pub timeout: Duration,
}

/// Outcome of reading a pending job file.
#[derive(Debug)]
pub enum JobRead {
    Ready(JobDescriptor),
    /// Still being written (or briefly locked); try again next cycle.
    Partial,
    /// Complete but unusable. Carries the reason.
    Invalid(String),
    /// Gone since it was listed.
    Missing,
}

/// A job moved into `processing/`, or left in `jobs/` when the rename kept
/// failing (`degraded`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub path: PathBuf,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultWrite {
    Written,
    /// A result already existed and was left untouched.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub results_removed: usize,
    pub processing_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub results: usize,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
    jobs: PathBuf,
    processing: PathBuf,
    results: PathBuf,
}

impl JobStore {
    /// Open the queue at `root`, creating the three directories if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let store = Self {
            jobs: root.join(JOBS_DIR),
            processing: root.join(PROCESSING_DIR),
            results: root.join(RESULTS_DIR),
            root,
        };

        for dir in [&store.jobs, &store.processing, &store.results] {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        tracing::debug!(root = %store.root.display(), "Opened job store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs
    }

    pub fn processing_dir(&self) -> &Path {
        &self.processing
    }

    pub fn results_dir(&self) -> &Path {
        &self.results
    }

    pub fn job_path(&self, id: &JobId) -> PathBuf {
        self.jobs.join(id.file_name())
    }

    pub fn processing_path(&self, id: &JobId) -> PathBuf {
        self.processing.join(id.file_name())
    }

    pub fn result_path(&self, id: &JobId) -> PathBuf {
        self.results.join(id.file_name())
    }

    /// Write a new job file. Fails with `DuplicateJob` if the id is taken.
    pub fn enqueue(&self, job: &JobDescriptor) -> Result<PathBuf, StoreError> {
        let bytes = serde_json::to_vec_pretty(job).map_err(|source| StoreError::Serialize {
            id: job.id.clone(),
            source,
        })?;
        let path = self.job_path(&job.id);

        match create_new_file(&path, |file| file.write_all(&bytes)) {
            Ok(true) => {}
            Ok(false) => return Err(StoreError::DuplicateJob(job.id.clone())),
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        tracing::debug!(job_id = %job.id, "Enqueued job");
        Ok(path)
    }

    /// Ids of files in `jobs/`, sorted. Names that are not valid job ids are
    /// skipped.
    pub fn list_pending(&self) -> Result<Vec<JobId>, StoreError> {
        let mut ids = list_ids(&self.jobs)?;
        ids.sort();
        Ok(ids)
    }

    pub fn read_job(&self, id: &JobId) -> JobRead {
        let path = self.job_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return JobRead::Missing,
            Err(e) => {
                tracing::debug!(job_id = %id, error = %e, "Job file not readable yet");
                return JobRead::Partial;
            }
        };

        match serde_json::from_slice::<JobDescriptor>(&bytes) {
            Ok(job) if job.id != *id => JobRead::Invalid(format!(
                "descriptor id {} does not match file name",
                job.id
            )),
            Ok(job) => JobRead::Ready(job),
            Err(e) if e.classify() == Category::Eof => JobRead::Partial,
            Err(e) => JobRead::Invalid(e.to_string()),
        }
    }

    /// Move `jobs/<id>.json` into `processing/`.
    ///
    /// Retries with a growing delay when the rename fails transiently (the
    /// producer may still hold the file open on some platforms). If every
    /// attempt fails but the file is still there, the job is processed in
    /// place and the claim is marked degraded.
    pub async fn claim(&self, id: &JobId) -> Result<ClaimedJob, ClaimError> {
        let from = self.job_path(id);
        let to = self.processing_path(id);

        for attempt in 1..=CLAIM_ATTEMPTS {
            match fs::rename(&from, &to) {
                Ok(()) => {
                    tracing::debug!(job_id = %id, "Claimed job");
                    return Ok(ClaimedJob {
                        id: id.clone(),
                        path: to,
                        degraded: false,
                    });
                }
                Err(_) if !from.exists() => return Err(ClaimError::Vanished(id.clone())),
                Err(e) => {
                    if attempt < CLAIM_ATTEMPTS {
                        let backoff = CLAIM_BACKOFF * attempt;
                        tracing::debug!(
                            job_id = %id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Claim rename failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    } else {
                        tracing::warn!(job_id = %id, error = %e, "Claim rename kept failing");
                    }
                }
            }
        }

        if from.exists() {
            tracing::warn!(job_id = %id, "Processing job in place without claiming it");
            Ok(ClaimedJob {
                id: id.clone(),
                path: from,
                degraded: true,
            })
        } else {
            Err(ClaimError::Vanished(id.clone()))
        }
    }

    /// Record the outcome of a job and drop its job file.
    ///
    /// First writer wins: an existing result is left as it is. Either way the
    /// job's `processing/` and `jobs/` files are removed afterwards.
    pub fn write_result(&self, result: &JobResult) -> Result<ResultWrite, StoreError> {
        self.write_result_with(result, |file, bytes| file.write_all(bytes))
    }

    fn write_result_with(
        &self,
        result: &JobResult,
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> Result<ResultWrite, StoreError> {
        let bytes = serde_json::to_vec_pretty(result).map_err(|source| StoreError::Serialize {
            id: result.id.clone(),
            source,
        })?;
        let path = self.result_path(&result.id);
        let outcome = match create_new_file(&path, |file| write(file, &bytes)) {
            Ok(true) => ResultWrite::Written,
            Ok(false) => {
                tracing::debug!(job_id = %result.id, "Result already recorded, keeping the first");
                ResultWrite::AlreadyPresent
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        remove_if_present(&self.processing_path(&result.id));
        remove_if_present(&self.job_path(&result.id));
        Ok(outcome)
    }

    /// Delete a pending job without processing it.
    pub fn discard_job(&self, id: &JobId) {
        remove_if_present(&self.job_path(id));
    }

    pub fn has_result(&self, id: &JobId) -> bool {
        self.result_path(id).exists()
    }

    /// Whether the job still has a file in `jobs/` or `processing/`.
    pub fn has_job_file(&self, id: &JobId) -> bool {
        self.job_path(id).exists() || self.processing_path(id).exists()
    }

    /// Read a result without consuming it. `None` while missing or partial.
    pub fn read_result(&self, id: &JobId) -> Option<JobResult> {
        let bytes = fs::read(self.result_path(id)).ok()?;
        match serde_json::from_slice::<JobResult>(&bytes) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::trace!(job_id = %id, error = %e, "Result file not complete yet");
                None
            }
        }
    }

    /// Read and delete a result.
    pub fn take_result(&self, id: &JobId) -> Option<JobResult> {
        let result = self.read_result(id)?;
        remove_if_present(&self.result_path(id));
        Some(result)
    }

    /// Poll for a result until `timeout` elapses, consuming it when found.
    pub async fn await_result(
        &self,
        id: &JobId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<JobResult, ResultTimeout> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.take_result(id) {
                return Ok(result);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ResultTimeout {
                    id: id.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Return a claimed job to `jobs/` so it is forwarded again.
    pub fn requeue(&self, claimed: &ClaimedJob) -> Result<(), StoreError> {
        if claimed.degraded {
            return Ok(());
        }
        if self.has_result(&claimed.id) {
            remove_if_present(&claimed.path);
            return Ok(());
        }

        let target = self.job_path(&claimed.id);
        match fs::rename(&claimed.path, &target) {
            Ok(()) => {
                tracing::info!(job_id = %claimed.id, "Requeued in-flight job");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    job_id = %claimed.id,
                    path = %claimed.path.display(),
                    "In-flight job file vanished before it could be requeued"
                );
                Ok(())
            }
            Err(e) => Err(StoreError::io(&claimed.path, e)),
        }
    }

    /// Put back jobs left in `processing/` by a host that exited without
    /// finishing them. Jobs that already have a result are deleted.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();

        for id in list_ids(&self.processing)? {
            let stranded = self.processing_path(&id);
            if self.has_result(&id) || self.job_path(&id).exists() {
                remove_if_present(&stranded);
                report.discarded += 1;
                continue;
            }

            match fs::rename(&stranded, self.job_path(&id)) {
                Ok(()) => report.requeued += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&stranded, e)),
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                requeued = report.requeued,
                discarded = report.discarded,
                "Recovered stranded jobs"
            );
        }
        Ok(report)
    }

    /// Delete result and processing files older than `retention`, except for
    /// processing files of jobs in `skip` (still in flight).
    ///
    /// Only the host knows what is in flight, so callers outside it should
    /// use [`JobStore::sweep_results`] while a host is running.
    pub fn sweep(
        &self,
        retention: Duration,
        skip: &HashSet<JobId>,
    ) -> Result<SweepReport, StoreError> {
        self.sweep_dirs(retention, Some(skip))
    }

    /// Delete result files older than `retention`. Processing files are left
    /// alone.
    pub fn sweep_results(&self, retention: Duration) -> Result<SweepReport, StoreError> {
        self.sweep_dirs(retention, None)
    }

    fn sweep_dirs(
        &self,
        retention: Duration,
        processing_skip: Option<&HashSet<JobId>>,
    ) -> Result<SweepReport, StoreError> {
        let now = SystemTime::now();
        let expired = |path: &Path| {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or_default() > retention)
                .unwrap_or(false)
        };

        let mut report = SweepReport::default();
        for id in list_ids(&self.results)? {
            let path = self.result_path(&id);
            if expired(&path) && fs::remove_file(&path).is_ok() {
                report.results_removed += 1;
            }
        }
        if let Some(skip) = processing_skip {
            for id in list_ids(&self.processing)? {
                let path = self.processing_path(&id);
                if !skip.contains(&id) && expired(&path) && fs::remove_file(&path).is_ok() {
                    report.processing_removed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                results_removed = report.results_removed,
                processing_removed = report.processing_removed,
                "Swept expired queue files"
            );
        }
        Ok(report)
    }

    pub fn status(&self) -> Result<QueueStatus, StoreError> {
        Ok(QueueStatus {
            pending: list_ids(&self.jobs)?.len(),
            processing: list_ids(&self.processing)?.len(),
            results: list_ids(&self.results)?.len(),
        })
    }
}

fn list_ids(dir: &Path) -> Result<Vec<JobId>, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut ids = Vec::new();
    for entry in entries {
        // Entries can vanish between readdir and stat; skip them.
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        match JobId::from_path(&path) {
            Some(id) => ids.push(id),
            None => tracing::trace!(path = %path.display(), "Ignoring non-job file"),
        }
    }
    Ok(ids)
}

/// Create `path` exclusively and fill it with `write`. Returns `false` if
/// the file already exists. A file that could not be filled is removed
/// again: a truncated job or result would otherwise block its id for good.
fn create_new_file(
    path: &Path,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    if let Err(e) = write(&mut file).and_then(|()| file.sync_all()) {
        drop(file);
        remove_if_present(path);
        return Err(e);
    }
    Ok(true)
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove queue file");
    }
}
