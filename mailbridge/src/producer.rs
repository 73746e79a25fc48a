//! Application side of the queue: drop a job file, then poll for its result.

use std::path::PathBuf;
use std::time::Duration;

use crate::job::{EmailPayload, JobDescriptor, JobId, JobResult};
use crate::queue::{JobStore, StoreError};

pub const DEFAULT_RESULT_POLL: Duration = Duration::from_millis(500);
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no result for job {id} after {timeout:?}")]
    Timeout { id: JobId, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct JobProducer {
    store: JobStore,
    client: Option<String>,
    poll_interval: Duration,
}

impl JobProducer {
    pub fn new(store: JobStore) -> Self {
        Self {
            store,
            client: None,
            poll_interval: DEFAULT_RESULT_POLL,
        }
    }

    /// Open (creating if needed) the queue at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::new(JobStore::open(root)?))
    }

    /// Tag recorded in each job's metadata.
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Queue an email under a fresh id.
    pub fn submit(&self, payload: EmailPayload) -> Result<JobId, ProducerError> {
        self.submit_job(JobDescriptor::send_email(payload))
    }

    /// Queue a prepared descriptor, stamping the client tag if it has none.
    pub fn submit_job(&self, mut job: JobDescriptor) -> Result<JobId, ProducerError> {
        if job.meta.client.is_none() {
            job.meta.client = self.client.clone();
        }
        self.store.enqueue(&job)?;
        tracing::info!(job_id = %job.id, recipients = job.payload.to.len(), "Submitted job");
        Ok(job.id)
    }

    /// Wait for the host to record a result, consuming it.
    pub async fn await_result(
        &self,
        id: &JobId,
        timeout: Duration,
    ) -> Result<JobResult, ProducerError> {
        self.store
            .await_result(id, timeout, self.poll_interval)
            .await
            .map_err(|e| {
                tracing::warn!(job_id = %e.id, timeout_ms = e.timeout.as_millis() as u64, "Gave up waiting for result");
                ProducerError::Timeout {
                    id: e.id,
                    timeout: e.timeout,
                }
            })
    }

    /// Submit and wait. Resolves to the recorded result or `Timeout`.
    pub async fn send_email(
        &self,
        payload: EmailPayload,
        timeout: Duration,
    ) -> Result<JobResult, ProducerError> {
        let id = self.submit(payload)?;
        self.await_result(&id, timeout).await
    }
}
