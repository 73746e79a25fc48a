//! Bridge host - the native messaging endpoint launched by the mail client.
//!
//! Flow:
//! 1. Create the queue directories, take the process lock, requeue jobs
//!    stranded in `processing/` by a previous run
//! 2. Spawn a reader task: frames from the peer → mpsc channel
//! 3. Poll loop: handle inbound frames, then (only once the peer has said
//!    hello) claim pending jobs and forward them
//! 4. Results from the peer become result files
//! 5. A failed send drops back to disconnected and requeues everything in
//!    flight; so does shutdown

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, FrameCodec, FrameReader};
use crate::bridge::protocol::{Frame, Inbound, Outbound, message_type};
use crate::config::HostConfig;
use crate::file_proxy;
use crate::job::{JobId, JobResult};
use crate::queue::{ClaimedJob, JobRead, JobStore, ResultWrite, StoreError};
use crate::singleton::{LockError, ProcessLock};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake yet, or the last send failed. Jobs stay queued.
    #[default]
    Disconnected,
    Connected,
}

#[derive(Debug)]
struct InFlight {
    claimed: ClaimedJob,
    attachments: Vec<PathBuf>,
}

enum ReaderEvent {
    Frame(Frame),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    PeerClosed,
}

pub struct BridgeHost {
    store: JobStore,
    config: HostConfig,
    state: ConnectionState,
    in_flight: HashMap<JobId, InFlight>,
    last_sweep: Option<Instant>,
    _lock: ProcessLock,
}

impl BridgeHost {
    /// Prepare the queue at `config.queue_root` and take the process lock.
    pub fn open(config: HostConfig) -> Result<Self, HostError> {
        let store = JobStore::open(&config.queue_root)?;
        let lock = ProcessLock::acquire(store.root())?;
        store.recover()?;

        Ok(Self {
            store,
            config,
            state: ConnectionState::Disconnected,
            in_flight: HashMap::new(),
            last_sweep: None,
            _lock: lock,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Serve the peer on stdin/stdout until it closes the pipe or `shutdown`
    /// fires.
    pub async fn run_stdio(self, shutdown: CancellationToken) -> Result<(), HostError> {
        self.run(tokio::io::stdin(), tokio::io::stdout(), shutdown)
            .await
    }

    pub async fn run<R, W>(
        mut self,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        tracing::info!(
            queue = %self.store.root().display(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Bridge host started"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_frames(
            FrameReader::new(reader),
            tx,
            self.config.clone(),
        ));
        let mut sink = FramedWrite::new(writer, FrameCodec::new());

        loop {
            if self.drain_inbound(&mut rx, &mut sink).await == Flow::PeerClosed {
                break;
            }
            if self.is_connected() {
                self.scan_and_forward(&mut sink).await;
            }
            self.maybe_sweep();

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                event = rx.recv() => {
                    let flow = match event {
                        Some(event) => self.handle_event(event, &mut sink).await,
                        None => Flow::PeerClosed,
                    };
                    if flow == Flow::PeerClosed {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        reader_task.abort();
        self.requeue_in_flight();
        tracing::info!("Bridge host stopped");
        Ok(())
    }

    async fn drain_inbound<W>(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<ReaderEvent>,
        sink: &mut FramedWrite<W, FrameCodec>,
    ) -> Flow
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if self.handle_event(event, sink).await == Flow::PeerClosed {
                        return Flow::PeerClosed;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Flow::Continue,
                Err(mpsc::error::TryRecvError::Disconnected) => return Flow::PeerClosed,
            }
        }
    }

    async fn handle_event<W>(
        &mut self,
        event: ReaderEvent,
        sink: &mut FramedWrite<W, FrameCodec>,
    ) -> Flow
    where
        W: AsyncWrite + Unpin,
    {
        match event {
            ReaderEvent::Frame(frame) => {
                self.dispatch(frame, sink).await;
                Flow::Continue
            }
            ReaderEvent::Closed => {
                tracing::info!("Extension closed the channel");
                Flow::PeerClosed
            }
        }
    }

    async fn dispatch<W>(&mut self, frame: Frame, sink: &mut FramedWrite<W, FrameCodec>)
    where
        W: AsyncWrite + Unpin,
    {
        match Inbound::classify(&frame) {
            Inbound::JobResult { id, success, error } => self.complete_job(&id, success, error),
            Inbound::Hello => {
                tracing::info!("Handshake received, extension connected");
                self.state = ConnectionState::Connected;
                self.reply(sink, &Outbound::hello_ack()).await;
            }
            Inbound::GetFileData { id, file_path } => {
                let granted = self.is_attachment(Path::new(&file_path));
                let response = file_proxy::file_data_response(id, &file_path, granted);
                self.reply(sink, &Outbound::FileData(response)).await;
            }
            Inbound::Ping {
                timestamp,
                request_id,
            } => {
                self.reply(
                    sink,
                    &Outbound::Pong {
                        timestamp,
                        request_id,
                    },
                )
                .await;
            }
            Inbound::Other => {
                let kind = message_type(&frame).unwrap_or("<none>").to_string();
                let message = serde_json::Value::Object(frame);
                tracing::debug!(message_type = %kind, %message, "Ignoring unhandled message");
            }
        }
    }

    /// Claim and forward every ready job. Returns how many were sent.
    ///
    /// Does nothing while disconnected.
    pub async fn scan_and_forward<W>(&mut self, sink: &mut FramedWrite<W, FrameCodec>) -> usize
    where
        W: AsyncWrite + Unpin,
    {
        if !self.is_connected() {
            return 0;
        }

        let pending = match self.store.list_pending() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list pending jobs");
                return 0;
            }
        };

        let mut forwarded = 0;
        for id in pending {
            if !self.is_connected() {
                break;
            }
            if self.in_flight.contains_key(&id) {
                tracing::trace!(job_id = %id, "Job already in flight");
                continue;
            }
            if self.store.has_result(&id) {
                tracing::info!(job_id = %id, "Result already recorded, discarding duplicate job");
                self.store.discard_job(&id);
                continue;
            }

            let job = match self.store.read_job(&id) {
                JobRead::Ready(job) => job,
                JobRead::Partial => {
                    tracing::trace!(job_id = %id, "Job file still being written");
                    continue;
                }
                JobRead::Missing => continue,
                JobRead::Invalid(reason) => {
                    tracing::warn!(job_id = %id, reason = %reason, "Rejecting invalid job file");
                    self.fail_job(id, format!("Invalid job descriptor: {reason}"));
                    continue;
                }
            };

            let claimed = match self.store.claim(&id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping job");
                    continue;
                }
            };

            match self.send(sink, &Outbound::from(&job)).await {
                Ok(()) => {
                    tracing::info!(job_id = %id, degraded = claimed.degraded, "Forwarded job to extension");
                    self.in_flight.insert(
                        id,
                        InFlight {
                            claimed,
                            attachments: job.attachment_paths(),
                        },
                    );
                    forwarded += 1;
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Failed to forward job");
                    self.fail_job(id, format!("Send failed: {e}"));
                }
            }
        }
        forwarded
    }

    async fn send<W>(
        &mut self,
        sink: &mut FramedWrite<W, FrameCodec>,
        message: &Outbound,
    ) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        match sink.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !e.is_encoding() {
                    self.disconnect(&e);
                }
                Err(e)
            }
        }
    }

    /// Answer a peer request. Failures are already handled by `send`, so
    /// they are only noted here.
    async fn reply<W>(&mut self, sink: &mut FramedWrite<W, FrameCodec>, message: &Outbound)
    where
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = self.send(sink, message).await {
            tracing::debug!(error = %e, message_type = message.kind(), "Could not reply to extension");
        }
    }

    fn disconnect(&mut self, reason: &CodecError) {
        if self.is_connected() {
            tracing::warn!(error = %reason, "Lost connection to extension");
        }
        self.state = ConnectionState::Disconnected;
        self.requeue_in_flight();
    }

    fn complete_job(&mut self, raw_id: &str, success: bool, error: Option<String>) {
        let id = match JobId::parse(raw_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring result with unusable id");
                return;
            }
        };

        let was_in_flight = self.in_flight.remove(&id).is_some();
        if !was_in_flight && !self.store.has_job_file(&id) {
            tracing::warn!(job_id = %id, "Ignoring result for unknown job");
            return;
        }

        let result = JobResult { id, success, error };
        match self.store.write_result(&result) {
            Ok(ResultWrite::Written) => {
                tracing::info!(job_id = %result.id, success, "Recorded job result");
            }
            Ok(ResultWrite::AlreadyPresent) => {}
            Err(e) => tracing::error!(job_id = %result.id, error = %e, "Failed to record job result"),
        }
    }

    fn fail_job(&mut self, id: JobId, error: String) {
        self.in_flight.remove(&id);
        let result = JobResult::failed(id, error);
        if let Err(e) = self.store.write_result(&result) {
            tracing::error!(job_id = %result.id, error = %e, "Failed to record job failure");
        }
    }

    fn requeue_in_flight(&mut self) {
        for (id, entry) in self.in_flight.drain() {
            if let Err(e) = self.store.requeue(&entry.claimed) {
                tracing::error!(job_id = %id, error = %e, "Failed to requeue in-flight job");
            }
        }
    }

    fn is_attachment(&self, path: &Path) -> bool {
        file_proxy::is_granted(
            path,
            self.in_flight.values().flat_map(|entry| &entry.attachments),
        )
    }

    fn maybe_sweep(&mut self) {
        let Some(retention) = self.config.result_retention else {
            return;
        };
        if self
            .last_sweep
            .is_some_and(|at| at.elapsed() < self.config.sweep_interval)
        {
            return;
        }
        self.last_sweep = Some(Instant::now());

        let skip: HashSet<JobId> = self.in_flight.keys().cloned().collect();
        if let Err(e) = self.store.sweep(retention, &skip) {
            tracing::warn!(error = %e, "Queue sweep failed");
        }
    }
}

/// Reader task: frames from the peer → event channel.
///
/// Malformed frames and read errors are skipped after a short pause; after
/// too many consecutive failures the pause grows.
async fn read_frames<R>(
    mut reader: FrameReader<R>,
    tx: mpsc::UnboundedSender<ReaderEvent>,
    config: HostConfig,
) where
    R: AsyncRead + Unpin,
{
    let mut consecutive_failures: u32 = 0;
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                consecutive_failures = 0;
                if tx.send(ReaderEvent::Frame(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(ReaderEvent::Closed);
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!(error = %e, consecutive_failures, "Failed to read frame");
                if consecutive_failures > config.max_read_failures {
                    tracing::warn!("Too many consecutive read failures, backing off");
                    tokio::time::sleep(config.read_backoff).await;
                    consecutive_failures = 0;
                } else {
                    tokio::time::sleep(config.read_retry_delay).await;
                }
            }
        }
    }
    tracing::debug!("Frame reader task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AttachmentRef, EmailPayload, JobDescriptor};
    use serde_json::{Value, json};
    use std::fs;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    type HostSink = FramedWrite<WriteHalf<DuplexStream>, FrameCodec>;
    type PeerFrames = FrameReader<ReadHalf<DuplexStream>>;

    fn id(s: &str) -> JobId {
        JobId::parse(s).unwrap()
    }

    fn frame(value: Value) -> Frame {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn config(root: &Path) -> HostConfig {
        HostConfig::new(root)
            .with_poll_interval(Duration::from_millis(20))
            .with_read_backoff(Duration::from_millis(5), Duration::from_millis(50))
    }

    fn open_host() -> (tempfile::TempDir, BridgeHost) {
        let dir = tempfile::tempdir().unwrap();
        let host = BridgeHost::open(config(dir.path())).unwrap();
        (dir, host)
    }

    fn enqueue(store: &JobStore, name: &str) {
        let job = JobDescriptor::send_email(EmailPayload {
            to: vec!["a@x.com".into()],
            subject: format!("subject {name}"),
            ..Default::default()
        })
        .with_id(id(name));
        store.enqueue(&job).unwrap();
    }

    /// Host-side sink plus the peer's view of what the host sends. The
    /// unused halves are returned so the pipe stays open.
    fn wire() -> (HostSink, PeerFrames, (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>)) {
        let (host_io, peer_io) = tokio::io::duplex(256 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (peer_read, peer_write) = tokio::io::split(peer_io);
        (
            FramedWrite::new(host_write, FrameCodec::new()),
            FrameReader::new(peer_read),
            (host_read, peer_write),
        )
    }

    async fn next(frames: &mut PeerFrames) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), frames.read_frame())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("stream closed")
    }

    async fn silent(frames: &mut PeerFrames) -> bool {
        tokio::time::timeout(Duration::from_millis(100), frames.read_frame())
            .await
            .is_err()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn jobs_wait_for_handshake() {
        let (_dir, mut host) = open_host();
        for name in ["c", "a", "b"] {
            enqueue(host.store(), name);
        }
        let (mut sink, mut frames, _keep) = wire();

        assert_eq!(host.scan_and_forward(&mut sink).await, 0);
        assert!(silent(&mut frames).await);
        assert_eq!(host.store().status().unwrap().pending, 3);

        host.dispatch(frame(json!({"type": "hello"})), &mut sink).await;
        assert_eq!(host.state(), ConnectionState::Connected);
        assert_eq!(next(&mut frames).await["type"], "hello_ack");

        assert_eq!(host.scan_and_forward(&mut sink).await, 3);
        for expected in ["a", "b", "c"] {
            let msg = next(&mut frames).await;
            assert_eq!(msg["type"], "sendEmail");
            assert_eq!(msg["id"], expected);
        }
        assert_eq!(host.store().status().unwrap().processing, 3);
        assert_eq!(host.in_flight_count(), 3);
    }

    #[tokio::test]
    async fn result_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        fs::write(
            store.job_path(&id("job-1")),
            br#"{"id": "job-1", "type": "sendEmail",
                "payload": {"to": ["a@x.com"], "subject": "S", "bodyHtml": "<p>B</p>", "attachments": []}}"#,
        )
        .unwrap();

        let host = BridgeHost::open(config(dir.path())).unwrap();
        let (host_io, peer_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (peer_read, peer_write) = tokio::io::split(peer_io);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(host.run(host_read, host_write, shutdown.clone()));

        let mut frames = FrameReader::new(peer_read);
        let mut peer = FramedWrite::new(peer_write, FrameCodec::new());

        peer.send(json!({"type": "hello"})).await.unwrap();
        assert_eq!(next(&mut frames).await["type"], "hello_ack");

        let job = next(&mut frames).await;
        assert_eq!(job["type"], "sendEmail");
        assert_eq!(job["id"], "job-1");
        assert_eq!(job["payload"]["subject"], "S");

        peer.send(json!({"id": "job-1", "success": true})).await.unwrap();
        wait_until(|| store.read_result(&id("job-1")).is_some()).await;

        let written: Value =
            serde_json::from_slice(&fs::read(store.result_path(&id("job-1"))).unwrap()).unwrap();
        assert_eq!(written, json!({"id": "job-1", "success": true}));
        assert!(!store.job_path(&id("job-1")).exists());
        assert!(!store.processing_path(&id("job-1")).exists());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_stops_run_and_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let host = BridgeHost::open(config(dir.path())).unwrap();
        let store = host.store().clone();
        enqueue(&store, "job-1");

        let (host_io, peer_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (peer_read, peer_write) = tokio::io::split(peer_io);
        let task = tokio::spawn(host.run(host_read, host_write, CancellationToken::new()));

        let mut frames = FrameReader::new(peer_read);
        let mut peer = FramedWrite::new(peer_write, FrameCodec::new());
        peer.send(json!({"type": "hello"})).await.unwrap();
        next(&mut frames).await;
        assert_eq!(next(&mut frames).await["id"], "job-1");

        drop(peer);
        drop(frames);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("host kept running after the peer left")
            .unwrap()
            .unwrap();
        assert!(store.job_path(&id("job-1")).exists());
        assert!(!store.has_result(&id("job-1")));
        assert!(!dir.path().join(crate::singleton::LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (_dir, host) = open_host();
        let (host_io, peer_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (peer_read, mut peer_write) = tokio::io::split(peer_io);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(host.run(host_read, host_write, shutdown.clone()));

        peer_write.write_all(&0u32.to_le_bytes()).await.unwrap();
        peer_write.write_all(&crate::bridge::codec::encode_frame(&json!("just a string")).unwrap()).await.unwrap();
        peer_write.write_all(&crate::bridge::codec::encode_frame(&json!({"type": "hello"})).unwrap()).await.unwrap();

        let mut frames = FrameReader::new(peer_read);
        assert_eq!(next(&mut frames).await["type"], "hello_ack");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_failure_writes_failure_result_and_disconnects() {
        let (_dir, mut host) = open_host();
        enqueue(host.store(), "a");
        enqueue(host.store(), "b");

        let (host_io, peer_io) = tokio::io::duplex(1024);
        drop(peer_io);
        let (_read, write) = tokio::io::split(host_io);
        let mut sink = FramedWrite::new(write, FrameCodec::new());
        host.state = ConnectionState::Connected;

        assert_eq!(host.scan_and_forward(&mut sink).await, 0);

        assert_eq!(host.state(), ConnectionState::Disconnected);
        let failed = host.store().read_result(&id("a")).unwrap();
        assert!(!failed.success);
        assert!(failed.error.unwrap().starts_with("Send failed"));
        assert!(host.store().job_path(&id("b")).exists());
        assert!(!host.store().has_result(&id("b")));
    }

    #[tokio::test]
    async fn transport_failure_requeues_in_flight_jobs() {
        let (_dir, mut host) = open_host();
        let (mut sink, frames, keep) = wire();
        host.state = ConnectionState::Connected;

        enqueue(host.store(), "a");
        assert_eq!(host.scan_and_forward(&mut sink).await, 1);
        assert!(host.store().processing_path(&id("a")).exists());

        drop(frames);
        drop(keep);
        enqueue(host.store(), "b");
        assert_eq!(host.scan_and_forward(&mut sink).await, 0);

        assert_eq!(host.in_flight_count(), 0);
        assert!(host.store().job_path(&id("a")).exists());
        assert!(!host.store().processing_path(&id("a")).exists());
        assert!(host.store().has_result(&id("b")));
    }

    #[tokio::test]
    async fn job_is_forwarded_once_and_duplicates_after_result_are_dropped() {
        let (_dir, mut host) = open_host();
        let (mut sink, mut frames, _keep) = wire();
        host.state = ConnectionState::Connected;

        enqueue(host.store(), "a");
        assert_eq!(host.scan_and_forward(&mut sink).await, 1);
        next(&mut frames).await;

        // Same id again while the first copy is in flight.
        enqueue(host.store(), "a");
        assert_eq!(host.scan_and_forward(&mut sink).await, 0);
        assert!(silent(&mut frames).await);

        host.dispatch(frame(json!({"id": "a", "success": true})), &mut sink).await;
        assert!(host.store().read_result(&id("a")).unwrap().success);

        enqueue(host.store(), "a");
        assert_eq!(host.scan_and_forward(&mut sink).await, 0);
        assert!(!host.store().job_path(&id("a")).exists());
        assert!(host.store().read_result(&id("a")).unwrap().success);
    }

    #[tokio::test]
    async fn late_results_do_not_overwrite() {
        let (_dir, mut host) = open_host();
        let (mut sink, mut frames, _keep) = wire();
        host.state = ConnectionState::Connected;

        enqueue(host.store(), "a");
        host.scan_and_forward(&mut sink).await;
        next(&mut frames).await;

        host.dispatch(frame(json!({"id": "a", "success": false, "error": "SMTP refused"})), &mut sink).await;
        host.dispatch(frame(json!({"id": "a", "success": true})), &mut sink).await;

        let result = host.store().read_result(&id("a")).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("SMTP refused"));
    }

    #[tokio::test]
    async fn results_for_unknown_jobs_are_ignored() {
        let (_dir, mut host) = open_host();
        let (mut sink, _frames, _keep) = wire();

        host.dispatch(frame(json!({"id": "ghost", "success": true})), &mut sink).await;

        assert!(!host.store().has_result(&id("ghost")));
    }

    #[tokio::test]
    async fn invalid_job_file_gets_failure_result() {
        let (_dir, mut host) = open_host();
        let (mut sink, _frames, _keep) = wire();
        host.state = ConnectionState::Connected;
        fs::write(host.store().job_path(&id("bad")), br#"{"id": "bad"}"#).unwrap();

        assert_eq!(host.scan_and_forward(&mut sink).await, 0);

        let result = host.store().read_result(&id("bad")).unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Invalid job descriptor"));
        assert!(!host.store().job_path(&id("bad")).exists());
    }

    #[tokio::test]
    async fn file_requests_limited_to_in_flight_attachments() {
        let (dir, mut host) = open_host();
        let (mut sink, mut frames, _keep) = wire();
        host.state = ConnectionState::Connected;

        let attachment = dir.path().join("report.txt");
        fs::write(&attachment, b"quarterly").unwrap();
        let secret = dir.path().join("secret.txt");
        fs::write(&secret, b"nope").unwrap();

        let job = JobDescriptor::send_email(EmailPayload {
            to: vec!["a@x.com".into()],
            attachments: vec![AttachmentRef::new(&attachment)],
            ..Default::default()
        })
        .with_id(id("with-file"));
        host.store().enqueue(&job).unwrap();
        host.scan_and_forward(&mut sink).await;
        next(&mut frames).await;

        let request = json!({"type": "getFileData", "id": 9, "filePath": attachment.to_str().unwrap()});
        host.dispatch(frame(request), &mut sink).await;
        let reply = next(&mut frames).await;
        assert_eq!(reply["type"], "fileDataResponse");
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["success"], true);
        assert_eq!(reply["name"], "report.txt");
        assert_eq!(reply["size"], 9);

        let request = json!({"type": "getFileData", "id": 10, "filePath": secret.to_str().unwrap()});
        host.dispatch(frame(request), &mut sink).await;
        let reply = next(&mut frames).await;
        assert_eq!(reply["success"], false);
        assert!(reply.get("data").is_none());
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let (_dir, mut host) = open_host();
        let (mut sink, mut frames, _keep) = wire();

        host.dispatch(frame(json!({"type": "ping", "timestamp": 42})), &mut sink).await;

        let reply = next(&mut frames).await;
        assert_eq!(reply["type"], "pong");
        assert_eq!(reply["timestamp"], 42);
    }

    #[tokio::test]
    async fn unknown_messages_are_ignored() {
        let (_dir, mut host) = open_host();
        let (mut sink, mut frames, _keep) = wire();

        host.dispatch(frame(json!({"type": "status", "detail": {"queued": 3}})), &mut sink)
            .await;

        assert!(silent(&mut frames).await);
        assert_eq!(host.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_handshake_reply_leaves_host_disconnected() {
        let (_dir, mut host) = open_host();
        let (mut sink, frames, keep) = wire();
        drop(frames);
        drop(keep);

        host.dispatch(frame(json!({"type": "hello"})), &mut sink).await;

        assert!(!host.is_connected());
    }

    #[tokio::test]
    async fn open_recovers_stranded_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        enqueue(&store, "stranded");
        store.claim(&id("stranded")).await.unwrap();

        let _host = BridgeHost::open(config(dir.path())).unwrap();

        assert!(store.job_path(&id("stranded")).exists());
    }

    #[test]
    fn second_host_on_same_queue_is_refused() {
        let (dir, _host) = open_host();
        assert!(matches!(
            BridgeHost::open(config(dir.path())),
            Err(HostError::Lock(LockError::AlreadyRunning { .. }))
        ));
    }

    #[test]
    fn sweep_runs_when_retention_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = BridgeHost::open(
            config(dir.path()).with_result_retention(Duration::from_secs(60)),
        )
        .unwrap();
        let path = host.store().result_path(&id("old"));
        fs::write(&path, br#"{"id": "old", "success": true}"#).unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(120))
            .unwrap();

        host.maybe_sweep();

        assert!(!path.exists());
    }
}
