//! Append Worker: the single writer for one target file.
//!
//! Each worker is one tokio task that exclusively owns its target's
//! descriptor. Requests are admitted under the worker's state lock (where
//! the queue bounds are enforced) and consumed strictly in order; every
//! write or fsync runs on the blocking pool, one at a time, so there is
//! never more than one operation in flight against the descriptor.
//!
//! ```text
//! IDLE ──enqueue──▶ DRAINING ──queue empty──▶ IDLE ──idle_timeout──▶ RETIRED
//!                       │
//!                 fatal / exhausted
//!                       ▼
//!                    CLOSED ──idle_timeout──▶ RETIRED
//! ```
//!
//! A closed worker fails everything still queued with `fatal-error` and
//! refuses new requests until the registry retires it.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, trace, warn};

use offlog_core::{CompletionRecord, Durability, Outcome, TargetId};

use crate::backpressure::{ByteBudget, QueueGauge, QueueLimits, Rejection};
use crate::config::DaemonConfig;
use crate::connection::CompletionSink;
use crate::retry::{RetryHandle, RetryPolicy};
use crate::target::{classify, ErrorClass, TargetFile, TargetKey};

/// Live workers by target identity. Shared by the registry and every worker
/// (a worker removes itself on retirement). Lock order: map, then worker.
pub(crate) type WorkerMap = Arc<Mutex<HashMap<TargetKey, WorkerHandle>>>;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub limits: QueueLimits,
    pub retry: RetryPolicy,
    pub max_consecutive_failures: u32,
    pub sync_interval: Duration,
    pub sync_bytes: u64,
    pub idle_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            limits: QueueLimits {
                max_entries: config.max_queue_entries,
                max_bytes: config.max_queue_bytes,
            },
            retry: RetryPolicy::exponential(config.retry_attempts, config.retry_backoff())
                .with_max_delay(config.retry_max_backoff()),
            max_consecutive_failures: config.max_consecutive_failures,
            sync_interval: config.sync_interval(),
            sync_bytes: config.sync_bytes,
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// One accepted `APPEND`, immutable once queued.
pub struct PendingAppend {
    pub request_id: u64,
    pub target: TargetId,
    pub durability: Durability,
    pub data: Vec<u8>,
    pub sink: CompletionSink,
}

impl PendingAppend {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Result of offering a request to a worker.
pub enum Admission {
    /// Queued; `APPEND_QUEUED` has been emitted and exactly one completion follows.
    Queued,
    Busy(Rejection),
    /// The target is closed; the request is refused with this reason.
    Closed(String),
    /// The registry already dropped this worker; resolve again.
    Retired(PendingAppend),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Draining,
    Closed { reason: String, since: Instant },
    Retired,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Draining => "draining",
            Phase::Closed { .. } => "closed",
            Phase::Retired => "retired",
        }
    }
}

/// Point-in-time view of a worker, reported through `STATUS`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub path: PathBuf,
    pub key: String,
    pub state: String,
    pub queued_entries: usize,
    pub queued_bytes: u64,
    pub appended: u64,
    pub failed: u64,
    pub bytes_written: u64,
    pub syncs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct WorkerState {
    phase: Phase,
    queue: VecDeque<PendingAppend>,
    /// Charge for queued plus in-flight requests.
    gauge: QueueGauge,
    last_activity: Instant,
    consecutive_failures: u32,
    last_error: Option<String>,
    appended: u64,
    failed: u64,
    bytes_written: u64,
    syncs: u64,
}

struct Shared {
    key: TargetKey,
    path: PathBuf,
    settings: WorkerSettings,
    budget: ByteBudget,
    state: Mutex<WorkerState>,
    wake: Notify,
}

#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Start the worker task. The caller publishes the handle in `workers`.
    pub(crate) fn spawn(
        key: TargetKey,
        path: PathBuf,
        file: Box<dyn TargetFile>,
        settings: WorkerSettings,
        budget: ByteBudget,
        workers: WorkerMap,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            key,
            path,
            settings,
            budget,
            state: Mutex::new(WorkerState {
                phase: Phase::Idle,
                queue: VecDeque::new(),
                gauge: QueueGauge::default(),
                last_activity: now,
                consecutive_failures: 0,
                last_error: None,
                appended: 0,
                failed: 0,
                bytes_written: 0,
                syncs: 0,
            }),
            wake: Notify::new(),
        });
        let stopping = *shutdown.borrow();
        let worker = AppendWorker {
            shared: Arc::clone(&shared),
            file: Some(file),
            workers,
            shutdown,
            stopping,
            unsynced: 0,
            last_sync: now,
        };
        tokio::spawn(worker.run());
        Self { shared }
    }

    pub fn key(&self) -> TargetKey {
        self.shared.key
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_retired(&self) -> bool {
        self.shared.state.lock().phase == Phase::Retired
    }

    /// Admit `request` if both the per-target bounds and the daemon-wide
    /// budget allow it. `APPEND_QUEUED` is emitted before the lock is
    /// released so it always precedes the completion on the connection.
    pub fn try_enqueue(&self, request: PendingAppend) -> Admission {
        let len = request.len();
        let mut state = self.shared.state.lock();
        match &state.phase {
            Phase::Retired => return Admission::Retired(request),
            Phase::Closed { reason, .. } => return Admission::Closed(reason.clone()),
            Phase::Idle | Phase::Draining => {}
        }
        if let Err(rejection) = self.shared.settings.limits.check(&state.gauge, len) {
            return Admission::Busy(rejection);
        }
        if !self.shared.budget.try_reserve(len) {
            return Admission::Busy(Rejection::TotalBytes);
        }

        state.gauge.entries += 1;
        state.gauge.bytes += len;
        state.phase = Phase::Draining;
        state.last_activity = Instant::now();
        request.sink.admitted(request.request_id);
        state.queue.push_back(request);
        drop(state);

        self.shared.wake.notify_one();
        Admission::Queued
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let state = self.shared.state.lock();
        WorkerSnapshot {
            path: self.shared.path.clone(),
            key: self.shared.key.to_string(),
            state: state.phase.label().to_string(),
            queued_entries: state.gauge.entries,
            queued_bytes: state.gauge.bytes,
            appended: state.appended,
            failed: state.failed,
            bytes_written: state.bytes_written,
            syncs: state.syncs,
            last_error: state.last_error.clone(),
        }
    }
}

/// Why a request could not be written.
enum Failure {
    /// Retries exhausted on a transient condition.
    Transient(String),
    /// Retries exhausted on ENOSPC/EDQUOT.
    Exhausted(String),
    Fatal(String),
}

struct AppendWorker {
    shared: Arc<Shared>,
    file: Option<Box<dyn TargetFile>>,
    workers: WorkerMap,
    shutdown: watch::Receiver<bool>,
    stopping: bool,
    /// Bytes written since the last fsync.
    unsynced: u64,
    last_sync: Instant,
}

impl AppendWorker {
    async fn run(mut self) {
        debug!(path = %self.shared.path.display(), key = %self.shared.key, "append worker started");
        loop {
            if let Some(request) = self.next_request() {
                self.process(request).await;
                continue;
            }
            if self.flush_due() {
                self.flush().await;
                continue;
            }
            if self.try_retire() {
                break;
            }
            self.idle_wait().await;
        }
        self.release_file().await;
        debug!(path = %self.shared.path.display(), "append worker retired");
    }

    fn next_request(&self) -> Option<PendingAppend> {
        let mut state = self.shared.state.lock();
        let next = state.queue.pop_front();
        if next.is_none() && state.phase == Phase::Draining {
            state.phase = Phase::Idle;
            state.last_activity = Instant::now();
        }
        next
    }

    async fn process(&mut self, request: PendingAppend) {
        let PendingAppend {
            request_id,
            target,
            durability,
            data,
            sink,
        } = request;
        let len = data.len() as u64;

        let (written, mut result) = self.write_payload(data).await;
        if result.is_ok() {
            match durability {
                Durability::Sync => result = self.sync_with_retry().await,
                Durability::NoSync => self.unsynced += written,
            }
        }

        let outcome = match &result {
            Ok(()) => Outcome::Success,
            Err(Failure::Transient(reason)) => Outcome::TransientError(reason.clone()),
            Err(Failure::Exhausted(reason)) | Err(Failure::Fatal(reason)) => {
                Outcome::FatalError(reason.clone())
            }
        };
        trace!(
            path = %self.shared.path.display(),
            request_id,
            bytes = written,
            outcome = %outcome,
            "append completed"
        );
        let failures = self.complete(request_id, target, sink, outcome, len, written);

        match result {
            Ok(()) => {
                if self.flush_due() {
                    self.flush().await;
                }
            }
            Err(Failure::Transient(reason)) => {
                warn!(
                    path = %self.shared.path.display(),
                    request_id,
                    attempts = self.shared.settings.retry.max_attempts(),
                    error = %reason,
                    "append failed after retries"
                );
                if failures >= self.shared.settings.max_consecutive_failures {
                    self.close(format!(
                        "{failures} consecutive failed appends; last: {reason}"
                    ));
                }
            }
            Err(Failure::Exhausted(reason)) | Err(Failure::Fatal(reason)) => self.close(reason),
        }
    }

    /// Write all of `data`, continuing short writes and retrying per policy.
    async fn write_payload(&mut self, data: Vec<u8>) -> (u64, Result<(), Failure>) {
        let mut retry = self.shared.settings.retry.handle();
        let mut data = data;
        let mut offset = 0usize;
        loop {
            let start = offset;
            let step = self
                .blocking(move |file| {
                    let mut offset = start;
                    let result = write_from(file, &data, &mut offset);
                    (data, offset, result)
                })
                .await;
            let (returned, reached, result) = match step {
                Ok(step) => step,
                Err(reason) => return (offset as u64, Err(Failure::Fatal(reason))),
            };
            data = returned;
            offset = reached;
            let err = match result {
                Ok(()) => return (offset as u64, Ok(())),
                Err(err) => err,
            };
            match self.retry_or_fail(&mut retry, err, "write") {
                Ok(delay) => sleep(delay).await,
                Err(failure) => return (offset as u64, Err(failure)),
            }
        }
    }

    async fn sync_with_retry(&mut self) -> Result<(), Failure> {
        let mut retry = self.shared.settings.retry.handle();
        loop {
            let result = self
                .blocking(|file| file.sync())
                .await
                .map_err(Failure::Fatal)?;
            match result {
                Ok(()) => {
                    self.unsynced = 0;
                    self.last_sync = Instant::now();
                    self.shared.state.lock().syncs += 1;
                    return Ok(());
                }
                Err(err) => sleep(self.retry_or_fail(&mut retry, err, "fsync")?).await,
            }
        }
    }

    /// The backoff before the next attempt, or how the operation failed.
    fn retry_or_fail(
        &self,
        retry: &mut RetryHandle,
        err: io::Error,
        op: &str,
    ) -> Result<Duration, Failure> {
        let class = classify(&err);
        let reason = format!("{op} failed: {err}");
        if class == ErrorClass::Fatal {
            return Err(Failure::Fatal(reason));
        }
        match retry.next_delay() {
            Some(delay) => {
                debug!(
                    path = %self.shared.path.display(),
                    attempt = retry.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "{op} failed; retrying"
                );
                Ok(delay)
            }
            None if class == ErrorClass::Exhaustion => Err(Failure::Exhausted(reason)),
            None => Err(Failure::Transient(reason)),
        }
    }

    /// Run `op` against the descriptor on the blocking pool.
    async fn blocking<T, F>(&mut self, op: F) -> Result<T, String>
    where
        F: FnOnce(&mut dyn TargetFile) -> T + Send + 'static,
        T: Send + 'static,
    {
        let Some(mut file) = self.file.take() else {
            return Err("target file is no longer open".to_string());
        };
        match tokio::task::spawn_blocking(move || {
            let out = op(file.as_mut());
            (file, out)
        })
        .await
        {
            Ok((file, out)) => {
                self.file = Some(file);
                Ok(out)
            }
            Err(err) => Err(format!("writer task failed: {err}")),
        }
    }

    /// Release the request's charge, record stats, then deliver. Returns the
    /// consecutive-failure count after this completion.
    fn complete(
        &self,
        request_id: u64,
        target: TargetId,
        sink: CompletionSink,
        outcome: Outcome,
        charged: u64,
        bytes_written: u64,
    ) -> u32 {
        let failures = {
            let mut state = self.shared.state.lock();
            state.gauge.entries = state.gauge.entries.saturating_sub(1);
            state.gauge.bytes = state.gauge.bytes.saturating_sub(charged);
            state.last_activity = Instant::now();
            state.bytes_written += bytes_written;
            match &outcome {
                Outcome::Success => {
                    state.appended += 1;
                    state.consecutive_failures = 0;
                }
                Outcome::Busy => {}
                Outcome::TransientError(reason) | Outcome::FatalError(reason) => {
                    state.failed += 1;
                    state.consecutive_failures += 1;
                    state.last_error = Some(reason.clone());
                }
            }
            state.consecutive_failures
        };
        self.shared.budget.release(charged);

        let delivered = sink.complete(CompletionRecord {
            request_id,
            target,
            outcome,
            bytes_written,
        });
        if !delivered {
            trace!(request_id, "connection gone; completion dropped");
        }
        failures
    }

    /// Move to CLOSED and fail everything still queued, in order.
    fn close(&mut self, reason: String) {
        let drained = {
            let mut state = self.shared.state.lock();
            if matches!(state.phase, Phase::Closed { .. } | Phase::Retired) {
                return;
            }
            state.phase = Phase::Closed {
                reason: reason.clone(),
                since: Instant::now(),
            };
            state.last_error = Some(reason.clone());
            std::mem::take(&mut state.queue)
        };
        self.unsynced = 0;
        error!(
            path = %self.shared.path.display(),
            error = %reason,
            failed_pending = drained.len(),
            "target closed"
        );
        for request in drained {
            let charged = request.len();
            self.complete(
                request.request_id,
                request.target,
                request.sink,
                Outcome::FatalError(reason.clone()),
                charged,
                0,
            );
        }
    }

    fn flush_due(&self) -> bool {
        if self.unsynced == 0 || self.file.is_none() {
            return false;
        }
        self.unsynced >= self.shared.settings.sync_bytes
            || self.last_sync.elapsed() >= self.shared.settings.sync_interval
    }

    /// Batched fsync for `no-sync` writes. No request waits on it.
    async fn flush(&mut self) {
        match self.sync_with_retry().await {
            Ok(()) => trace!(path = %self.shared.path.display(), "batched fsync"),
            Err(Failure::Transient(reason)) => {
                warn!(path = %self.shared.path.display(), error = %reason, "batched fsync failed");
                self.last_sync = Instant::now();
            }
            Err(Failure::Exhausted(reason)) | Err(Failure::Fatal(reason)) => self.close(reason),
        }
    }

    /// Mark the worker retired and unpublish it if it has been idle (or
    /// closed) long enough, or immediately once the daemon is stopping.
    fn try_retire(&self) -> bool {
        let idle_timeout = self.shared.settings.idle_timeout;
        let now = Instant::now();
        let mut workers = self.workers.lock();
        let mut state = self.shared.state.lock();
        let expired = match &state.phase {
            Phase::Idle => {
                state.queue.is_empty()
                    && (self.stopping
                        || now.duration_since(state.last_activity) >= idle_timeout)
            }
            Phase::Closed { since, .. } => {
                self.stopping || now.duration_since(*since) >= idle_timeout
            }
            Phase::Draining => false,
            Phase::Retired => true,
        };
        if !expired {
            return false;
        }
        state.phase = Phase::Retired;
        drop(state);

        let published = workers
            .get(&self.shared.key)
            .is_some_and(|handle| Arc::ptr_eq(&handle.shared, &self.shared));
        if published {
            workers.remove(&self.shared.key);
        }
        true
    }

    async fn idle_wait(&mut self) {
        let deadline = self.next_deadline();
        let stop_requested = tokio::select! {
            _ = self.shared.wake.notified() => false,
            _ = sleep_until(deadline) => false,
            _ = self.shutdown.changed(), if !self.stopping => true,
        };
        if stop_requested {
            self.stopping = true;
        }
    }

    fn next_deadline(&self) -> Instant {
        let idle_timeout = self.shared.settings.idle_timeout;
        let retire_at = {
            let state = self.shared.state.lock();
            match &state.phase {
                Phase::Closed { since, .. } => *since + idle_timeout,
                _ => state.last_activity + idle_timeout,
            }
        };
        if self.unsynced > 0 && self.file.is_some() {
            retire_at.min(self.last_sync + self.shared.settings.sync_interval)
        } else {
            retire_at
        }
    }

    /// fsync and close the descriptor on the way out.
    async fn release_file(&mut self) {
        if self.file.is_none() {
            return;
        }
        match self.blocking(|file| file.sync()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(path = %self.shared.path.display(), error = %err, "final fsync failed")
            }
            Err(reason) => {
                warn!(path = %self.shared.path.display(), error = %reason, "final fsync failed")
            }
        }
        self.file = None;
    }
}

/// Write `data[*offset..]`, continuing short writes. `offset` always reflects
/// the bytes that reached the file, even on error.
fn write_from(file: &mut dyn TargetFile, data: &[u8], offset: &mut usize) -> io::Result<()> {
    while *offset < data.len() {
        match file.write(&data[*offset..]) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => *offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use std::path::PathBuf;
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    // ---------------------------------------------------------------------------
    // Scripted descriptor
    // ---------------------------------------------------------------------------

    #[derive(Default)]
    struct DiskState {
        content: Vec<u8>,
        synced_len: usize,
        syncs: usize,
        write_errors: VecDeque<io::Error>,
        sync_errors: VecDeque<io::Error>,
        max_chunk: Option<usize>,
    }

    #[derive(Clone, Default)]
    struct Disk {
        state: Arc<Mutex<DiskState>>,
        /// Held by a test to stall the writer inside `write`.
        gate: Arc<Mutex<()>>,
    }

    impl Disk {
        fn content(&self) -> Vec<u8> {
            self.state.lock().content.clone()
        }

        fn fail_writes(&self, errors: impl IntoIterator<Item = io::Error>) {
            self.state.lock().write_errors.extend(errors);
        }
    }

    struct ScriptedFile(Disk);

    impl TargetFile for ScriptedFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _gate = self.0.gate.lock();
            let mut state = self.0.state.lock();
            if let Some(err) = state.write_errors.pop_front() {
                return Err(err);
            }
            let n = state.max_chunk.map_or(buf.len(), |max| max.min(buf.len()));
            state.content.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn sync(&mut self) -> io::Result<()> {
            let mut state = self.0.state.lock();
            if let Some(err) = state.sync_errors.pop_front() {
                return Err(err);
            }
            state.syncs += 1;
            state.synced_len = state.content.len();
            Ok(())
        }
    }

    // ---------------------------------------------------------------------------
    // Harness
    // ---------------------------------------------------------------------------

    const KEY: TargetKey = TargetKey { dev: 1, ino: 42 };

    fn settings() -> WorkerSettings {
        WorkerSettings {
            limits: QueueLimits {
                max_entries: 64,
                max_bytes: 1 << 20,
            },
            retry: RetryPolicy::exponential(3, Duration::from_millis(1)),
            max_consecutive_failures: 8,
            sync_interval: Duration::from_secs(3600),
            sync_bytes: u64::MAX,
            idle_timeout: Duration::from_secs(3600),
        }
    }

    struct Harness {
        worker: WorkerHandle,
        workers: WorkerMap,
        shutdown: watch::Sender<bool>,
        budget: ByteBudget,
    }

    fn start(disk: &Disk, settings: WorkerSettings, budget: ByteBudget) -> Harness {
        let workers: WorkerMap = Arc::default();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = WorkerHandle::spawn(
            KEY,
            PathBuf::from("/logs/app.log"),
            Box::new(ScriptedFile(disk.clone())),
            settings,
            budget.clone(),
            Arc::clone(&workers),
            shutdown_rx,
        );
        workers.lock().insert(KEY, worker.clone());
        Harness {
            worker,
            workers,
            shutdown,
            budget,
        }
    }

    fn connection() -> (
        CompletionSink,
        UnboundedSender<Outbound>,
        UnboundedReceiver<Outbound>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CompletionSink::new(tx.downgrade()), tx, rx)
    }

    fn append(id: u64, data: &[u8], durability: Durability, sink: &CompletionSink) -> PendingAppend {
        PendingAppend {
            request_id: id,
            target: TargetId::Path(PathBuf::from("/logs/app.log")),
            durability,
            data: data.to_vec(),
            sink: sink.clone(),
        }
    }

    fn enqueue(worker: &WorkerHandle, request: PendingAppend) {
        assert!(matches!(worker.try_enqueue(request), Admission::Queued));
    }

    async fn next_completion(rx: &mut UnboundedReceiver<Outbound>) -> CompletionRecord {
        loop {
            let item = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("completion within deadline")
                .expect("channel open");
            if let Outbound::Completed(record) = item {
                return record;
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(10), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    // ---------------------------------------------------------------------------
    // Ordering
    // ---------------------------------------------------------------------------

    #[tokio::test]
    async fn completions_follow_acceptance_order() {
        let disk = Disk::default();
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        let mut expected = Vec::new();
        for id in 0..20u64 {
            let line = format!("line {id}\n");
            expected.extend_from_slice(line.as_bytes());
            enqueue(&h.worker, append(id, line.as_bytes(), Durability::NoSync, &sink));
        }

        for id in 0..20u64 {
            let record = next_completion(&mut rx).await;
            assert_eq!(record.request_id, id);
            assert_eq!(record.outcome, Outcome::Success);
        }
        assert_eq!(disk.content(), expected);
    }

    #[tokio::test]
    async fn queued_notice_precedes_completion() {
        let disk = Disk::default();
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(7, b"x", Durability::NoSync, &sink));

        assert!(matches!(rx.recv().await, Some(Outbound::Queued(7))));
        let record = next_completion(&mut rx).await;
        assert_eq!(record.request_id, 7);
        assert_eq!(record.bytes_written, 1);
    }

    #[tokio::test]
    async fn short_writes_are_continued() {
        let disk = Disk::default();
        disk.state.lock().max_chunk = Some(3);
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"hello world\n", Durability::NoSync, &sink));
        let record = next_completion(&mut rx).await;

        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.bytes_written, 12);
        assert_eq!(disk.content(), b"hello world\n");
    }

    // ---------------------------------------------------------------------------
    // Backpressure
    // ---------------------------------------------------------------------------

    #[tokio::test]
    async fn entry_bound_rejects_without_side_effects() {
        let disk = Disk::default();
        let mut s = settings();
        s.limits.max_entries = 2;
        let h = start(&disk, s, ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        let gate = disk.gate.lock();
        enqueue(&h.worker, append(1, b"a", Durability::NoSync, &sink));
        enqueue(&h.worker, append(2, b"b", Durability::NoSync, &sink));
        assert!(matches!(
            h.worker.try_enqueue(append(3, b"c", Durability::NoSync, &sink)),
            Admission::Busy(Rejection::QueueEntries)
        ));
        drop(gate);

        assert_eq!(next_completion(&mut rx).await.request_id, 1);
        assert_eq!(next_completion(&mut rx).await.request_id, 2);
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "no completion for the rejected request"
        );
        assert_eq!(disk.content(), b"ab");
    }

    #[tokio::test]
    async fn oversize_request_only_enters_an_empty_queue() {
        let disk = Disk::default();
        let mut s = settings();
        s.limits.max_bytes = 8;
        let h = start(&disk, s, ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        let gate = disk.gate.lock();
        enqueue(&h.worker, append(1, &[b'x'; 20], Durability::NoSync, &sink));
        assert!(matches!(
            h.worker.try_enqueue(append(2, b"y", Durability::NoSync, &sink)),
            Admission::Busy(Rejection::QueueBytes)
        ));
        drop(gate);

        assert_eq!(next_completion(&mut rx).await.bytes_written, 20);
    }

    #[tokio::test]
    async fn shared_budget_is_released_on_completion() {
        let disk = Disk::default();
        let h = start(&disk, settings(), ByteBudget::new(10));
        let (sink, _tx, mut rx) = connection();

        let gate = disk.gate.lock();
        enqueue(&h.worker, append(1, &[b'a'; 8], Durability::NoSync, &sink));
        assert!(matches!(
            h.worker.try_enqueue(append(2, &[b'b'; 8], Durability::NoSync, &sink)),
            Admission::Busy(Rejection::TotalBytes)
        ));
        assert_eq!(h.budget.used(), 8);
        drop(gate);

        next_completion(&mut rx).await;
        assert_eq!(h.budget.used(), 0);
        assert_eq!(h.worker.snapshot().queued_entries, 0);
    }

    // ---------------------------------------------------------------------------
    // Failures
    // ---------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let disk = Disk::default();
        disk.fail_writes([
            io::Error::from(ErrorKind::TimedOut),
            io::Error::from(ErrorKind::TimedOut),
        ]);
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"ok\n", Durability::NoSync, &sink));
        let record = next_completion(&mut rx).await;

        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(disk.content(), b"ok\n");
    }

    #[tokio::test]
    async fn exhausted_transient_fails_one_request_and_continues() {
        let disk = Disk::default();
        disk.fail_writes((0..3).map(|_| io::Error::from(ErrorKind::TimedOut)));
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"lost\n", Durability::NoSync, &sink));
        enqueue(&h.worker, append(2, b"kept\n", Durability::NoSync, &sink));

        let first = next_completion(&mut rx).await;
        assert!(matches!(first.outcome, Outcome::TransientError(_)), "{first:?}");
        let second = next_completion(&mut rx).await;
        assert_eq!(second.outcome, Outcome::Success);
        assert_eq!(disk.content(), b"kept\n");
        wait_until(|| h.worker.snapshot().state == "idle").await;
    }

    #[tokio::test]
    async fn fatal_error_closes_target_and_fails_queue() {
        let disk = Disk::default();
        disk.fail_writes([io::Error::from_raw_os_error(libc::EIO)]);
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        let gate = disk.gate.lock();
        enqueue(&h.worker, append(1, b"a", Durability::NoSync, &sink));
        enqueue(&h.worker, append(2, b"b", Durability::NoSync, &sink));
        enqueue(&h.worker, append(3, b"c", Durability::NoSync, &sink));
        drop(gate);

        for id in 1..=3 {
            let record = next_completion(&mut rx).await;
            assert_eq!(record.request_id, id);
            assert!(matches!(record.outcome, Outcome::FatalError(_)), "{record:?}");
        }
        assert!(matches!(
            h.worker.try_enqueue(append(4, b"d", Durability::NoSync, &sink)),
            Admission::Closed(_)
        ));
        assert!(disk.content().is_empty());
        assert_eq!(h.worker.snapshot().state, "closed");
    }

    #[tokio::test]
    async fn disk_full_closes_after_retries() {
        let disk = Disk::default();
        disk.fail_writes((0..3).map(|_| io::Error::from_raw_os_error(libc::ENOSPC)));
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"a", Durability::NoSync, &sink));
        let record = next_completion(&mut rx).await;

        assert!(matches!(record.outcome, Outcome::FatalError(_)), "{record:?}");
        wait_until(|| h.worker.snapshot().state == "closed").await;
        assert!(matches!(
            h.worker.try_enqueue(append(2, b"b", Durability::NoSync, &sink)),
            Admission::Closed(_)
        ));
    }

    #[tokio::test]
    async fn consecutive_failures_close_the_target() {
        let disk = Disk::default();
        disk.fail_writes((0..2).map(|_| io::Error::from(ErrorKind::TimedOut)));
        let mut s = settings();
        s.retry = RetryPolicy::exponential(1, Duration::ZERO);
        s.max_consecutive_failures = 2;
        let h = start(&disk, s, ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"a", Durability::NoSync, &sink));
        enqueue(&h.worker, append(2, b"b", Durability::NoSync, &sink));
        next_completion(&mut rx).await;
        next_completion(&mut rx).await;

        wait_until(|| h.worker.snapshot().state == "closed").await;
        let snapshot = h.worker.snapshot();
        assert_eq!(snapshot.failed, 2);
        assert!(snapshot
            .last_error
            .is_some_and(|e| e.contains("2 consecutive failed appends")));
    }

    // ---------------------------------------------------------------------------
    // Durability
    // ---------------------------------------------------------------------------

    #[tokio::test]
    async fn sync_append_completes_after_fsync() {
        let disk = Disk::default();
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"hello\n", Durability::Sync, &sink));
        let record = next_completion(&mut rx).await;

        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.bytes_written, 6);
        let state = disk.state.lock();
        assert_eq!(state.syncs, 1);
        assert_eq!(state.synced_len, 6);
    }

    #[tokio::test]
    async fn no_sync_appends_are_flushed_by_byte_threshold() {
        let disk = Disk::default();
        let mut s = settings();
        s.sync_bytes = 10;
        let h = start(&disk, s, ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"12345", Durability::NoSync, &sink));
        next_completion(&mut rx).await;
        assert_eq!(disk.state.lock().syncs, 0);

        enqueue(&h.worker, append(2, b"67890", Durability::NoSync, &sink));
        next_completion(&mut rx).await;
        wait_until(|| disk.state.lock().syncs == 1).await;
        assert_eq!(disk.state.lock().synced_len, 10);
    }

    #[tokio::test]
    async fn idle_worker_flushes_on_interval() {
        let disk = Disk::default();
        let mut s = settings();
        s.sync_interval = Duration::from_millis(20);
        let h = start(&disk, s, ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"tick\n", Durability::NoSync, &sink));
        next_completion(&mut rx).await;

        wait_until(|| disk.state.lock().synced_len == 5).await;
    }

    // ---------------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------------

    #[tokio::test]
    async fn idle_worker_retires_and_refuses_late_requests() {
        let disk = Disk::default();
        let mut s = settings();
        s.idle_timeout = Duration::from_millis(30);
        let h = start(&disk, s, ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        enqueue(&h.worker, append(1, b"bye\n", Durability::NoSync, &sink));
        next_completion(&mut rx).await;

        wait_until(|| h.workers.lock().is_empty()).await;
        assert!(h.worker.is_retired());
        assert!(matches!(
            h.worker.try_enqueue(append(2, b"late", Durability::NoSync, &sink)),
            Admission::Retired(_)
        ));
        wait_until(|| disk.state.lock().synced_len == 4).await;
    }

    #[tokio::test]
    async fn writes_continue_after_connection_drops() {
        let disk = Disk::default();
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, tx, rx) = connection();

        let gate = disk.gate.lock();
        for id in 0..5u64 {
            enqueue(&h.worker, append(id, b"z", Durability::NoSync, &sink));
        }
        drop(tx);
        drop(rx);
        drop(gate);

        wait_until(|| disk.content().len() == 5).await;
        wait_until(|| h.worker.snapshot().appended == 5).await;
    }

    #[tokio::test]
    async fn shutdown_drains_then_retires() {
        let disk = Disk::default();
        let h = start(&disk, settings(), ByteBudget::unlimited());
        let (sink, _tx, mut rx) = connection();

        let gate = disk.gate.lock();
        for id in 0..3u64 {
            enqueue(&h.worker, append(id, b"d", Durability::NoSync, &sink));
        }
        h.shutdown.send_replace(true);
        drop(gate);

        for id in 0..3u64 {
            assert_eq!(next_completion(&mut rx).await.request_id, id);
        }
        wait_until(|| h.workers.lock().is_empty()).await;
        assert_eq!(disk.content(), b"ddd");
        wait_until(|| disk.state.lock().synced_len == 3).await;
    }

    #[test]
    fn worker_can_move_between_runtime_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Box<dyn TargetFile>>();
        assert_send_sync::<AppendWorker>();
    }

    #[test]
    fn configured_backoff_cap_bounds_every_step() {
        let config = DaemonConfig {
            retry_attempts: 4,
            retry_backoff_ms: 10,
            retry_max_backoff_ms: 15,
            ..DaemonConfig::default()
        };
        let mut retry = WorkerSettings::from_config(&config).retry.handle();
        assert_eq!(retry.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(retry.next_delay(), Some(Duration::from_millis(15)));
        assert_eq!(retry.next_delay(), Some(Duration::from_millis(15)));
        assert_eq!(retry.next_delay(), None);
    }
}
