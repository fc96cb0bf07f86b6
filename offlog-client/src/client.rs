//! Blocking connection to the offlog daemon.
//!
//! Callers submit appends and get control back as soon as the daemon has
//! acknowledged admission (or the admission deadline passes). A background
//! reader thread resolves outstanding requests as frames arrive, so no file
//! I/O ever happens on the caller's thread.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use offlog_core::wire::{
    self, AppendAck, AppendPayload, OpenTargetAck, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_SOCKET_PATH,
};
use offlog_core::{Durability, Frame, MessageType, Outcome, ProtocolError, TargetId};

use crate::error::{ClientError, SubmitError};

pub const DEFAULT_ADMISSION_DEADLINE: Duration = Duration::from_millis(50);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Replies (status documents in particular) are not bounded by the append
/// payload ceiling.
const REPLY_PAYLOAD_LIMIT: u32 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Configuration and public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    /// How long `submit` waits for the admission verdict. Zero returns the
    /// handle immediately.
    pub admission_deadline: Duration,
    /// Bound on blocking request/reply exchanges (open, status, shutdown).
    pub request_timeout: Duration,
    /// Must not exceed the daemon's own ceiling.
    pub max_payload_bytes: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            admission_deadline: DEFAULT_ADMISSION_DEADLINE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    pub fn with_admission_deadline(mut self, deadline: Duration) -> Self {
        self.admission_deadline = deadline;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// How one submitted append ended, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Success { bytes_written: u64 },
    /// Rejected at admission after the caller stopped waiting for the verdict.
    Busy,
    /// The daemon gave up retrying; later appends to the target may succeed.
    TransientError { reason: String, bytes_written: u64 },
    /// The target is closed; later appends will fail too.
    FatalError { reason: String, bytes_written: u64 },
    /// The daemon connection dropped before a verdict arrived. Whether the
    /// bytes reached the file is unknown.
    ConnectionLost,
}

impl AppendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AppendOutcome::Success { .. })
    }
}

impl From<AppendAck> for AppendOutcome {
    fn from(ack: AppendAck) -> Self {
        let bytes_written = ack.bytes_written;
        match ack.outcome {
            Outcome::Success => AppendOutcome::Success { bytes_written },
            Outcome::Busy => AppendOutcome::Busy,
            Outcome::TransientError(reason) => AppendOutcome::TransientError {
                reason,
                bytes_written,
            },
            Outcome::FatalError(reason) => AppendOutcome::FatalError {
                reason,
                bytes_written,
            },
        }
    }
}

impl fmt::Display for AppendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendOutcome::Success { bytes_written } => write!(f, "success ({bytes_written} bytes)"),
            AppendOutcome::Busy => write!(f, "busy"),
            AppendOutcome::TransientError { reason, .. } => write!(f, "transient error: {reason}"),
            AppendOutcome::FatalError { reason, .. } => write!(f, "fatal error: {reason}"),
            AppendOutcome::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

/// A target opened with [`Client::open_target`]. Only valid on the connection
/// that opened it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHandle {
    id: u64,
    path: PathBuf,
}

impl TargetHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

type Callback = Arc<dyn Fn(u64, &AppendOutcome) + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared connection state
// ---------------------------------------------------------------------------

enum Slot {
    Append(AppendSlot),
    /// Request/reply exchange; filled in by the reader.
    Request(Option<Frame>),
}

#[derive(Default)]
struct AppendSlot {
    queued: bool,
    outcome: Option<AppendOutcome>,
    /// The handle was dropped; forget the slot once it resolves.
    detached: bool,
}

#[derive(Default)]
struct State {
    slots: HashMap<u64, Slot>,
    lost: bool,
    rejected: Option<String>,
}

impl State {
    fn lost_error(&self) -> ClientError {
        match &self.rejected {
            Some(reason) => ClientError::Rejected(reason.clone()),
            None => ClientError::ConnectionLost,
        }
    }

    fn append_pending(&self, request_id: u64) -> bool {
        matches!(
            self.slots.get(&request_id),
            Some(Slot::Append(AppendSlot { outcome: None, .. }))
        )
    }

    fn outstanding(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Append(AppendSlot { outcome: None, .. })))
            .count()
    }
}

struct Shared {
    config: ClientConfig,
    writer: Mutex<UnixStream>,
    /// Extra clone used only to shut the socket down without queueing behind
    /// a blocked writer.
    control: UnixStream,
    state: Mutex<State>,
    changed: Condvar,
    callbacks: Mutex<Vec<Callback>>,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, frame: &Frame) -> io::Result<()> {
        let mut stream = self.writer.lock();
        wire::write_frame(&mut *stream, frame).map_err(|err| match err {
            ProtocolError::Io(err) => err,
            other => io::Error::new(ErrorKind::InvalidData, other),
        })
    }

    fn dispatch(&self, frame: Frame) -> Result<(), ProtocolError> {
        let request_id = frame.request_id;
        match frame.kind {
            MessageType::AppendQueued => {
                if let Some(Slot::Append(slot)) = self.state.lock().slots.get_mut(&request_id) {
                    slot.queued = true;
                }
                self.changed.notify_all();
            }
            MessageType::AppendAck => {
                let ack = AppendAck::decode(&frame.payload)?;
                self.resolve(request_id, AppendOutcome::from(ack));
            }
            MessageType::OpenTargetAck | MessageType::Pong | MessageType::StatusAck => {
                self.fill_reply(frame);
            }
            MessageType::Error => {
                let reason = frame.text().unwrap_or("unspecified").to_owned();
                warn!(request_id, %reason, "daemon reported a protocol violation");
                self.state.lock().rejected = Some(reason);
                self.fill_reply(frame);
            }
            other => return Err(ProtocolError::Unexpected(other)),
        }
        Ok(())
    }

    fn fill_reply(&self, frame: Frame) {
        let request_id = frame.request_id;
        let mut state = self.state.lock();
        match state.slots.get_mut(&request_id) {
            Some(Slot::Request(reply)) if reply.is_none() => *reply = Some(frame),
            _ => debug!(request_id, "reply for an abandoned request"),
        }
        drop(state);
        self.changed.notify_all();
    }

    fn resolve(&self, request_id: u64, outcome: AppendOutcome) {
        let mut state = self.state.lock();
        let detached = match state.slots.get_mut(&request_id) {
            Some(Slot::Append(slot)) if slot.outcome.is_none() => {
                slot.outcome = Some(outcome.clone());
                slot.detached
            }
            _ => {
                debug!(request_id, "verdict for an unknown request");
                return;
            }
        };
        if detached {
            state.slots.remove(&request_id);
        }
        drop(state);
        self.changed.notify_all();
        self.notify(request_id, &outcome);
    }

    fn connection_lost(&self) {
        let mut resolved = Vec::new();
        {
            let mut state = self.state.lock();
            state.lost = true;
            state.slots.retain(|request_id, slot| match slot {
                Slot::Append(append) if append.outcome.is_none() => {
                    resolved.push(*request_id);
                    append.outcome = Some(AppendOutcome::ConnectionLost);
                    !append.detached
                }
                _ => true,
            });
        }
        self.changed.notify_all();
        resolved.sort_unstable();
        for request_id in resolved {
            self.notify(request_id, &AppendOutcome::ConnectionLost);
        }
    }

    fn notify(&self, request_id: u64, outcome: &AppendOutcome) {
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(request_id, outcome);
        }
    }
}

/// Block on `changed` while `pending` holds, up to `deadline`. Returns whether
/// the wait ended because `pending` became false.
fn wait_while(
    changed: &Condvar,
    state: &mut MutexGuard<'_, State>,
    deadline: Instant,
    mut pending: impl FnMut(&State) -> bool,
) -> bool {
    while pending(state) {
        if changed.wait_until(state, deadline).timed_out() {
            return !pending(state);
        }
    }
    true
}

fn read_loop(mut stream: UnixStream, shared: &Shared) {
    loop {
        match wire::read_frame(&mut stream, REPLY_PAYLOAD_LIMIT) {
            Ok(Some(frame)) => {
                if let Err(err) = shared.dispatch(frame) {
                    warn!(error = %err, "undecodable frame from daemon");
                    let _ = stream.shutdown(Shutdown::Both);
                    break;
                }
            }
            Ok(None) => {
                debug!("daemon closed the connection");
                break;
            }
            Err(err) => {
                debug!(error = %err, "daemon connection failed");
                break;
            }
        }
    }
    shared.connection_lost();
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One connection to the daemon. Cheap to share by reference across threads.
pub struct Client {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Client {
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(&config.socket_path).map_err(|source| {
            match source.kind() {
                ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                    ClientError::DaemonUnavailable {
                        socket: config.socket_path.clone(),
                        source,
                    }
                }
                _ => ClientError::Io(source),
            }
        })?;
        let read_half = stream.try_clone()?;
        let control = stream.try_clone()?;
        debug!(socket = %config.socket_path.display(), "connected to offlog daemon");

        let shared = Arc::new(Shared {
            config,
            writer: Mutex::new(stream),
            control,
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        let reader = thread::Builder::new().name("offlog-reader".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || read_loop(read_half, &shared)
        })?;

        Ok(Self {
            shared,
            reader: Some(reader),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Append `data` to the file at `path`. Relative paths are made absolute
    /// against the caller's working directory.
    pub fn submit(
        &self,
        path: impl AsRef<Path>,
        data: &[u8],
        durability: Durability,
    ) -> Result<AppendHandle, SubmitError> {
        let path = std::path::absolute(path.as_ref())
            .map_err(|err| ProtocolError::InvalidPath(err.to_string()))?;
        wire::validate_target_path(&path)?;
        self.submit_target(TargetId::Path(path), data, durability)
    }

    /// Append `data` through a handle negotiated with [`Client::open_target`].
    pub fn submit_to(
        &self,
        target: &TargetHandle,
        data: &[u8],
        durability: Durability,
    ) -> Result<AppendHandle, SubmitError> {
        self.submit_target(TargetId::Handle(target.id), data, durability)
    }

    fn submit_target(
        &self,
        target: TargetId,
        data: &[u8],
        durability: Durability,
    ) -> Result<AppendHandle, SubmitError> {
        let max = self.shared.config.max_payload_bytes;
        let len = AppendPayload::encoded_len(&target, data.len());
        if len > max as usize {
            return Err(SubmitError::PayloadTooLarge { len, max });
        }

        let request_id = self.shared.next_id();
        let frame = Frame::append(
            request_id,
            &AppendPayload {
                target,
                durability,
                data: data.to_vec(),
            },
        )?;

        {
            let mut state = self.shared.state.lock();
            if state.lost {
                return Err(SubmitError::ConnectionLost);
            }
            state
                .slots
                .insert(request_id, Slot::Append(AppendSlot::default()));
        }
        if let Err(err) = self.shared.send(&frame) {
            debug!(request_id, error = %err, "append could not be sent");
            self.shared.state.lock().slots.remove(&request_id);
            return Err(SubmitError::ConnectionLost);
        }

        let deadline = self.shared.config.admission_deadline;
        if !deadline.is_zero() {
            let mut state = self.shared.state.lock();
            wait_while(
                &self.shared.changed,
                &mut state,
                Instant::now() + deadline,
                |state| match state.slots.get(&request_id) {
                    Some(Slot::Append(slot)) => !slot.queued && slot.outcome.is_none(),
                    _ => false,
                },
            );
            if let Some(Slot::Append(AppendSlot {
                queued: false,
                outcome: Some(AppendOutcome::Busy),
                ..
            })) = state.slots.get(&request_id)
            {
                state.slots.remove(&request_id);
                return Err(SubmitError::Busy);
            }
        }

        Ok(AppendHandle {
            request_id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Register a callback run on the reader thread for every append verdict,
    /// busy rejections included. Callbacks must not block.
    pub fn on_completion(&self, callback: impl Fn(u64, &AppendOutcome) + Send + Sync + 'static) {
        self.shared.callbacks.lock().push(Arc::new(callback));
    }

    /// Number of appends still waiting for a verdict.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding()
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.state.lock().lost
    }

    /// Ask the daemon to open `path` and hand back a connection-scoped handle.
    pub fn open_target(&self, path: impl AsRef<Path>) -> Result<TargetHandle, ClientError> {
        let path = std::path::absolute(path.as_ref())?;
        let frame = Frame::open_target(self.shared.next_id(), &path)?;
        let reply = self.request(frame, MessageType::OpenTargetAck, self.shared.config.request_timeout)?;
        match OpenTargetAck::decode(&reply.payload)? {
            OpenTargetAck::Opened(id) => Ok(TargetHandle { id, path }),
            OpenTargetAck::Denied(reason) => Err(ClientError::OpenDenied { path, reason }),
        }
    }

    /// Release a handle. Appends already submitted through it still complete.
    pub fn close_target(&self, target: TargetHandle) -> Result<(), ClientError> {
        self.shared
            .send(&Frame::close_target(self.shared.next_id(), target.id))
            .map_err(|_| ClientError::ConnectionLost)
    }

    /// Round-trip a PING; returns the measured latency.
    pub fn ping(&self, timeout: Duration) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let frame = Frame::empty(MessageType::Ping, self.shared.next_id());
        self.request(frame, MessageType::Pong, timeout)?;
        Ok(started.elapsed())
    }

    /// Daemon status document (uptime, connections, per-target workers).
    pub fn status(&self) -> Result<serde_json::Value, ClientError> {
        let frame = Frame::empty(MessageType::Status, self.shared.next_id());
        let reply = self.request(frame, MessageType::StatusAck, self.shared.config.request_timeout)?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    /// Ask the daemon to drain and exit.
    pub fn shutdown(&self) -> Result<serde_json::Value, ClientError> {
        let frame = Frame::empty(MessageType::Shutdown, self.shared.next_id());
        let reply = self.request(frame, MessageType::StatusAck, self.shared.config.request_timeout)?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    fn request(&self, frame: Frame, expect: MessageType, timeout: Duration) -> Result<Frame, ClientError> {
        let request_id = frame.request_id;
        {
            let mut state = self.shared.state.lock();
            if state.lost {
                return Err(state.lost_error());
            }
            state.slots.insert(request_id, Slot::Request(None));
        }
        if let Err(err) = self.shared.send(&frame) {
            self.shared.state.lock().slots.remove(&request_id);
            return Err(ClientError::Io(err));
        }

        let mut state = self.shared.state.lock();
        wait_while(
            &self.shared.changed,
            &mut state,
            Instant::now() + timeout,
            |state| !state.lost && matches!(state.slots.get(&request_id), Some(Slot::Request(None))),
        );
        let reply = match state.slots.remove(&request_id) {
            Some(Slot::Request(Some(reply))) => reply,
            _ if state.lost => return Err(state.lost_error()),
            _ => return Err(ClientError::Timeout(timeout)),
        };
        drop(state);

        if reply.kind == expect {
            Ok(reply)
        } else if reply.kind == MessageType::Error {
            Err(ClientError::Rejected(reply.text().unwrap_or("unspecified").to_owned()))
        } else {
            Err(ProtocolError::Unexpected(reply.kind).into())
        }
    }

    /// Wait up to `timeout` for every outstanding append to resolve, then
    /// disconnect. The connection is closed even when the wait times out.
    pub fn close(mut self, timeout: Duration) -> Result<(), ClientError> {
        let drained = {
            let mut state = self.shared.state.lock();
            wait_while(
                &self.shared.changed,
                &mut state,
                Instant::now() + timeout,
                |state| !state.lost && state.outstanding() > 0,
            )
        };
        self.disconnect();
        if drained {
            Ok(())
        } else {
            Err(ClientError::Timeout(timeout))
        }
    }

    fn disconnect(&mut self) {
        let _ = self.shared.control.shutdown(Shutdown::Both);
        let Some(reader) = self.reader.take() else {
            return;
        };
        // Dropping the client from inside a completion callback must not
        // join the reader thread on itself.
        if reader.thread().id() == thread::current().id() {
            return;
        }
        if reader.join().is_err() {
            warn!("offlog reader thread panicked");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("socket_path", &self.shared.config.socket_path)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AppendHandle
// ---------------------------------------------------------------------------

/// Pending verdict for one submitted append. Dropping the handle does not
/// cancel the write; the verdict is still passed to completion callbacks.
pub struct AppendHandle {
    request_id: u64,
    shared: Arc<Shared>,
}

impl AppendHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// The verdict, if it has arrived.
    pub fn poll(&self) -> Option<AppendOutcome> {
        match self.shared.state.lock().slots.get(&self.request_id) {
            Some(Slot::Append(slot)) => slot.outcome.clone(),
            _ => None,
        }
    }

    /// Block up to `timeout` for the verdict.
    pub fn wait(&self, timeout: Duration) -> Result<AppendOutcome, ClientError> {
        let mut state = self.shared.state.lock();
        let request_id = self.request_id;
        wait_while(
            &self.shared.changed,
            &mut state,
            Instant::now() + timeout,
            |state| state.append_pending(request_id),
        );
        match state.slots.get(&request_id) {
            Some(Slot::Append(AppendSlot {
                outcome: Some(outcome),
                ..
            })) => Ok(outcome.clone()),
            _ => Err(ClientError::Timeout(timeout)),
        }
    }
}

impl Drop for AppendHandle {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let resolved = match state.slots.get_mut(&self.request_id) {
            Some(Slot::Append(slot)) => {
                slot.detached = true;
                slot.outcome.is_some()
            }
            _ => false,
        };
        if resolved {
            state.slots.remove(&self.request_id);
        }
    }
}

impl fmt::Debug for AppendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendHandle")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}
