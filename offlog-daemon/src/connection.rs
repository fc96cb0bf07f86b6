//! Connection Handler: one reader and one writer task per client.
//!
//! The reader decodes frames and routes appends through the registry in
//! arrival order; everything sent back (admission verdicts, completions,
//! replies) goes through one unbounded channel drained by the writer, so a
//! slow client never blocks a worker. Workers only hold weak senders: once
//! the reader is gone, their completions are dropped on the floor.
//!
//! A client that hangs up loses its replies, not its requests: when the
//! writer fails, the reader keeps submitting what is already on the socket
//! until EOF.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use offlog_core::wire::{
    validate_target_path, AppendAck, AppendPayload, FrameHeader, MessageType, OpenTargetAck,
    HEADER_LEN,
};
use offlog_core::{CompletionRecord, Frame, ProtocolError, TargetId};

use crate::error::{io_err, DaemonError};
use crate::runtime::{stopped, DaemonContext};
use crate::target::{open_failure_reason, TargetKey};
use crate::worker::{Admission, PendingAppend};

/// Items queued for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Admission verdict for an accepted append.
    Queued(u64),
    Completed(CompletionRecord),
    Frame(Frame),
}

/// Where a worker delivers a request's admission notice and completion.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    tx: WeakUnboundedSender<Outbound>,
}

impl CompletionSink {
    pub fn new(tx: WeakUnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn admitted(&self, request_id: u64) -> bool {
        self.deliver(Outbound::Queued(request_id))
    }

    /// Returns `false` when the connection is already gone.
    pub fn complete(&self, record: CompletionRecord) -> bool {
        self.deliver(Outbound::Completed(record))
    }

    fn deliver(&self, item: Outbound) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

type Outstanding = Arc<Mutex<HashSet<u64>>>;

const OUTSTANDING_POLL: Duration = Duration::from_millis(10);

/// Serve one client until it disconnects, violates the protocol, or the
/// daemon stops.
pub(crate) async fn serve(stream: UnixStream, ctx: Arc<DaemonContext>) -> Result<(), DaemonError> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let outstanding: Outstanding = Arc::default();
    let writer_task = tokio::spawn(write_loop(writer, rx, Arc::clone(&outstanding)));

    ctx.connection_opened();
    let mut connection = Connection {
        ctx: Arc::clone(&ctx),
        tx,
        outstanding,
        handles: HashMap::new(),
        next_handle: 1,
    };
    let result = connection.read_loop(reader).await;
    // Last strong sender: the writer flushes what is queued, then exits.
    drop(connection);
    ctx.connection_closed();

    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "connection writer stopped"),
        Err(err) => warn!(error = %err, "connection writer task failed"),
    }
    result
}

enum Event {
    Frame(Result<Option<Frame>, ProtocolError>),
    Stopping,
}

struct Connection {
    ctx: Arc<DaemonContext>,
    tx: UnboundedSender<Outbound>,
    outstanding: Outstanding,
    /// Handles negotiated with `OPEN_TARGET`, scoped to this connection.
    handles: HashMap<u64, (PathBuf, TargetKey)>,
    next_handle: u64,
}

impl Connection {
    async fn read_loop(&mut self, reader: OwnedReadHalf) -> Result<(), DaemonError> {
        let mut reader = BufReader::new(reader);
        let max_payload = self.ctx.config.max_payload_bytes;
        let stopping = stopped(self.ctx.stop_signal());
        tokio::pin!(stopping);

        loop {
            let event = tokio::select! {
                read = read_frame(&mut reader, max_payload) => Event::Frame(read),
                _ = &mut stopping => Event::Stopping,
            };
            let frame = match event {
                Event::Frame(Ok(Some(frame))) => frame,
                Event::Frame(Ok(None)) => return Ok(()),
                // Peer closed with our replies unread.
                Event::Frame(Err(ProtocolError::Io(err)))
                    if err.kind() == ErrorKind::ConnectionReset =>
                {
                    return Ok(())
                }
                Event::Frame(Err(ProtocolError::Io(err))) => {
                    return Err(io_err("daemon socket read", err))
                }
                Event::Frame(Err(err)) => {
                    self.violation(0, &err);
                    return Ok(());
                }
                Event::Stopping => {
                    self.wait_outstanding().await;
                    return Ok(());
                }
            };

            let request_id = frame.request_id;
            if let Err(err) = self.dispatch(frame).await {
                self.violation(request_id, &err);
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match frame.kind {
            MessageType::Append => self.on_append(frame).await?,
            MessageType::OpenTarget => self.on_open_target(frame).await?,
            MessageType::CloseTarget => {
                let handle = frame.handle()?;
                if self.handles.remove(&handle).is_none() {
                    debug!(handle, "CLOSE_TARGET for unknown handle");
                }
            }
            MessageType::Ping => {
                self.send(Frame::new(MessageType::Pong, frame.request_id, frame.payload));
            }
            MessageType::Status => {
                let status = self.ctx.status_payload();
                self.send(Frame::new(
                    MessageType::StatusAck,
                    frame.request_id,
                    status.to_string().into_bytes(),
                ));
            }
            MessageType::Shutdown => {
                info!("shutdown requested over socket");
                self.send(Frame::new(
                    MessageType::StatusAck,
                    frame.request_id,
                    json!({ "stopping": true }).to_string().into_bytes(),
                ));
                self.ctx.request_stop();
            }
            other => return Err(ProtocolError::Unexpected(other)),
        }
        Ok(())
    }

    async fn on_append(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let request_id = frame.request_id;
        let append = AppendPayload::decode(&frame.payload)?;
        if !self.outstanding.lock().insert(request_id) {
            return Err(ProtocolError::DuplicateRequestId(request_id));
        }

        let (path, known) = match &append.target {
            TargetId::Path(path) => (path.clone(), None),
            TargetId::Handle(handle) => match self.handles.get(handle) {
                Some((path, key)) => (path.clone(), Some(*key)),
                None => {
                    self.reject(
                        request_id,
                        AppendAck::fatal(format!("unknown target handle {handle}")),
                    );
                    return Ok(());
                }
            },
        };

        let request = PendingAppend {
            request_id,
            target: append.target,
            durability: append.durability,
            data: append.data,
            sink: CompletionSink::new(self.tx.downgrade()),
        };
        match self.ctx.registry.submit(&path, known, request).await {
            Ok(Admission::Queued) => {}
            Ok(Admission::Busy(rejection)) => {
                debug!(path = %path.display(), request_id, reason = %rejection, "append rejected: busy");
                self.reject(request_id, AppendAck::busy());
            }
            Ok(Admission::Closed(reason)) => self.reject(request_id, AppendAck::fatal(reason)),
            Ok(Admission::Retired(_)) => {
                self.reject(request_id, AppendAck::fatal("target was retired"));
            }
            Err(err) => {
                debug!(path = %path.display(), request_id, error = %err, "target could not be opened");
                self.reject(request_id, AppendAck::fatal(open_failure_reason(&err)));
            }
        }
        Ok(())
    }

    async fn on_open_target(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let path = PathBuf::from(frame.text()?);
        validate_target_path(&path)?;

        let ack = match self.ctx.registry.open(&path).await {
            Ok(key) => {
                let handle = self.next_handle;
                self.next_handle += 1;
                debug!(path = %path.display(), handle, "target handle opened");
                self.handles.insert(handle, (path, key));
                OpenTargetAck::Opened(handle)
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "OPEN_TARGET denied");
                OpenTargetAck::Denied(open_failure_reason(&err))
            }
        };
        self.send(Frame::open_target_ack(frame.request_id, &ack));
        Ok(())
    }

    /// Synchronous verdict: nothing was queued, nothing else follows.
    fn reject(&self, request_id: u64, ack: AppendAck) {
        self.outstanding.lock().remove(&request_id);
        self.send(Frame::append_ack(request_id, &ack));
    }

    fn send(&self, frame: Frame) {
        let _ = self.tx.send(Outbound::Frame(frame));
    }

    fn violation(&self, request_id: u64, err: &ProtocolError) {
        warn!(request_id, error = %err, "protocol violation; closing connection");
        self.send(Frame::error(request_id, &err.to_string()));
    }

    /// Keep delivering completions for already-queued appends while the
    /// daemon drains, bounded by the shutdown grace period.
    async fn wait_outstanding(&self) {
        if self.tx.is_closed() {
            return;
        }
        let deadline = Instant::now() + self.ctx.config.shutdown_grace();
        while !self.outstanding.lock().is_empty() && Instant::now() < deadline {
            sleep(OUTSTANDING_POLL).await;
        }
    }
}

async fn write_loop(
    writer: OwnedWriteHalf,
    mut rx: UnboundedReceiver<Outbound>,
    outstanding: Outstanding,
) -> Result<(), DaemonError> {
    let mut writer = BufWriter::new(writer);
    while let Some(item) = rx.recv().await {
        write_item(&mut writer, item, &outstanding).await?;
        while let Ok(item) = rx.try_recv() {
            write_item(&mut writer, item, &outstanding).await?;
        }
        writer
            .flush()
            .await
            .map_err(|e| io_err("daemon socket flush", e))?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn write_item(
    writer: &mut BufWriter<OwnedWriteHalf>,
    item: Outbound,
    outstanding: &Outstanding,
) -> Result<(), DaemonError> {
    let frame = match item {
        Outbound::Queued(request_id) => Frame::empty(MessageType::AppendQueued, request_id),
        Outbound::Completed(record) => {
            outstanding.lock().remove(&record.request_id);
            Frame::append_ack(
                record.request_id,
                &AppendAck {
                    outcome: record.outcome,
                    bytes_written: record.bytes_written,
                },
            )
        }
        Outbound::Frame(frame) => frame,
    };
    writer
        .write_all(&frame.encode())
        .await
        .map_err(|e| io_err("daemon socket write", e))
}

/// Async counterpart of [`offlog_core::wire::read_frame`]. `Ok(None)` on a
/// clean EOF between frames.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u32,
) -> Result<Option<Frame>, ProtocolError> {
    let mut head = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::TruncatedFrame {
                read: filled,
                expected: HEADER_LEN,
            });
        }
        filled += n;
    }

    let header = FrameHeader::decode(&head, max_payload)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    if let Err(err) = reader.read_exact(&mut payload).await {
        if err.kind() == ErrorKind::UnexpectedEof {
            return Err(ProtocolError::TruncatedFrame {
                read: HEADER_LEN,
                expected: HEADER_LEN + payload.len(),
            });
        }
        return Err(err.into());
    }
    Ok(Some(Frame::new(header.kind, header.request_id, payload)))
}
