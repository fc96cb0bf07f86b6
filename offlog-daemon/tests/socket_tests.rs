//! End-to-end checks against a daemon bound to a real socket, speaking raw
//! frames from blocking clients.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use offlog_core::wire::{read_frame, write_frame, AppendAck, AppendPayload, MessageType};
use offlog_core::{Durability, Frame, Outcome, TargetId};
use offlog_daemon::{Daemon, DaemonConfig, DaemonError, ShutdownHandle};

struct Running {
    _dir: TempDir,
    socket: PathBuf,
    data: PathBuf,
    shutdown: ShutdownHandle,
    server: JoinHandle<Result<(), DaemonError>>,
}

fn start(config: impl FnOnce(&mut DaemonConfig)) -> Running {
    let dir = TempDir::new().expect("tempdir");
    let mut cfg = DaemonConfig {
        socket_path: dir.path().join("offlog.sock"),
        ..DaemonConfig::default()
    };
    config(&mut cfg);
    let daemon = Daemon::bind(cfg).expect("bind daemon");
    let shutdown = daemon.shutdown_handle();
    let socket = daemon.socket_path().to_path_buf();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).expect("data dir");
    let server = tokio::spawn(daemon.run());
    Running {
        _dir: dir,
        socket,
        data,
        shutdown,
        server,
    }
}

impl Running {
    async fn stop(self) {
        self.shutdown.shutdown();
        timeout(Duration::from_secs(10), self.server)
            .await
            .expect("daemon stops in time")
            .expect("join")
            .expect("clean exit");
    }
}

fn append_frame(id: u64, path: &Path, data: &[u8], durability: Durability) -> Frame {
    Frame::append(
        id,
        &AppendPayload {
            target: TargetId::Path(path.to_path_buf()),
            durability,
            data: data.to_vec(),
        },
    )
    .expect("encode append")
}

/// Read frames until the APPEND_ACK for `id`, asserting it was queued first.
fn await_ack(stream: &mut UnixStream, id: u64) -> AppendAck {
    let mut queued = false;
    loop {
        let frame = read_frame(stream, u32::MAX)
            .expect("read frame")
            .expect("connection open");
        if frame.request_id != id {
            continue;
        }
        match frame.kind {
            MessageType::AppendQueued => queued = true,
            MessageType::AppendAck => {
                assert!(queued, "APPEND_QUEUED must precede APPEND_ACK");
                return AppendAck::decode(&frame.payload).expect("decode ack");
            }
            other => panic!("unexpected {other}"),
        }
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.expect("blocking client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hello_sync_append() {
    let daemon = start(|_| {});
    let socket = daemon.socket.clone();
    let target = daemon.data.join("a.log");

    let path = target.clone();
    let ack = blocking(move || {
        let mut stream = UnixStream::connect(&socket).expect("connect");
        write_frame(&mut stream, &append_frame(1, &path, b"hello\n", Durability::Sync))
            .expect("send");
        await_ack(&mut stream, 1)
    })
    .await;

    assert_eq!(ack.outcome, Outcome::Success);
    assert_eq!(ack.bytes_written, 6);
    assert_eq!(fs::read(&target).unwrap(), b"hello\n");
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_connections_keep_acceptance_order() {
    let daemon = start(|_| {});
    let target = daemon.data.join("shared.log");

    let socket = daemon.socket.clone();
    let path = target.clone();
    blocking(move || {
        let mut a = UnixStream::connect(&socket).expect("connect a");
        let mut b = UnixStream::connect(&socket).expect("connect b");

        write_frame(&mut a, &append_frame(1, &path, b"A1\n", Durability::NoSync)).unwrap();
        assert_eq!(await_ack(&mut a, 1).outcome, Outcome::Success);
        write_frame(&mut b, &append_frame(1, &path, b"B1\n", Durability::NoSync)).unwrap();
        assert_eq!(await_ack(&mut b, 1).outcome, Outcome::Success);
        write_frame(&mut a, &append_frame(2, &path, b"A2\n", Durability::NoSync)).unwrap();
        assert_eq!(await_ack(&mut a, 2).outcome, Outcome::Success);
    })
    .await;

    assert_eq!(fs::read(&target).unwrap(), b"A1\nB1\nA2\n");
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelined_appends_complete_in_order_without_interleaving() {
    let daemon = start(|_| {});
    let target = daemon.data.join("fifo.log");

    let socket = daemon.socket.clone();
    let path = target.clone();
    let expected = blocking(move || {
        let mut stream = UnixStream::connect(&socket).expect("connect");
        let mut expected = Vec::new();
        for id in 0..200u64 {
            let line = format!("{id:04} {}\n", "x".repeat((id % 37) as usize));
            expected.extend_from_slice(line.as_bytes());
            write_frame(&mut stream, &append_frame(id, &path, line.as_bytes(), Durability::NoSync))
                .unwrap();
        }
        let mut acked = Vec::new();
        while acked.len() < 200 {
            let frame = read_frame(&mut stream, u32::MAX).unwrap().unwrap();
            if frame.kind == MessageType::AppendAck {
                acked.push(frame.request_id);
            }
        }
        assert_eq!(acked, (0..200).collect::<Vec<_>>());
        expected
    })
    .await;

    assert_eq!(fs::read(&target).unwrap(), expected);
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_survive_client_disconnect() {
    let daemon = start(|_| {});
    let target = daemon.data.join("orphan.log");

    let socket = daemon.socket.clone();
    let path = target.clone();
    blocking(move || {
        let mut stream = UnixStream::connect(&socket).expect("connect");
        for id in 0..50u64 {
            write_frame(&mut stream, &append_frame(id, &path, b"0123456789", Durability::NoSync))
                .unwrap();
        }
    })
    .await;

    timeout(Duration::from_secs(10), async {
        while fs::metadata(&target).map(|m| m.len()).unwrap_or(0) < 500 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all 50 writes land");
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_frame_stops_the_daemon() {
    let daemon = start(|_| {});
    let socket = daemon.socket.clone();

    let reply = blocking(move || {
        let mut stream = UnixStream::connect(&socket).expect("connect");
        write_frame(&mut stream, &Frame::empty(MessageType::Shutdown, 1)).unwrap();
        read_frame(&mut stream, u32::MAX).unwrap().unwrap()
    })
    .await;
    assert_eq!(reply.kind, MessageType::StatusAck);

    timeout(Duration::from_secs(10), daemon.server)
        .await
        .expect("daemon exits")
        .expect("join")
        .expect("clean exit");
    assert!(!daemon.socket.exists());
}
