use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn offlog_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("offlog"));
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

struct DaemonProcess {
    child: Child,
    home: PathBuf,
    socket: PathBuf,
}

impl DaemonProcess {
    fn start(home: &Path, socket: &Path, log_dir: &Path) -> Self {
        let child = offlog_cmd(home)
            .args(["daemon", "start", "--socket"])
            .arg(socket)
            .arg("--log-dir")
            .arg(log_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self {
            child,
            home: home.to_path_buf(),
            socket: socket.to_path_buf(),
        }
    }

    fn stop(&mut self) {
        let _ = offlog_cmd(&self.home)
            .args(["daemon", "stop", "--socket"])
            .arg(&self.socket)
            .status();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    false
}

fn daemon_answers(home: &Path, socket: &Path) -> bool {
    offlog_cmd(home)
        .args(["ping", "--socket"])
        .arg(socket)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[test]
fn ping_without_daemon_fails() {
    let home = TempDir::new().expect("home");
    offlog_cmd(home.path())
        .args(["ping", "--socket"])
        .arg(home.path().join("none.sock"))
        .assert()
        .failure()
        .stderr(contains("not reachable"));
}

#[test]
fn status_without_daemon_reports_not_running() {
    let home = TempDir::new().expect("home");
    let socket = home.path().join("none.sock");

    let output = offlog_cmd(home.path())
        .args(["daemon", "status", "--json", "--socket"])
        .arg(&socket)
        .output()
        .expect("run status");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status json");
    assert_eq!(value["running"], false);

    offlog_cmd(home.path())
        .args(["daemon", "stop", "--socket"])
        .arg(&socket)
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn append_requires_text() {
    let home = TempDir::new().expect("home");
    offlog_cmd(home.path())
        .args(["append", "/tmp/x.log"])
        .assert()
        .failure();
}

#[test]
fn logs_prints_the_tail() {
    let home = TempDir::new().expect("home");
    let log_dir = home.path().join("logs");
    fs::create_dir_all(&log_dir).expect("log dir");
    let body: String = (1..=10).map(|i| format!("line {i}\n")).collect();
    fs::write(log_dir.join("offlogd.log"), body).expect("write log");

    let assert = offlog_cmd(home.path())
        .args(["daemon", "logs", "--lines", "2", "--log-dir"])
        .arg(&log_dir)
        .assert()
        .success()
        .stdout(contains("line 9\nline 10"));
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    assert!(!stdout.contains("line 8"));
}

#[test]
fn daemon_lifecycle_over_the_cli() {
    let home = TempDir::new().expect("home");
    let socket = home.path().join("offlog.sock");
    let log_dir = home.path().join("logs");
    let target = home.path().join("app.log");

    let mut daemon = DaemonProcess::start(home.path(), &socket, &log_dir);
    assert!(
        wait_until(Duration::from_secs(10), || daemon_answers(home.path(), &socket)),
        "daemon did not answer in time"
    );

    offlog_cmd(home.path())
        .arg("append")
        .arg(&target)
        .args(["hello", "world", "--sync", "--socket"])
        .arg(&socket)
        .assert()
        .success()
        .stdout(contains("appended 12 bytes"));
    assert_eq!(fs::read_to_string(&target).expect("target"), "hello world\n");

    let output = offlog_cmd(home.path())
        .args(["daemon", "status", "--json", "--socket"])
        .arg(&socket)
        .output()
        .expect("run status");
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status json");
    assert_eq!(status["running"], true);
    assert!(status["workers"]
        .as_array()
        .expect("workers")
        .iter()
        .any(|w| w["path"] == target.display().to_string()));

    offlog_cmd(home.path())
        .args(["daemon", "status", "--socket"])
        .arg(&socket)
        .assert()
        .success()
        .stdout(contains("app.log"));

    daemon.stop();
    assert!(
        wait_until(Duration::from_secs(5), || !socket.exists()),
        "socket should be removed after stop"
    );
    assert!(log_dir.join("offlogd.log").exists());
}
