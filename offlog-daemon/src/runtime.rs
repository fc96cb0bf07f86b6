use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::{DaemonConfig, LogFormat};
use crate::connection;
use crate::error::{io_err, DaemonError};
use crate::log_rotation::{rotate_daemon_log, RotationPolicy};
use crate::paths::{daemon_log_path, LOG_ROTATION_INTERVAL};
use crate::registry::Registry;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State shared by the accept loop and every connection.
pub(crate) struct DaemonContext {
    pub(crate) config: DaemonConfig,
    pub(crate) registry: Registry,
    stop: watch::Sender<bool>,
    started_at_unix: u64,
    connections: AtomicUsize,
}

impl DaemonContext {
    pub(crate) fn new(config: DaemonConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            registry: Registry::new(&config),
            config,
            stop,
            started_at_unix: unix_seconds_now(),
            connections: AtomicUsize::new(0),
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Document returned in `STATUS_ACK`.
    pub(crate) fn status_payload(&self) -> Value {
        let budget = self.registry.budget();
        let now = unix_seconds_now();
        json!({
            "running": true,
            "stopping": *self.stop.borrow(),
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "socket": self.config.socket_path.display().to_string(),
            "started_at_unix": self.started_at_unix,
            "uptime_secs": now.saturating_sub(self.started_at_unix),
            "connections": self.connections.load(Ordering::Relaxed),
            "total_bytes_queued": budget.used(),
            "total_bytes_limit": budget.limit(),
            "workers": self.registry.snapshot(),
        })
    }
}

/// Cloneable trigger for a graceful stop, usable from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    ctx: Arc<DaemonContext>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.ctx.request_stop();
    }
}

/// A bound daemon socket, ready to serve.
pub struct Daemon {
    listener: UnixListener,
    ctx: Arc<DaemonContext>,
}

impl Daemon {
    /// Bind the socket described by `config`. A stale socket file left by a
    /// dead daemon is removed; a live one is an error. Must be called from
    /// within a tokio runtime.
    pub fn bind(config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let socket = config.socket_path.clone();
        if let Some(parent) = socket.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        prepare_socket_for_bind(&socket)?;
        let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
        set_socket_permissions(&socket, config.socket_mode)?;

        Ok(Self {
            listener,
            ctx: Arc::new(DaemonContext::new(config)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.ctx.config.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Serve until SIGINT, SIGTERM, a `SHUTDOWN` frame, or
    /// [`ShutdownHandle::shutdown`]; then drain every target and return.
    pub async fn run(self) -> Result<(), DaemonError> {
        let Daemon { listener, ctx } = self;
        tracing::info!(
            socket = %ctx.config.socket_path.display(),
            pid = std::process::id(),
            "offlog daemon listening"
        );

        let rotation_handle = ctx.config.log_dir.clone().map(|log_dir| {
            let stop = ctx.stop_signal();
            tokio::spawn(log_rotation_task(log_dir, stop))
        });

        let signal_handle = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { signal_task(ctx).await })
        };

        let accept_result = accept_loop(&listener, Arc::clone(&ctx)).await;
        ctx.request_stop();
        drop(listener);
        remove_socket(&ctx.config.socket_path);

        let drained = ctx.registry.shutdown(ctx.config.shutdown_grace()).await;
        tracing::info!(drained, "offlog daemon stopped");

        handle_join("signal_handler", signal_handle.await)?;
        if let Some(handle) = rotation_handle {
            handle_join("log_rotation", handle.await)?;
        }
        accept_result
    }
}

/// Initialise logging, then run the daemon on a fresh multi-threaded
/// runtime, blocking the current thread until it exits.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    config.validate()?;
    init_tracing(&config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async move { Daemon::bind(config)?.run().await })
}

async fn accept_loop(listener: &UnixListener, ctx: Arc<DaemonContext>) -> Result<(), DaemonError> {
    let mut stop = ctx.stop_signal();
    loop {
        if *stop.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_transient_accept_error(&err) => {
                        tracing::warn!(error = %err, "accept failed; continuing");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                    Err(err) => return Err(io_err(&ctx.config.socket_path, err)),
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(err) = connection::serve(stream, ctx).await {
                        tracing::debug!(error = %err, "socket client error");
                    }
                });
            }
        }
    }
}

/// Accept errors that concern one connection or a momentary resource
/// shortage, not the listener itself.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    ) || matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

async fn signal_task(ctx: Arc<DaemonContext>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).map_err(|e| DaemonError::Task {
        task: "signal_handler",
        reason: format!("SIGTERM handler failed: {e}"),
    })?;
    let stop = stopped(ctx.stop_signal());

    tokio::select! {
        _ = stop => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            ctx.request_stop();
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("received ctrl-c, shutting down daemon");
                ctx.request_stop();
                Ok(())
            }
            Err(err) => Err(DaemonError::Task {
                task: "signal_handler",
                reason: format!("ctrl-c handler failed: {err}"),
            }),
        },
    }
}

async fn log_rotation_task(
    log_dir: PathBuf,
    stop: watch::Receiver<bool>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(LOG_ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    let stop = stopped(stop);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = interval.tick() => {
                let log_dir = log_dir.clone();
                // Failures are logged inside; rotation never stops the daemon.
                tokio::task::spawn_blocking(move || {
                    rotate_daemon_log(&log_dir, RotationPolicy::default());
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

/// Resolves once the stop flag is set (or its sender is gone).
pub(crate) async fn stopped(mut signal: watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::SocketInUse {
                socket: socket.to_path_buf(),
            });
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn remove_socket(socket: &Path) {
    match fs::remove_file(socket) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(socket = %socket.display(), error = %err, "failed to remove socket"),
    }
}

fn set_socket_permissions(path: &Path, mode: u32) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Task {
            task,
            reason: format!("join failure: {err}"),
        }),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG` wins over the configured level. With a `log_dir`, events go to
/// `<log_dir>/offlogd.log` instead of stderr.
fn init_tracing(config: &DaemonConfig) -> Result<(), DaemonError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);

    let installed = match (&config.log_dir, config.log_format) {
        (Some(dir), format) => {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            let writer = DaemonLogWriter {
                path: daemon_log_path(dir),
            };
            match format {
                LogFormat::Json => builder.json().with_writer(writer).try_init(),
                LogFormat::Text => builder.with_ansi(false).with_writer(writer).try_init(),
            }
        }
        (None, LogFormat::Json) => builder.json().try_init(),
        (None, LogFormat::Text) => builder.try_init(),
    };
    installed.map_err(|e| DaemonError::Logging(e.to_string()))
}

/// Opens the daemon log for every event so rotation can rename it freely.
/// Falls back to stderr if the file cannot be opened.
#[derive(Clone)]
struct DaemonLogWriter {
    path: PathBuf,
}

impl<'a> MakeWriter<'a> for DaemonLogWriter {
    type Writer = Box<dyn io::Write + Send>;

    fn make_writer(&'a self) -> Self::Writer {
        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(io::stderr()),
        }
    }
}
