//! File Target Registry: one Append Worker per underlying file.
//!
//! The map is keyed by `(dev, ino)`, never by path string, so two spellings
//! of one file share a worker and a path reused after a rename does not. The
//! map lock covers lookup and insert only; `stat` and `open` run on the
//! blocking pool before it is taken.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::backpressure::ByteBudget;
use crate::config::DaemonConfig;
use crate::target::{open_target, stat_key, TargetKey};
use crate::worker::{Admission, PendingAppend, WorkerHandle, WorkerMap, WorkerSettings, WorkerSnapshot};

const DRAIN_POLL: Duration = Duration::from_millis(10);

pub struct Registry {
    workers: WorkerMap,
    settings: WorkerSettings,
    budget: ByteBudget,
    stopping: watch::Sender<bool>,
}

impl Registry {
    pub fn new(config: &DaemonConfig) -> Self {
        Self::with_settings(
            WorkerSettings::from_config(config),
            ByteBudget::new(config.max_total_bytes),
        )
    }

    pub fn with_settings(settings: WorkerSettings, budget: ByteBudget) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            settings,
            budget,
            stopping,
        }
    }

    /// Route `request` to the worker for `path`, creating it if needed.
    ///
    /// `known` is a cached key (from `OPEN_TARGET`); it skips the `stat` as
    /// long as its worker is still alive. Once that worker is retired the
    /// path is resolved again.
    pub async fn submit(
        &self,
        path: &Path,
        known: Option<TargetKey>,
        mut request: PendingAppend,
    ) -> io::Result<Admission> {
        let mut known = known;
        loop {
            let worker = match known.take().and_then(|key| self.lookup(key)) {
                Some(worker) => worker,
                None => self.resolve(path).await?,
            };
            match worker.try_enqueue(request) {
                Admission::Retired(returned) => {
                    debug!(path = %path.display(), "worker retired during submit; resolving again");
                    request = returned;
                }
                admission => return Ok(admission),
            }
        }
    }

    /// Open (or reuse) the target at `path` and return its key. Opening for
    /// append doubles as the access check for `OPEN_TARGET`.
    pub async fn open(&self, path: &Path) -> io::Result<TargetKey> {
        self.resolve(path).await.map(|worker| worker.key())
    }

    pub fn lookup(&self, key: TargetKey) -> Option<WorkerHandle> {
        self.workers.lock().get(&key).cloned()
    }

    async fn resolve(&self, path: &Path) -> io::Result<WorkerHandle> {
        if self.is_stopping() {
            return Err(io::Error::other("daemon is shutting down"));
        }

        let candidate = path.to_path_buf();
        if let Ok(key) = blocking(move || stat_key(&candidate)).await {
            if let Some(worker) = self.lookup(key) {
                return Ok(worker);
            }
        }

        let opening = path.to_path_buf();
        let (file, key) = blocking(move || open_target(&opening)).await?;

        let mut workers = self.workers.lock();
        if let Some(existing) = workers.get(&key) {
            let existing = existing.clone();
            drop(workers);
            drop(file);
            return Ok(existing);
        }
        let worker = WorkerHandle::spawn(
            key,
            path.to_path_buf(),
            Box::new(file),
            self.settings.clone(),
            self.budget.clone(),
            Arc::clone(&self.workers),
            self.stopping.subscribe(),
        );
        workers.insert(key, worker.clone());
        drop(workers);

        info!(path = %path.display(), key = %key, "target opened");
        Ok(worker)
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn budget(&self) -> &ByteBudget {
        &self.budget
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Snapshots of every live worker, ordered by path.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers: Vec<WorkerHandle> = self.workers.lock().values().cloned().collect();
        let mut snapshots: Vec<WorkerSnapshot> = workers.iter().map(WorkerHandle::snapshot).collect();
        snapshots.sort_by(|a, b| a.path.cmp(&b.path));
        snapshots
    }

    /// Tell every worker to drain and retire, then wait for them for at most
    /// `grace`. Returns `true` if all of them finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stopping.send_replace(true);
        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.len();
            if remaining == 0 {
                info!("all targets drained");
                return true;
            }
            if Instant::now() >= deadline {
                let paths: Vec<PathBuf> = self
                    .workers
                    .lock()
                    .values()
                    .map(|worker| worker.path().to_path_buf())
                    .collect();
                warn!(remaining, ?paths, "shutdown grace elapsed with targets still draining");
                return false;
            }
            sleep(DRAIN_POLL).await;
        }
    }
}

async fn blocking<T, F>(op: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(io::Error::other)?
}
