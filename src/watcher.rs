use crate::{
    config::WatcherConfig,
    ingest::{IngestStatus, IngestionEngine, is_hidden, is_session_file},
};
use anyhow::{Context, Result, anyhow};
use notify::{Event, RecursiveMode, Watcher};
use std::{
    collections::HashMap,
    future::Future,
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

/// Whether a notification for `path` should reach the ingestion engine: a session
/// file at most `max_depth` directories below `root` with no hidden component.
pub fn is_watched_path(root: &Path, path: &Path, max_depth: usize) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    if !is_session_file(path) {
        return false;
    }
    let mut depth = 0usize;
    for component in relative.components() {
        let Component::Normal(name) = component else {
            return false;
        };
        if name.to_str().is_none_or(is_hidden) {
            return false;
        }
        depth += 1;
    }
    depth > 0 && depth - 1 <= max_depth
}

#[derive(Debug)]
struct Pending {
    size: Option<u64>,
    changed_at: Instant,
}

/// Holds changed files back until their size has stopped moving for the
/// stabilization window.
#[derive(Debug)]
pub struct Debouncer {
    stabilization: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub fn new(stabilization: Duration) -> Self {
        Self {
            stabilization,
            pending: HashMap::new(),
        }
    }

    /// Records a change notification; restarts the window for that path.
    pub fn touch(&mut self, path: PathBuf, size: Option<u64>, now: Instant) {
        self.pending.insert(path, Pending {
            size,
            changed_at: now,
        });
    }

    /// Returns the paths that have been stable for the full window. Paths whose
    /// size can no longer be read are forgotten.
    pub fn poll(
        &mut self,
        now: Instant,
        mut size_of: impl FnMut(&Path) -> Option<u64>,
    ) -> Vec<PathBuf> {
        let stabilization = self.stabilization;
        let mut ready = Vec::new();
        self.pending.retain(|path, pending| {
            let Some(size) = size_of(path) else {
                return false;
            };
            if pending.size != Some(size) {
                pending.size = Some(size);
                pending.changed_at = now;
                return true;
            }
            if now.duration_since(pending.changed_at) >= stabilization {
                ready.push(path.clone());
                return false;
            }
            true
        });
        ready.sort();
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Paths with an ingestion task still running or cooling down, mapped to that task.
pub struct InFlight {
    tasks: HashMap<PathBuf, JoinHandle<()>>,
    cooldown: Duration,
    cancel: watch::Sender<bool>,
}

impl InFlight {
    pub fn new(cooldown: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            tasks: HashMap::new(),
            cooldown,
            cancel,
        }
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.tasks
            .get(path)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Starts `work` for `path` unless a task for that path is still active.
    /// The path stays claimed for the cooldown after `work` completes.
    pub fn spawn_if_idle<F>(&mut self, path: PathBuf, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_active(&path) {
            return false;
        }
        let cooldown = self.cooldown;
        let mut cancel = self.cancel.subscribe();
        let handle = tokio::spawn(async move {
            work.await;
            if cooldown.is_zero() || *cancel.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(cooldown) => {}
                _ = cancel.changed() => {}
            }
        });
        self.tasks.insert(path, handle);
        true
    }

    /// Forgets tasks that have finished their cooldown.
    pub fn reap(&mut self) {
        self.tasks.retain(|_, handle| !handle.is_finished());
    }

    /// Cuts every cooldown short and waits for running ingestions to finish.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        for (path, handle) in self.tasks {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, path = %path.display(), "ingestion task failed");
            }
        }
    }
}

pub struct WatchHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
    dropped: Arc<AtomicU64>,
}

impl WatchHandle {
    /// Notifications discarded because the event buffer was full.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

/// Watches `root` and tails every session file that changes beneath it.
pub fn spawn(
    config: WatcherConfig,
    root: PathBuf,
    engine: Arc<IngestionEngine>,
) -> Result<WatchHandle> {
    std::fs::create_dir_all(&root)
        .with_context(|| format!("failed to create watch root {}", root.display()))?;
    // Notifications carry resolved paths on some platforms.
    let root = root.canonicalize().unwrap_or(root);

    let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_in_callback = dropped.clone();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if event.kind.is_create() || event.kind.is_modify() => {
            for path in event.paths {
                if tx.try_send(path).is_err() {
                    dropped_in_callback.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "file watcher error"),
    })
    .with_context(|| "failed to create file watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let watch_root = root.clone();
    let join = tokio::spawn(async move {
        // The watcher stops delivering once dropped.
        let _watcher = watcher;
        run(config, watch_root, engine, rx, shutdown_rx).await
    });

    tracing::info!(root = %root.display(), "watching for session changes");

    Ok(WatchHandle {
        shutdown: Some(shutdown_tx),
        join,
        dropped,
    })
}

async fn run(
    config: WatcherConfig,
    root: PathBuf,
    engine: Arc<IngestionEngine>,
    mut rx: mpsc::Receiver<PathBuf>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let mut debouncer = Debouncer::new(config.stabilization());
    let mut in_flight = InFlight::new(config.cooldown());
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            received = rx.recv() => {
                let Some(path) = received else { break };
                if is_watched_path(&root, &path, config.max_depth) {
                    let size = file_size(&path);
                    debouncer.touch(path, size, Instant::now());
                }
            }
            _ = ticker.tick() => {
                in_flight.reap();
                let now = Instant::now();
                for path in debouncer.poll(now, file_size) {
                    let engine = engine.clone();
                    let target = path.clone();
                    let started = in_flight.spawn_if_idle(path.clone(), async move {
                        tail(&engine, &target).await;
                    });
                    if !started {
                        tracing::debug!(path = %path.display(), "ingestion already in flight; deferring");
                        let size = file_size(&path);
                        debouncer.touch(path, size, now);
                    }
                }
            }
        }
    }

    tracing::info!(
        pending = debouncer.len(),
        active = in_flight.active_count(),
        "stopping session watcher"
    );
    in_flight.shutdown().await;
    Ok(())
}

async fn tail(engine: &IngestionEngine, path: &Path) {
    match engine.tail_file(path).await {
        Ok(outcome) if outcome.status == IngestStatus::Ingested => {
            tracing::info!(
                session = %outcome.session_id,
                messages = outcome.stats.messages,
                tool_uses = outcome.stats.tool_uses,
                decode_errors = outcome.stats.decode_errors,
                "ingested appended entries"
            );
        }
        Ok(outcome) => {
            tracing::debug!(session = %outcome.session_id, status = ?outcome.status, "nothing new to ingest");
        }
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "failed to ingest session file");
        }
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|meta| meta.len())
}
