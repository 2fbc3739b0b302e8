use crate::{
    cli::Command,
    config::AppConfig,
    forward::HttpForwarder,
    ingest::IngestionEngine,
    reader::TrailingLine,
    sink::EventSink,
    storage::{DayCount, FileEditStat, Overview, SessionRollup, Storage, ToolCount},
    watcher,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc, time::Duration};

/// Everything `stats` prints when no session is selected.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub database: PathBuf,
    pub overview: Overview,
    pub tools: Vec<ToolCount>,
    pub timeline: Vec<DayCount>,
    pub files: Vec<FileEditStat>,
    pub sessions: Vec<SessionRollup>,
}

impl StatsReport {
    pub async fn collect(storage: &Storage) -> Result<Self> {
        Ok(Self {
            database: storage.path().to_path_buf(),
            overview: storage.overview().await?,
            tools: storage.tool_histogram(None).await?,
            timeline: storage.timeline().await?,
            files: storage.file_histogram().await?,
            sessions: storage.session_rollups().await?,
        })
    }
}

/// High-level application orchestrator.
pub struct App {
    config: Arc<AppConfig>,
}

impl App {
    pub async fn new(config: AppConfig) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub async fn run(self, command: Command, rebuild: bool) -> Result<()> {
        match command {
            Command::Import { file } => self.import(file, rebuild).await,
            Command::Watch => self.watch(rebuild).await,
            Command::Stats { session } => self.stats(session).await,
        }
    }

    async fn import(&self, file: Option<PathBuf>, rebuild: bool) -> Result<()> {
        let (sink, forwarder) = self.open_sink(rebuild).await?;
        let engine = IngestionEngine::new(sink).await?;

        match file {
            Some(path) => {
                let outcome = engine
                    .import_file(&path)
                    .await
                    .with_context(|| format!("failed to import {}", path.display()))?;
                print_json(&outcome)?;
            }
            None => {
                let summary = engine
                    .import_tree(&self.config.sessions.projects_dir, TrailingLine::Include)
                    .await?;
                print_json(&summary)?;
            }
        }

        report_forwarding(forwarder.as_deref());
        Ok(())
    }

    async fn watch(&self, rebuild: bool) -> Result<()> {
        let (sink, forwarder) = self.open_sink(rebuild).await?;
        let engine = Arc::new(IngestionEngine::new(sink).await?);
        let root = self.config.sessions.projects_dir.clone();

        // Sessions may be mid-write; their unterminated lines are left to the watcher.
        let summary = engine.import_tree(&root, TrailingLine::HoldBack).await?;
        tracing::info!(
            imported = summary.imported,
            skipped = summary.skipped,
            failed = summary.failed,
            "initial import complete"
        );

        let handle = watcher::spawn(self.config.watcher.clone(), root, engine.clone())?;
        tracing::info!("watching session logs; press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;

        let dropped = handle.dropped_notifications();
        handle.shutdown().await?;
        if dropped > 0 {
            tracing::warn!(dropped, "file notifications were dropped while the buffer was full");
        }
        report_forwarding(forwarder.as_deref());
        Ok(())
    }

    async fn stats(&self, session: Option<String>) -> Result<()> {
        let storage = self.open_storage(false).await?;
        match session {
            Some(id) => print_json(&storage.session_detail(&id).await?),
            None => print_json(&StatsReport::collect(&storage).await?),
        }
    }

    async fn open_storage(&self, rebuild: bool) -> Result<Storage> {
        let storage = Storage::connect(&self.config.storage.database_path).await?;
        storage.ensure_schema().await?;
        if rebuild {
            tracing::info!(path = %storage.path().display(), "rebuilding usage database");
            storage.truncate_all().await?;
        }
        Ok(storage)
    }

    /// The local store, or the HTTP forwarder when a forward URL is configured.
    async fn open_sink(
        &self,
        rebuild: bool,
    ) -> Result<(Arc<dyn EventSink>, Option<Arc<HttpForwarder>>)> {
        if let Some(url) = self.config.forward.url.as_deref() {
            if rebuild {
                tracing::warn!("--rebuild has no effect while forwarding events");
            }
            let forwarder = Arc::new(HttpForwarder::new(
                url,
                Duration::from_secs(self.config.forward.timeout_secs),
            )?);
            tracing::info!(endpoint = forwarder.endpoint(), "forwarding events");
            let sink: Arc<dyn EventSink> = forwarder.clone();
            return Ok((sink, Some(forwarder)));
        }

        let storage: Arc<dyn EventSink> = Arc::new(self.open_storage(rebuild).await?);
        Ok((storage, None))
    }
}

fn report_forwarding(forwarder: Option<&HttpForwarder>) {
    if let Some(forwarder) = forwarder {
        tracing::info!(
            delivered = forwarder.delivered(),
            dropped = forwarder.dropped(),
            "forwarding finished"
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}
