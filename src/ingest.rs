use crate::{
    error::IngestError,
    events::{SessionRecord, entry_events},
    parser::parse_line,
    reader::{LineReader, TrailingLine},
    session::{FileProgress, FileTotals, ProcessingCursor, SessionKey, SessionTracker},
    sink::EventSink,
    storage::IngestStateRow,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::Metadata,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

pub const SESSION_FILE_EXTENSION: &str = "jsonl";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Whole file from offset 0 (or a partial checkpoint), skipped when already
    /// represented in the store.
    Import,
    /// Only bytes appended since the last checkpoint.
    Tail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ingested,
    AlreadyProcessed,
    SessionExists,
    Empty,
    UpToDate,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub lines: u64,
    pub messages: u64,
    pub tool_uses: u64,
    pub tool_counts: BTreeMap<String, u64>,
    pub decode_errors: u64,
    pub events: u64,
    pub start_offset: u64,
    pub end_offset: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub session_id: String,
    pub mode: IngestMode,
    pub status: IngestStatus,
    pub stats: FileStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub projects: u64,
    pub sessions: u64,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
    pub messages: u64,
    pub tool_uses: u64,
    pub decode_errors: u64,
}

impl FileProgress {
    fn from_state(state: &IngestStateRow) -> Self {
        let cursor = match state.fully_processed_scan {
            Some(scan) => ProcessingCursor::FullyProcessed {
                scan,
                offset: state.last_offset,
            },
            None if state.last_offset > 0 => ProcessingCursor::Offset(state.last_offset),
            None => ProcessingCursor::Unprocessed,
        };
        Self {
            session_id: state.session_id.clone(),
            cursor,
            totals: FileTotals {
                messages: state.message_count,
                tool_uses: state.tool_use_count,
                decode_errors: state.decode_errors,
            },
        }
    }

    fn to_state(&self, path: &Path) -> IngestStateRow {
        let fully_processed_scan = match self.cursor {
            ProcessingCursor::FullyProcessed { scan, .. } => Some(scan),
            _ => None,
        };
        IngestStateRow {
            path: path.to_path_buf(),
            session_id: self.session_id.clone(),
            last_offset: self.cursor.offset(),
            fully_processed_scan,
            message_count: self.totals.messages,
            tool_use_count: self.totals.tool_uses,
            decode_errors: self.totals.decode_errors,
        }
    }
}

/// Drives session files through the line reader and entry parser and streams the
/// resulting events into a sink.
pub struct IngestionEngine {
    sink: Arc<dyn EventSink>,
    tracker: Mutex<SessionTracker>,
    scan: AtomicU64,
}

impl IngestionEngine {
    pub async fn new(sink: Arc<dyn EventSink>) -> Result<Self> {
        let states = sink.load_cursors().await?;
        let tracker = SessionTracker::with_progress(
            states
                .iter()
                .map(|state| (state.path.clone(), FileProgress::from_state(state))),
        );
        tracing::debug!(files = tracker.len(), "restored ingest checkpoints");
        Ok(Self {
            sink,
            tracker: Mutex::new(tracker),
            scan: AtomicU64::new(0),
        })
    }

    pub fn progress(&self, path: &Path) -> FileProgress {
        self.tracker
            .lock()
            .expect("session tracker lock poisoned")
            .progress(path)
    }

    fn record_progress(&self, path: &Path, progress: FileProgress) {
        self.tracker
            .lock()
            .expect("session tracker lock poisoned")
            .update(path, progress);
    }

    /// Imports a quiescent file; an unterminated last line counts as a record.
    pub async fn import_file(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        self.ingest(path, IngestMode::Import, TrailingLine::Include)
            .await
    }

    pub async fn tail_file(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        self.ingest(path, IngestMode::Tail, TrailingLine::HoldBack)
            .await
    }

    /// Imports every `<root>/<project>/<session>.jsonl`. Per-file failures are logged
    /// and counted; they never stop the scan. Pass `TrailingLine::HoldBack` when
    /// sessions may still be written to, so a half-written last line is left for
    /// the next tail.
    pub async fn import_tree(&self, root: &Path, trailing: TrailingLine) -> Result<ImportSummary> {
        let scan = self.scan.fetch_add(1, Ordering::SeqCst) + 1;
        let mut summary = ImportSummary::default();
        if !root.exists() {
            tracing::warn!(root = %root.display(), "session root not found; nothing to import");
            return Ok(summary);
        }

        let projects = collect_project_files(root)?;
        for (project_dir, files) in projects {
            summary.projects += 1;
            tracing::debug!(project = %project_dir.display(), files = files.len(), "scanning project");
            for path in files {
                summary.sessions += 1;
                match self.ingest(&path, IngestMode::Import, trailing).await {
                    Ok(outcome) if outcome.status == IngestStatus::Ingested => {
                        summary.imported += 1;
                        summary.messages += outcome.stats.messages;
                        summary.tool_uses += outcome.stats.tool_uses;
                        summary.decode_errors += outcome.stats.decode_errors;
                        tracing::info!(
                            session = %outcome.session_id,
                            messages = outcome.stats.messages,
                            tool_uses = outcome.stats.tool_uses,
                            decode_errors = outcome.stats.decode_errors,
                            tools = ?outcome.stats.tool_counts,
                            "imported session"
                        );
                    }
                    Ok(outcome) => {
                        summary.skipped += 1;
                        tracing::debug!(session = %outcome.session_id, status = ?outcome.status, "skipped session");
                    }
                    Err(err) => {
                        summary.failed += 1;
                        tracing::warn!(error = %err, path = %path.display(), "failed to import session file");
                    }
                }
            }
        }

        tracing::info!(scan, ?summary, "import scan finished");
        Ok(summary)
    }

    async fn ingest(
        &self,
        path: &Path,
        mode: IngestMode,
        trailing: TrailingLine,
    ) -> Result<IngestOutcome, IngestError> {
        let key = SessionKey::from_path(path).ok_or_else(|| {
            IngestError::file_access(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no session file name"),
            )
        })?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| IngestError::file_access(path, err))?;
        let len = metadata.len();
        let mut progress = self.progress(path);
        let scan = self.scan.load(Ordering::SeqCst);

        let outcome = |status, stats| IngestOutcome {
            session_id: key.session_id.clone(),
            mode,
            status,
            stats,
        };

        if len == 0 {
            return Ok(outcome(IngestStatus::Empty, FileStats::default()));
        }

        let start = match (mode, progress.cursor) {
            (IngestMode::Import, ProcessingCursor::FullyProcessed { .. }) => {
                return Ok(outcome(IngestStatus::AlreadyProcessed, FileStats::default()));
            }
            (IngestMode::Import, ProcessingCursor::Offset(offset)) if offset > 0 && offset <= len => {
                tracing::debug!(path = %path.display(), offset, "resuming partially ingested file");
                offset
            }
            (IngestMode::Import, _) => {
                let exists = self
                    .sink
                    .has_session(&key.session_id)
                    .await
                    .map_err(IngestError::Store)?;
                if exists && progress.cursor == ProcessingCursor::Unprocessed {
                    progress.session_id = Some(key.session_id.clone());
                    progress.cursor = ProcessingCursor::FullyProcessed { scan, offset: len };
                    self.checkpoint(path, progress).await?;
                    return Ok(outcome(IngestStatus::SessionExists, FileStats::default()));
                }
                progress.totals = FileTotals::default();
                0
            }
            (IngestMode::Tail, cursor) => {
                let offset = cursor.offset();
                if len < offset {
                    tracing::info!(path = %path.display(), len, offset, "session file shrank; re-reading from start");
                    progress.totals = FileTotals::default();
                    0
                } else if len == offset {
                    return Ok(outcome(IngestStatus::UpToDate, FileStats::default()));
                } else {
                    offset
                }
            }
        };

        let mut reader = LineReader::open(path, start, trailing)
            .await
            .map_err(|err| IngestError::file_access(path, err))?;

        let mut stats = FileStats {
            start_offset: start,
            end_offset: start,
            ..FileStats::default()
        };
        let drained = self.drain(path, &mut reader, &key, &mut stats).await;

        progress.session_id = Some(key.session_id.clone());
        progress.totals.messages += stats.messages;
        progress.totals.tool_uses += stats.tool_uses;
        progress.totals.decode_errors += stats.decode_errors;
        progress.cursor = match (mode, &drained, progress.cursor) {
            (IngestMode::Import, Ok(()), _) => ProcessingCursor::FullyProcessed {
                scan,
                offset: stats.end_offset,
            },
            (IngestMode::Tail, Ok(()), ProcessingCursor::FullyProcessed { scan, .. }) if start > 0 => {
                ProcessingCursor::FullyProcessed {
                    scan,
                    offset: stats.end_offset,
                }
            }
            _ => ProcessingCursor::Offset(stats.end_offset),
        };

        if let Err(err) = drained {
            self.record_progress(path, progress.clone());
            if let Err(save_err) = self.sink.save_cursor(&progress.to_state(path)).await {
                tracing::warn!(error = %save_err, path = %path.display(), "failed to checkpoint after aborted ingest");
            }
            return Err(err);
        }

        // The file may have grown while it was drained.
        let metadata = tokio::fs::metadata(path).await.unwrap_or(metadata);
        let record = session_record(&key, &metadata, progress.totals);
        self.sink
            .upsert_session(&record)
            .await
            .map_err(IngestError::Store)?;
        self.checkpoint(path, progress).await?;

        Ok(outcome(IngestStatus::Ingested, stats))
    }

    /// Parses lines until EOF, appending each event as soon as it is derived.
    /// `stats.end_offset` only advances past lines whose events were all stored.
    async fn drain(
        &self,
        path: &Path,
        reader: &mut LineReader,
        key: &SessionKey,
        stats: &mut FileStats,
    ) -> Result<(), IngestError> {
        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => return Err(IngestError::file_access(path, err)),
            };
            stats.lines += 1;

            match parse_line(&line.text) {
                Ok(entry) => {
                    for event in entry_events(&entry, &key.session_id, Utc::now()) {
                        self.sink
                            .append(&event)
                            .await
                            .map_err(IngestError::Store)?;
                        stats.events += 1;
                    }
                    // Counted once stored, so a re-delivered line is not counted twice.
                    if entry.is_message() {
                        stats.messages += 1;
                    }
                    for tool in &entry.tool_invocations {
                        stats.tool_uses += 1;
                        *stats.tool_counts.entry(tool.name.clone()).or_default() += 1;
                    }
                }
                Err(err) => {
                    stats.decode_errors += 1;
                    tracing::debug!(error = %err, path = %path.display(), offset = line.end_offset, "skipping undecodable line");
                }
            }
            stats.end_offset = line.end_offset;
        }
        stats.end_offset = reader.offset();
        Ok(())
    }

    async fn checkpoint(&self, path: &Path, progress: FileProgress) -> Result<(), IngestError> {
        let state = progress.to_state(path);
        self.record_progress(path, progress);
        self.sink
            .save_cursor(&state)
            .await
            .map_err(IngestError::Store)
    }
}

fn session_record(key: &SessionKey, metadata: &Metadata, totals: FileTotals) -> SessionRecord {
    SessionRecord {
        session_id: key.session_id.clone(),
        project: Some(key.project.clone()),
        file_size: Some(metadata.len()),
        created: metadata.created().ok().map(DateTime::<Utc>::from),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        message_count: Some(totals.messages),
        tool_use_count: Some(totals.tool_uses),
        decode_errors: Some(totals.decode_errors),
    }
}

pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

pub fn is_session_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(SESSION_FILE_EXTENSION)
}

/// Session files directly inside each visible project directory, sorted by path.
fn collect_project_files(root: &Path) -> Result<Vec<(PathBuf, Vec<PathBuf>)>> {
    let mut projects = Vec::new();
    let entries = match root.read_dir() {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(error = %err, root = %root.display(), "failed to read session root");
            return Ok(projects);
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read directory entry");
                continue;
            }
        };
        let project_dir = entry.path();
        let hidden = entry.file_name().to_str().is_none_or(is_hidden);
        if hidden || !project_dir.is_dir() {
            continue;
        }

        let files = match project_dir.read_dir() {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(error = %err, path = %project_dir.display(), "failed to read project directory");
                continue;
            }
        };
        let mut sessions: Vec<PathBuf> = files
            .filter_map(|file| file.ok())
            .map(|file| file.path())
            .filter(|path| path.is_file() && is_session_file(path))
            .collect();
        sessions.sort();
        projects.push((project_dir, sessions));
    }

    projects.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::UsageEvent, sink::testing::MemorySink, storage::Storage};
    use std::{fs, io::Write};
    use tempfile::{NamedTempFile, TempDir};

    const USER: &str = r#"{"type":"user","timestamp":"2025-06-01T10:00:00Z","message":{"content":"fix the bug"}}"#;
    const ASSISTANT: &str = r#"{"type":"assistant","timestamp":"2025-06-01T10:00:05Z","message":{"usage":{"input_tokens":10,"output_tokens":5},"content":[{"type":"tool_use","name":"Edit","input":{"file_path":"src/main.rs"}},{"type":"tool_use","name":"Read","input":{"file_path":"Cargo.toml"}}]}}"#;
    const SUMMARY: &str = r#"{"type":"summary","summary":"Bug fix"}"#;

    fn session_file(dir: &TempDir, project: &str, id: &str, lines: &[&str]) -> PathBuf {
        let project_dir = dir.path().join(project);
        fs::create_dir_all(&project_dir).unwrap();
        let path = project_dir.join(format!("{id}.jsonl"));
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body).unwrap();
        path
    }

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn storage_engine() -> (NamedTempFile, Storage, IngestionEngine) {
        let db_file = NamedTempFile::new().unwrap();
        let storage = Storage::connect(db_file.path()).await.unwrap();
        storage.ensure_schema().await.unwrap();
        let engine = IngestionEngine::new(Arc::new(storage.clone())).await.unwrap();
        (db_file, storage, engine)
    }

    #[tokio::test]
    async fn malformed_lines_are_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::default());
        let engine = IngestionEngine::new(sink.clone()).await.unwrap();
        let path = session_file(
            &dir,
            "-work-app",
            "s1",
            &["{broken", USER, "not json at all", ASSISTANT, "", SUMMARY, "[1]"],
        );

        let outcome = engine.import_file(&path).await.unwrap();
        assert_eq!(outcome.status, IngestStatus::Ingested);
        assert_eq!(outcome.stats.decode_errors, 3);
        assert_eq!(outcome.stats.lines, 6);
        assert_eq!(outcome.stats.messages, 2);
        assert_eq!(outcome.stats.tool_uses, 2);
        assert_eq!(outcome.stats.tool_counts.get("Edit"), Some(&1));
        // user message; assistant message, tokens, Edit + its file edit, Read
        assert_eq!(outcome.stats.events, 6);
        assert_eq!(sink.events().len(), 6);
        assert_eq!(outcome.stats.end_offset, fs::metadata(&path).unwrap().len());

        let sessions = sink.sessions.lock().unwrap().clone();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].project.as_deref(), Some("/work/app"));
        assert_eq!(sessions[0].decode_errors, Some(3));
        assert_eq!(sessions[0].message_count, Some(2));
    }

    #[tokio::test]
    async fn reimport_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let (_db, storage, engine) = storage_engine().await;
        let path = session_file(&dir, "p", "s1", &[USER, ASSISTANT]);

        engine.import_file(&path).await.unwrap();
        let before = storage.collection_counts().await.unwrap();

        let again = engine.import_file(&path).await.unwrap();
        assert_eq!(again.status, IngestStatus::AlreadyProcessed);
        assert_eq!(again.stats.events, 0);

        // A fresh engine restores the checkpoint from the store.
        let restarted = IngestionEngine::new(Arc::new(storage.clone())).await.unwrap();
        let third = restarted.import_file(&path).await.unwrap();
        assert_eq!(third.status, IngestStatus::AlreadyProcessed);
        assert_eq!(storage.collection_counts().await.unwrap(), before);
        assert_eq!(before.messages, 2);
        assert_eq!(before.file_edits, 1);
    }

    #[tokio::test]
    async fn import_skips_sessions_already_in_store() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::default());
        sink.sessions.lock().unwrap().push(SessionRecord {
            session_id: "s1".to_string(),
            ..SessionRecord::default()
        });
        let engine = IngestionEngine::new(sink.clone()).await.unwrap();
        let path = session_file(&dir, "p", "s1", &[USER]);

        let outcome = engine.import_file(&path).await.unwrap();
        assert_eq!(outcome.status, IngestStatus::SessionExists);
        assert!(sink.events().is_empty());

        // Tailing resumes from the end of what was already there.
        append(&path, &format!("{USER}\n"));
        let tailed = engine.tail_file(&path).await.unwrap();
        assert_eq!(tailed.stats.messages, 1);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn tail_reads_only_appended_complete_lines() {
        let dir = TempDir::new().unwrap();
        let (_db, storage, engine) = storage_engine().await;
        let path = session_file(&dir, "p", "s1", &[USER]);
        engine.import_file(&path).await.unwrap();

        append(&path, &format!("{ASSISTANT}\n{{\"type\":\"user\",\"mess"));
        let first = engine.tail_file(&path).await.unwrap();
        assert_eq!(first.mode, IngestMode::Tail);
        assert_eq!(first.stats.messages, 1);
        assert_eq!(first.stats.decode_errors, 0);

        append(&path, "age\":{\"content\":\"more\"}}\n");
        let second = engine.tail_file(&path).await.unwrap();
        assert_eq!(second.stats.messages, 1);
        assert_eq!(second.stats.decode_errors, 0);

        let unchanged = engine.tail_file(&path).await.unwrap();
        assert_eq!(unchanged.status, IngestStatus::UpToDate);

        let counts = storage.collection_counts().await.unwrap();
        assert_eq!(counts.messages, 3);
        assert_eq!(counts.tool_usage, 2);
        assert_eq!(counts.token_usage, 1);

        let session = storage.session("s1").await.unwrap().unwrap();
        assert_eq!(session.message_count, Some(3));
        assert_eq!(session.file_size, Some(fs::metadata(&path).unwrap().len()));
    }

    #[tokio::test]
    async fn tail_without_prior_import_starts_at_zero_and_restarts_after_truncation() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::default());
        let engine = IngestionEngine::new(sink.clone()).await.unwrap();
        let path = session_file(&dir, "p", "fresh", &[USER, USER]);

        let first = engine.tail_file(&path).await.unwrap();
        assert_eq!(first.stats.start_offset, 0);
        assert_eq!(first.stats.messages, 2);

        fs::write(&path, format!("{USER}\n")).unwrap();
        let second = engine.tail_file(&path).await.unwrap();
        assert_eq!(second.stats.start_offset, 0);
        assert_eq!(second.stats.messages, 1);
        assert_eq!(engine.progress(&path).totals.messages, 1);
    }

    #[tokio::test]
    async fn store_failure_aborts_file_and_checkpoints_last_complete_line() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::failing_after(1));
        let engine = IngestionEngine::new(sink.clone()).await.unwrap();
        let path = session_file(&dir, "p", "s1", &[USER, ASSISTANT]);

        let err = engine.import_file(&path).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));
        assert_eq!(sink.events().len(), 1);

        let progress = engine.progress(&path);
        assert_eq!(progress.cursor, ProcessingCursor::Offset(USER.len() as u64 + 1));
        assert_eq!(progress.totals.messages, 1);
        assert!(sink.sessions.lock().unwrap().is_empty());
        assert_eq!(sink.cursors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_file_is_a_file_access_error() {
        let dir = TempDir::new().unwrap();
        let engine = IngestionEngine::new(Arc::new(MemorySink::default()))
            .await
            .unwrap();
        let err = engine
            .import_file(&dir.path().join("p").join("missing.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::FileAccess { .. }));
    }

    #[tokio::test]
    async fn import_tree_walks_visible_projects() {
        let dir = TempDir::new().unwrap();
        let (_db, storage, engine) = storage_engine().await;
        session_file(&dir, "-home-a", "s1", &[USER, ASSISTANT]);
        session_file(&dir, "-home-b", "s2", &[USER, "{oops"]);
        session_file(&dir, ".hidden", "s3", &[USER]);
        fs::write(dir.path().join("-home-b").join("empty.jsonl"), "").unwrap();
        fs::write(dir.path().join("-home-b").join("notes.txt"), USER).unwrap();
        fs::write(dir.path().join("stray.jsonl"), USER).unwrap();

        let summary = engine.import_tree(dir.path(), TrailingLine::Include).await.unwrap();
        assert_eq!(summary.projects, 2);
        assert_eq!(summary.sessions, 3);
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.decode_errors, 1);
        assert!(!storage.has_session("s3").await.unwrap());

        let rerun = engine.import_tree(dir.path(), TrailingLine::Include).await.unwrap();
        assert_eq!(rerun.imported, 0);
        assert_eq!(rerun.skipped, 3);
        assert_eq!(storage.collection_counts().await.unwrap().messages, 3);
    }

    #[tokio::test]
    async fn events_keep_file_order() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::default());
        let engine = IngestionEngine::new(sink.clone()).await.unwrap();
        let path = session_file(&dir, "p", "s1", &[ASSISTANT, USER]);
        engine.import_file(&path).await.unwrap();

        let events = sink.events();
        assert!(matches!(events.first(), Some(UsageEvent::Message(m)) if m.role == "assistant"));
        assert!(matches!(events.last(), Some(UsageEvent::Message(m)) if m.role == "user"));
    }

    #[tokio::test]
    async fn import_after_restart_resumes_from_tail_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (_db, storage, engine) = storage_engine().await;
        let path = session_file(&dir, "p", "s1", &[USER]);
        let tailed = engine.tail_file(&path).await.unwrap();
        assert_eq!(tailed.status, IngestStatus::Ingested);
        append(&path, &format!("{USER}\n"));

        let restarted = IngestionEngine::new(Arc::new(storage.clone())).await.unwrap();
        let imported = restarted.import_file(&path).await.unwrap();
        assert_eq!(imported.status, IngestStatus::Ingested);
        assert_eq!(imported.stats.start_offset, USER.len() as u64 + 1);
        assert_eq!(imported.stats.messages, 1);
        assert_eq!(storage.collection_counts().await.unwrap().messages, 2);

        let again = restarted.tail_file(&path).await.unwrap();
        assert_eq!(again.status, IngestStatus::UpToDate);
    }

    #[tokio::test]
    async fn import_after_store_failure_does_not_duplicate_stored_lines() {
        let dir = TempDir::new().unwrap();
        let failing = Arc::new(MemorySink::failing_after(1));
        let engine = IngestionEngine::new(failing.clone()).await.unwrap();
        let path = session_file(&dir, "p", "s1", &[USER, ASSISTANT]);
        assert!(matches!(
            engine.import_file(&path).await,
            Err(IngestError::Store(_))
        ));

        let healthy = Arc::new(MemorySink::default());
        *healthy.events.lock().unwrap() = failing.events();
        *healthy.cursors.lock().unwrap() = failing.cursors.lock().unwrap().clone();
        let engine = IngestionEngine::new(healthy.clone()).await.unwrap();
        let outcome = engine.import_file(&path).await.unwrap();
        assert_eq!(outcome.status, IngestStatus::Ingested);
        assert_eq!(outcome.stats.start_offset, USER.len() as u64 + 1);

        let events = healthy.events();
        let users = events
            .iter()
            .filter(|e| matches!(e, UsageEvent::Message(m) if m.role == "user"))
            .count();
        let assistants = events
            .iter()
            .filter(|e| matches!(e, UsageEvent::Message(m) if m.role == "assistant"))
            .count();
        assert_eq!((users, assistants), (1, 1));

        let sessions = healthy.sessions.lock().unwrap().clone();
        assert_eq!(sessions.last().and_then(|s| s.message_count), Some(2));
    }

    #[tokio::test]
    async fn held_back_import_leaves_half_written_line_for_tail() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::default());
        let engine = IngestionEngine::new(sink.clone()).await.unwrap();
        let path = session_file(&dir, "p", "s1", &[USER]);
        let (head, rest) = ASSISTANT.split_at(40);
        append(&path, head);

        let summary = engine
            .import_tree(dir.path(), TrailingLine::HoldBack)
            .await
            .unwrap();
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.messages, 1);
        assert_eq!(summary.decode_errors, 0);

        append(&path, &format!("{rest}\n"));
        let tailed = engine.tail_file(&path).await.unwrap();
        assert_eq!(tailed.stats.messages, 1);
        assert_eq!(tailed.stats.decode_errors, 0);
        assert_eq!(tailed.stats.end_offset, fs::metadata(&path).unwrap().len());
        assert_eq!(engine.progress(&path).totals.decode_errors, 0);
    }

    /// Appends a line to the session file the first time an event is stored.
    struct GrowingSink {
        inner: MemorySink,
        path: PathBuf,
        grown: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl EventSink for GrowingSink {
        async fn append(&self, event: &UsageEvent) -> Result<()> {
            if !self.grown.swap(true, Ordering::SeqCst) {
                append(&self.path, &format!("{USER}\n"));
            }
            self.inner.append(event).await
        }

        async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
            self.inner.upsert_session(record).await
        }

        async fn has_session(&self, session_id: &str) -> Result<bool> {
            self.inner.has_session(session_id).await
        }

        async fn load_cursors(&self) -> Result<Vec<IngestStateRow>> {
            self.inner.load_cursors().await
        }

        async fn save_cursor(&self, state: &IngestStateRow) -> Result<()> {
            self.inner.save_cursor(state).await
        }
    }

    #[tokio::test]
    async fn session_size_reflects_file_after_drain() {
        let dir = TempDir::new().unwrap();
        let path = session_file(&dir, "p", "s1", &[USER, ASSISTANT]);
        let sink = Arc::new(GrowingSink {
            inner: MemorySink::default(),
            path: path.clone(),
            grown: Default::default(),
        });
        let engine = IngestionEngine::new(sink.clone()).await.unwrap();

        let outcome = engine.import_file(&path).await.unwrap();
        let final_len = fs::metadata(&path).unwrap().len();
        let sessions = sink.inner.sessions.lock().unwrap().clone();
        let file_size = sessions.last().and_then(|s| s.file_size).unwrap();
        assert_eq!(file_size, final_len);
        assert!(file_size >= outcome.stats.end_offset);
    }
}
