use crate::{
    events::{
        FileEditEvent, MessageEvent, SessionRecord, TokenUsageEvent, ToolUsageEvent, UsageEvent,
        format_timestamp,
    },
    parser::FileOperation,
    sink::EventSink,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Number of date buckets returned by [`Storage::timeline`].
pub const TIMELINE_DAYS: usize = 30;
/// Number of files returned by [`Storage::file_histogram`].
pub const TOP_FILES: usize = 20;
/// Number of tools included in [`Storage::overview`].
pub const OVERVIEW_TOP_TOOLS: usize = 5;

const SCHEMA: &[(&str, &str)] = &[
    (
        "sessions",
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            project TEXT,
            file_size INTEGER,
            created TEXT,
            modified TEXT,
            message_count INTEGER,
            tool_use_count INTEGER,
            decode_errors INTEGER,
            updated_at TEXT NOT NULL
        );
        "#,
    ),
    (
        "messages",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content_length INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );
        "#,
    ),
    (
        "tool_usage",
        r#"
        CREATE TABLE IF NOT EXISTS tool_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            success INTEGER NOT NULL DEFAULT 1,
            timestamp TEXT NOT NULL
        );
        "#,
    ),
    (
        "file_edits",
        r#"
        CREATE TABLE IF NOT EXISTS file_edits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            operation TEXT NOT NULL,
            lines_changed INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );
        "#,
    ),
    (
        "token_usage",
        r#"
        CREATE TABLE IF NOT EXISTS token_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_input_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_input_tokens INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );
        "#,
    ),
    (
        "ingest_state",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_state (
            path TEXT PRIMARY KEY,
            session_id TEXT,
            last_offset INTEGER NOT NULL DEFAULT 0,
            fully_processed_scan INTEGER,
            message_count INTEGER NOT NULL DEFAULT 0,
            tool_use_count INTEGER NOT NULL DEFAULT 0,
            decode_errors INTEGER NOT NULL DEFAULT 0
        );
        "#,
    ),
    (
        "messages session index",
        "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp);",
    ),
    (
        "tool_usage session index",
        "CREATE INDEX IF NOT EXISTS idx_tool_usage_session ON tool_usage(session_id);",
    ),
    (
        "tool_usage timestamp index",
        "CREATE INDEX IF NOT EXISTS idx_tool_usage_timestamp ON tool_usage(timestamp);",
    ),
    (
        "file_edits session index",
        "CREATE INDEX IF NOT EXISTS idx_file_edits_session ON file_edits(session_id);",
    ),
];

const EVENT_TABLES: &[&str] = &["messages", "tool_usage", "file_edits", "token_usage"];

#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
    path: PathBuf,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path_buf)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open usage database {}", path_buf.display()))?;

        Ok(Self {
            pool: Arc::new(pool),
            path: path_buf,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for (name, ddl) in SCHEMA {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .with_context(|| format!("failed to ensure {name} schema"))?;
        }
        Ok(())
    }

    /// Empties every collection and the ingest checkpoints.
    pub async fn truncate_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in EVENT_TABLES.iter().chain(&["sessions", "ingest_state"]) {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to truncate {table}"))?;
        }
        tx.commit().await.with_context(|| "failed to commit truncate")?;
        Ok(())
    }

    pub async fn append_message(&self, event: &MessageEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (session_id, role, content_length, timestamp)
            VALUES (?, ?, ?, ?);
            "#,
        )
        .bind(&event.session_id)
        .bind(&event.role)
        .bind(to_i64(event.content_length))
        .bind(format_timestamp(event.timestamp))
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to insert message")?;
        Ok(())
    }

    pub async fn append_tool_usage(&self, event: &ToolUsageEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tool_usage (session_id, tool_name, description, success, timestamp)
            VALUES (?, ?, ?, ?, ?);
            "#,
        )
        .bind(&event.session_id)
        .bind(&event.tool_name)
        .bind(&event.description)
        .bind(event.success)
        .bind(format_timestamp(event.timestamp))
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to insert tool usage")?;
        Ok(())
    }

    pub async fn append_file_edit(&self, event: &FileEditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_edits (session_id, file_path, operation, lines_changed, timestamp)
            VALUES (?, ?, ?, ?, ?);
            "#,
        )
        .bind(&event.session_id)
        .bind(&event.file_path)
        .bind(event.operation.as_str())
        .bind(to_i64(event.lines_changed))
        .bind(format_timestamp(event.timestamp))
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to insert file edit")?;
        Ok(())
    }

    pub async fn append_token_usage(&self, event: &TokenUsageEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_usage (
                session_id, input_tokens, output_tokens, cache_creation_input_tokens, cache_read_input_tokens, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&event.session_id)
        .bind(to_i64(event.usage.input_tokens))
        .bind(to_i64(event.usage.output_tokens))
        .bind(to_i64(event.usage.cache_creation_input_tokens))
        .bind(to_i64(event.usage.cache_read_input_tokens))
        .bind(format_timestamp(event.timestamp))
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to insert token usage")?;
        Ok(())
    }

    /// Inserts the session or merges the record's present fields over the stored row.
    pub async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, project, file_size, created, modified, message_count, tool_use_count, decode_errors, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                project = COALESCE(excluded.project, sessions.project),
                file_size = COALESCE(excluded.file_size, sessions.file_size),
                created = COALESCE(excluded.created, sessions.created),
                modified = COALESCE(excluded.modified, sessions.modified),
                message_count = COALESCE(excluded.message_count, sessions.message_count),
                tool_use_count = COALESCE(excluded.tool_use_count, sessions.tool_use_count),
                decode_errors = COALESCE(excluded.decode_errors, sessions.decode_errors),
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(&record.session_id)
        .bind(record.project.as_deref())
        .bind(record.file_size.map(to_i64))
        .bind(record.created.map(format_timestamp))
        .bind(record.modified.map(format_timestamp))
        .bind(record.message_count.map(to_i64))
        .bind(record.tool_use_count.map(to_i64))
        .bind(record.decode_errors.map(to_i64))
        .bind(format_timestamp(Utc::now()))
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to upsert session {}", record.session_id))?;
        Ok(())
    }

    pub async fn has_session(&self, session_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE session_id = ? LIMIT 1")
            .bind(session_id)
            .fetch_optional(&*self.pool)
            .await
            .with_context(|| "failed to look up session")?;
        Ok(row.is_some())
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, project, file_size, created, modified, message_count, tool_use_count, decode_errors
            FROM sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&*self.pool)
        .await
        .with_context(|| "failed to load session")?;

        row.map(|row| session_from_row(&row)).transpose()
    }

    pub async fn load_ingest_state(&self) -> Result<Vec<IngestStateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT path, session_id, last_offset, fully_processed_scan, message_count, tool_use_count, decode_errors
            FROM ingest_state
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load ingest state")?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            states.push(IngestStateRow {
                path: PathBuf::from(path),
                session_id: row.try_get::<Option<String>, _>("session_id")?,
                last_offset: row.try_get::<i64, _>("last_offset").unwrap_or(0) as u64,
                fully_processed_scan: row
                    .try_get::<Option<i64>, _>("fully_processed_scan")?
                    .map(|scan| scan as u64),
                message_count: row.try_get::<i64, _>("message_count").unwrap_or(0) as u64,
                tool_use_count: row.try_get::<i64, _>("tool_use_count").unwrap_or(0) as u64,
                decode_errors: row.try_get::<i64, _>("decode_errors").unwrap_or(0) as u64,
            });
        }
        Ok(states)
    }

    pub async fn upsert_ingest_state(&self, state: &IngestStateRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_state (
                path, session_id, last_offset, fully_processed_scan, message_count, tool_use_count, decode_errors
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                session_id = excluded.session_id,
                last_offset = excluded.last_offset,
                fully_processed_scan = excluded.fully_processed_scan,
                message_count = excluded.message_count,
                tool_use_count = excluded.tool_use_count,
                decode_errors = excluded.decode_errors;
            "#,
        )
        .bind(state.path.to_string_lossy().as_ref())
        .bind(state.session_id.as_deref())
        .bind(to_i64(state.last_offset))
        .bind(state.fully_processed_scan.map(to_i64))
        .bind(to_i64(state.message_count))
        .bind(to_i64(state.tool_use_count))
        .bind(to_i64(state.decode_errors))
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to save ingest state for {}", state.path.display()))?;
        Ok(())
    }

    pub async fn collection_counts(&self) -> Result<CollectionCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM sessions) AS sessions,
                (SELECT COUNT(*) FROM messages) AS messages,
                (SELECT COUNT(*) FROM tool_usage) AS tool_usage,
                (SELECT COUNT(*) FROM file_edits) AS file_edits,
                (SELECT COUNT(*) FROM token_usage) AS token_usage
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .with_context(|| "failed to count collections")?;

        Ok(CollectionCounts {
            sessions: row.try_get::<i64, _>("sessions").unwrap_or(0) as u64,
            messages: row.try_get::<i64, _>("messages").unwrap_or(0) as u64,
            tool_usage: row.try_get::<i64, _>("tool_usage").unwrap_or(0) as u64,
            file_edits: row.try_get::<i64, _>("file_edits").unwrap_or(0) as u64,
            token_usage: row.try_get::<i64, _>("token_usage").unwrap_or(0) as u64,
        })
    }

    pub async fn token_totals(&self) -> Result<TokenTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(input_tokens), 0) AS input_tokens,
                COALESCE(SUM(output_tokens), 0) AS output_tokens,
                COALESCE(SUM(cache_read_input_tokens), 0) AS cache_read_tokens,
                COALESCE(SUM(cache_creation_input_tokens), 0) AS cache_write_tokens
            FROM token_usage
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .with_context(|| "failed to load token totals")?;

        let input_tokens = row.try_get::<i64, _>("input_tokens").unwrap_or(0) as u64;
        let output_tokens = row.try_get::<i64, _>("output_tokens").unwrap_or(0) as u64;
        Ok(TokenTotals {
            input_tokens,
            output_tokens,
            cache_read_tokens: row.try_get::<i64, _>("cache_read_tokens").unwrap_or(0) as u64,
            cache_write_tokens: row.try_get::<i64, _>("cache_write_tokens").unwrap_or(0) as u64,
            total_tokens: input_tokens + output_tokens,
        })
    }

    /// Tool usage grouped by name, most used first; ties keep first-seen order.
    pub async fn tool_histogram(&self, limit: Option<usize>) -> Result<Vec<ToolCount>> {
        let rows = sqlx::query(
            r#"
            SELECT tool_name, COUNT(*) AS count, MIN(id) AS first_seen
            FROM tool_usage
            GROUP BY tool_name
            ORDER BY count DESC, first_seen ASC
            LIMIT ?
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load tool histogram")?;

        let mut tools = Vec::with_capacity(rows.len());
        for row in rows {
            tools.push(ToolCount {
                name: row.try_get("tool_name")?,
                count: row.try_get::<i64, _>("count").unwrap_or(0) as u64,
            });
        }
        Ok(tools)
    }

    /// Tool usage per UTC calendar date, most recent [`TIMELINE_DAYS`] dates first.
    pub async fn timeline(&self) -> Result<Vec<DayCount>> {
        let rows = sqlx::query(
            r#"
            SELECT substr(timestamp, 1, 10) AS date, COUNT(*) AS count
            FROM tool_usage
            GROUP BY date
            ORDER BY date DESC
            LIMIT ?
            "#,
        )
        .bind(limit_param(Some(TIMELINE_DAYS)))
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load usage timeline")?;

        let mut days = Vec::with_capacity(rows.len());
        for row in rows {
            days.push(DayCount {
                date: row.try_get("date")?,
                count: row.try_get::<i64, _>("count").unwrap_or(0) as u64,
            });
        }
        Ok(days)
    }

    /// Most edited files, top [`TOP_FILES`].
    pub async fn file_histogram(&self) -> Result<Vec<FileEditStat>> {
        let rows = sqlx::query(
            r#"
            SELECT file_path, COUNT(*) AS edits, COALESCE(SUM(lines_changed), 0) AS lines, MIN(id) AS first_seen
            FROM file_edits
            GROUP BY file_path
            ORDER BY edits DESC, first_seen ASC
            LIMIT ?
            "#,
        )
        .bind(limit_param(Some(TOP_FILES)))
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load file histogram")?;

        let mut files = Vec::with_capacity(rows.len());
        for row in rows {
            files.push(FileEditStat {
                path: row.try_get("file_path")?,
                edits: row.try_get::<i64, _>("edits").unwrap_or(0) as u64,
                lines: row.try_get::<i64, _>("lines").unwrap_or(0) as u64,
            });
        }
        Ok(files)
    }

    /// One row per session that has messages, latest activity first. Stored session
    /// metadata is overlaid when present.
    pub async fn session_rollups(&self) -> Result<Vec<SessionRollup>> {
        let rows = sqlx::query(
            r#"
            WITH msg AS (
                SELECT
                    session_id,
                    COUNT(*) AS message_count,
                    MIN(timestamp) AS first_timestamp,
                    MAX(timestamp) AS last_timestamp
                FROM messages
                GROUP BY session_id
            ),
            tools AS (
                SELECT session_id, COUNT(*) AS tool_count
                FROM tool_usage
                GROUP BY session_id
            ),
            files AS (
                SELECT session_id, COUNT(*) AS file_count
                FROM file_edits
                GROUP BY session_id
            )
            SELECT
                msg.session_id,
                msg.message_count,
                COALESCE(tools.tool_count, 0) AS tool_count,
                COALESCE(files.file_count, 0) AS file_count,
                msg.first_timestamp,
                msg.last_timestamp,
                sessions.project,
                sessions.file_size,
                sessions.created,
                sessions.modified
            FROM msg
            LEFT JOIN tools ON tools.session_id = msg.session_id
            LEFT JOIN files ON files.session_id = msg.session_id
            LEFT JOIN sessions ON sessions.session_id = msg.session_id
            ORDER BY msg.last_timestamp DESC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load session rollups")?;

        let mut rollups = Vec::with_capacity(rows.len());
        for row in rows {
            let first: String = row.try_get("first_timestamp")?;
            let last: String = row.try_get("last_timestamp")?;
            rollups.push(SessionRollup {
                session_id: row.try_get("session_id")?,
                message_count: row.try_get::<i64, _>("message_count").unwrap_or(0) as u64,
                tool_count: row.try_get::<i64, _>("tool_count").unwrap_or(0) as u64,
                file_count: row.try_get::<i64, _>("file_count").unwrap_or(0) as u64,
                first_timestamp: parse_stored_timestamp(&first)?,
                last_timestamp: parse_stored_timestamp(&last)?,
                project: row.try_get::<Option<String>, _>("project")?,
                file_size: row
                    .try_get::<Option<i64>, _>("file_size")?
                    .map(|size| size as u64),
                created: optional_timestamp(&row, "created")?,
                modified: optional_timestamp(&row, "modified")?,
            });
        }
        Ok(rollups)
    }

    pub async fn overview(&self) -> Result<Overview> {
        let counts = self.collection_counts().await?;
        Ok(Overview {
            total_sessions: counts.sessions,
            total_tools: counts.tool_usage,
            total_edits: counts.file_edits,
            total_messages: counts.messages,
            tokens: self.token_totals().await?,
            top_tools: self.tool_histogram(Some(OVERVIEW_TOP_TOOLS)).await?,
        })
    }

    /// Every recorded event for one session, in insertion order.
    pub async fn session_detail(&self, session_id: &str) -> Result<SessionDetail> {
        let messages = sqlx::query(
            "SELECT role, content_length, timestamp FROM messages WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load session messages")?
        .iter()
        .map(|row| -> Result<MessageEvent> {
            let ts: String = row.try_get("timestamp")?;
            Ok(MessageEvent {
                session_id: session_id.to_string(),
                role: row.try_get("role")?,
                content_length: row.try_get::<i64, _>("content_length").unwrap_or(0) as u64,
                timestamp: parse_stored_timestamp(&ts)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let tools = sqlx::query(
            "SELECT tool_name, description, success, timestamp FROM tool_usage WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load session tool usage")?
        .iter()
        .map(|row| -> Result<ToolUsageEvent> {
            let ts: String = row.try_get("timestamp")?;
            Ok(ToolUsageEvent {
                session_id: session_id.to_string(),
                tool_name: row.try_get("tool_name")?,
                description: row.try_get("description")?,
                success: row.try_get("success")?,
                timestamp: parse_stored_timestamp(&ts)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let files = sqlx::query(
            "SELECT file_path, operation, lines_changed, timestamp FROM file_edits WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load session file edits")?
        .iter()
        .map(|row| -> Result<FileEditEvent> {
            let ts: String = row.try_get("timestamp")?;
            let operation: String = row.try_get("operation")?;
            let operation = match operation.as_str() {
                "write" => FileOperation::Write,
                "edit" => FileOperation::Edit,
                other => return Err(anyhow!("unknown file operation stored: {other}")),
            };
            Ok(FileEditEvent {
                session_id: session_id.to_string(),
                file_path: row.try_get("file_path")?,
                operation,
                lines_changed: row.try_get::<i64, _>("lines_changed").unwrap_or(0) as u64,
                timestamp: parse_stored_timestamp(&ts)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(SessionDetail {
            session: self.session(session_id).await?,
            stats: SessionDetailStats {
                total_messages: messages.len() as u64,
                total_tools: tools.len() as u64,
                total_files: files.len() as u64,
            },
            messages,
            tools,
            files,
        })
    }
}

#[async_trait]
impl EventSink for Storage {
    async fn append(&self, event: &UsageEvent) -> Result<()> {
        match event {
            UsageEvent::Message(e) => self.append_message(e).await,
            UsageEvent::ToolUsage(e) => self.append_tool_usage(e).await,
            UsageEvent::FileEdit(e) => self.append_file_edit(e).await,
            UsageEvent::TokenUsage(e) => self.append_token_usage(e).await,
            UsageEvent::Session(record) => Storage::upsert_session(self, record).await,
        }
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        Storage::upsert_session(self, record).await
    }

    async fn has_session(&self, session_id: &str) -> Result<bool> {
        Storage::has_session(self, session_id).await
    }

    async fn load_cursors(&self) -> Result<Vec<IngestStateRow>> {
        self.load_ingest_state().await
    }

    async fn save_cursor(&self, state: &IngestStateRow) -> Result<()> {
        self.upsert_ingest_state(state).await
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// SQLite treats a negative LIMIT as unbounded.
fn limit_param(limit: Option<usize>) -> i64 {
    limit
        .map(|value| i64::try_from(value).unwrap_or(i64::MAX))
        .unwrap_or(-1)
}

fn parse_stored_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp stored in DB: {value}"))
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.try_get::<Option<String>, _>(column)?
        .as_deref()
        .map(parse_stored_timestamp)
        .transpose()
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    let count = |column: &str| -> Result<Option<u64>> {
        Ok(row.try_get::<Option<i64>, _>(column)?.map(|v| v as u64))
    };
    Ok(SessionRecord {
        session_id: row.try_get("session_id")?,
        project: row.try_get::<Option<String>, _>("project")?,
        file_size: count("file_size")?,
        created: optional_timestamp(row, "created")?,
        modified: optional_timestamp(row, "modified")?,
        message_count: count("message_count")?,
        tool_use_count: count("tool_use_count")?,
        decode_errors: count("decode_errors")?,
    })
}

/// Persisted ingestion checkpoint for one log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestStateRow {
    pub path: PathBuf,
    pub session_id: Option<String>,
    pub last_offset: u64,
    pub fully_processed_scan: Option<u64>,
    pub message_count: u64,
    pub tool_use_count: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionCounts {
    pub sessions: u64,
    pub messages: u64,
    pub tool_usage: u64,
    pub file_edits: u64,
    pub token_usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEditStat {
    pub path: String,
    pub edits: u64,
    pub lines: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRollup {
    pub session_id: String,
    pub message_count: u64,
    pub tool_count: u64,
    pub file_count: u64,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub project: Option<String>,
    pub file_size: Option<u64>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub total_sessions: u64,
    pub total_tools: u64,
    pub total_edits: u64,
    pub total_messages: u64,
    pub tokens: TokenTotals,
    pub top_tools: Vec<ToolCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetailStats {
    pub total_messages: u64,
    pub total_tools: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetail {
    pub session: Option<SessionRecord>,
    pub messages: Vec<MessageEvent>,
    pub tools: Vec<ToolUsageEvent>,
    pub files: Vec<FileEditEvent>,
    pub stats: SessionDetailStats,
}
