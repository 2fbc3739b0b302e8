use crate::{
    events::{SessionRecord, UsageEvent},
    storage::IngestStateRow,
};
use anyhow::Result;
use async_trait::async_trait;

/// Destination for ingested events. The aggregate store implements it in-process;
/// the forwarder ships events to a remote log API.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records one event. Session records are upserted, everything else appended.
    async fn append(&self, event: &UsageEvent) -> Result<()>;

    async fn upsert_session(&self, record: &SessionRecord) -> Result<()>;

    async fn has_session(&self, session_id: &str) -> Result<bool>;

    async fn load_cursors(&self) -> Result<Vec<IngestStateRow>> {
        Ok(Vec::new())
    }

    async fn save_cursor(&self, _state: &IngestStateRow) -> Result<()> {
        Ok(())
    }
}
