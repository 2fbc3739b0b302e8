use crate::{
    events::{SessionRecord, UsageEvent},
    sink::EventSink,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, redirect::Policy};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Ships events to a remote log endpoint, one POST per event. Delivery is best
/// effort: failures are logged and counted, never retried or surfaced.
pub struct HttpForwarder {
    client: Client,
    endpoint: String,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl HttpForwarder {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("claude-usage-tracker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn post(&self, event: &UsageEvent) {
        match self.client.post(&self.endpoint).json(event).send().await {
            Ok(response) if response.status().is_success() => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(response) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    status = %response.status(),
                    session = event.session_id(),
                    endpoint = %self.endpoint,
                    "log endpoint rejected event; dropping"
                );
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    session = event.session_id(),
                    endpoint = %self.endpoint,
                    "failed to forward event; dropping"
                );
            }
        }
    }
}

#[async_trait]
impl EventSink for HttpForwarder {
    async fn append(&self, event: &UsageEvent) -> Result<()> {
        self.post(event).await;
        Ok(())
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        self.post(&UsageEvent::Session(record.clone())).await;
        Ok(())
    }

    /// The remote side cannot be queried, so every file counts as new.
    async fn has_session(&self, _session_id: &str) -> Result<bool> {
        Ok(false)
    }
}
