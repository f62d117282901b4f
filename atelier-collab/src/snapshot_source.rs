//! Where persisted page snapshots come from.
//!
//! The collaboration core only ever reads snapshots, once per room session,
//! to seed an empty replica. Persisting is the surrounding application's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("snapshot service returned {0}")]
    Status(reqwest::StatusCode),
    #[error("snapshot unavailable: {0}")]
    Unavailable(String),
}

/// Single idempotent read of a room's last persisted snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// `Ok(None)` when the room has never been persisted.
    async fn fetch(&self, room_id: &str) -> Result<Option<Value>, SnapshotError>;
}

/// Fetches `GET {base_url}/{room_id}` from the page storage service.
pub struct HttpSnapshotSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn url_for(&self, room_id: &str) -> String {
        format!("{}/{room_id}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, room_id: &str) -> Result<Option<Value>, SnapshotError> {
        let url = self.url_for(room_id);
        log::debug!("fetching snapshot from {url}");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SnapshotError::Status(status));
        }
        Ok(Some(response.json().await?))
    }
}

/// In-memory snapshots keyed by room id. Counts fetches.
#[derive(Default)]
pub struct StaticSnapshotSource {
    snapshots: HashMap<String, Value>,
    failing: bool,
    fetches: AtomicUsize,
}

impl StaticSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, room_id: impl Into<String>, snapshot: Value) -> Self {
        self.snapshots.insert(room_id.into(), snapshot);
        self
    }

    /// A source whose every fetch fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn fetch(&self, room_id: &str) -> Result<Option<Value>, SnapshotError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(SnapshotError::Unavailable(format!("no snapshot service for {room_id}")));
        }
        Ok(self.snapshots.get(room_id).cloned())
    }
}
