//! Engine snapshot persistence

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::config::GridConfig;
use super::engine::EngineEvent;
use super::errors::{GridError, GridResult};
use super::risk::PnlTracker;
use super::types::OrderBinding;

/// Minimal grid description stored with every snapshot, used to detect a
/// configuration change across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridFingerprint {
    pub asset: String,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub level_count: u32,
}

impl GridFingerprint {
    pub fn new(config: &GridConfig, level_count: usize) -> Self {
        Self {
            asset: config.asset.clone(),
            lower_price: config.lower_price,
            upper_price: config.upper_price,
            level_count: level_count as u32,
        }
    }
}

/// Persistent engine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Bindings ordered by level index
    pub bindings: Vec<OrderBinding>,

    /// High-water mark of processed exchange events, `None` before the first one
    #[serde(default)]
    pub last_event_seq: Option<u64>,

    /// Strictly increasing per write
    pub write_seq: u64,

    pub fingerprint: GridFingerprint,

    #[serde(default)]
    pub pnl: PnlTracker,

    pub saved_at: DateTime<Utc>,
}

impl EngineSnapshot {
    /// Reject snapshots written for another instrument
    pub fn validate_against(&self, fingerprint: &GridFingerprint) -> GridResult<()> {
        if self.fingerprint.asset != fingerprint.asset {
            return Err(GridError::InvalidConfiguration(format!(
                "Snapshot asset '{}' doesn't match config asset '{}'",
                self.fingerprint.asset, fingerprint.asset
            )));
        }
        if self.fingerprint != *fingerprint {
            warn!(
                "Grid parameters changed since last snapshot: was [{}, {}] x{}, now [{}, {}] x{}",
                self.fingerprint.lower_price,
                self.fingerprint.upper_price,
                self.fingerprint.level_count,
                fingerprint.lower_price,
                fingerprint.upper_price,
                fingerprint.level_count
            );
        }
        Ok(())
    }
}

/// Load/save of engine snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> GridResult<Option<EngineSnapshot>>;

    async fn save(&self, snapshot: &EngineSnapshot) -> GridResult<()>;
}

fn check_monotonic(last: Option<(Option<u64>, u64)>, snapshot: &EngineSnapshot) -> GridResult<()> {
    if let Some((last_event_seq, write_seq)) = last {
        if snapshot.last_event_seq < last_event_seq || snapshot.write_seq < write_seq {
            return Err(GridError::Persistence(format!(
                "snapshot regresses: event_seq {:?} < {:?} or write_seq {} < {}",
                snapshot.last_event_seq, last_event_seq, snapshot.write_seq, write_seq
            )));
        }
    }
    Ok(())
}

/// JSON file store with atomic replace (write to temp, then rename)
pub struct JsonFileSnapshotStore {
    path: PathBuf,
    last_written: Mutex<Option<(Option<u64>, u64)>>,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn load(&self) -> GridResult<Option<EngineSnapshot>> {
        if !tokio::fs::try_exists(&self.path).await? {
            info!("No existing snapshot at {:?}", self.path);
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let snapshot: EngineSnapshot = serde_json::from_str(&content)?;
        *self.last_written.lock().await = Some((snapshot.last_event_seq, snapshot.write_seq));

        info!(
            "Loaded snapshot from {:?}: write_seq={}, event_seq={:?}, {} bindings",
            self.path,
            snapshot.write_seq,
            snapshot.last_event_seq,
            snapshot.bindings.len()
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> GridResult<()> {
        let mut last = self.last_written.lock().await;
        check_monotonic(*last, snapshot)?;

        let temp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        *last = Some((snapshot.last_event_seq, snapshot.write_seq));
        debug!("Snapshot {} saved to {:?}", snapshot.write_seq, self.path);
        Ok(())
    }
}

/// In-memory store for tests and paper runs
#[derive(Default)]
pub struct MemorySnapshotStore {
    saved: Mutex<Option<EngineSnapshot>>,
    writes: Mutex<u64>,
    should_fail: Mutex<bool>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self) -> Option<EngineSnapshot> {
        self.saved.lock().await.clone()
    }

    pub async fn write_count(&self) -> u64 {
        *self.writes.lock().await
    }

    pub async fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock().await = fail;
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> GridResult<Option<EngineSnapshot>> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> GridResult<()> {
        if *self.should_fail.lock().await {
            return Err(GridError::Persistence("Mock store failure".into()));
        }
        let mut saved = self.saved.lock().await;
        check_monotonic(
            saved.as_ref().map(|s| (s.last_event_seq, s.write_seq)),
            snapshot,
        )?;
        *saved = Some(snapshot.clone());
        *self.writes.lock().await += 1;
        Ok(())
    }
}

/// Background task that persists snapshots off the engine loop and reports
/// each write back as an engine event
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<EngineSnapshot>,
    handle: JoinHandle<()>,
}

impl SnapshotWriter {
    pub fn spawn(store: Arc<dyn SnapshotStore>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineSnapshot>();

        let handle = tokio::spawn(async move {
            while let Some(mut snapshot) = rx.recv().await {
                // only the newest queued snapshot matters
                while let Ok(newer) = rx.try_recv() {
                    snapshot = newer;
                }

                let write_seq = snapshot.write_seq;
                let event = match store.save(&snapshot).await {
                    Ok(()) => EngineEvent::SnapshotPersisted { write_seq },
                    Err(e) => {
                        error!("Snapshot write failed: write_seq={}, {}", write_seq, e);
                        EngineEvent::SnapshotFailed {
                            write_seq,
                            reason: e.to_string(),
                        }
                    }
                };
                // engine may already be gone during shutdown
                let _ = events.send(event);
            }
            debug!("Snapshot writer stopped");
        });

        Self { tx, handle }
    }

    /// Queue a snapshot for writing
    pub fn submit(&self, snapshot: EngineSnapshot) -> GridResult<()> {
        self.tx
            .send(snapshot)
            .map_err(|_| GridError::ChannelClosed("snapshot writer".into()))
    }

    /// Write `last` (if any), then wait for every queued write to finish
    pub async fn shutdown(self, last: Option<EngineSnapshot>) -> GridResult<()> {
        if let Some(snapshot) = last {
            self.submit(snapshot)?;
        }
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| GridError::Persistence(format!("snapshot writer panicked: {e}")))
    }
}
