// Log hub: per active run/build, a ring buffer of recent output plus a
// fan-out set of live subscribers.
//
// Delivery policy: lossless into the ring, lossy to subscribers. A subscriber
// whose channel is full receives one "slow consumer" marker and is dropped,
// so a stuck WebSocket can never stall the publishing executor.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Marker delivered to a subscriber right before it is dropped for lagging
pub const SLOW_CONSUMER_MARKER: &[u8] = b"\n[log stream lagging, output dropped]\n";

/// Per-subscriber channel depth, in chunks
const SUBSCRIBER_CHANNEL_DEPTH: usize = 64;

/// Grace period between terminal flush and entry eviction, letting live
/// subscribers drain their channels
const EVICT_GRACE: Duration = Duration::from_secs(2);

struct Subscriber {
    tx: mpsc::Sender<Bytes>,
}

struct LogEntry {
    ring: VecDeque<u8>,
    subscribers: Vec<Subscriber>,
}

impl LogEntry {
    fn new() -> Self {
        Self {
            ring: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }
}

pub struct LogHub {
    logs_dir: PathBuf,
    ring_capacity: usize,
    entries: Arc<Mutex<HashMap<String, LogEntry>>>,
}

impl LogHub {
    pub fn new(logs_dir: PathBuf, ring_capacity: usize) -> Self {
        Self {
            logs_dir,
            ring_capacity,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Keys carry run/build ids and job names; flatten to a safe file name
    fn log_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.logs_dir.join(format!("{}.log", safe))
    }

    /// Open capture for a run/job or build key
    pub fn begin(&self, key: &str) {
        let mut entries = self.lock_entries();
        entries.entry(key.to_string()).or_insert_with(LogEntry::new);
    }

    /// Append bytes to the ring and fan out to live subscribers
    pub fn publish(&self, key: &str, bytes: &[u8]) {
        let mut entries = self.lock_entries();
        let entry = entries.entry(key.to_string()).or_insert_with(LogEntry::new);

        for &b in bytes {
            if entry.ring.len() == self.ring_capacity {
                entry.ring.pop_front();
            }
            entry.ring.push_back(b);
        }

        let chunk = Bytes::copy_from_slice(bytes);
        entry.subscribers.retain(|sub| {
            match sub.tx.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // One marker, best effort, then drop the subscriber
                    let _ = sub.tx.try_send(Bytes::from_static(SLOW_CONSUMER_MARKER));
                    warn!(key = %key, "Dropping slow log subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Ring snapshot for REST tail reads. Falls back to the on-disk log once
    /// the entry has been evicted.
    pub fn tail(&self, key: &str, max_bytes: usize) -> Option<Vec<u8>> {
        {
            let entries = self.lock_entries();
            if let Some(entry) = entries.get(key) {
                let bytes: Vec<u8> = entry.ring.iter().copied().collect();
                let start = bytes.len().saturating_sub(max_bytes);
                return Some(bytes[start..].to_vec());
            }
        }
        let path = self.log_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let start = bytes.len().saturating_sub(max_bytes);
                Some(bytes[start..].to_vec())
            }
            Err(_) => None,
        }
    }

    /// Register a live subscriber. For an evicted key the on-disk contents
    /// arrive as a single chunk and the channel closes immediately.
    pub fn subscribe(&self, key: &str) -> Option<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_DEPTH);
        {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.get_mut(key) {
                // Late joiners first receive what the ring already holds
                if !entry.ring.is_empty() {
                    let snapshot: Vec<u8> = entry.ring.iter().copied().collect();
                    let _ = tx.try_send(Bytes::from(snapshot));
                }
                entry.subscribers.push(Subscriber { tx });
                return Some(rx);
            }
        }
        let path = self.log_path(key);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let _ = tx.try_send(Bytes::from(bytes));
                drop(tx);
                Some(rx)
            }
            Err(_) => None,
        }
    }

    /// Terminal state: flush the ring to disk, then evict after a short grace
    /// period so live subscribers can drain
    pub fn finish(&self, key: &str) {
        let snapshot: Option<Vec<u8>> = {
            let entries = self.lock_entries();
            entries
                .get(key)
                .map(|entry| entry.ring.iter().copied().collect())
        };

        if let Some(bytes) = snapshot {
            if let Err(e) = std::fs::create_dir_all(&self.logs_dir)
                .and_then(|_| std::fs::write(self.log_path(key), &bytes))
            {
                warn!(key = %key, error = %e, "Failed to flush log ring to disk");
            }
        }

        let entries = Arc::clone(&self.entries);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(EVICT_GRACE).await;
            let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.remove(&key).is_some() {
                debug!(key = %key, "Evicted log entry");
            }
        });
    }

    /// Remove the persisted log for a deleted run/build
    pub fn remove_persisted(&self, key: &str) {
        let path = self.log_path(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(key = %key, error = %e, "Failed to remove persisted log");
            }
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Key for a pipeline run's per-job log stream
pub fn run_job_key(run_id: uuid::Uuid, job_name: &str) -> String {
    format!("{}_{}", run_id, job_name)
}

/// Key for a freestyle build's log stream
pub fn build_key(build_id: uuid::Uuid) -> String {
    build_id.to_string()
}
