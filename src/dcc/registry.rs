//! Process-wide table of active and recently-finished transfers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::BotError;

/// Unique identity of a transfer: one peer cannot have two simultaneous
/// transfers of the same file on the same server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub server: String,
    pub peer_nick: String,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    fn is_finished(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub server: String,
    pub peer_nick: String,
    pub filename: String,
    pub status: TransferStatus,
    pub size: u64,
    pub received: u64,
    pub offset: u64,
    pub speed: f64,
    pub error: Option<String>,
    pub md5_advertised: Option<String>,
    pub md5_computed: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    pub fn new(key: &TransferKey, size: u64) -> Self {
        Self {
            server: key.server.clone(),
            peer_nick: key.peer_nick.clone(),
            filename: key.filename.clone(),
            status: TransferStatus::Queued,
            size,
            received: 0,
            offset: 0,
            speed: 0.0,
            error: None,
            md5_advertised: None,
            md5_computed: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// A patch applied atomically to a `TransferRecord`. `None` fields are left
/// unchanged.
#[derive(Debug, Default, Clone)]
pub struct TransferPatch {
    pub status: Option<TransferStatus>,
    pub received: Option<u64>,
    pub offset: Option<u64>,
    pub speed: Option<f64>,
    pub error: Option<String>,
    pub md5_advertised: Option<String>,
    pub md5_computed: Option<String>,
}

struct Entry {
    record: TransferRecord,
    cancel: CancellationToken,
}

/// `insert`/`update`/`cancel`/`snapshot`/`reap` over a table keyed by
/// `(server, peer_nick, filename)`. Never owns a Transfer Engine's task —
/// only its cancellation handle.
pub struct Registry {
    entries: RwLock<HashMap<TransferKey, Entry>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new transfer. Fails with `AlreadyActive` if the key is
    /// already `queued`/`in_progress` (spec Open Question (a)).
    pub async fn insert(&self, key: TransferKey, size: u64) -> Result<CancellationToken, BotError> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&key) {
            if !existing.record.status.is_finished() {
                return Err(BotError::AlreadyActive);
            }
        }
        let cancel = CancellationToken::new();
        entries.insert(
            key.clone(),
            Entry {
                record: TransferRecord::new(&key, size),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    pub async fn update(&self, key: &TransferKey, patch: TransferPatch) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if let Some(status) = patch.status {
                entry.record.status = status;
                if status.is_finished() {
                    entry.record.finished_at = Some(Utc::now());
                }
            }
            if let Some(received) = patch.received {
                entry.record.received = received;
            }
            if let Some(offset) = patch.offset {
                entry.record.offset = offset;
            }
            if let Some(speed) = patch.speed {
                entry.record.speed = speed;
            }
            if let Some(error) = patch.error {
                entry.record.error = Some(error);
            }
            if let Some(md5) = patch.md5_advertised {
                entry.record.md5_advertised = Some(md5);
            }
            if let Some(md5) = patch.md5_computed {
                entry.record.md5_computed = Some(md5);
            }
        }
    }

    /// Signal cancellation to the owning engine. Returns true if a
    /// cancellable (non-finished) transfer existed for `key`.
    pub async fn cancel(&self, key: &TransferKey) -> bool {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.record.status.is_finished() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<TransferRecord> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    /// True if any non-finished transfer exists for `server`. Used by the
    /// session idle reclaimer to decide whether the whole session may QUIT.
    pub async fn has_active(&self, server: &str) -> bool {
        self.entries
            .read()
            .await
            .values()
            .any(|e| e.record.server == server && !e.record.status.is_finished())
    }

    /// True if any non-finished transfer exists for `server` from one of
    /// `peers`. Used by the per-channel idle reclaimer.
    pub async fn has_active_for_peers(&self, server: &str, peers: &std::collections::HashSet<String>) -> bool {
        self.entries.read().await.values().any(|e| {
            e.record.server == server
                && !e.record.status.is_finished()
                && peers.contains(&e.record.peer_nick)
        })
    }

    /// Record an advertised MD5 for the pending transfer from `peer_nick` on
    /// `server` whose filename is mentioned in `text` (spec §4.1: a channel
    /// PRIVMSG matching `^[0-9a-f]{32}\b`). No-op if no matching
    /// non-finished transfer exists. Returns true if a record was updated.
    pub async fn mark_md5_advertised(&self, server: &str, peer_nick: &str, text: &str, md5: &str) -> bool {
        let mut entries = self.entries.write().await;
        for (key, entry) in entries.iter_mut() {
            if key.server == server
                && key.peer_nick == peer_nick
                && !entry.record.status.is_finished()
                && text.contains(&key.filename)
            {
                entry.record.md5_advertised = Some(md5.to_string());
                return true;
            }
        }
        false
    }

    /// Remove finished entries older than `transfer_list_timeout` seconds.
    pub async fn reap(&self, transfer_list_timeout_secs: i64) {
        let cutoff = Utc::now() - chrono::Duration::seconds(transfer_list_timeout_secs);
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| match entry.record.finished_at {
            Some(finished_at) => finished_at > cutoff,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TransferKey {
        TransferKey {
            server: "irc.example.org".to_string(),
            peer_nick: "bot1".to_string(),
            filename: "ep1.mkv".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_active_key_is_rejected() {
        let registry = Registry::new();
        registry.insert(key(), 100).await.unwrap();
        let result = registry.insert(key(), 100).await;
        assert!(matches!(result, Err(BotError::AlreadyActive)));
    }

    #[tokio::test]
    async fn finished_key_can_be_reinserted() {
        let registry = Registry::new();
        registry.insert(key(), 100).await.unwrap();
        registry
            .update(
                &key(),
                TransferPatch {
                    status: Some(TransferStatus::Completed),
                    ..Default::default()
                },
            )
            .await;
        assert!(registry.insert(key(), 100).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_signals_token() {
        let registry = Registry::new();
        let token = registry.insert(key(), 100).await.unwrap();
        assert!(registry.cancel(&key()).await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_key_returns_false() {
        let registry = Registry::new();
        assert!(!registry.cancel(&key()).await);
    }

    #[tokio::test]
    async fn reap_evicts_old_finished_entries_only() {
        let registry = Registry::new();
        registry.insert(key(), 100).await.unwrap();
        registry
            .update(
                &key(),
                TransferPatch {
                    status: Some(TransferStatus::Completed),
                    ..Default::default()
                },
            )
            .await;
        {
            let mut entries = registry.entries.write().await;
            entries.get_mut(&key()).unwrap().record.finished_at =
                Some(Utc::now() - chrono::Duration::seconds(120));
        }
        registry.reap(60).await;
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn has_active_reflects_in_progress_only() {
        let registry = Registry::new();
        assert!(!registry.has_active("irc.example.org").await);
        registry.insert(key(), 100).await.unwrap();
        assert!(registry.has_active("irc.example.org").await);
        registry
            .update(
                &key(),
                TransferPatch {
                    status: Some(TransferStatus::Completed),
                    ..Default::default()
                },
            )
            .await;
        assert!(!registry.has_active("irc.example.org").await);
    }

    #[tokio::test]
    async fn has_active_for_peers_filters_by_nick() {
        let registry = Registry::new();
        registry.insert(key(), 100).await.unwrap();
        let mut peers = std::collections::HashSet::new();
        peers.insert("someone_else".to_string());
        assert!(!registry.has_active_for_peers("irc.example.org", &peers).await);
        peers.insert("bot1".to_string());
        assert!(registry.has_active_for_peers("irc.example.org", &peers).await);
    }

    #[tokio::test]
    async fn mark_md5_advertised_matches_by_filename() {
        let registry = Registry::new();
        registry.insert(key(), 100).await.unwrap();
        let updated = registry
            .mark_md5_advertised(
                "irc.example.org",
                "bot1",
                "d41d8cd98f00b204e9800998ecf8427e ep1.mkv is ready",
                "d41d8cd98f00b204e9800998ecf8427e",
            )
            .await;
        assert!(updated);
        let snapshot = registry.snapshot().await;
        assert_eq!(
            snapshot[0].md5_advertised.as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
    }

    #[tokio::test]
    async fn mark_md5_advertised_ignores_unrelated_filename() {
        let registry = Registry::new();
        registry.insert(key(), 100).await.unwrap();
        let updated = registry
            .mark_md5_advertised("irc.example.org", "bot1", "deadbeef unrelated.bin", "deadbeef")
            .await;
        assert!(!updated);
    }

    #[tokio::test]
    async fn reap_never_evicts_in_progress() {
        let registry = Registry::new();
        registry.insert(key(), 100).await.unwrap();
        registry.reap(0).await;
        assert_eq!(registry.snapshot().await.len(), 1);
    }
}
