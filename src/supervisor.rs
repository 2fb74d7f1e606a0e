//! Bot Supervisor: top-level coordinator holding `GlobalConfig`, the Session
//! map, and the Transfer Registry. Generalizes the teacher's `AppState`
//! (`main.rs`) from a single shared `TransferManager` into the
//! multi-session, config-resolving coordinator the spec describes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{AppConfig, GlobalConfig};
use crate::dcc::registry::{Registry, TransferKey, TransferRecord};
use crate::dcc::PendingAccepts;
use crate::error::BotError;
use crate::irc::session::{self, SessionHandle, SessionSnapshot};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct InfoSnapshot {
    pub networks: Vec<SessionSnapshot>,
    pub transfers: Vec<TransferRecord>,
}

pub struct Supervisor {
    config: AppConfig,
    global: Arc<GlobalConfig>,
    registry: Arc<Registry>,
    pending_accepts: Arc<PendingAccepts>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let global = Arc::new(config.global.clone());
        Arc::new(Self {
            config,
            global,
            registry: Registry::new(),
            pending_accepts: Arc::new(PendingAccepts::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn global(&self) -> &Arc<GlobalConfig> {
        &self.global
    }

    /// Resolve `host` to a running Session, creating one on demand from
    /// `servers[host]` or `default_server_config` (spec §4.5).
    async fn resolve_session(&self, host: &str) -> Result<SessionHandle, BotError> {
        if let Some(handle) = self.sessions.read().await.get(host) {
            return Ok(handle.clone());
        }

        let server_config = self.config.resolve_server(host)?;
        let mut sessions = self.sessions.write().await;
        // Re-check: another request may have created it while we awaited the write lock.
        if let Some(handle) = sessions.get(host) {
            return Ok(handle.clone());
        }
        let handle = session::spawn(
            server_config,
            self.global.clone(),
            self.registry.clone(),
            self.pending_accepts.clone(),
        );
        sessions.insert(host.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn join(&self, server: &str, channel: &str) -> Result<(), BotError> {
        let handle = self.resolve_session(server).await?;
        handle.join(channel.to_string());
        Ok(())
    }

    pub async fn part(&self, server: &str, channel: &str) -> Result<(), BotError> {
        let handle = self.resolve_session(server).await?;
        handle.part(channel.to_string());
        Ok(())
    }

    pub async fn msg(&self, server: &str, target: &str, message: &str) -> Result<(), BotError> {
        let handle = self.resolve_session(server).await?;
        handle.msg(target.to_string(), message.to_string());
        Ok(())
    }

    /// Cancels the Transfer matching `(server, nick, filename)`. Returns
    /// `false` if no cancellable transfer existed for that key.
    pub async fn cancel(&self, server: &str, nick: &str, filename: &str) -> bool {
        let key = TransferKey {
            server: server.to_string(),
            peer_nick: nick.to_string(),
            filename: filename.to_string(),
        };
        self.registry.cancel(&key).await
    }

    pub async fn info(&self) -> InfoSnapshot {
        let networks = {
            let sessions = self.sessions.read().await;
            let mut snaps = Vec::with_capacity(sessions.len());
            for handle in sessions.values() {
                snaps.push(handle.snapshot().await);
            }
            snaps
        };
        let transfers = self.registry.snapshot().await;
        InfoSnapshot { networks, transfers }
    }

    /// Orderly shutdown: QUIT each Session, cancel every in-progress
    /// Transfer, wait up to `SHUTDOWN_GRACE` for them to unwind, then flush
    /// the Registry.
    pub async fn shutdown(&self) {
        tracing::info!("supervisor shutdown: cancelling in-progress transfers");
        for record in self.registry.snapshot().await {
            let key = TransferKey {
                server: record.server,
                peer_nick: record.peer_nick,
                filename: record.filename,
            };
            self.registry.cancel(&key).await;
        }

        {
            let sessions = self.sessions.read().await;
            for handle in sessions.values() {
                handle.shutdown();
            }
        }

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        self.registry.reap(0).await;
        tracing::info!("supervisor shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn config_with_default() -> AppConfig {
        let mut config = AppConfig::default();
        config.default_server_config = Some(ServerConfig::default());
        config
    }

    #[tokio::test]
    async fn resolve_session_is_idempotent() {
        let supervisor = Supervisor::new(config_with_default());
        let result = supervisor.join("irc.example.org", "#chan").await;
        assert!(result.is_ok());
        assert_eq!(supervisor.sessions.read().await.len(), 1);
        let _ = supervisor.join("irc.example.org", "#other").await;
        assert_eq!(supervisor.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_server_is_config_invalid() {
        let supervisor = Supervisor::new(AppConfig::default());
        let result = supervisor.join("irc.example.org", "#chan").await;
        assert!(matches!(result, Err(BotError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn cancel_unknown_transfer_returns_false() {
        let supervisor = Supervisor::new(config_with_default());
        assert!(!supervisor.cancel("irc.example.org", "bot1", "x.bin").await);
    }

    #[tokio::test]
    async fn info_reports_empty_snapshot_initially() {
        let supervisor = Supervisor::new(config_with_default());
        let info = supervisor.info().await;
        assert!(info.networks.is_empty());
        assert!(info.transfers.is_empty());
    }
}
