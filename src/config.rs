//! Application Configuration Module
//!
//! Typed, closed configuration schema: a missing required per-server `host`
//! or an unrecognized key is a startup-fatal `ConfigInvalid`, not a silent
//! default.

use crate::error::BotError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Per-server connection and behavior options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_nick")]
    pub nick: String,
    #[serde(default)]
    pub nickserv_password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub random_nick: bool,
    #[serde(default)]
    pub channels: HashSet<String>,
    #[serde(default)]
    pub also_join: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub rewrite_to_ssend: HashSet<String>,
}

fn default_port() -> u16 {
    6667
}
fn default_nick() -> String {
    "dccbot".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            nick: default_nick(),
            nickserv_password: None,
            use_tls: false,
            verify_ssl: true,
            random_nick: false,
            channels: HashSet::new(),
            also_join: HashMap::new(),
            rewrite_to_ssend: HashSet::new(),
        }
    }
}

/// Process-wide defaults shared by every session and transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default = "default_download_path")]
    pub download_path: String,
    #[serde(default = "default_allowed_mimetypes")]
    pub allowed_mimetypes: HashSet<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_channel_idle_timeout")]
    pub channel_idle_timeout: u64,
    #[serde(default = "default_server_idle_timeout")]
    pub server_idle_timeout: u64,
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout: u64,
    #[serde(default = "default_transfer_list_timeout")]
    pub transfer_list_timeout: u64,
    #[serde(default = "default_true")]
    pub auto_md5sum: bool,
    #[serde(default = "default_incomplete_suffix")]
    pub incomplete_suffix: String,
    #[serde(default)]
    pub ssend_map: HashMap<String, bool>,
    #[serde(default)]
    pub allow_private_ips: bool,
}

fn default_download_path() -> String {
    "./downloads".to_string()
}
fn default_allowed_mimetypes() -> HashSet<String> {
    ["application/octet-stream", "video/x-matroska", "video/mp4", "application/zip"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_file_size() -> u64 {
    20 * 1024 * 1024 * 1024 // 20 GiB
}
fn default_channel_idle_timeout() -> u64 {
    300
}
fn default_server_idle_timeout() -> u64 {
    600
}
fn default_resume_timeout() -> u64 {
    30
}
fn default_transfer_list_timeout() -> u64 {
    3600
}
fn default_incomplete_suffix() -> String {
    ".incomplete".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            download_path: default_download_path(),
            allowed_mimetypes: default_allowed_mimetypes(),
            max_file_size: default_max_file_size(),
            channel_idle_timeout: default_channel_idle_timeout(),
            server_idle_timeout: default_server_idle_timeout(),
            resume_timeout: default_resume_timeout(),
            transfer_list_timeout: default_transfer_list_timeout(),
            auto_md5sum: true,
            incomplete_suffix: default_incomplete_suffix(),
            ssend_map: HashMap::new(),
            allow_private_ips: false,
        }
    }
}

/// Top-level config.json shape: global options plus named servers.
///
/// `deny_unknown_fields` is deliberately omitted here: serde cannot combine
/// it with `#[serde(flatten)]`. Unknown-key rejection still applies to
/// every nested struct (`GlobalConfig`, `ServerConfig`), which is where the
/// operator-facing options actually live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub default_server_config: Option<ServerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            servers: HashMap::new(),
            default_server_config: None,
        }
    }
}

impl AppConfig {
    /// Load config from file. Missing file falls back to defaults (no
    /// servers configured); a present-but-invalid file is a hard error,
    /// since an unrecognized key or bad type almost always means the
    /// operator's config.json drifted from what this binary understands.
    pub fn load(path: &str) -> Result<Self, BotError> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| BotError::ConfigInvalid(format!("{}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file at {}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(BotError::ConfigInvalid(format!("{}: {}", path, e))),
        }
    }

    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        tracing::info!("saved config to {}", path);
        Ok(())
    }

    /// Resolve the config for a given server host: an explicit entry in
    /// `servers`, falling back to `default_server_config` with `host`
    /// filled in, or `ConfigInvalid` if neither exists.
    pub fn resolve_server(&self, host: &str) -> Result<ServerConfig, BotError> {
        if let Some(cfg) = self.servers.get(host) {
            return Ok(cfg.clone());
        }
        if let Some(default) = &self.default_server_config {
            let mut cfg = default.clone();
            cfg.host = host.to_string();
            return Ok(cfg);
        }
        Err(BotError::ConfigInvalid(format!(
            "no server config for {host} and no default_server_config set"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GlobalConfig::default();
        assert!(config.auto_md5sum);
        assert_eq!(config.incomplete_suffix, ".incomplete");
        assert!(config.max_file_size > 0);
        assert!(!config.allow_private_ips);
    }

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 6667);
        assert_eq!(server.nick, "dccbot");
        assert!(server.verify_ssl);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load("/nonexistent/path/config.json").unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn unknown_key_is_config_invalid() {
        let json = r#"{"download_path":"./d","bogus_field":true}"#;
        let result: Result<AppConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn resolve_server_falls_back_to_default_config() {
        let mut config = AppConfig::default();
        config.default_server_config = Some(ServerConfig {
            host: String::new(),
            ..ServerConfig::default()
        });
        let resolved = config.resolve_server("irc.example.org").unwrap();
        assert_eq!(resolved.host, "irc.example.org");
    }

    #[test]
    fn resolve_server_errors_without_default() {
        let config = AppConfig::default();
        assert!(config.resolve_server("irc.example.org").is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let mut config = AppConfig::default();
        config.servers.insert(
            "irc.example.org".to_string(),
            ServerConfig {
                host: "irc.example.org".to_string(),
                ..ServerConfig::default()
            },
        );
        let json = serde_json::to_string(&config).unwrap();
        let loaded: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.servers.len(), 1);
    }
}
