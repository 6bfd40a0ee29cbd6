//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{StoredToken, TokenStore};
use crate::calling::{CallSettings, EngineSettings, PeerSettings, VideoFallback};

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signaling server base URL, e.g. `https://weconnect.example.com`
    pub server_url: Option<String>,
    /// REST base URL when it differs from the signaling server
    pub api_url: Option<String>,
    /// Bearer token for both REST and signaling
    pub auth_token: Option<StoredToken>,
    /// Our own user id
    pub user_id: Option<String>,
    #[serde(default)]
    pub call: CallConfig,
}

/// `[call]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ring_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub gather_timeout_ms: u64,
    /// Send candidates inside the SDP instead of trickling them.
    pub wait_for_gathering: bool,
    pub video_fallback: VideoFallback,
    /// Address advertised in host candidates.
    pub host_ip: Option<IpAddr>,
    /// Camera device node.
    pub camera: Option<PathBuf>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            connect_timeout_secs: 30,
            gather_timeout_ms: 2000,
            wait_for_gathering: false,
            video_fallback: VideoFallback::AudioOnly,
            host_ip: None,
            camera: None,
        }
    }
}

impl CallConfig {
    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            ring_timeout: Duration::from_secs(self.ring_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            video_fallback: self.video_fallback,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            wait_for_gathering: self.wait_for_gathering,
            gather_timeout: Duration::from_millis(self.gather_timeout_ms),
        }
    }

    pub fn peer_settings(&self) -> PeerSettings {
        PeerSettings {
            host_ip: self.host_ip,
            ..PeerSettings::default()
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "weconnect", "weconnect-call")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn server_url(&self) -> Result<String> {
        self.server_url
            .clone()
            .context("No server configured. Run 'weconnect-call login' first.")
    }

    /// REST base: `api_url`, else the server URL.
    pub fn api_base(&self) -> Result<String> {
        match &self.api_url {
            Some(url) => Ok(url.clone()),
            None => self.server_url(),
        }
    }

    pub fn user_id(&self) -> Result<String> {
        self.user_id
            .clone()
            .context("No user id stored. Run 'weconnect-call login --user-id <id>'.")
    }

    /// A token that is present and not expired.
    pub fn valid_token(&self) -> Result<String> {
        let token = self
            .get_auth_token()
            .context("No auth token. Run 'weconnect-call login' first.")?;
        if token.is_expired() {
            anyhow::bail!("Auth token expired. Run 'weconnect-call login'.");
        }
        Ok(token.token)
    }
}

impl TokenStore for Config {
    fn get_auth_token(&self) -> Option<StoredToken> {
        self.auth_token.clone()
    }

    fn set_auth_token(&mut self, token: StoredToken) {
        self.auth_token = Some(token);
    }

    fn clear_tokens(&mut self) {
        self.auth_token = None;
        self.user_id = None;
    }
}
