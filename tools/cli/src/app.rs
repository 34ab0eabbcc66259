//! Wiring of the CLI's home directory.
//!
//! ```text
//! <home>/config.json          optional CliConfig
//! <home>/server.json          snapshot of the in-memory server
//! <home>/devices/<user>/      this device's key cache
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use snapvault_common::{SystemClock, UserId};
use snapvault_crypto::{PrimitiveProvider, StandardProvider};
use snapvault_keyring::{
    DeviceFingerprint, KeyCache, KeyManager, KeyStores, KeyringConfig, SharingService,
};
use snapvault_pipeline::{PipelineConfig, PipelineContext};
use snapvault_storage::{FileStore, MemoryBackend};

const CONFIG_FILE: &str = "config.json";
const SERVER_FILE: &str = "server.json";
const DEVICES_DIR: &str = "devices";

/// Settings read from `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub keyring: KeyringConfig,
    pub pipeline: PipelineConfig,
}

impl CliConfig {
    /// Load the config from `home`, falling back to defaults if absent.
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        config.keyring.validate().context("Invalid keyring config")?;
        config.pipeline.validate().context("Invalid pipeline config")?;
        Ok(config)
    }
}

/// One user's session against the home directory.
pub struct App {
    home: PathBuf,
    pub backend: MemoryBackend,
    pub manager: Arc<KeyManager>,
    pub sharing: SharingService,
    pub pipelines: PipelineContext,
}

impl App {
    /// Open `home` for `user`, reading `config.json` if present.
    pub fn open(home: &Path, user: &str) -> Result<Self> {
        let config = CliConfig::load(home)?;
        Self::open_with(home, user, config)
    }

    pub fn open_with(home: &Path, user: &str, config: CliConfig) -> Result<Self> {
        std::fs::create_dir_all(home)
            .with_context(|| format!("Failed to create {}", home.display()))?;

        let server_path = home.join(SERVER_FILE);
        let backend = if server_path.exists() {
            let snapshot = std::fs::read_to_string(&server_path)
                .with_context(|| format!("Failed to read {}", server_path.display()))?;
            MemoryBackend::restore(&snapshot).context("Corrupt server snapshot")?
        } else {
            MemoryBackend::new()
        };

        let user_id = UserId::new(user).context("Invalid user id")?;
        let provider: Arc<dyn PrimitiveProvider> = Arc::new(StandardProvider::new());
        let device_dir = home.join(DEVICES_DIR).join(user_id.as_str());
        let cache = Arc::new(KeyCache::new(
            user_id.clone(),
            DeviceFingerprint::detect(),
            &config.keyring,
            Arc::new(FileStore::new(&device_dir)),
            provider.clone(),
            Arc::new(SystemClock),
        ));

        let manager = Arc::new(KeyManager::new(
            user_id.clone(),
            config.keyring,
            provider.clone(),
            KeyStores {
                accounts: Arc::new(backend.clone()),
                wrapped_keys: Arc::new(backend.clone()),
            },
            cache,
        ));
        let sharing = SharingService::new(
            manager.clone(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
        );
        let pipelines = PipelineContext::new(
            user_id,
            manager.clone(),
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            provider,
        )
        .with_config(config.pipeline);

        debug!(home = %home.display(), "Home directory opened");
        Ok(Self {
            home: home.to_path_buf(),
            backend,
            manager,
            sharing,
            pipelines,
        })
    }

    /// Write the server snapshot back to the home directory.
    pub fn save(&self) -> Result<()> {
        let snapshot = self.backend.snapshot().context("Failed to snapshot server")?;
        let path = self.home.join(SERVER_FILE);
        let temp = self.home.join(format!("{}.tmp", SERVER_FILE));

        std::fs::write(&temp, snapshot)
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        std::fs::rename(&temp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
