use anyhow::Context;
use chorus_checkpoint::CheckpointConfig;
use chorus_merge::MergeConfig;
use chorus_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Contents of `chorus.toml`. Every table and key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChorusConfig {
    /// Where tasks, the session snapshot and the event log live, relative to the repository.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".chorus")
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            orchestrator: OrchestratorConfig::default(),
            merge: MergeConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl ChorusConfig {
    /// Read `path`. A missing file means all defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read config file '{}'", path.display())
                })
            }
        };
        Self::parse(&text).with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Data directory resolved against the repository root.
    pub fn data_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.data_dir)
    }
}
