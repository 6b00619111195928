use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_VIEWER_CONFIG: &str = include_str!("data/viewer_config.json");

/// Environment variable naming a JSON file that replaces the builtin config.
pub const VIEWER_CONFIG_ENV: &str = "VIEWER_CONFIG_PATH";

pub const MIN_PLAYBACK_INTERVAL_MS: u64 = 50;
pub const MAX_PLAYBACK_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    endpoint: String,
    playback_interval_ms: u64,
    step_timeout_ms: u64,
    reconnect_delay_ms: u64,
    reset_on_connect: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:3000/ws".to_string(),
            playback_interval_ms: 200,
            step_timeout_ms: 5_000,
            reconnect_delay_ms: 2_000,
            reset_on_connect: true,
        }
    }
}

impl ViewerConfig {
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_VIEWER_CONFIG).expect("builtin viewer config should parse")
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ViewerConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ViewerConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config = ViewerConfig::from_json_str(&contents)?;
        Ok(config)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Pacing of local playback through stored history.
    pub fn playback_interval(&self) -> Duration {
        Duration::from_millis(
            self.playback_interval_ms
                .clamp(MIN_PLAYBACK_INTERVAL_MS, MAX_PLAYBACK_INTERVAL_MS),
        )
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reset_on_connect(&self) -> bool {
        self.reset_on_connect
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_playback_interval_ms(mut self, interval_ms: u64) -> Self {
        self.playback_interval_ms = interval_ms;
        self
    }

    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = timeout_ms;
        self
    }
}

#[derive(Debug, Error)]
pub enum ViewerConfigError {
    #[error("failed to parse viewer config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read viewer config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Load the config named by [`VIEWER_CONFIG_ENV`], falling back to the
/// builtin document. Returns the file path when one was used.
pub fn load_viewer_config_from_env() -> (ViewerConfig, Option<PathBuf>) {
    let Some(path) = env::var(VIEWER_CONFIG_ENV).ok().map(PathBuf::from) else {
        tracing::info!(target: "viewer::config", "viewer_config.loaded=builtin");
        return (ViewerConfig::builtin(), None);
    };

    match ViewerConfig::from_file(&path) {
        Ok(config) => {
            tracing::info!(
                target: "viewer::config",
                path = %path.display(),
                "viewer_config.loaded=file"
            );
            (config, Some(path))
        }
        Err(err) => {
            tracing::warn!(
                target: "viewer::config",
                path = %path.display(),
                error = %err,
                "viewer_config.load_failed"
            );
            (ViewerConfig::builtin(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_matches_defaults() {
        assert_eq!(ViewerConfig::builtin(), ViewerConfig::default());
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config = ViewerConfig::from_json_str(r#"{"endpoint": "ws://sim.local:9000/ws"}"#)
            .expect("config parses");
        assert_eq!(config.endpoint(), "ws://sim.local:9000/ws");
        assert_eq!(config.step_timeout(), Duration::from_secs(5));
        assert!(config.reset_on_connect());
    }

    #[test]
    fn playback_interval_is_clamped() {
        let fast = ViewerConfig::default().with_playback_interval_ms(1);
        assert_eq!(fast.playback_interval(), Duration::from_millis(50));
        let slow = ViewerConfig::default().with_playback_interval_ms(60_000);
        assert_eq!(slow.playback_interval(), Duration::from_secs(5));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ViewerConfig::from_file(Path::new("/nonexistent/viewer.json"))
            .expect_err("file does not exist");
        assert!(matches!(err, ViewerConfigError::ReadFailed { .. }));
        assert!(err.to_string().contains("viewer.json"));
    }
}
