//! Environment-driven service configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::REQUEST_TIMEOUT;

/// Everything the service reads from its environment. Defaults are chosen so
/// `replaymux <ws-url>` works with nothing else set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address of the management surface.
    pub listen: SocketAddr,
    /// SQLite database path for replay metadata.
    pub db_path: PathBuf,
    /// Directory screencast frames land in.
    pub videos_dir: PathBuf,
    /// Override for the in-page recorder source.
    pub recording_script_path: Option<PathBuf>,
    /// Host substring identifying challenge iframes.
    pub challenge_host: String,
    pub capture_video: bool,
    /// Bearer token for the metrics endpoint; unset means open (local use).
    pub management_token: Option<String>,
    pub request_timeout: Duration,
    pub viewport: (f64, f64),
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 4110).into(),
            db_path: PathBuf::from("replaymux.sqlite"),
            videos_dir: PathBuf::from("videos"),
            recording_script_path: None,
            challenge_host: "challenges.cloudflare.com".to_string(),
            capture_video: false,
            management_token: None,
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
            viewport: (1280.0, 720.0),
        }
    }
}

impl Config {
    /// Resolves the configuration from `REPLAYMUX_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(listen) = env_var("REPLAYMUX_LISTEN").and_then(|v| v.parse().ok()) {
            config.listen = listen;
        }
        if let Some(db) = env_var("REPLAYMUX_DB") {
            config.db_path = PathBuf::from(db);
        }
        if let Some(dir) = env_var("REPLAYMUX_VIDEOS_DIR") {
            config.videos_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_var("REPLAYMUX_RECORDING_SCRIPT") {
            config.recording_script_path = Some(PathBuf::from(path));
        }
        if let Some(host) = env_var("REPLAYMUX_CHALLENGE_HOST") {
            config.challenge_host = host;
        }
        if let Some(video) = env_var("REPLAYMUX_CAPTURE_VIDEO") {
            config.capture_video = matches!(video.as_str(), "1" | "true" | "yes");
        }
        config.management_token = env_var("REPLAYMUX_MANAGEMENT_TOKEN");
        if let Some(ms) = env_var("REPLAYMUX_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.request_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// The recorder source: the configured script file, or the built-in
    /// bootstrap recorder.
    pub async fn recording_script(&self) -> String {
        if let Some(path) = self.recording_script_path.as_ref() {
            match tokio::fs::read_to_string(path).await {
                Ok(source) => return source,
                Err(err) => {
                    tracing::warn!(
                        "failed to read recording script {}: {err}; using built-in recorder",
                        path.display()
                    );
                }
            }
        }
        crate::javascript::RECORDING_BOOTSTRAP.to_string()
    }

    /// Url the in-page hook beacons to.
    pub fn beacon_url(&self) -> String {
        format!("http://{}/management/cf-solved", self.listen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.listen.port(), 4110);
        assert!(config.beacon_url().ends_with("/management/cf-solved"));
        assert!(!config.capture_video);
    }

    #[tokio::test]
    async fn missing_script_override_falls_back_to_builtin() {
        let config = Config {
            recording_script_path: Some(PathBuf::from("/definitely/not/here.js")),
            ..Config::default()
        };
        let script = config.recording_script().await;
        assert!(script.contains("__browserlessRecording"));
    }
}
