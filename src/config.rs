//! Daemon configuration.
//! A JSON file where every field is optional; missing fields and a missing
//! file fall back to defaults. CLI flags override after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::{CaptureBackend, CaptureRegion};
use crate::dub::CorpusOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Share of the screen height, from the bottom, that holds subtitles.
    pub bottom_fraction: f64,
    /// Screenshot tool; `None` probes grim, maim, scrot in that order.
    pub backend: Option<CaptureBackend>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            bottom_fraction: 1.0 / 3.0,
            backend: None,
        }
    }
}

impl CaptureConfig {
    pub fn region(&self) -> CaptureRegion {
        CaptureRegion::BottomFraction(self.bottom_fraction)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub python_bin: String,
    pub worker_script: PathBuf,
    pub lang: String,
    pub health_interval_secs: u64,
    /// Deadline for one worker reply; a worker that misses it is restarted.
    pub request_timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            worker_script: PathBuf::from("python-worker/worker.py"),
            lang: "en".to_string(),
            health_interval_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub middleware_url: String,
    pub timeout_secs: u64,
    pub max_audio_bytes: usize,
}

impl OcrConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            middleware_url: "http://127.0.0.1:2731".to_string(),
            timeout_secs: 30,
            max_audio_bytes: 16 * 1024 * 1024,
        }
    }
}

impl RealtimeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub corpus_path: PathBuf,
    /// Base directory for relative audio paths in the corpus.
    pub audio_root: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub capture: CaptureConfig,
    pub ocr: OcrConfig,
    pub realtime: RealtimeConfig,
    /// LRU cap on the played set; unbounded when absent.
    pub played_capacity: Option<usize>,
    pub ignored_characters: Vec<String>,
    pub history_db: Option<PathBuf>,
    /// Seed the played set from `history_db` at startup.
    pub resume_from_history: bool,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            corpus_path: PathBuf::from("saves/dub_result_manifest.json"),
            audio_root: None,
            poll_interval_ms: 200,
            capture: CaptureConfig::default(),
            ocr: OcrConfig::default(),
            realtime: RealtimeConfig::default(),
            played_capacity: None,
            ignored_characters: vec!["???".to_string(), "Crowd".to_string(), "Everyone".to_string()],
            history_db: None,
            resume_from_history: false,
            log_format: LogFormat::Pretty,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.ocr.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ocr.request_timeout_secs must be positive".into()));
        }
        let fraction = self.capture.bottom_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "capture.bottom_fraction must be in (0, 1], got {fraction}"
            )));
        }
        if self.resume_from_history && self.history_db.is_none() {
            return Err(ConfigError::Invalid("resume_from_history requires history_db".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn corpus_options(&self) -> CorpusOptions {
        CorpusOptions {
            audio_root: self.audio_root.clone(),
            ignored_characters: self.ignored_characters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(200));
        assert!(!config.realtime.enabled);
        assert_eq!(config.realtime.middleware_url, "http://127.0.0.1:2731");
        assert_eq!(config.capture.region(), CaptureRegion::BottomFraction(1.0 / 3.0));
        assert!(config.played_capacity.is_none());
        assert_eq!(config.ocr.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dubplay.json");
        std::fs::write(
            &path,
            r#"{"realtime": {"enabled": true}, "capture": {"backend": "grim"}, "log_format": "json"}"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert!(config.realtime.enabled);
        assert_eq!(config.realtime.timeout_secs, 30);
        assert_eq!(config.capture.backend, Some(CaptureBackend::Grim));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.ignored_characters.len(), 3);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.poll_interval_ms, 200);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(DaemonConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validation() {
        let mut config = DaemonConfig::default();
        config.capture.bottom_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.ocr.request_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.resume_from_history = true;
        assert!(config.validate().is_err());
        config.history_db = Some(PathBuf::from("history.db"));
        assert!(config.validate().is_ok());
    }
}
