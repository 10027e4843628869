use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f64),
    #[error("no camera sources configured")]
    NoSources,
}

/// Daemon and CLI configuration: optional TOML file overlaid by `PRESENCE_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root for every default path below.
    pub data_dir: PathBuf,
    /// SQLite database holding users and attendance.
    pub db_path: PathBuf,
    /// Directory of enrollment images.
    pub image_dir: PathBuf,
    /// Trained recognition model artifact.
    pub model_path: PathBuf,
    /// SCRFD detection model (ONNX).
    pub detector_model: PathBuf,
    /// Stream locators, one capture thread each.
    pub sources: Vec<String>,
    /// Chi-square distance below which a face matches.
    pub threshold: f64,
    /// Longest wait for one frame before a source counts as stalled.
    pub frame_timeout: Duration,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    image_dir: Option<PathBuf>,
    model_path: Option<PathBuf>,
    detector_model: Option<PathBuf>,
    sources: Option<Vec<String>>,
    threshold: Option<f64>,
    frame_timeout_ms: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load from `PRESENCE_CONFIG` (if set) and `PRESENCE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path_var = |key: &str| env(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let data_dir = path_var("PRESENCE_DATA_DIR")
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let db_path = path_var("PRESENCE_DB_PATH")
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("attendance.db"));
        let image_dir = path_var("PRESENCE_IMAGE_DIR")
            .or(file.image_dir)
            .unwrap_or_else(|| data_dir.join("faces"));
        let model_path = path_var("PRESENCE_MODEL_PATH")
            .or(file.model_path)
            .unwrap_or_else(|| data_dir.join("model.json"));
        let detector_model = path_var("PRESENCE_DETECTOR_MODEL")
            .or(file.detector_model)
            .unwrap_or_else(|| data_dir.join("models").join("det_10g.onnx"));

        let sources = env("PRESENCE_SOURCES")
            .map(|list| split_sources(&list))
            .or(file.sources)
            .unwrap_or_else(|| vec!["0".to_string()]);

        let threshold = env("PRESENCE_THRESHOLD")
            .and_then(|v| v.parse().ok())
            .or(file.threshold)
            .unwrap_or(presence_core::DEFAULT_THRESHOLD);
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold(threshold));
        }

        let timeout_ms = env("PRESENCE_FRAME_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .or(file.frame_timeout_ms)
            .unwrap_or(5000);

        Ok(Self {
            data_dir,
            db_path,
            image_dir,
            model_path,
            detector_model,
            sources,
            threshold,
            frame_timeout: Duration::from_millis(timeout_ms.max(1)),
        })
    }
}

impl Config {
    /// Configured stream locators; capture needs at least one. Offline tools
    /// never call this, so an empty list only stops the daemon.
    pub fn require_sources(&self) -> Result<&[String], ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        Ok(&self.sources)
    }
}

fn split_sources(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_derive_from_data_home() {
        let config = Config::resolve(FileConfig::default(), env_from(&[("HOME", "/home/op")])).unwrap();
        let data = PathBuf::from("/home/op/.local/share/presence");
        assert_eq!(config.data_dir, data);
        assert_eq!(config.db_path, data.join("attendance.db"));
        assert_eq!(config.image_dir, data.join("faces"));
        assert_eq!(config.model_path, data.join("model.json"));
        assert_eq!(config.detector_model, data.join("models/det_10g.onnx"));
        assert_eq!(config.sources, vec!["0"]);
        assert_eq!(config.threshold, 100.0);
        assert_eq!(config.frame_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            data_dir = "/srv/presence"
            sources = ["/dev/video4"]
            threshold = 80.0
            frame_timeout_ms = 2000
            "#,
        )
        .unwrap();
        let config = Config::resolve(
            file,
            env_from(&[
                ("PRESENCE_SOURCES", "0, dir:/var/replay ,"),
                ("PRESENCE_THRESHOLD", "65.5"),
            ]),
        )
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/srv/presence/attendance.db"));
        assert_eq!(config.sources, vec!["0", "dir:/var/replay"]);
        assert_eq!(config.threshold, 65.5);
        assert_eq!(config.frame_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let config = Config::resolve(
            FileConfig::default(),
            env_from(&[("XDG_DATA_HOME", "/x"), ("PRESENCE_THRESHOLD", "lots")]),
        )
        .unwrap();
        assert_eq!(config.threshold, presence_core::DEFAULT_THRESHOLD);
        assert_eq!(config.data_dir, PathBuf::from("/x/presence"));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let bad = Config::resolve(FileConfig::default(), env_from(&[("PRESENCE_THRESHOLD", "-1")]));
        assert!(matches!(bad, Err(ConfigError::InvalidThreshold(_))));

    }

    #[test]
    fn test_empty_sources_only_fail_capture() {
        let config =
            Config::resolve(FileConfig::default(), env_from(&[("PRESENCE_SOURCES", " , ")])).unwrap();
        assert!(config.sources.is_empty());
        assert!(matches!(config.require_sources(), Err(ConfigError::NoSources)));

        let default = Config::resolve(FileConfig::default(), env_from(&[])).unwrap();
        assert_eq!(default.require_sources().unwrap(), ["0".to_string()]);
    }

    #[test]
    fn test_unknown_file_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.toml");
        std::fs::write(&path, "thresold = 90.0\n").unwrap();
        assert!(matches!(FileConfig::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            FileConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
