use axum::http::HeaderValue;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration.
///
/// Values come from an optional TOML file named by `ROLLCALL_CONFIG`,
/// overridden by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen address (default: 0.0.0.0:8000).
    pub bind_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance (exclusive) for a positive match.
    pub match_threshold: f32,
    /// Number of recognition worker threads.
    pub workers: usize,
    /// Attempts per task before a retry-eligible failure becomes final.
    pub max_attempts: u32,
    /// Base delay between attempts; grows linearly with the attempt number.
    pub retry_backoff: Duration,
    /// How long terminal task results stay pollable.
    pub result_ttl: Duration,
    /// Per-observer outbound buffer; an observer that falls this far behind is dropped.
    pub observer_buffer: usize,
    /// Descriptor sidecar endpoint.
    pub extractor_url: String,
    /// Timeout for one descriptor request.
    pub extractor_timeout: Duration,
    /// Fraction of near-black pixels above which a frame counts as faceless.
    pub dark_frame_pct: f32,
    /// Browser origins allowed to call the API; `*` allows any.
    pub cors_origins: Vec<String>,
}

/// File form of [`Config`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind_addr: Option<SocketAddr>,
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    workers: Option<usize>,
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    result_ttl_secs: Option<u64>,
    observer_buffer: Option<usize>,
    extractor_url: Option<String>,
    extractor_timeout_secs: Option<u64>,
    dark_frame_pct: Option<f32>,
    cors_origins: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from the optional file and `ROLLCALL_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Parse a TOML document with environment overrides from `env`.
    pub fn from_toml_str(
        doc: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(doc).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::resolve(file, env)
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        let config = Self {
            bind_addr: env_parse(&env, "ROLLCALL_BIND_ADDR")?
                .or(file.bind_addr)
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000))),
            db_path: env("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("rollcall.db")),
            match_threshold: env_parse(&env, "ROLLCALL_MATCH_THRESHOLD")?
                .or(file.match_threshold)
                .unwrap_or(0.6),
            workers: env_parse(&env, "ROLLCALL_WORKERS")?
                .or(file.workers)
                .unwrap_or(default_workers),
            max_attempts: env_parse(&env, "ROLLCALL_MAX_ATTEMPTS")?
                .or(file.max_attempts)
                .unwrap_or(3),
            retry_backoff: Duration::from_millis(
                env_parse(&env, "ROLLCALL_RETRY_BACKOFF_MS")?
                    .or(file.retry_backoff_ms)
                    .unwrap_or(250),
            ),
            result_ttl: Duration::from_secs(
                env_parse(&env, "ROLLCALL_RESULT_TTL_SECS")?
                    .or(file.result_ttl_secs)
                    .unwrap_or(3600),
            ),
            observer_buffer: env_parse(&env, "ROLLCALL_OBSERVER_BUFFER")?
                .or(file.observer_buffer)
                .unwrap_or(64),
            extractor_url: env("ROLLCALL_EXTRACTOR_URL")
                .or(file.extractor_url)
                .unwrap_or_else(|| "http://127.0.0.1:8500/embed".to_string()),
            extractor_timeout: Duration::from_secs(
                env_parse(&env, "ROLLCALL_EXTRACTOR_TIMEOUT_SECS")?
                    .or(file.extractor_timeout_secs)
                    .unwrap_or(10),
            ),
            dark_frame_pct: env_parse(&env, "ROLLCALL_DARK_FRAME_PCT")?
                .or(file.dark_frame_pct)
                .unwrap_or(0.95),
            cors_origins: env("ROLLCALL_CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|origin| origin.trim().to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .or(file.cors_origins)
                .unwrap_or_else(|| vec!["*".to_string()]),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("must be a positive number, got {}", self.match_threshold),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers",
                reason: "at least one worker is required".into(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.observer_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "observer_buffer",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.dark_frame_pct) {
            return Err(ConfigError::Invalid {
                key: "dark_frame_pct",
                reason: format!("must be within 0..=1, got {}", self.dark_frame_pct),
            });
        }
        if let Some(bad) = self
            .cors_origins
            .iter()
            .find(|origin| origin.as_str() != "*" && HeaderValue::from_str(origin).is_err())
        {
            return Err(ConfigError::Invalid {
                key: "cors_origins",
                reason: format!("{bad:?} is not a valid origin"),
            });
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("", env_of(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/u/.local/share/rollcall/rollcall.db")
        );
        assert!(config.workers >= 1);
        assert_eq!(config.cors_origins, vec!["*"]);
    }

    #[test]
    fn test_cors_origins_from_file_and_env() {
        let doc = "cors_origins = [\"http://dash.local:3000\"]\n";
        let config = Config::from_toml_str(doc, env_of(&[])).unwrap();
        assert_eq!(config.cors_origins, vec!["http://dash.local:3000"]);

        let config = Config::from_toml_str(
            doc,
            env_of(&[("ROLLCALL_CORS_ORIGINS", "http://a.local, http://b.local,")]),
        )
        .unwrap();
        assert_eq!(config.cors_origins, vec!["http://a.local", "http://b.local"]);

        let err = Config::from_toml_str("cors_origins = [\"bad\\norigin\"]", env_of(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "cors_origins", .. }));
    }

    #[test]
    fn test_env_overrides_file() {
        let doc = "match_threshold = 0.5\nworkers = 2\n";
        let config = Config::from_toml_str(
            doc,
            env_of(&[("ROLLCALL_MATCH_THRESHOLD", "0.45")]),
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_rejects_non_positive_threshold() {
        let err = Config::from_toml_str("match_threshold = 0.0", env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "match_threshold", .. }));
    }

    #[test]
    fn test_rejects_unparsable_env() {
        let err =
            Config::from_toml_str("", env_of(&[("ROLLCALL_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ROLLCALL_WORKERS", .. }));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(matches!(
            Config::from_toml_str("admin_password = \"admin123\"", env_of(&[])),
            Err(ConfigError::Parse { .. })
        ));
    }
}
