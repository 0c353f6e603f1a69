use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine settings, loaded from TOML. Every field has a default, so an empty
/// document is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub store: WriteRetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads for independent lanes. Left out, the available
    /// parallelism is used; see [`SchedulerConfig::worker_count`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    /// Retries for a work item whose dependency is not materialized yet.
    pub dependency_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            dependency_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    #[inline]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Backoff policy at the result-store write boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for WriteRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 10,
        }
    }
}

impl WriteRetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "store.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        match self.scheduler.workers {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "scheduler.workers",
                    reason: "must be at least 1".to_string(),
                })
            }
            Some(n) if n > 1024 => {
                return Err(ConfigError::Invalid {
                    field: "scheduler.workers",
                    reason: format!("{n} exceeds the limit of 1024"),
                })
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").expect("empty config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.scheduler.dependency_retries, 3);
        assert_eq!(config.store.max_attempts, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [scheduler]
            workers = 4

            [store]
            base_backoff_ms = 1
            "#,
        )
        .expect("valid config");
        assert_eq!(config.scheduler.worker_count(), 4);
        assert_eq!(config.scheduler.retry_backoff_ms, 50);
        assert_eq!(config.store.max_attempts, 3);
        assert_eq!(config.store.backoff(1), Duration::from_millis(1));
        assert_eq!(config.store.backoff(3), Duration::from_millis(4));
    }

    #[test]
    fn zero_write_attempts_is_rejected() {
        let err = EngineConfig::from_toml_str("[store]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "store.max_attempts",
                ..
            }
        ));
    }

    #[test]
    fn zero_workers_is_rejected_and_absent_workers_use_the_host() {
        let err = EngineConfig::from_toml_str("[scheduler]\nworkers = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "scheduler.workers",
                ..
            }
        ));
        let config = EngineConfig::from_toml_str("[scheduler]\ndependency_retries = 1\n")
            .expect("workers may be omitted");
        assert_eq!(config.scheduler.workers, None);
        assert!(config.scheduler.worker_count() >= 1);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[scheduler]\ndependency_retries = 7").expect("write config");
        let config = EngineConfig::load(file.path()).expect("load config");
        assert_eq!(config.scheduler.dependency_retries, 7);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("missing.toml");
        match EngineConfig::load(&path) {
            Err(ConfigError::Io { path: reported, .. }) => {
                assert!(reported.ends_with("missing.toml"));
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }
}
