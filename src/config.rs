//! Runtime configuration
//!
//! Settings live in the `app_settings` key/value table so operators can tune a
//! running deployment; [`DispatchConfig`] reads them with defaults.

use std::str::FromStr;
use std::path::PathBuf;
use std::time::Duration;
use rusqlite::{params, OptionalExtension};

use crate::db::{now_millis, Database};
use crate::queue_store::DEFAULT_MAX_ATTEMPTS;
use crate::traits::StoreError;

pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.db.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        tracing::debug!(key = %key, found = value.is_some(), "Setting get");
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tracing::debug!(key = %key, "Setting set");
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_millis()],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        tracing::debug!(key = %key, "Setting delete");
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM app_settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.map(|v| v == "true").unwrap_or(false))
    }

    /// Parse a setting, falling back to `default` when missing.
    /// An unparseable value is a validation error, not a silent default.
    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, StoreError> {
        match self.get(key)? {
            Some(raw) => raw.trim().parse().map_err(|_| {
                StoreError::Validation(format!("setting '{}' has invalid value '{}'", key, raw))
            }),
            None => Ok(default),
        }
    }
}

/// Tunables for the dispatch engine, watchdog and retention tasks
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub worker_count: usize,
    pub max_attempts: u32,
    pub high_priority_first: bool,
    /// Sleep bounds when a claim finds no work
    pub idle_backoff_min: Duration,
    pub idle_backoff_max: Duration,
    /// Requeue delay: base * 2^attempts, capped at max, plus up to `retry_jitter`
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_jitter: Duration,
    pub send_timeout: Duration,
    pub lease_timeout: Duration,
    pub watchdog_interval: Duration,
    /// Consecutive persistence failures tolerated before a worker halts
    pub store_retry_limit: u32,
    pub store_retry_backoff: Duration,
    pub retention_days: u32,
    pub retention_interval: Duration,
    pub archive_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            high_priority_first: true,
            idle_backoff_min: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(5),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(3600),
            retry_jitter: Duration::from_millis(500),
            send_timeout: Duration::from_secs(25),
            lease_timeout: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(30),
            store_retry_limit: 5,
            store_retry_backoff: Duration::from_millis(200),
            retention_days: 30,
            retention_interval: Duration::from_secs(3600),
            archive_dir: None,
        }
    }
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl DispatchConfig {
    /// Load from the settings table; missing keys keep their defaults
    pub fn load(settings: &SettingsStore) -> Result<Self, StoreError> {
        let d = Self::default();
        let ms = |v: Duration| v.as_millis() as u64;

        let config = Self {
            worker_count: settings.get_parsed("dispatch.worker_count", d.worker_count)?,
            max_attempts: settings.get_parsed("dispatch.max_attempts", d.max_attempts)?,
            high_priority_first: settings
                .get_parsed("dispatch.high_priority_first", d.high_priority_first)?,
            idle_backoff_min: millis(settings.get_parsed("dispatch.idle_backoff_min_ms", ms(d.idle_backoff_min))?),
            idle_backoff_max: millis(settings.get_parsed("dispatch.idle_backoff_max_ms", ms(d.idle_backoff_max))?),
            retry_base: millis(settings.get_parsed("dispatch.retry_base_ms", ms(d.retry_base))?),
            retry_max: millis(settings.get_parsed("dispatch.retry_max_ms", ms(d.retry_max))?),
            retry_jitter: millis(settings.get_parsed("dispatch.retry_jitter_ms", ms(d.retry_jitter))?),
            send_timeout: millis(settings.get_parsed("dispatch.send_timeout_ms", ms(d.send_timeout))?),
            lease_timeout: millis(settings.get_parsed("dispatch.lease_timeout_ms", ms(d.lease_timeout))?),
            watchdog_interval: millis(settings.get_parsed("dispatch.watchdog_interval_ms", ms(d.watchdog_interval))?),
            store_retry_limit: settings.get_parsed("dispatch.store_retry_limit", d.store_retry_limit)?,
            store_retry_backoff: millis(settings.get_parsed("dispatch.store_retry_backoff_ms", ms(d.store_retry_backoff))?),
            retention_days: settings.get_parsed("retention.days", d.retention_days)?,
            retention_interval: millis(settings.get_parsed("retention.interval_ms", ms(d.retention_interval))?),
            archive_dir: settings.get("retention.archive_dir")?.map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.worker_count == 0 {
            return Err(StoreError::Validation("dispatch.worker_count must be at least 1".to_string()));
        }
        if self.idle_backoff_min > self.idle_backoff_max {
            return Err(StoreError::Validation(
                "dispatch.idle_backoff_min_ms must not exceed dispatch.idle_backoff_max_ms".to_string(),
            ));
        }
        if self.send_timeout >= self.lease_timeout {
            // A send that outlives its lease would be reclaimed while still running
            return Err(StoreError::Validation(
                "dispatch.send_timeout_ms must be shorter than dispatch.lease_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SettingsStore {
        SettingsStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_set_and_get() {
        let settings = settings();
        settings.set("relay.url", "https://relay.example.com/send").unwrap();
        assert_eq!(
            settings.get("relay.url").unwrap(),
            Some("https://relay.example.com/send".to_string())
        );
    }

    #[test]
    fn test_get_missing_key() {
        assert_eq!(settings().get("nonexistent_key").unwrap(), None);
    }

    #[test]
    fn test_delete() {
        let settings = settings();
        settings.set("temp_key", "temp_value").unwrap();
        settings.delete("temp_key").unwrap();
        assert_eq!(settings.get("temp_key").unwrap(), None);
    }

    #[test]
    fn test_set_overwrites() {
        let settings = settings();
        settings.set("key", "original").unwrap();
        settings.set("key", "updated").unwrap();
        assert_eq!(settings.get("key").unwrap(), Some("updated".to_string()));
    }

    #[test]
    fn test_get_bool() {
        let settings = settings();
        settings.set("enabled", "true").unwrap();
        assert!(settings.get_bool("enabled").unwrap());

        settings.set("enabled", "not_a_bool").unwrap();
        assert!(!settings.get_bool("enabled").unwrap());

        assert!(!settings.get_bool("missing").unwrap());
    }

    #[test]
    fn test_load_defaults() {
        let config = DispatchConfig::load(&settings()).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.lease_timeout, Duration::from_secs(300));
        assert!(config.high_priority_first);
        assert!(config.archive_dir.is_none());
    }

    #[test]
    fn test_load_overrides() {
        let settings = settings();
        settings.set("dispatch.max_attempts", "3").unwrap();
        settings.set("dispatch.high_priority_first", "false").unwrap();
        settings.set("dispatch.retry_base_ms", "250").unwrap();
        settings.set("retention.archive_dir", "/var/lib/dispatch/archive").unwrap();

        let config = DispatchConfig::load(&settings).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert!(!config.high_priority_first);
        assert_eq!(config.retry_base, Duration::from_millis(250));
        assert_eq!(config.archive_dir, Some(PathBuf::from("/var/lib/dispatch/archive")));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let settings = settings();
        settings.set("dispatch.worker_count", "many").unwrap();
        assert!(matches!(DispatchConfig::load(&settings), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_send_timeout_must_fit_in_lease() {
        let settings = settings();
        settings.set("dispatch.send_timeout_ms", "600000").unwrap();
        assert!(DispatchConfig::load(&settings).is_err());
    }
}
