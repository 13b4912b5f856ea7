//! Engine configuration.
//!
//! Defaults mirror the production deployment. Every value can be overridden
//! through a `CATALOG_SYNC_*` environment variable so that test rigs and
//! staging installs do not need a rebuild.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, SyncError};

/// Production catalog API.
pub const DEFAULT_API_URL: &str = "https://www.dinkassa.se/api";

/// Delay between two reconciliation passes.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(60);

/// Items requested per page when listing inventory items.
pub const PRODUCT_PAGE_SIZE: usize = 200;

/// Items requested per page when listing categories.
pub const CATEGORY_PAGE_SIZE: usize = 100;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The remote service reports `LastModifiedDateTime` in local wall-clock time
/// (UTC+2) without an offset. This correction is added to local UTC
/// timestamps before comparing.
pub const DEFAULT_REMOTE_CLOCK_OFFSET_SECS: i64 = 7200;

/// Upper bound on how long a quantity request may keep its product's
/// quantity ticket before it is force-released.
pub const DEFAULT_QUANTITY_HOLD_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub data_dir: PathBuf,
    pub poll_delay: Duration,
    pub product_page_size: usize,
    pub category_page_size: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub remote_clock_offset_secs: i64,
    pub quantity_hold_timeout: Duration,
    /// Run passes even while an editing session is active. Debug builds only.
    pub force_while_editing: bool,
    /// Overrides the persisted `sync.enabled` switch at startup.
    pub enable_sync: Option<bool>,
    /// Overrides the persisted `sync.log_events` switch at startup.
    pub log_events: Option<bool>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            data_dir: PathBuf::from("."),
            poll_delay: DEFAULT_POLL_DELAY,
            product_page_size: PRODUCT_PAGE_SIZE,
            category_page_size: CATEGORY_PAGE_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            remote_clock_offset_secs: DEFAULT_REMOTE_CLOCK_OFFSET_SECS,
            quantity_hold_timeout: DEFAULT_QUANTITY_HOLD_TIMEOUT,
            force_while_editing: false,
            enable_sync: None,
            log_events: None,
        }
    }
}

impl SyncConfig {
    /// Build a config from defaults plus `CATALOG_SYNC_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_string("CATALOG_SYNC_API_URL") {
            config.api_url = url;
        }
        if let Some(dir) = env_string("CATALOG_SYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("CATALOG_SYNC_POLL_DELAY_SECS")? {
            config.poll_delay = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("CATALOG_SYNC_PRODUCT_PAGE_SIZE")? {
            config.product_page_size = size;
        }
        if let Some(size) = env_parse::<usize>("CATALOG_SYNC_CATEGORY_PAGE_SIZE")? {
            config.category_page_size = size;
        }
        if let Some(secs) = env_parse::<u64>("CATALOG_SYNC_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CATALOG_SYNC_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<i64>("CATALOG_SYNC_REMOTE_CLOCK_OFFSET_SECS")? {
            config.remote_clock_offset_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("CATALOG_SYNC_QUANTITY_HOLD_TIMEOUT_SECS")? {
            config.quantity_hold_timeout = Duration::from_secs(secs);
        }
        if let Some(force) = env_parse::<bool>("CATALOG_SYNC_FORCE")? {
            if cfg!(debug_assertions) {
                config.force_while_editing = force;
            } else if force {
                warn!("CATALOG_SYNC_FORCE ignored in release builds");
            }
        }

        config.enable_sync = env_parse::<bool>("CATALOG_SYNC_ENABLED")?;
        config.log_events = env_parse::<bool>("CATALOG_SYNC_LOG_EVENTS")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.product_page_size == 0 || self.category_page_size == 0 {
            return Err(SyncError::Config("page sizes must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::Config("request timeout must be positive".into()));
        }
        if self.quantity_hold_timeout < self.request_timeout {
            return Err(SyncError::Config(
                "quantity hold timeout must not be shorter than the request timeout".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{key}: invalid value '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.product_page_size, 200);
        assert_eq!(config.category_page_size, 100);
        assert_eq!(config.remote_clock_offset_secs, 7200);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("CATALOG_SYNC_POLL_DELAY_SECS", "5");
        std::env::set_var("CATALOG_SYNC_API_URL", "http://localhost:9000/api");
        let config = SyncConfig::from_env().unwrap();
        std::env::remove_var("CATALOG_SYNC_POLL_DELAY_SECS");
        std::env::remove_var("CATALOG_SYNC_API_URL");

        assert_eq!(config.poll_delay, Duration::from_secs(5));
        assert_eq!(config.api_url, "http://localhost:9000/api");
        assert_eq!(config.enable_sync, None);
    }

    #[test]
    #[serial]
    fn test_env_switch_overrides() {
        std::env::set_var("CATALOG_SYNC_ENABLED", "true");
        std::env::set_var("CATALOG_SYNC_LOG_EVENTS", "false");
        let config = SyncConfig::from_env().unwrap();
        std::env::remove_var("CATALOG_SYNC_ENABLED");
        std::env::remove_var("CATALOG_SYNC_LOG_EVENTS");

        assert_eq!(config.enable_sync, Some(true));
        assert_eq!(config.log_events, Some(false));
    }

    #[test]
    #[serial]
    fn test_env_rejects_garbage() {
        std::env::set_var("CATALOG_SYNC_PRODUCT_PAGE_SIZE", "lots");
        let result = SyncConfig::from_env();
        std::env::remove_var("CATALOG_SYNC_PRODUCT_PAGE_SIZE");
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_hold_timeout_must_cover_request_timeout() {
        let config = SyncConfig {
            quantity_hold_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
