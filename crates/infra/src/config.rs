//! Environment-driven service configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use crate::sync::SyncConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Settings read once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// When set, the ledger and catalog live in Postgres.
    pub database_url: Option<String>,
    pub sync_timeout: Duration,
    pub sync_page_limit: usize,
    /// `None` disables the background scheduler.
    pub sync_interval: Option<Duration>,
    pub sync_history_limit: usize,
    /// Webhook signing secrets keyed by lowercase provider name.
    pub webhook_secrets: BTreeMap<String, String>,
}

impl core::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url.as_ref().map(|_| "***"))
            .field("sync_timeout", &self.sync_timeout)
            .field("sync_page_limit", &self.sync_page_limit)
            .field("sync_interval", &self.sync_interval)
            .field("sync_history_limit", &self.sync_history_limit)
            .field("webhook_secrets", &self.webhook_secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            sync_timeout: Duration::from_secs(30),
            sync_page_limit: 50,
            sync_interval: Some(Duration::from_secs(300)),
            sync_history_limit: 100,
            webhook_secrets: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::default()
            .with_step_timeout(self.sync_timeout)
            .with_page_limit(self.sync_page_limit)
            .with_history_limit(self.sync_history_limit)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit `(name, value)` pairs; unknown names are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let key = key.as_ref();
            let value: String = value.into();
            match key {
                "STOCKLINE_BIND_ADDR" => {
                    config.bind_addr = value
                        .parse()
                        .with_context(|| format!("STOCKLINE_BIND_ADDR is not an address: {value}"))?;
                }
                "DATABASE_URL" if !value.trim().is_empty() => {
                    config.database_url = Some(value);
                }
                "SYNC_TIMEOUT_SECS" => {
                    config.sync_timeout = Duration::from_secs(parse_number(key, &value)?);
                }
                "SYNC_PAGE_LIMIT" => {
                    config.sync_page_limit = parse_number::<usize>(key, &value)?.max(1);
                }
                "SYNC_INTERVAL_SECS" => {
                    let secs: u64 = parse_number(key, &value)?;
                    config.sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "SYNC_HISTORY_LIMIT" => {
                    config.sync_history_limit = parse_number::<usize>(key, &value)?.max(1);
                }
                _ => {
                    if let Some(provider) = key.strip_prefix("WEBHOOK_SECRET_") {
                        if !value.is_empty() {
                            config
                                .webhook_secrets
                                .insert(provider.to_ascii_lowercase(), value);
                        }
                    }
                }
            }
        }
        Ok(config)
    }
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: core::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = AppConfig::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
        assert_eq!(config.sync_page_limit, 50);
        assert_eq!(config.sync_interval, Some(Duration::from_secs(300)));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn sync_settings_flow_into_sync_config() {
        let config = AppConfig::from_vars([("SYNC_TIMEOUT_SECS", "5"), ("SYNC_PAGE_LIMIT", "3")])
            .unwrap();
        let sync = config.sync_config();
        assert_eq!(sync.step_timeout, Duration::from_secs(5));
        assert_eq!(sync.page_limit, 3);
        assert_eq!(sync.history_limit, 100);
    }

    #[test]
    fn zero_interval_disables_scheduler() {
        let config = AppConfig::from_vars([("SYNC_INTERVAL_SECS", "0")]).unwrap();
        assert_eq!(config.sync_interval, None);
    }

    #[test]
    fn webhook_secrets_are_keyed_by_provider() {
        let config = AppConfig::from_vars([
            ("WEBHOOK_SECRET_SHOPIFY", "s3cret"),
            ("WEBHOOK_SECRET_ZOHO", ""),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert_eq!(config.webhook_secrets.get("shopify").map(String::as_str), Some("s3cret"));
        assert!(!config.webhook_secrets.contains_key("zoho"));
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = AppConfig::from_vars([("SYNC_PAGE_LIMIT", "lots")]).unwrap_err();
        assert!(err.to_string().contains("SYNC_PAGE_LIMIT"));
    }

    #[test]
    fn debug_hides_secrets() {
        let config = AppConfig::from_vars([
            ("DATABASE_URL", "postgres://user:pw@db/stock"),
            ("WEBHOOK_SECRET_SHOPIFY", "s3cret"),
        ])
        .unwrap();
        let out = format!("{config:?}");
        assert!(!out.contains("pw@db"));
        assert!(!out.contains("s3cret"));
    }
}
