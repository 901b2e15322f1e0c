use std::str::FromStr;

use camino::Utf8PathBuf;

use crate::error::SyncError;

pub const DEFAULT_BASE_URL: &str = "https://api.artdatabanken.se/taxonservice/v1";
pub const DEFAULT_ROOT_NAME: &str = "Lepidoptera";
pub const DEFAULT_CULTURE: &str = "sv_SE";
pub const DEFAULT_TTL_SECONDS: u64 = 0;
pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_DATA_ROOT: &str = "data";

/// Resolved pipeline configuration. Built once at startup and passed into
/// the components that need it; there is no other configuration channel.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: String,
    pub base_url: String,
    pub root_name: String,
    pub culture: String,
    pub ttl_seconds: u64,
    pub batch_size: usize,
    pub timeout_seconds: u64,
    pub fast_exit: bool,
    pub data_root: Utf8PathBuf,
    pub cache_root: Utf8PathBuf,
    pub db_path: Utf8PathBuf,
}

/// CLI-level overrides. Anything left `None` falls back to the environment
/// and then to the built-in default.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub culture: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub batch_size: Option<usize>,
    pub timeout_seconds: Option<u64>,
    pub no_fast_exit: bool,
    pub data_root: Option<Utf8PathBuf>,
    pub db_path: Option<Utf8PathBuf>,
}

impl SyncConfig {
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self, SyncError> {
        Self::resolve_from(overrides, &|key| std::env::var(key).ok())
    }

    /// Resolution against an explicit environment lookup, so tests can run
    /// without touching the process environment.
    pub fn resolve_from(
        overrides: &ConfigOverrides,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, SyncError> {
        let api_key = env("ARTDATABANKEN_SUBSCRIPTION_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(SyncError::MissingApiKey)?;

        let base_url = env("DYNTAXA_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let root_name = env("DYNTAXA_ROOT_NAME").unwrap_or_else(|| DEFAULT_ROOT_NAME.to_string());

        let culture = overrides
            .culture
            .clone()
            .or_else(|| env("DYNTAXA_CULTURE"))
            .unwrap_or_else(|| DEFAULT_CULTURE.to_string());

        let ttl_seconds = match overrides.ttl_seconds {
            Some(value) => value,
            None => parse_env(env, "DYNTAXA_CACHE_TTL_SECONDS")?.unwrap_or(DEFAULT_TTL_SECONDS),
        };
        let batch_size = match overrides.batch_size {
            Some(value) => value,
            None => parse_env(env, "DYNTAXA_POST_BATCH_SIZE")?.unwrap_or(DEFAULT_BATCH_SIZE),
        };
        if batch_size == 0 {
            return Err(SyncError::InvalidConfig {
                key: "batch_size".to_string(),
                value: "0".to_string(),
            });
        }
        let timeout_seconds = match overrides.timeout_seconds {
            Some(value) => value,
            None => {
                parse_env(env, "DYNTAXA_HTTP_TIMEOUT_SECONDS")?.unwrap_or(DEFAULT_TIMEOUT_SECONDS)
            }
        };

        let fast_exit = if overrides.no_fast_exit {
            false
        } else {
            env("DYNTAXA_FAST_EXIT").as_deref() != Some("0")
        };

        let data_root = overrides
            .data_root
            .clone()
            .or_else(|| env("DYNTAXA_DATA_ROOT").map(Utf8PathBuf::from))
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_DATA_ROOT));
        let cache_root = env("DYNTAXA_CACHE_ROOT")
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| data_root.join("cache"));
        let db_path = overrides
            .db_path
            .clone()
            .or_else(|| env("DYNTAXA_DB").map(Utf8PathBuf::from))
            .unwrap_or_else(|| data_root.join("db").join("dyntaxa.sqlite"));

        Ok(Self {
            api_key,
            base_url,
            root_name,
            culture,
            ttl_seconds,
            batch_size,
            timeout_seconds,
            fast_exit,
            data_root,
            cache_root,
            db_path,
        })
    }
}

fn parse_env<T: FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, SyncError> {
    match env(key) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| SyncError::InvalidConfig {
            key: key.to_string(),
            value,
        }),
    }
}
