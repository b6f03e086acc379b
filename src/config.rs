use serde::Deserialize;
use anyhow::Result;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::str::FromStr;

fn default_max_file_size() -> usize {
    // 10 MB in bytes
    10 * 1024 * 1024
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Sample size used when a run request does not name one.
    pub default_sample_size: usize,
    /// Rows materialized from raw files when no sample size is set.
    pub preview_row_cap: usize,
    pub max_file_size: usize,
    pub cache_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            default_sample_size: 100,
            preview_row_cap: 1000,
            max_file_size: default_max_file_size(),
            cache_capacity: 64,
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        // Load .env file first
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();

        Ok(Config {
            bind_addr: parse_var(&lookup, "PREVIEW_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            default_sample_size: parse_var(&lookup, "PREVIEW_DEFAULT_SAMPLE_SIZE")?
                .unwrap_or(defaults.default_sample_size),
            preview_row_cap: parse_var(&lookup, "PREVIEW_ROW_CAP")?.unwrap_or(defaults.preview_row_cap),
            max_file_size: parse_var(&lookup, "PREVIEW_MAX_FILE_SIZE")?.unwrap_or(defaults.max_file_size),
            cache_capacity: parse_var(&lookup, "PREVIEW_CACHE_CAPACITY")?.unwrap_or(defaults.cache_capacity),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}={:?}: {}", key, raw, e)),
    }
}

pub fn load_config() -> Result<Config> {
    Config::new()
}
