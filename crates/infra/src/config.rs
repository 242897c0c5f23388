//! Process configuration loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use castline_core::FeedId;

use crate::feed::FeedCacheConfig;
use crate::invalidation::{InvalidationConfig, InvalidationStrategy};
use crate::jobs::JobRunnerConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub feed_id: FeedId,
    pub public_base_url: String,
    pub public_base_path: String,
    pub cache_ttl: Duration,
    pub cache_max_entry_bytes: usize,
    pub cache_max_entries: usize,
    pub cache_sweep_interval: Duration,
    pub invalidation_strategy: InvalidationStrategy,
    pub invalidation_drain_interval: Duration,
    pub job_max_retries: u32,
    pub stale_job_hours: u32,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let feed_id = lookup("CASTLINE_FEED_ID").unwrap_or_else(|| "main".to_string());

        Ok(Self {
            feed_id: FeedId::parse(feed_id).context("CASTLINE_FEED_ID must be a valid feed id")?,
            public_base_url: lookup("CASTLINE_PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            public_base_path: lookup("CASTLINE_PUBLIC_BASE_PATH").unwrap_or_else(|| "/feeds".to_string()),
            cache_ttl: Duration::from_secs(parse_or(&lookup, "CASTLINE_CACHE_TTL_SECS", 300)?),
            cache_max_entry_bytes: parse_or(&lookup, "CASTLINE_CACHE_MAX_ENTRY_BYTES", 5 * 1024 * 1024)?,
            cache_max_entries: parse_or(&lookup, "CASTLINE_CACHE_MAX_ENTRIES", 256)?,
            cache_sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "CASTLINE_CACHE_SWEEP_INTERVAL_SECS",
                60,
            )?),
            invalidation_strategy: parse_or(
                &lookup,
                "CASTLINE_INVALIDATION_STRATEGY",
                InvalidationStrategy::Immediate,
            )?,
            invalidation_drain_interval: Duration::from_secs(parse_or(
                &lookup,
                "CASTLINE_INVALIDATION_DRAIN_INTERVAL_SECS",
                30,
            )?),
            job_max_retries: parse_or(&lookup, "CASTLINE_JOB_MAX_RETRIES", 3)?,
            stale_job_hours: parse_or(&lookup, "CASTLINE_STALE_JOB_HOURS", 2)?,
        })
    }

    pub fn cache(&self) -> FeedCacheConfig {
        FeedCacheConfig::default()
            .with_ttl(self.cache_ttl)
            .with_max_entry_bytes(self.cache_max_entry_bytes)
            .with_max_entries(self.cache_max_entries)
            .with_sweep_interval(self.cache_sweep_interval)
    }

    pub fn invalidation(&self) -> InvalidationConfig {
        InvalidationConfig::default()
            .with_strategy(self.invalidation_strategy)
            .with_public_base_path(self.public_base_path.clone())
    }

    pub fn runner(&self) -> JobRunnerConfig {
        JobRunnerConfig::new(self.feed_id.clone()).with_max_retries(self.job_max_retries)
    }

    /// Public URL of the feed, e.g. `http://localhost:8080/feeds/main`.
    pub fn feed_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            self.public_base_path.trim_matches('/'),
            self.feed_id
        )
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}
