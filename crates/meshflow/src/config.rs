use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerKind {
    Postgres,
    Memory,
}

// Config is a central place for runtime configuration.
// Everything is loaded from the environment (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub ledger: LedgerKind,
    pub database_url: Option<String>,
    pub migrate_on_startup: bool,
    pub storage: StorageKind,
    pub storage_dir: PathBuf,
    pub public_base_url: String,
    pub max_upload_bytes: usize,
    pub conversion_timeout: Duration,
    pub max_concurrent_conversions: usize,
    pub stale_after: Duration,
    pub watchdog_interval: Option<Duration>,
    pub shutdown_drain: Duration,
    pub grid_resolution: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_nonempty("DATABASE_URL");

        let ledger = match env_nonempty("MESHFLOW_LEDGER") {
            Some(v) => match v.to_lowercase().as_str() {
                "postgres" | "pg" => LedgerKind::Postgres,
                "memory" | "mem" => LedgerKind::Memory,
                other => anyhow::bail!("MESHFLOW_LEDGER must be `postgres` or `memory`, got `{other}`"),
            },
            None if database_url.is_some() => LedgerKind::Postgres,
            None => LedgerKind::Memory,
        };

        if ledger == LedgerKind::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is missing (required by the postgres ledger)");
        }

        let storage = match env_nonempty("MESHFLOW_STORAGE") {
            Some(v) => StorageKind::parse(&v)
                .ok_or_else(|| anyhow::anyhow!("MESHFLOW_STORAGE must be `local` or `memory`, got `{v}`"))?,
            None => StorageKind::Local,
        };

        let bind_addr = env_or_fallback("MESHFLOW_BIND_ADDR", "BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let public_base_url = env_nonempty("MESHFLOW_PUBLIC_BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_default();

        let watchdog_secs: u64 = env_parse("MESHFLOW_WATCHDOG_INTERVAL_SECS")?.unwrap_or(60);

        let cfg = Self {
            bind_addr,
            ledger,
            database_url,
            migrate_on_startup: env_bool("MESHFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
            storage,
            storage_dir: env_nonempty("MESHFLOW_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/blobs")),
            public_base_url,
            max_upload_bytes: env_parse("MESHFLOW_MAX_UPLOAD_BYTES")?.unwrap_or(10 * 1024 * 1024),
            conversion_timeout: Duration::from_millis(
                env_parse("MESHFLOW_CONVERSION_TIMEOUT_MS")?.unwrap_or(60_000),
            ),
            max_concurrent_conversions: env_parse::<usize>("MESHFLOW_MAX_CONCURRENT_CONVERSIONS")?
                .unwrap_or(4)
                .max(1),
            stale_after: Duration::from_secs(env_parse("MESHFLOW_STALE_AFTER_SECS")?.unwrap_or(900)),
            watchdog_interval: (watchdog_secs > 0).then(|| Duration::from_secs(watchdog_secs)),
            shutdown_drain: Duration::from_secs(
                env_parse("MESHFLOW_SHUTDOWN_DRAIN_SECS")?.unwrap_or(30),
            ),
            grid_resolution: env_parse("MESHFLOW_GRID_RESOLUTION")?.unwrap_or(64),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // otherwise the watchdog could fail a conversion that is still running
        if self.stale_after <= self.conversion_timeout {
            anyhow::bail!(
                "MESHFLOW_STALE_AFTER_SECS ({}s) must exceed MESHFLOW_CONVERSION_TIMEOUT_MS ({}ms)",
                self.stale_after.as_secs(),
                self.conversion_timeout.as_millis()
            );
        }
        if self.max_upload_bytes == 0 {
            anyhow::bail!("MESHFLOW_MAX_UPLOAD_BYTES must be > 0");
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    env_nonempty(primary).or_else(|| env_nonempty(fallback))
}

fn env_bool(key: &str) -> Option<bool> {
    env_nonempty(key).map(|v| parse_bool(&v))
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env_nonempty(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key}={v} is invalid: {e}"))
        })
        .transpose()
}
