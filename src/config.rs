use std::env;
use std::time::Duration;

/// Runtime configuration, read once at startup from the environment
/// (a `.env` file is honored when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub api_host: String,
    pub api_port: u16,
    pub worker_pool_size: usize,
    pub worker_lease_ttl: Duration,
    pub worker_max_retries: i32,
    pub worker_poll_interval: Duration,
    pub worker_shutdown_grace: Duration,
    pub default_rate_limit_per_minute: i32,
    pub default_max_concurrent_jobs: i32,
    pub event_bus_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL must be set".to_string())?;

        Ok(Self {
            database_url,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 20)?,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parse_env("API_PORT", 8080)?,
            worker_pool_size: parse_env("WORKER_POOL_SIZE", 3)?,
            worker_lease_ttl: Duration::from_secs(parse_env("WORKER_LEASE_TTL_SECONDS", 300)?),
            worker_max_retries: parse_env("WORKER_MAX_RETRIES", 3)?,
            worker_poll_interval: Duration::from_secs(parse_env(
                "WORKER_POLL_INTERVAL_SECONDS",
                1,
            )?),
            worker_shutdown_grace: Duration::from_secs(parse_env(
                "WORKER_SHUTDOWN_GRACE_SECONDS",
                30,
            )?),
            default_rate_limit_per_minute: parse_env("DEFAULT_RATE_LIMIT_PER_MINUTE", 10)?,
            default_max_concurrent_jobs: parse_env("DEFAULT_MAX_CONCURRENT_JOBS", 5)?,
            event_bus_capacity: parse_env("EVENT_BUS_CAPACITY", 256)?,
        })
    }

    /// Reaper cadence: half the lease TTL, so an expired lease is reclaimed
    /// within one tick of expiring.
    pub fn reaper_interval(&self) -> Duration {
        self.worker_lease_ttl / 2
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}
