use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 5)
    pub db_max_connections: u32,

    /// Bot token used to resolve the sending identity
    pub discord_bot_token: String,

    /// Base URL of the Discord REST API (default: v10)
    pub discord_api_url: String,

    /// Request timeout for outbound webhook calls in seconds (default: 15)
    pub http_timeout_secs: u64,

    /// Path of the queue snapshot file (default: queue.json)
    pub queue_file: String,

    /// Delay between two deliveries in milliseconds (default: 250)
    pub queue_delay_ms: u64,

    /// Cooldown after a remote 5xx in milliseconds (default: 300000 = 5 min)
    pub queue_slowmode_ms: u64,

    /// Interval between two queue snapshots in milliseconds (default: 60000)
    pub queue_backup_interval_ms: u64,

    /// Path of the pending broadcast document
    pub broadcast_file: String,

    /// Interval between two broadcast checks in seconds (default: 3600)
    pub broadcast_interval_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 5)?,
            discord_bot_token: std::env::var("DISCORD_BOT_TOKEN").map_err(|_| {
                anyhow::anyhow!("DISCORD_BOT_TOKEN environment variable is required")
            })?,
            discord_api_url: std::env::var("DISCORD_API_URL")
                .unwrap_or_else(|_| "https://discord.com/api/v10".to_string()),
            http_timeout_secs: parse_var("HTTP_TIMEOUT_SECS", 15)?,
            queue_file: std::env::var("QUEUE_FILE").unwrap_or_else(|_| "queue.json".to_string()),
            queue_delay_ms: parse_var("QUEUE_DELAY_MS", 250)?,
            queue_slowmode_ms: parse_var("QUEUE_SLOWMODE_MS", 300_000)?,
            queue_backup_interval_ms: parse_var("QUEUE_BACKUP_INTERVAL_MS", 60_000)?,
            broadcast_file: std::env::var("BROADCAST_FILE")
                .unwrap_or_else(|_| "data/broadcast.json".to_string()),
            broadcast_interval_secs: parse_var("BROADCAST_INTERVAL_SECS", 3600)?,
        })
    }

    pub fn queue_delay(&self) -> Duration {
        Duration::from_millis(self.queue_delay_ms)
    }

    pub fn slowmode_delay(&self) -> Duration {
        Duration::from_millis(self.queue_slowmode_ms)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.queue_backup_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }
}

/// Read a numeric variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u64 = parse_var("HERALD_TEST_UNSET_VARIABLE", 250).unwrap();
        assert_eq!(value, 250);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("HERALD_TEST_GARBAGE_VARIABLE", "quarter second") };
        let result: anyhow::Result<u64> = parse_var("HERALD_TEST_GARBAGE_VARIABLE", 250);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("HERALD_TEST_GARBAGE_VARIABLE")
        );
    }

    #[test]
    fn test_parse_var_reads_value() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("HERALD_TEST_SET_VARIABLE", " 1500 ") };
        let value: u64 = parse_var("HERALD_TEST_SET_VARIABLE", 250).unwrap();
        assert_eq!(value, 1500);
    }
}
