// samband/crates/samband/src/config.rs

use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub allowed_origins: String,
    pub database_path: PathBuf,
    pub backup_path: PathBuf,
    pub police_api_url: String,
    pub police_api_timeout_seconds: u64,
    pub db_busy_timeout_seconds: u64,
    pub fetch_interval_minutes: u64,
    pub backup_interval_hours: u64,
    pub cleanup_interval_hours: u64,
    pub backup_retention_days: u32,
    pub fetch_log_retention_days: u32,
    pub rate_limit_per_minute: u64,
    pub api_host: String,
    pub api_port: u16,
    pub environment: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: generate_api_key(),
            allowed_origins: String::new(),
            database_path: PathBuf::from("./data/events.db"),
            backup_path: PathBuf::from("./data/backups"),
            police_api_url: "https://polisen.se/api/events".to_string(),
            police_api_timeout_seconds: 30,
            db_busy_timeout_seconds: 30,
            fetch_interval_minutes: 5,
            backup_interval_hours: 24,
            cleanup_interval_hours: 24,
            backup_retention_days: 30,
            fetch_log_retention_days: 30,
            rate_limit_per_minute: 60,
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            environment: "production".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let api_key = match env::var("API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                warn!("API_KEY not set, generated a random key for this process");
                defaults.api_key
            }
        };

        Ok(Self {
            api_key,
            allowed_origins: env::var("ALLOWED_ORIGINS").unwrap_or(defaults.allowed_origins),
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            backup_path: env::var("BACKUP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_path),
            police_api_url: env::var("POLICE_API_URL").unwrap_or(defaults.police_api_url),
            police_api_timeout_seconds: parse_var(
                "POLICE_API_TIMEOUT",
                defaults.police_api_timeout_seconds,
            )?,
            db_busy_timeout_seconds: parse_var("DB_BUSY_TIMEOUT", defaults.db_busy_timeout_seconds)?,
            fetch_interval_minutes: parse_var(
                "FETCH_INTERVAL_MINUTES",
                defaults.fetch_interval_minutes,
            )?,
            backup_interval_hours: parse_var(
                "BACKUP_INTERVAL_HOURS",
                defaults.backup_interval_hours,
            )?,
            cleanup_interval_hours: parse_var(
                "CLEANUP_INTERVAL_HOURS",
                defaults.cleanup_interval_hours,
            )?,
            backup_retention_days: parse_var(
                "BACKUP_RETENTION_DAYS",
                defaults.backup_retention_days,
            )?,
            fetch_log_retention_days: parse_var(
                "FETCH_LOG_RETENTION_DAYS",
                defaults.fetch_log_retention_days,
            )?,
            rate_limit_per_minute: parse_var(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            )?,
            api_host: env::var("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_var("API_PORT", defaults.api_port)?,
            environment: env::var("ENVIRONMENT").unwrap_or(defaults.environment),
        })
    }

    pub fn allowed_origins_list(&self) -> Vec<String> {
        self.allowed_origins
            .split(',')
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn police_api_timeout(&self) -> Duration {
        Duration::from_secs(self.police_api_timeout_seconds)
    }

    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_secs(self.db_busy_timeout_seconds)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_minutes.max(1) * 60)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_hours.max(1) * 3600)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours.max(1) * 3600)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_path.display());
        info!("- Backups: {}", self.backup_path.display());
        info!("- Police API: {} (timeout {}s)", self.police_api_url, self.police_api_timeout_seconds);
        info!("- DB busy timeout: {}s", self.db_busy_timeout_seconds);
        info!("- Fetch every {} minutes", self.fetch_interval_minutes);
        info!("- Backup every {} hours", self.backup_interval_hours);
        info!("- Cleanup every {} hours", self.cleanup_interval_hours);
        info!(
            "- Retention: backups {} days, fetch log {} days",
            self.backup_retention_days, self.fetch_log_retention_days
        );
        info!("- Rate limit: {}/minute", self.rate_limit_per_minute);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Environment: {}", self.environment);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect()
}
