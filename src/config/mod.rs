use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub research: ResearchConfig,
    pub lock: LockConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Defaults for research sessions and graph operations
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
    pub default_max_depth: u32,
    /// Number of path executions before a session's budget is exhausted.
    pub execution_budget: Option<u32>,
}

/// Session lock configuration
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub stale_after_secs: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/research.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = ResearchConfig::default();
        let research = ResearchConfig {
            max_iterations: parse_var("RESEARCH_MAX_ITERATIONS").unwrap_or(defaults.max_iterations),
            confidence_threshold: parse_var("RESEARCH_CONFIDENCE_THRESHOLD")
                .unwrap_or(defaults.confidence_threshold),
            default_max_depth: parse_var("RESEARCH_MAX_DEPTH")
                .unwrap_or(defaults.default_max_depth),
            execution_budget: parse_var("EXECUTION_BUDGET"),
        };

        if !(0.0..=1.0).contains(&research.confidence_threshold) {
            return Err(AppError::Config {
                message: format!(
                    "RESEARCH_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                    research.confidence_threshold
                ),
            });
        }
        if research.max_iterations == 0 {
            return Err(AppError::Config {
                message: "RESEARCH_MAX_ITERATIONS must be at least 1".to_string(),
            });
        }

        let lock_defaults = LockConfig::default();
        let lock = LockConfig {
            stale_after_secs: parse_var("LOCK_STALE_AFTER_SECS")
                .unwrap_or(lock_defaults.stale_after_secs),
            retry_delay_ms: parse_var("LOCK_RETRY_DELAY_MS").unwrap_or(lock_defaults.retry_delay_ms),
            max_retries: parse_var("LOCK_MAX_RETRIES").unwrap_or(lock_defaults.max_retries),
        };

        Ok(Config {
            database,
            logging,
            research,
            lock,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            confidence_threshold: 0.9,
            default_max_depth: 5,
            execution_budget: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            retry_delay_ms: 30_000,
            max_retries: 10,
        }
    }
}

impl LockConfig {
    /// Age after which a held lock may be taken over.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Delay between lock acquisition attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
