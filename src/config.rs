//! Configuration loader for the `resultflow` pipeline.
//!
//! This module centralizes all runtime configuration values and their
//! defaults, loading from environment variables (with optional `.env` file
//! support provided by the caller). Every tuning constant the pipeline
//! depends on (send caps, delays, the SMS quiet-hours window, the
//! hourly-chart rotation) is a named value here rather than a magic number
//! at its point of use.
use std::env;

use anyhow::{anyhow, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional signed integer environment variable with a default value.
macro_rules! parse_env_i32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<i32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent
/// configuration snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// SQLite connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Directory the lab feed drops pipe-delimited result files into.
    /// Empty string disables the import step.
    pub feed_import_dir: String,

    /// Base URL for the per-result link embedded in outbound messages.
    pub result_url_base: String,

    /// Maximum emails sent in one notification pass (provider throttling).
    pub email_send_cap: u32,

    /// Delay between consecutive sends, any channel, in milliseconds.
    pub send_delay_ms: u64,

    /// First local hour of day (inclusive) at which SMS sends are allowed.
    pub sms_window_start_hour: u32,

    /// Local hour of day (exclusive) after which SMS sends stop.
    pub sms_window_end_hour: u32,

    /// Fixed UTC offset, in hours, of the reference timezone used for the
    /// SMS window check. Eastern Standard Time is -5.
    pub local_tz_offset_hours: i32,

    /// Hourly-aggregation bucket rotation correcting the feed's UTC
    /// timestamps back to local wall-clock hours.
    pub hour_bucket_rotation: u32,

    /// Minutes between scheduled update-and-notify passes.
    pub task_interval_minutes: u32,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – SQLite connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `FEED_IMPORT_DIR` – lab feed drop directory (default: unset, no import)
/// - `RESULT_URL_BASE` – result link base URL
/// - `EMAIL_SEND_CAP` – max emails per pass (default: 190)
/// - `SEND_DELAY_MS` – inter-send delay (default: 500)
/// - `SMS_WINDOW_START_HOUR` / `SMS_WINDOW_END_HOUR` – quiet-hours window
///   (default: 8–22)
/// - `LOCAL_TZ_OFFSET_HOURS` – reference timezone offset (default: -5)
/// - `HOUR_BUCKET_ROTATION` – hourly chart rotation (default: 6)
/// - `TASK_INTERVAL_MINUTES` – scheduler interval (default: 10)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let feed_import_dir = env::var("FEED_IMPORT_DIR").unwrap_or_default();
    let result_url_base = env::var("RESULT_URL_BASE")
        .unwrap_or_else(|_| "https://besafe.virginia.edu/result-demo".to_string());
    let email_send_cap = parse_env_u32!("EMAIL_SEND_CAP", 190);
    let send_delay_ms = parse_env_u32!("SEND_DELAY_MS", 500) as u64;
    let sms_window_start_hour = parse_env_u32!("SMS_WINDOW_START_HOUR", 8);
    let sms_window_end_hour = parse_env_u32!("SMS_WINDOW_END_HOUR", 22);
    let local_tz_offset_hours = parse_env_i32!("LOCAL_TZ_OFFSET_HOURS", -5);
    let hour_bucket_rotation = parse_env_u32!("HOUR_BUCKET_ROTATION", 6);
    let task_interval_minutes = parse_env_u32!("TASK_INTERVAL_MINUTES", 10);

    if sms_window_start_hour > 23 || sms_window_end_hour > 24 {
        return Err(anyhow!("SMS window hours must fall within a single day"));
    }
    if hour_bucket_rotation > 23 {
        return Err(anyhow!("HOUR_BUCKET_ROTATION must be between 0 and 23"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        feed_import_dir,
        result_url_base,
        email_send_cap,
        send_delay_ms,
        sms_window_start_hour,
        sms_window_end_hour,
        local_tz_offset_hours,
        hour_bucket_rotation,
        task_interval_minutes,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        // Mask any password embedded in the database URL
        let masked_db_url = if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                )
            } else {
                self.db_url.clone()
            }
        } else {
            self.db_url.clone()
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL          : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX           : {}", self.db_pool_max);
        tracing::info!("  FEED_IMPORT_DIR       : {}", self.feed_import_dir);
        tracing::info!("  RESULT_URL_BASE       : {}", self.result_url_base);
        tracing::info!("  EMAIL_SEND_CAP        : {}", self.email_send_cap);
        tracing::info!("  SEND_DELAY_MS         : {}", self.send_delay_ms);
        tracing::info!(
            "  SMS_WINDOW            : {:02}:00-{:02}:00 (UTC{:+})",
            self.sms_window_start_hour,
            self.sms_window_end_hour,
            self.local_tz_offset_hours
        );
        tracing::info!("  HOUR_BUCKET_ROTATION  : {}", self.hour_bucket_rotation);
        tracing::info!("  TASK_INTERVAL_MINUTES : {}", self.task_interval_minutes);
    }
}
