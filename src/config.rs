//! Runtime configuration, read once from the environment and passed down.

use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;

/// Settings handed to the upstream fetch collaborator at construction.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub api_key: String,
    pub base_url: String,
    pub sport: String,
    pub regions: String,
    pub markets: String,
    pub odds_format: String,
    pub rate_limit_per_minute: u32,
}

/// Configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Absent only in web-only mode.
    pub feed: Option<FeedConfig>,
    pub data_dir: PathBuf,
    pub daily_file_prefix: String,
    pub games_dir: String,
    pub usage_file: String,
    pub monthly_limit: u32,
    pub port: u16,
    /// If true, run one ingestion cycle and exit (no schedule)
    pub run_once: bool,
    /// If true, serve the dashboard without calling the upstream API
    pub web_only: bool,
    pub schedule_utc_offset_hours: i32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A local .env is optional; deployments set real env vars.
        let _ = dotenvy::dotenv();

        let web_only = env_flag("WEB_ONLY");
        let feed = if web_only {
            None
        } else {
            Some(FeedConfig::from_env()?)
        };

        Ok(Self {
            feed,
            data_dir: PathBuf::from(env_or("DATA_DIR", ".")),
            daily_file_prefix: env_or("DAILY_FILE_PREFIX", "nfl_odds"),
            games_dir: env_or("GAMES_DIR", "games"),
            usage_file: env_or("USAGE_FILE", "api_usage.json"),
            monthly_limit: env_parse("MONTHLY_LIMIT", 500),
            port: env_parse("PORT", 5000),
            run_once: env_flag("RUN_ONCE"),
            web_only,
            schedule_utc_offset_hours: env_parse("SCHEDULE_UTC_OFFSET_HOURS", -5),
        })
    }

    pub fn games_path(&self) -> PathBuf {
        self.data_dir.join(&self.games_dir)
    }

    pub fn usage_path(&self) -> PathBuf {
        self.data_dir.join(&self.usage_file)
    }
}

impl FeedConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = match env::var("ODDS_API_KEY").or_else(|_| env::var("THE_ODDS_API_KEY")) {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            Ok(_) => return Err(anyhow!("ODDS_API_KEY is set but empty")),
            Err(_) => return Err(anyhow!("ODDS_API_KEY environment variable not set")),
        };

        // Prevent accidental use of sample/placeholder keys
        let key_lower = api_key.to_lowercase();
        if key_lower.contains("change_me")
            || key_lower.contains("your_")
            || key_lower.starts_with("sample")
        {
            return Err(anyhow!(
                "ODDS_API_KEY appears to be a placeholder value; replace with your real key"
            ));
        }

        Ok(Self {
            api_key,
            base_url: env_or("ODDS_API_BASE_URL", "https://api.the-odds-api.com"),
            sport: env_or("SPORT", "americanfootball_nfl"),
            regions: env_or("REGIONS", "us"),
            markets: env_or("MARKETS", "h2h,spreads,totals"),
            odds_format: env_or("ODDS_FORMAT", "american"),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 30),
        })
    }

    /// Key prefix safe to log.
    pub fn redacted_key(&self) -> String {
        let visible: String = self.api_key.chars().take(8).collect();
        format!("{}...", visible)
    }
}

fn env_or(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
