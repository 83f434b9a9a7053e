//! Runtime configuration, loaded from environment variables.
//!
//! Precedence: environment variables only; a `.env` file is read first via
//! `dotenvy` if present, then overridden by real process environment
//! variables of the same name.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_STORAGE_PATH: &str = "./genie-state.json";
const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_AUTO_BACKUP: bool = true;
const DEFAULT_BACKUP_RETENTION_DAYS: i64 = 30;
const DEFAULT_CALENDAR_ID: &str = "primary";
const DEFAULT_EVENT_SUMMARY_PREFIX: &str = "[Genie] ";
const DEFAULT_OVERALL_DEADLINE_MS: u64 = 60_000;
const DEFAULT_LLM_DEADLINE_MS: u64 = 30_000;
const DEFAULT_CALENDAR_DEADLINE_MS: u64 = 10_000;
const DEFAULT_RESEARCH_DEADLINE_MS: u64 = 10_000;
const DEFAULT_PROMPTS_DIR: &str = "./prompts";
const DEFAULT_MAX_CONCURRENT_UTTERANCES: i64 = 16;

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Store's persisted JSON document.
    pub storage_path: PathBuf,
    /// Directory backups are written into.
    pub backup_dir: PathBuf,
    /// Whether to write a timestamped backup after every successful save.
    pub auto_backup: bool,
    /// How many days of backups to retain before pruning.
    pub backup_retention_days: i64,
    /// API key for the LLM provider, if it requires one.
    pub llm_api_key: Option<String>,
    /// API key for the research provider, if it requires one.
    pub research_api_key: Option<String>,
    /// Path to calendar OAuth client credentials, if file-based.
    pub calendar_credentials_path: Option<PathBuf>,
    /// Path to a cached calendar OAuth token, if file-based.
    pub calendar_token_path: Option<PathBuf>,
    /// Calendar identifier to schedule events against.
    pub default_calendar_id: String,
    /// Prefix marking events this crate owns, for orphan adoption.
    pub event_summary_prefix: String,
    /// Overall per-utterance deadline.
    pub overall_deadline: Duration,
    /// Per-LLM-call retry budget.
    pub llm_deadline: Duration,
    /// Per-calendar-call deadline.
    pub calendar_deadline: Duration,
    /// Per-research-call deadline.
    pub research_deadline: Duration,
    /// Directory prompt templates are loaded from at startup.
    pub prompts_dir: PathBuf,
    /// Upper bound on utterances processed concurrently across all users.
    pub max_concurrent_utterances: usize,
}

impl Config {
    /// Load configuration from the environment, applying `.env` first if
    /// present.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric/bool environment variable is present
    /// but cannot be parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            storage_path: env_path("STORAGE_PATH", DEFAULT_STORAGE_PATH),
            backup_dir: env_path("BACKUP_DIR", DEFAULT_BACKUP_DIR),
            auto_backup: env_bool("AUTO_BACKUP", DEFAULT_AUTO_BACKUP)?,
            backup_retention_days: env_i64("BACKUP_RETENTION_DAYS", DEFAULT_BACKUP_RETENTION_DAYS)?,
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
            research_api_key: std::env::var("RESEARCH_API_KEY").ok(),
            calendar_credentials_path: std::env::var("CALENDAR_CREDENTIALS_PATH")
                .ok()
                .map(PathBuf::from),
            calendar_token_path: std::env::var("CALENDAR_TOKEN_PATH").ok().map(PathBuf::from),
            default_calendar_id: env_string("DEFAULT_CALENDAR_ID", DEFAULT_CALENDAR_ID),
            event_summary_prefix: env_string("EVENT_SUMMARY_PREFIX", DEFAULT_EVENT_SUMMARY_PREFIX),
            overall_deadline: env_duration_ms("OVERALL_DEADLINE_MS", DEFAULT_OVERALL_DEADLINE_MS)?,
            llm_deadline: env_duration_ms("LLM_DEADLINE_MS", DEFAULT_LLM_DEADLINE_MS)?,
            calendar_deadline: env_duration_ms("CALENDAR_DEADLINE_MS", DEFAULT_CALENDAR_DEADLINE_MS)?,
            research_deadline: env_duration_ms("RESEARCH_DEADLINE_MS", DEFAULT_RESEARCH_DEADLINE_MS)?,
            prompts_dir: env_path("PROMPTS_DIR", DEFAULT_PROMPTS_DIR),
            max_concurrent_utterances: usize::try_from(env_i64(
                "MAX_CONCURRENT_UTTERANCES",
                DEFAULT_MAX_CONCURRENT_UTTERANCES,
            )?)
            .unwrap_or(16),
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_bool(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<bool>()
            .map_err(|e| anyhow::anyhow!("invalid bool for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_i64(key: &str, default: i64) -> anyhow::Result<i64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<i64>()
            .map_err(|e| anyhow::anyhow!("invalid integer for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(key: &str, default_ms: u64) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| anyhow::anyhow!("invalid duration (ms) for {key}: {e}")),
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        for key in [
            "STORAGE_PATH",
            "BACKUP_DIR",
            "AUTO_BACKUP",
            "BACKUP_RETENTION_DAYS",
            "DEFAULT_CALENDAR_ID",
            "EVENT_SUMMARY_PREFIX",
        ] {
            std::env::remove_var(key);
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.default_calendar_id, "primary");
        assert_eq!(cfg.event_summary_prefix, "[Genie] ");
        assert!(cfg.auto_backup);
        assert_eq!(cfg.backup_retention_days, 30);
    }
}
