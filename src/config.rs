//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Model inference API URL
    pub model_url: String,

    /// Model inference API key (optional)
    pub model_api_key: Option<String>,

    /// Embedding service URL (Ollama-compatible)
    pub embedding_url: String,

    /// OpenWeather API key (optional - weather capability disabled without it)
    pub weather_api_key: Option<String>,

    /// Gateway base URL for delegated capabilities (calendar, mail, drive,
    /// contacts). Those capabilities are disabled without it.
    pub workspace_api_url: Option<String>,

    /// SQLite database path (sessions, memory, ledger, index, feedback)
    pub db_path: PathBuf,

    /// Short-term memory window per user
    pub short_term_capacity: usize,

    /// Long-term fact capacity per user
    pub long_term_capacity: usize,

    /// Daily spend ceiling per user, USD
    pub budget_ceiling_usd: f64,

    /// Per-action timeout
    pub action_timeout: Duration,

    /// Soft deadline for the executing stage of one turn
    pub turn_deadline: Duration,

    /// How long a turn may wait for its session lock before failing fast
    pub session_lock_timeout: Duration,

    /// HTTP listen port
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let model_url = std::env::var("CONCIERGE_MODEL_URL")
            .unwrap_or_else(|_| "http://localhost:11434/api/generate".to_string());
        let model_api_key = std::env::var("CONCIERGE_MODEL_API_KEY").ok();

        let embedding_url = std::env::var("CONCIERGE_EMBEDDING_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());

        let weather_api_key = std::env::var("OWM_API_KEY").ok();
        let workspace_api_url = std::env::var("CONCIERGE_WORKSPACE_URL").ok();

        let db_path = std::env::var("CONCIERGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("concierge")
                    .join("concierge.db")
            });

        let short_term_capacity = env_parse("CONCIERGE_SHORT_TERM", 10);
        let long_term_capacity = env_parse("CONCIERGE_LONG_TERM", 100);

        let budget_ceiling_usd = std::env::var("CONCIERGE_BUDGET_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.50);

        let action_timeout = Duration::from_secs(env_parse("CONCIERGE_ACTION_TIMEOUT_SECS", 10));
        let turn_deadline = Duration::from_secs(env_parse("CONCIERGE_TURN_DEADLINE_SECS", 30));
        let session_lock_timeout =
            Duration::from_secs(env_parse("CONCIERGE_LOCK_TIMEOUT_SECS", 15));

        let port = env_parse("PORT", 8080u16);

        Ok(Self {
            model_url,
            model_api_key,
            embedding_url,
            weather_api_key,
            workspace_api_url,
            db_path,
            short_term_capacity,
            long_term_capacity,
            budget_ceiling_usd,
            action_timeout,
            turn_deadline,
            session_lock_timeout,
            port,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// Platform-specific dirs fallback
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .ok()
                .or_else(|| {
                    std::env::var("HOME")
                        .map(|h| PathBuf::from(h).join(".local/share"))
                        .ok()
                })
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
                .ok()
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").map(PathBuf::from).ok()
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            None
        }
    }
}
