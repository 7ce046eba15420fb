use std::path::PathBuf;

use crate::browser::ProxyConfig;

/// Default check interval when a watch declares neither `interval` nor `schedule` (5 minutes)
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 300_000;

/// Process-wide settings, read from environment variables at startup.
///
/// Every field has a default so the daemon runs out of the box with a
/// `config/` directory next to the working directory.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory scanned for `*.json` watch documents
    pub config_dir: PathBuf,
    /// Directory for per-watch snapshot files
    pub state_dir: PathBuf,
    /// Directory for error screenshots
    pub screenshot_dir: PathBuf,
    /// Directory for persisted browser storage state
    pub session_dir: PathBuf,
    /// Default watch interval in milliseconds
    pub check_interval_ms: u64,
    /// Port for the status server
    pub health_port: u16,
    /// Navigation attempts per run
    pub max_retries: u32,
    /// Base delay for exponential navigation backoff
    pub retry_base_delay_ms: u64,
    /// Startup delay between scheduling successive watches
    pub stagger_delay_ms: u64,
    /// Minimum interval between two change notifications for one watch
    pub notification_throttle_ms: u64,
    /// Consecutive failures before an error notification fires
    pub error_notify_threshold: u32,
    /// Global proxy for the browser
    pub proxy: Option<ProxyConfig>,
    /// Global Telegram transport, active when both env vars are set
    pub telegram: Option<TelegramSettings>,
    /// Global ntfy topic URL
    pub ntfy_url: Option<String>,
    /// Global webhook URL
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            state_dir: PathBuf::from("state"),
            screenshot_dir: PathBuf::from("screenshots"),
            session_dir: PathBuf::from("sessions"),
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            health_port: 8080,
            max_retries: 3,
            retry_base_delay_ms: 5000,
            stagger_delay_ms: 2000,
            notification_throttle_ms: 60_000,
            error_notify_threshold: 3,
            proxy: None,
            telegram: None,
            ntfy_url: None,
            webhook_url: None,
        }
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let proxy = env_var("PROXY_SERVER").map(|server| ProxyConfig {
            server,
            username: env_var("PROXY_USERNAME"),
            password: env_var("PROXY_PASSWORD"),
        });

        let telegram = match (env_var("TELEGRAM_BOT_TOKEN"), env_var("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramSettings { bot_token, chat_id }),
            _ => None,
        };

        Self {
            config_dir: env_path("CONFIG_DIR", defaults.config_dir),
            state_dir: env_path("STATE_DIR", defaults.state_dir),
            screenshot_dir: env_path("SCREENSHOT_DIR", defaults.screenshot_dir),
            session_dir: env_path("SESSION_DIR", defaults.session_dir),
            check_interval_ms: env_num("CHECK_INTERVAL_MS", defaults.check_interval_ms),
            health_port: env_num("HEALTH_PORT", defaults.health_port),
            max_retries: env_num("MAX_RETRIES", defaults.max_retries),
            retry_base_delay_ms: env_num("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            stagger_delay_ms: env_num("STAGGER_DELAY_MS", defaults.stagger_delay_ms),
            notification_throttle_ms: env_num(
                "NOTIFICATION_THROTTLE_MS",
                defaults.notification_throttle_ms,
            ),
            error_notify_threshold: env_num(
                "ERROR_NOTIFY_THRESHOLD",
                defaults.error_notify_threshold,
            ),
            proxy,
            telegram,
            ntfy_url: env_var("NTFY_URL"),
            webhook_url: env_var("WEBHOOK_URL"),
        }
    }
}

/// Non-empty environment variable, or None
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env_var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_num<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
