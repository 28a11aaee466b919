use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Upper bound for every configured wait, in seconds.
const MAX_WAIT_SECS: f64 = 86_400.0;

/// Upper bound for `relay.max_attempt`.
const MAX_ATTEMPT_LIMIT: f64 = 1_000.0;

/// Chat identifiers allowed to trigger exchanges.
///
/// Only an unset or exactly empty value opens the relay to every chat. A
/// value that yields no usable id (`","`, `" "`) denies every chat.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AllowList {
    #[default]
    Everyone,
    Only(Vec<String>),
}

impl AllowList {
    /// Parse a comma-separated list such as the `CHAT_ID` variable.
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return AllowList::Everyone;
        }
        Self::restricted(raw, raw.split(','))
    }

    /// An empty list opens the relay like an empty string does.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let ids: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
        if ids.is_empty() {
            return AllowList::Everyone;
        }
        let raw = format!("{:?}", ids);
        Self::restricted(&raw, ids.iter().map(String::as_str))
    }

    fn restricted<'a>(raw: &str, entries: impl Iterator<Item = &'a str>) -> Self {
        let chat_ids: Vec<String> = entries
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if chat_ids.is_empty() {
            warn!(
                "Allowed chat ids '{}' contain no usable id; every chat will be denied",
                raw
            );
        }
        AllowList::Only(chat_ids)
    }

    pub fn permits_everyone(&self) -> bool {
        matches!(self, AllowList::Everyone)
    }

    pub fn permits(&self, chat_id: i64) -> bool {
        match self {
            AllowList::Everyone => true,
            AllowList::Only(chat_ids) => {
                let chat_id = chat_id.to_string();
                chat_ids.iter().any(|allowed| *allowed == chat_id)
            }
        }
    }
}

impl<'de> Deserialize<'de> for AllowList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Accept both `allowed_chat_ids = [1, 2]` and `allowed_chat_ids = "1,2"`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            List(Vec<serde_json::Value>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => AllowList::parse(&text),
            Raw::List(values) => AllowList::from_ids(values.into_iter().map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })),
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allowed_chat_ids: AllowList,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Long-poll timeout passed to `getUpdates`; 0 is a short poll.
    #[serde(default)]
    pub long_poll_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserConfig {
    #[serde(default = "default_assistant_url")]
    pub assistant_url: String,
    /// Persistent profile so the login survives restarts.
    #[serde(default = "default_user_data_dir")]
    pub user_data_dir: PathBuf,
    #[serde(default = "default_headed")]
    pub headed: bool,
    /// Explicit browser binary; searched on PATH when unset.
    #[serde(default)]
    pub executable: Option<String>,
    /// Attach to an already running browser on this debugging port
    /// instead of launching one.
    #[serde(default)]
    pub debug_port: Option<u16>,
    #[serde(default = "default_input_selector")]
    pub input_selector: String,
    #[serde(default = "default_message_selector")]
    pub message_selector: String,
    #[serde(default = "default_page_load_secs")]
    pub page_load_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: f64,
    #[serde(default = "default_response_delay_secs")]
    pub response_delay_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_attempt")]
    pub max_attempt: f64,
    #[serde(default = "default_settle_interval_ms")]
    pub settle_interval_ms: u64,
    #[serde(default = "default_settle_max_samples")]
    pub settle_max_samples: u32,
    #[serde(default = "default_not_responding_text")]
    pub not_responding_text: String,
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_delay_secs)
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_secs_f64(self.response_delay_secs)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}

/// Optional `GET /chat?q=...` endpoint sharing the relay's browser page.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HttpConfig {
    /// Address to listen on, e.g. `127.0.0.1:5001`. Disabled when unset.
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_telegram_config")]
    pub telegram: TelegramConfig,
    #[serde(default = "default_browser_config")]
    pub browser: BrowserConfig,
    #[serde(default = "default_relay_config")]
    pub relay: RelayConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_assistant_url() -> String {
    "https://chat.openai.com/".to_string()
}

fn default_user_data_dir() -> PathBuf {
    std::env::temp_dir().join("telegram-chat-relay")
}

fn default_headed() -> bool {
    // Interactive login needs a visible window.
    true
}

fn default_input_selector() -> String {
    "textarea".to_string()
}

fn default_message_selector() -> String {
    "div[class*='ConversationItem__Message']".to_string()
}

fn default_page_load_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> f64 {
    5.0
}

fn default_restart_delay_secs() -> f64 {
    5.0
}

fn default_response_delay_secs() -> f64 {
    5.0
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_attempt() -> f64 {
    3.0
}

fn default_settle_interval_ms() -> u64 {
    1000
}

fn default_settle_max_samples() -> u32 {
    300
}

fn default_not_responding_text() -> String {
    "<ChatGPT is not responding.>".to_string()
}

fn default_telegram_config() -> TelegramConfig {
    TelegramConfig {
        token: String::new(),
        allowed_chat_ids: AllowList::default(),
        api_base: default_api_base(),
        long_poll_secs: 0,
    }
}

fn default_browser_config() -> BrowserConfig {
    BrowserConfig {
        assistant_url: default_assistant_url(),
        user_data_dir: default_user_data_dir(),
        headed: default_headed(),
        executable: None,
        debug_port: None,
        input_selector: default_input_selector(),
        message_selector: default_message_selector(),
        page_load_secs: default_page_load_secs(),
    }
}

fn default_relay_config() -> RelayConfig {
    RelayConfig {
        poll_interval_secs: default_poll_interval_secs(),
        restart_delay_secs: default_restart_delay_secs(),
        response_delay_secs: default_response_delay_secs(),
        backoff_multiplier: default_backoff_multiplier(),
        max_attempt: default_max_attempt(),
        settle_interval_ms: default_settle_interval_ms(),
        settle_max_samples: default_settle_max_samples(),
        not_responding_text: default_not_responding_text(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: default_telegram_config(),
            browser: default_browser_config(),
            relay: default_relay_config(),
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    /// Load the optional TOML file, then apply `TELEGRAM_TOKEN` and `CHAT_ID`
    /// from the environment on top of it.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML configuration")
    }

    /// Environment values win over the file. A set-but-empty `CHAT_ID`
    /// clears the allow-list.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_TOKEN") {
            let token = token.trim();
            if !token.is_empty() {
                self.telegram.token = token.to_string();
            }
        }
        if let Some(chat_ids) = lookup("CHAT_ID") {
            self.telegram.allowed_chat_ids = AllowList::parse(&chat_ids);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.token.is_empty() {
            bail!("TELEGRAM_TOKEN is not set (environment or [telegram] token)");
        }
        if !self.relay.backoff_multiplier.is_finite() || self.relay.backoff_multiplier <= 1.0 {
            bail!(
                "relay.backoff_multiplier must be greater than 1 (got {})",
                self.relay.backoff_multiplier
            );
        }
        let max_attempt = self.relay.max_attempt;
        if !max_attempt.is_finite() || !(1.0..=MAX_ATTEMPT_LIMIT).contains(&max_attempt) {
            bail!(
                "relay.max_attempt must be between 1 and {} (got {})",
                MAX_ATTEMPT_LIMIT,
                max_attempt
            );
        }
        if self.relay.settle_max_samples == 0 {
            bail!("relay.settle_max_samples must be at least 1");
        }
        for (name, value) in [
            ("poll_interval_secs", self.relay.poll_interval_secs),
            ("restart_delay_secs", self.relay.restart_delay_secs),
            ("response_delay_secs", self.relay.response_delay_secs),
        ] {
            if !value.is_finite() || !(0.0..=MAX_WAIT_SECS).contains(&value) {
                bail!(
                    "relay.{} must be between 0 and {} (got {})",
                    name,
                    MAX_WAIT_SECS,
                    value
                );
            }
        }
        if self.telegram.long_poll_secs as f64 > MAX_WAIT_SECS {
            bail!(
                "telegram.long_poll_secs must be at most {} (got {})",
                MAX_WAIT_SECS,
                self.telegram.long_poll_secs
            );
        }
        if let Some(listen) = &self.http.listen {
            listen
                .parse::<SocketAddr>()
                .with_context(|| format!("http.listen is not a socket address: {}", listen))?;
        }
        Ok(())
    }
}
