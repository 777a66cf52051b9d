//! Zapflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, ZapflowError};
use crate::types::{Channel, ChannelEndpoint, ChannelFamily};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZapflowConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub variator: VariatorConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub waha: Vec<WahaSessionConfig>,
    #[serde(default)]
    pub evolution: Vec<EvolutionInstanceConfig>,
    #[serde(default)]
    pub telegram: Vec<TelegramBotConfig>,
}

impl ZapflowConfig {
    /// Load config from the default path (~/.zapflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ZapflowError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ZapflowError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate channel ids and empty credentials.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for channel in self.channels() {
            if channel.channel_id.is_empty() {
                return Err(ZapflowError::Config("channel id must not be empty".into()));
            }
            if !seen.insert(channel.channel_id.clone()) {
                return Err(ZapflowError::Config(format!(
                    "duplicate channel id '{}'",
                    channel.channel_id
                )));
            }
            if channel.endpoint.credential.is_empty() && channel.family == ChannelFamily::Telegram {
                return Err(ZapflowError::Config(format!(
                    "telegram bot '{}' has no bot_token",
                    channel.channel_id
                )));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Zapflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".zapflow")
    }

    /// All configured channels as fresh (not yet probed) snapshots.
    pub fn channels(&self) -> Vec<Channel> {
        let waha = self.waha.iter().map(|w| {
            Channel::new(
                &w.id,
                ChannelFamily::Waha,
                display_or_id(&w.name, &w.id),
                &w.owner,
                ChannelEndpoint {
                    base_url: w.base_url.clone(),
                    credential: w.api_key.clone(),
                    remote_name: w.session.clone(),
                },
            )
        });
        let evolution = self.evolution.iter().map(|e| {
            Channel::new(
                &e.id,
                ChannelFamily::Evolution,
                display_or_id(&e.name, &e.id),
                &e.owner,
                ChannelEndpoint {
                    base_url: e.base_url.clone(),
                    credential: e.api_key.clone(),
                    remote_name: e.instance.clone(),
                },
            )
        });
        let telegram = self.telegram.iter().map(|t| {
            Channel::new(
                &t.id,
                ChannelFamily::Telegram,
                display_or_id(&t.name, &t.id),
                &t.owner,
                ChannelEndpoint {
                    base_url: t.api_base.clone(),
                    credential: t.bot_token.clone(),
                    remote_name: String::new(),
                },
            )
        });
        waha.chain(evolution).chain(telegram).collect()
    }
}

fn display_or_id(name: &str, id: &str) -> String {
    if name.is_empty() { id.to_string() } else { name.to_string() }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Dispatch engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Delay before each recipient's first message.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter added to `base_delay_ms`.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Delay range between humanized steps (greeting → filler → payload).
    #[serde(default = "default_step_delay_min_ms")]
    pub step_delay_min_ms: u64,
    #[serde(default = "default_step_delay_max_ms")]
    pub step_delay_max_ms: u64,
    #[serde(default = "default_greetings")]
    pub greetings: Vec<String>,
    #[serde(default = "default_fillers")]
    pub fillers: Vec<String>,
    /// Consecutive send failures before a channel is demoted to `error`.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Terminal progress records older than this are evicted (0 = keep forever).
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
    #[serde(default = "default_history_db")]
    pub history_db: String,
}

fn default_base_delay_ms() -> u64 { 5_000 }
fn default_jitter_ms() -> u64 { 5_000 }
fn default_step_delay_min_ms() -> u64 { 2_000 }
fn default_step_delay_max_ms() -> u64 { 7_000 }
fn default_max_consecutive_failures() -> u32 { 3 }
fn default_health_check_interval_secs() -> u64 { 60 }
fn default_progress_ttl_secs() -> u64 { 3_600 }
fn default_history_db() -> String { "~/.zapflow/history.db".into() }

fn default_greetings() -> Vec<String> {
    vec!["Oi!", "Olá!", "Oi, tudo bem?", "Olá, como vai?", "E aí, tudo certo?"]
        .into_iter().map(String::from).collect()
}

fn default_fillers() -> Vec<String> {
    vec![
        "Espero que esteja tudo bem por aí.",
        "Passando rapidinho para te contar uma coisa.",
        "Tenho uma novidade para você.",
        "Só um minutinho do seu tempo.",
    ]
    .into_iter().map(String::from).collect()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            jitter_ms: default_jitter_ms(),
            step_delay_min_ms: default_step_delay_min_ms(),
            step_delay_max_ms: default_step_delay_max_ms(),
            greetings: default_greetings(),
            fillers: default_fillers(),
            max_consecutive_failures: default_max_consecutive_failures(),
            health_check_interval_secs: default_health_check_interval_secs(),
            progress_ttl_secs: default_progress_ttl_secs(),
            history_db: default_history_db(),
        }
    }
}

/// External message variator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariatorConfig {
    /// `POST {message, quantity}` endpoint; `None` uses local synonym substitution.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_variator_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_variator_retries")]
    pub max_retries: u32,
}

fn default_variator_timeout_secs() -> u64 { 30 }
fn default_variator_retries() -> u32 { 3 }

impl Default for VariatorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_variator_timeout_secs(),
            max_retries: default_variator_retries(),
        }
    }
}

/// Outbound HTTP settings shared by gateway adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 { 8 }

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: default_http_timeout_secs() }
    }
}

/// A WAHA session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WahaSessionConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_waha_session")]
    pub session: String,
}

fn default_waha_session() -> String { "default".into() }

/// An Evolution API instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionInstanceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub instance: String,
}

/// A Telegram bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramBotConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub bot_token: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

fn default_telegram_api_base() -> String { "https://api.telegram.org".into() }
