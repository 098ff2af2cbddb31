//! Configuration module for luabot.

use serde::Deserialize;
use std::path::Path;

use crate::{BotError, Result};

/// Chat bot behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Prefix that marks a message as a command (e.g. `!ping`).
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Author name given to lines typed on the console.
    #[serde(default = "default_console_user")]
    pub console_user: String,
}

fn default_command_prefix() -> String {
    "!".to_string()
}

fn default_console_user() -> String {
    "operator".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            console_user: default_console_user(),
        }
    }
}

/// Script host configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptingConfig {
    /// Directory containing the `.lua` scripts.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
    /// Capacity of the event queue. Events beyond it are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Reload scripts automatically when files change.
    #[serde(default = "default_watch")]
    pub watch: bool,
    /// Strip unsafe standard library functions from the interpreter.
    #[serde(default = "default_sandbox")]
    pub sandbox: bool,
    /// Instruction budget per callback invocation (0 = unlimited).
    #[serde(default)]
    pub max_instructions: u64,
    /// Interpreter memory limit in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
}

fn default_scripts_dir() -> String {
    "lua/scripts".to_string()
}

fn default_queue_capacity() -> usize {
    200
}

fn default_watch() -> bool {
    true
}

fn default_sandbox() -> bool {
    true
}

fn default_max_memory_mb() -> usize {
    64
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            queue_capacity: default_queue_capacity(),
            watch: default_watch(),
            sandbox: default_sandbox(),
            max_instructions: 0,
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "bot_data.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// HTTP utility configuration for `http_get` / `http_post`.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Timeout applied when a script passes no `timeout` option.
    #[serde(default = "default_http_timeout")]
    pub default_timeout_secs: u64,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("luabot/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/luabot.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Bot behaviour.
    #[serde(default)]
    pub bot: BotConfig,
    /// Script host.
    #[serde(default)]
    pub scripting: ScriptingConfig,
    /// Key-value store database.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// HTTP utilities exposed to scripts.
    #[serde(default)]
    pub http: HttpConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(BotError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| BotError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `LUABOT_SCRIPTS_DIR`: Override the scripts directory
    /// - `LUABOT_DATABASE_PATH`: Override the database file path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LUABOT_SCRIPTS_DIR") {
            if !dir.is_empty() {
                self.scripting.scripts_dir = dir;
            }
        }
        if let Ok(path) = std::env::var("LUABOT_DATABASE_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.scripting.queue_capacity == 0 {
            return Err(BotError::Validation(
                "scripting.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.bot.command_prefix.is_empty()
            || self.bot.command_prefix.chars().any(char::is_whitespace)
        {
            return Err(BotError::Validation(
                "bot.command_prefix must be non-empty and contain no whitespace".to_string(),
            ));
        }
        if self.scripting.scripts_dir.is_empty() {
            return Err(BotError::Validation(
                "scripting.scripts_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
