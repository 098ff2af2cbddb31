//! luabot - a chat bot core driven by Lua scripts.
//!
//! Scripts react to channel and direct messages, register chat commands,
//! schedule timers and keep state in a SQLite-backed key-value store.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod platform;
pub mod script;

pub use config::Config;
pub use db::Database;
pub use error::{BotError, Result};
pub use platform::{ChatPlatform, ConsolePlatform, IncomingMessage};
pub use script::Engine;
