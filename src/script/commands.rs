//! Command registry with per-command cooldowns.
//!
//! Command names are globally unique: the first script to register a name
//! keeps it until that script is unloaded. The cooldown is shared by all
//! users of a command.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::event::{Event, LuaRef, ScriptOwner};
use super::queue::EventQueue;
use super::value::ScriptValue;

/// Default command prefix.
pub const DEFAULT_PREFIX: &str = "!";

/// Reasons a command registration is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command name cannot be empty")]
    EmptyName,
    #[error("command name '{0}' contains invalid characters")]
    InvalidName(String),
    #[error("command '{name}' already registered by script '{owner}'")]
    Duplicate { name: String, owner: String },
}

/// A registered command.
pub struct Command {
    pub name: String,
    pub description: String,
    pub callback: LuaRef,
    pub cooldown: Duration,
    pub script: String,
    pub generation: u64,
    last_used: Mutex<Option<Instant>>,
}

impl Command {
    /// Check the cooldown and, if it has elapsed, mark the command used now.
    fn try_use(&self) -> bool {
        let mut last_used = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(at) = *last_used {
            if at.elapsed() < self.cooldown {
                return false;
            }
        }
        *last_used = Some(Instant::now());
        true
    }
}

/// Public description of a command, as returned by `get_commands`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub script: String,
    pub cooldown: Duration,
}

/// Outcome of offering a message to the command registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDispatch {
    /// Not a known command; the message should go to the hooks.
    NotCommand,
    /// A known command still cooling down. Nothing was dispatched.
    OnCooldown,
    /// The command event was submitted.
    Queued,
}

/// Registry of chat commands.
pub struct CommandRegistry {
    commands: Mutex<HashMap<String, Arc<Command>>>,
    prefix: String,
}

impl CommandRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            commands: Mutex::new(HashMap::new()),
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register a command. The first registrant of a name wins.
    pub fn register(
        &self,
        name: &str,
        description: &str,
        callback: LuaRef,
        cooldown: Duration,
        owner: impl Into<ScriptOwner>,
    ) -> Result<(), CommandError> {
        let owner = owner.into();
        if name.is_empty() {
            return Err(CommandError::EmptyName);
        }
        if name.chars().any(char::is_whitespace) {
            return Err(CommandError::InvalidName(name.to_string()));
        }

        let mut commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = commands.get(name) {
            return Err(CommandError::Duplicate {
                name: name.to_string(),
                owner: existing.script.clone(),
            });
        }

        commands.insert(
            name.to_string(),
            Arc::new(Command {
                name: name.to_string(),
                description: description.to_string(),
                callback,
                cooldown,
                script: owner.name,
                generation: owner.generation,
                last_used: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Offer a message to the registry.
    ///
    /// The first whitespace-separated token, minus the prefix, names the
    /// command. On success the command event carries
    /// `{ args, channel_id, author }` where `args` holds every raw token,
    /// `args[1]` being the prefixed command token itself.
    pub fn try_dispatch(
        &self,
        content: &str,
        channel_id: &str,
        author: &str,
        queue: &EventQueue,
    ) -> CommandDispatch {
        if !content.starts_with(&self.prefix) {
            return CommandDispatch::NotCommand;
        }

        let tokens: Vec<&str> = content.split_whitespace().collect();
        let Some(name) = tokens
            .first()
            .and_then(|token| token.strip_prefix(self.prefix.as_str()))
        else {
            return CommandDispatch::NotCommand;
        };

        let Some(command) = self.get(name) else {
            return CommandDispatch::NotCommand;
        };

        if !command.try_use() {
            debug!("Command '{}' is on cooldown", command.name);
            return CommandDispatch::OnCooldown;
        }

        let args = tokens.iter().map(|t| ScriptValue::from(*t)).collect();
        let data = ScriptValue::table([
            ("args", ScriptValue::Array(args)),
            ("channel_id", ScriptValue::from(channel_id)),
            ("author", ScriptValue::from(author)),
        ]);

        queue.submit(
            Event::Command {
                name: command.name.clone(),
                data,
                callback: command.callback.clone(),
                script: command.script.clone(),
                generation: command.generation,
            },
            "command",
        );
        CommandDispatch::Queued
    }

    pub fn get(&self, name: &str) -> Option<Arc<Command>> {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        commands.get(name).cloned()
    }

    /// Remove every command owned by `script`. Returns the removed names.
    pub fn remove_all_for_script(&self, script: &str) -> Vec<String> {
        let mut commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        let names: Vec<String> = commands
            .values()
            .filter(|c| c.script == script)
            .map(|c| c.name.clone())
            .collect();
        for name in &names {
            commands.remove(name);
        }
        names
    }

    /// Snapshot of all commands, sorted by name.
    pub fn list(&self) -> Vec<CommandInfo> {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<CommandInfo> = commands
            .values()
            .map(|c| CommandInfo {
                name: c.name.clone(),
                description: c.description.clone(),
                script: c.script.clone(),
                cooldown: c.cooldown,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn count_for_script(&self, script: &str) -> usize {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        commands.values().filter(|c| c.script == script).count()
    }

    pub fn len(&self) -> usize {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
