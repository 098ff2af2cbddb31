//! Chat platform abstraction.
//!
//! The engine only needs to send text to a channel and to receive incoming
//! messages. [`ConsolePlatform`] implements both over stdin/stdout for local
//! runs.

use std::io::Write;

use crate::Result;

/// Outbound side of a chat platform.
pub trait ChatPlatform: Send + Sync {
    /// Send `text` to the channel identified by `channel_id`.
    fn send_message(&self, channel_id: &str, text: &str) -> Result<()>;
}

/// A message received from the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub content: String,
    pub channel_id: String,
    pub author: String,
    /// `None` for direct messages.
    pub guild_id: Option<String>,
    pub author_is_bot: bool,
}

impl IncomingMessage {
    /// A message posted in a guild channel.
    pub fn channel(
        content: impl Into<String>,
        channel_id: impl Into<String>,
        author: impl Into<String>,
        guild_id: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            channel_id: channel_id.into(),
            author: author.into(),
            guild_id: Some(guild_id.into()),
            author_is_bot: false,
        }
    }

    /// A direct message.
    pub fn direct(
        content: impl Into<String>,
        channel_id: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            channel_id: channel_id.into(),
            author: author.into(),
            guild_id: None,
            author_is_bot: false,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.guild_id.is_none()
    }
}

/// Channel used for console input.
pub const CONSOLE_CHANNEL: &str = "console";

/// Platform that prints outgoing messages to stdout.
pub struct ConsolePlatform {
    user: String,
}

impl ConsolePlatform {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    /// Turn a line typed on the console into a message.
    ///
    /// `@name: text` is a direct message from `name`; anything else is a
    /// channel message from the console user. Blank lines yield `None`.
    pub fn parse_line(&self, line: &str) -> Option<IncomingMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix('@') {
            if let Some((author, text)) = rest.split_once(':') {
                let author = author.trim();
                let text = text.trim();
                if !author.is_empty() && !text.is_empty() {
                    return Some(IncomingMessage::direct(
                        text,
                        format!("dm-{}", author),
                        author,
                    ));
                }
            }
        }

        Some(IncomingMessage::channel(
            line,
            CONSOLE_CHANNEL,
            self.user.as_str(),
            CONSOLE_CHANNEL,
        ))
    }
}

impl ChatPlatform for ConsolePlatform {
    fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "[{}] {}", channel_id, text)?;
        stdout.flush()?;
        Ok(())
    }
}
