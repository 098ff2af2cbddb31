//! Events consumed by the script dispatcher.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use mlua::{FromLua, IntoLua, Lua, RegistryKey};

use super::value::ScriptValue;

/// Handle to a Lua value stored in the interpreter registry.
///
/// The handle is `Send + Sync`, so registries and events can hold it on any
/// thread. The value itself can only be read back on the thread owning the
/// interpreter. It is released once the last handle is dropped and the
/// dispatcher expires registry values.
#[derive(Clone)]
pub struct LuaRef(Arc<RegistryKey>);

impl LuaRef {
    /// Store a value in the registry.
    pub fn new(lua: &Lua, value: impl IntoLua) -> mlua::Result<Self> {
        Ok(Self(Arc::new(lua.create_registry_value(value)?)))
    }

    /// Read the value back.
    pub fn get<T: FromLua>(&self, lua: &Lua) -> mlua::Result<T> {
        lua.registry_value(&self.0)
    }
}

impl fmt::Debug for LuaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LuaRef").finish()
    }
}

/// One loaded instance of a script.
///
/// Every load gets a fresh generation, so callbacks captured from an earlier
/// instance of the same file can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOwner {
    pub name: String,
    pub generation: u64,
}

impl ScriptOwner {
    pub fn new(name: impl Into<String>, generation: u64) -> Self {
        Self {
            name: name.into(),
            generation,
        }
    }
}

impl From<&str> for ScriptOwner {
    fn from(name: &str) -> Self {
        Self::new(name, 0)
    }
}

impl fmt::Display for ScriptOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.generation)
    }
}

/// Named hook points scripts can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    ChannelMessage,
    DirectMessage,
    Shutdown,
}

impl HookKind {
    pub const ALL: [HookKind; 3] = [
        HookKind::ChannelMessage,
        HookKind::DirectMessage,
        HookKind::Shutdown,
    ];

    /// Script-facing hook name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::ChannelMessage => "on_channel_message",
            HookKind::DirectMessage => "on_direct_message",
            HookKind::Shutdown => "on_shutdown",
        }
    }

    /// Parse a script-facing hook name.
    ///
    /// `on_unload` is not a hook kind; it is stored on the script itself.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operation requested for a script file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    Load,
    Reload,
    Unload,
}

impl ScriptAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptAction::Load => "load",
            ScriptAction::Reload => "reload",
            ScriptAction::Unload => "unload",
        }
    }
}

/// A unit of work for the dispatcher.
#[derive(Debug)]
pub enum Event {
    /// Fan out to every hook registered for `hook`.
    Bot { hook: HookKind, data: ScriptValue },
    /// A timer expired.
    Timer {
        timer_id: String,
        data: Option<LuaRef>,
        callback: LuaRef,
        script: String,
        generation: u64,
    },
    /// A chat command passed its cooldown check.
    Command {
        name: String,
        data: ScriptValue,
        callback: LuaRef,
        script: String,
        generation: u64,
    },
    /// Load, reload or unload a script file.
    Script { action: ScriptAction, path: PathBuf },
}

impl Event {
    /// Short label used in logs.
    pub fn kind(&self) -> String {
        match self {
            Event::Bot { hook, .. } => hook.as_str().to_string(),
            Event::Timer { timer_id, .. } => format!("timer({})", timer_id),
            Event::Command { name, .. } => format!("command({})", name),
            Event::Script { action, .. } => format!("script_{}", action.as_str()),
        }
    }

    /// Whether the event belongs to the shutdown sequence.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Event::Bot {
                hook: HookKind::Shutdown,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_kind_names() {
        for kind in HookKind::ALL {
            assert_eq!(HookKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(HookKind::from_name("on_unload"), None);
        assert_eq!(HookKind::from_name("on_anything"), None);
    }

    #[test]
    fn test_event_kind_labels() {
        let lua = Lua::new();
        let callback = LuaRef::new(&lua, lua.create_function(|_, ()| Ok(())).unwrap()).unwrap();

        let bot = Event::Bot {
            hook: HookKind::ChannelMessage,
            data: ScriptValue::Nil,
        };
        assert_eq!(bot.kind(), "on_channel_message");

        let timer = Event::Timer {
            timer_id: "timer_7".to_string(),
            data: None,
            callback: callback.clone(),
            script: "a.lua".to_string(),
            generation: 1,
        };
        assert_eq!(timer.kind(), "timer(timer_7)");

        let command = Event::Command {
            name: "ping".to_string(),
            data: ScriptValue::Nil,
            callback,
            script: "a.lua".to_string(),
            generation: 1,
        };
        assert_eq!(command.kind(), "command(ping)");

        let script = Event::Script {
            action: ScriptAction::Reload,
            path: PathBuf::from("a.lua"),
        };
        assert_eq!(script.kind(), "script_reload");
    }

    #[test]
    fn test_is_shutdown() {
        let shutdown = Event::Bot {
            hook: HookKind::Shutdown,
            data: ScriptValue::Nil,
        };
        assert!(shutdown.is_shutdown());

        let message = Event::Bot {
            hook: HookKind::DirectMessage,
            data: ScriptValue::Nil,
        };
        assert!(!message.is_shutdown());
    }

    #[test]
    fn test_lua_ref_roundtrip() {
        let lua = Lua::new();
        let handle = LuaRef::new(&lua, "stored").unwrap();
        let value: String = handle.get(&lua).unwrap();
        assert_eq!(value, "stored");
    }

    #[test]
    fn test_lua_ref_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LuaRef>();
        assert_send_sync::<Event>();
    }
}
