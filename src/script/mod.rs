//! Lua script host.
//!
//! Scripts register hooks, commands and timers through host functions.
//! All of their code runs on one dispatcher thread fed by a bounded event
//! queue, so callbacks never overlap.

pub mod api;
pub mod commands;
pub mod dispatcher;
pub mod engine;
pub mod event;
pub mod hooks;
pub mod http;
pub mod interpreter;
pub mod lifecycle;
pub mod queue;
pub mod timer;
pub mod value;
pub mod watcher;

pub use api::HostApi;
pub use commands::{CommandDispatch, CommandError, CommandInfo, CommandRegistry};
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use event::{Event, HookKind, LuaRef, ScriptAction, ScriptOwner};
pub use hooks::{HookRegistration, HookRegistry};
pub use http::{HttpClient, HttpOptions, HttpResponse};
pub use interpreter::{Interpreter, ResourceLimits};
pub use lifecycle::{LoadSummary, ScriptManager, ScriptUnit};
pub use queue::{EventQueue, EventReceiver, QueueState};
pub use timer::TimerManager;
pub use value::ScriptValue;
pub use watcher::SourceWatcher;
