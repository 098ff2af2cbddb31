//! Script engine facade.
//!
//! Owns the event queue and the dispatcher thread. Everything that reaches
//! the interpreter goes through [`Engine`]: platform messages, script file
//! changes and the shutdown sequence.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::api::HostApi;
use super::commands::{CommandDispatch, CommandRegistry};
use super::dispatcher::Dispatcher;
use super::event::{Event, HookKind, ScriptAction};
use super::hooks::HookRegistry;
use super::http::HttpClient;
use super::interpreter::Interpreter;
use super::lifecycle::{LoadSummary, ScriptManager};
use super::queue::EventQueue;
use super::timer::TimerManager;
use super::value::ScriptValue;
use super::watcher::SourceWatcher;
use crate::config::Config;
use crate::db::Database;
use crate::platform::{ChatPlatform, IncomingMessage};
use crate::{BotError, Result};

/// Name of the thread that owns the interpreter.
pub const DISPATCHER_THREAD: &str = "script-dispatcher";

/// Reason passed to `on_shutdown` hooks.
pub const SHUTDOWN_REASON: &str = "graceful_shutdown";

/// The running script host.
pub struct Engine {
    queue: Arc<EventQueue>,
    hooks: Arc<HookRegistry>,
    commands: Arc<CommandRegistry>,
    timers: Arc<TimerManager>,
    scripts_dir: PathBuf,
    startup: LoadSummary,
    shutting_down: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Start the dispatcher thread and load every script in the scripts
    /// directory. Returns once the initial load has finished.
    ///
    /// Must be called from a multi-threaded tokio runtime: host functions
    /// block the dispatcher thread on async work driven by the runtime.
    pub async fn start(
        config: &Config,
        platform: Arc<dyn ChatPlatform>,
        store: Database,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| BotError::Config(format!("script engine needs a tokio runtime: {}", e)))?;
        if runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(BotError::Config(
                "script engine needs a multi-threaded tokio runtime".to_string(),
            ));
        }

        let (queue, mut rx) = EventQueue::new(config.scripting.queue_capacity);
        let hooks = Arc::new(HookRegistry::new());
        let commands = Arc::new(CommandRegistry::new(config.bot.command_prefix.as_str()));
        let timers = TimerManager::new(Arc::clone(&queue), runtime.clone());
        let http = HttpClient::new(&config.http)?;
        let scripts_dir = PathBuf::from(&config.scripting.scripts_dir);

        let (ready_tx, ready_rx) = oneshot::channel::<Result<LoadSummary>>();

        let thread = {
            let scripting = config.scripting.clone();
            let hooks = Arc::clone(&hooks);
            let commands = Arc::clone(&commands);
            let timers = Arc::clone(&timers);
            let scripts_dir = scripts_dir.clone();

            std::thread::Builder::new()
                .name(DISPATCHER_THREAD.to_string())
                .spawn(move || {
                    let setup = || -> Result<Dispatcher> {
                        let interp = Interpreter::from_config(&scripting)?;
                        let scripts = Rc::new(ScriptManager::new(
                            Arc::clone(&hooks),
                            Arc::clone(&commands),
                            Arc::clone(&timers),
                        ));
                        HostApi::new(
                            platform,
                            Rc::clone(&scripts),
                            Arc::clone(&hooks),
                            commands,
                            timers,
                            store,
                            http,
                            runtime,
                        )
                        .register(interp.lua())?;
                        Ok(Dispatcher::new(interp, scripts, hooks))
                    };

                    let dispatcher = match setup() {
                        Ok(dispatcher) => dispatcher,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    let summary = dispatcher.load_all(&scripts_dir);
                    if ready_tx.send(Ok(summary)).is_err() {
                        warn!("Engine startup abandoned");
                        return;
                    }

                    dispatcher.run(&mut rx);
                })?
        };

        let startup = ready_rx.await.map_err(|_| {
            BotError::Script("dispatcher thread exited during startup".to_string())
        })??;

        info!(
            "Script engine started: {} scripts loaded, {} failed",
            startup.loaded.len(),
            startup.failed.len()
        );

        Ok(Self {
            queue,
            hooks,
            commands,
            timers,
            scripts_dir,
            startup,
            shutting_down: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(thread)),
        })
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Result of the initial directory load.
    pub fn startup(&self) -> &LoadSummary {
        &self.startup
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Route an incoming platform message.
    ///
    /// Commands go to their owner; anything else fans out to the channel or
    /// direct message hooks. Messages from bots are ignored.
    pub fn process_message(&self, message: &IncomingMessage) {
        if self.is_shutting_down() {
            debug!("Ignoring message during shutdown");
            return;
        }
        if message.author_is_bot {
            return;
        }

        let content = message.content.trim();
        match self
            .commands
            .try_dispatch(content, &message.channel_id, &message.author, &self.queue)
        {
            CommandDispatch::NotCommand => {}
            CommandDispatch::Queued | CommandDispatch::OnCooldown => return,
        }

        let hook = if message.is_direct() {
            HookKind::DirectMessage
        } else {
            HookKind::ChannelMessage
        };
        let data = ScriptValue::table([
            ("content", ScriptValue::from(content)),
            ("channel_id", ScriptValue::from(message.channel_id.as_str())),
            ("author", ScriptValue::from(message.author.as_str())),
        ]);
        self.queue.submit(Event::Bot { hook, data }, "platform");
    }

    /// Queue a lifecycle operation for a script file.
    pub fn submit_script_event(&self, action: ScriptAction, path: impl Into<PathBuf>) -> bool {
        self.queue.submit(
            Event::Script {
                action,
                path: path.into(),
            },
            "engine",
        )
    }

    pub fn load_script(&self, path: impl Into<PathBuf>) -> bool {
        self.submit_script_event(ScriptAction::Load, path)
    }

    pub fn reload_script(&self, path: impl Into<PathBuf>) -> bool {
        self.submit_script_event(ScriptAction::Reload, path)
    }

    pub fn unload_script(&self, path: impl Into<PathBuf>) -> bool {
        self.submit_script_event(ScriptAction::Unload, path)
    }

    /// Watch the scripts directory and reload changed files.
    pub fn watch(&self) -> Result<SourceWatcher> {
        SourceWatcher::new(&self.scripts_dir, Arc::clone(&self.queue))
    }

    /// Stop the engine.
    ///
    /// New events are refused, timers are cancelled, `on_shutdown` hooks run
    /// after everything already queued, and the dispatcher thread is joined.
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down script engine");

        self.queue.begin_draining();
        self.timers.stop_all();

        let data = ScriptValue::table([("reason", ScriptValue::from(SHUTDOWN_REASON))]);
        if !self.queue.submit(
            Event::Bot {
                hook: HookKind::Shutdown,
                data,
            },
            "shutdown",
        ) {
            warn!("Shutdown hooks could not be queued");
        }
        self.queue.close();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => info!("Script engine stopped"),
                Ok(Err(_)) => error!("Dispatcher thread panicked"),
                Err(e) => error!("Failed to join dispatcher thread: {}", e),
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            // Let the dispatcher thread run out without waiting for it.
            self.queue.begin_draining();
            self.timers.stop_all();
            self.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPlatform {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl ChatPlatform for RecordingPlatform {
        fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    impl RecordingPlatform {
        fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.scripting.scripts_dir = dir.to_string_lossy().to_string();
        config
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    async fn start(dir: &Path) -> (Engine, Arc<RecordingPlatform>) {
        let platform = Arc::new(RecordingPlatform::default());
        let store = Database::open_in_memory().await.unwrap();
        let engine = Engine::start(&config(dir), platform.clone(), store)
            .await
            .unwrap();
        (engine, platform)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_loads_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.lua"), "register_command('a', 'first', function() end)").unwrap();
        std::fs::write(dir.path().join("b.lua"), "this does not parse").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        let (engine, _platform) = start(dir.path()).await;

        assert_eq!(engine.startup().loaded, vec!["a.lua"]);
        assert_eq!(engine.startup().failed, vec!["b.lua"]);
        assert!(engine.commands().get("a").is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_current_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = Database::open_in_memory().await.unwrap();
        let result = Engine::start(
            &config(dir.path()),
            Arc::new(RecordingPlatform::default()),
            store,
        )
        .await;
        assert!(matches!(result, Err(BotError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_message_routing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("route.lua"),
            r#"
            register_hook("on_channel_message", function(d) send_message(d.channel_id, "chan:" .. d.content) end)
            register_hook("on_direct_message", function(d) send_message(d.channel_id, "dm:" .. d.author) end)
            register_command("ping", "reply pong", function(d) send_message(d.channel_id, "pong " .. table.concat(d.args, " ", 2)) end)
            "#,
        )
        .unwrap();
        let (engine, platform) = start(dir.path()).await;

        engine.process_message(&IncomingMessage::channel("  hello  ", "c1", "alice", "g1"));
        engine.process_message(&IncomingMessage::direct("psst", "d1", "bob"));
        engine.process_message(&IncomingMessage::channel("!ping a b", "c1", "alice", "g1"));
        let mut from_bot = IncomingMessage::channel("ignored", "c1", "robot", "g1");
        from_bot.author_is_bot = true;
        engine.process_message(&from_bot);

        assert!(wait_until(|| platform.texts().len() >= 3).await);
        engine.shutdown().await;

        assert_eq!(platform.texts(), vec!["chan:hello", "dm:bob", "pong a b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_runs_hooks_and_rejects_later_messages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bye.lua"),
            r#"
            register_hook("on_shutdown", function(d) send_message("log", "bye:" .. d.reason) end)
            register_hook("on_channel_message", function(d) send_message("log", d.content) end)
            "#,
        )
        .unwrap();
        let (engine, platform) = start(dir.path()).await;

        engine.process_message(&IncomingMessage::channel("before", "c1", "alice", "g1"));
        engine.shutdown().await;
        engine.process_message(&IncomingMessage::channel("after", "c1", "alice", "g1"));
        engine.shutdown().await;

        assert!(engine.is_shutting_down());
        assert!(engine.queue().is_closed());
        assert_eq!(platform.texts(), vec!["before", "bye:graceful_shutdown"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_script_events_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _platform) = start(dir.path()).await;

        let path = dir.path().join("late.lua");
        std::fs::write(&path, "register_command('late', 'added later', function() end)").unwrap();
        assert!(engine.load_script(&path));
        assert!(wait_until(|| engine.commands().get("late").is_some()).await);

        assert!(engine.unload_script(&path));
        assert!(wait_until(|| engine.commands().is_empty()).await);

        engine.shutdown().await;
    }
}
