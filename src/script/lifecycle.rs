//! Script lifecycle: load, unload and reload of script files.
//!
//! Every script runs in its own environment table whose `__index` falls
//! back to the globals holding the host functions. Registrations made while
//! a script is "current" are attributed to it and removed when it unloads.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use mlua::{Function, Table};
use tracing::{debug, error, info, warn};

use super::commands::CommandRegistry;
use super::event::ScriptOwner;
use super::hooks::HookRegistry;
use super::interpreter::Interpreter;
use super::timer::TimerManager;
use crate::{BotError, Result};

/// A loaded script.
pub struct ScriptUnit {
    pub name: String,
    pub path: PathBuf,
    /// Distinguishes this load from earlier loads of the same file.
    pub generation: u64,
    env: Table,
    on_unload: RefCell<Option<Function>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptUnit {
    /// Owner tag for registrations made by this instance.
    pub fn owner(&self) -> ScriptOwner {
        ScriptOwner::new(self.name.as_str(), self.generation)
    }

    /// The script's isolated environment.
    pub fn env(&self) -> &Table {
        &self.env
    }

    pub fn set_on_unload(&self, callback: Function) {
        *self.on_unload.borrow_mut() = Some(callback);
    }

    pub fn has_on_unload(&self) -> bool {
        self.on_unload.borrow().is_some()
    }

    pub fn add_command(&self, name: &str) {
        self.commands.borrow_mut().push(name.to_string());
    }

    /// Names of the commands this script registered, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

/// Outcome of loading a directory of scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
}

/// Counts of registrations removed from a script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removed {
    pub hooks: usize,
    pub commands: usize,
    pub timers: usize,
}

/// Tracks loaded scripts. Lives on the dispatcher thread.
pub struct ScriptManager {
    scripts: RefCell<HashMap<String, Rc<ScriptUnit>>>,
    current: RefCell<Option<Rc<ScriptUnit>>>,
    last_generation: Cell<u64>,
    hooks: Arc<HookRegistry>,
    commands: Arc<CommandRegistry>,
    timers: Arc<TimerManager>,
}

impl ScriptManager {
    pub fn new(
        hooks: Arc<HookRegistry>,
        commands: Arc<CommandRegistry>,
        timers: Arc<TimerManager>,
    ) -> Self {
        Self {
            scripts: RefCell::new(HashMap::new()),
            current: RefCell::new(None),
            last_generation: Cell::new(0),
            hooks,
            commands,
            timers,
        }
    }

    /// The script whose code is currently executing, if any.
    pub fn current(&self) -> Option<Rc<ScriptUnit>> {
        self.current.borrow().clone()
    }

    /// Run `f` with `unit` as the current script, restoring the previous one.
    pub fn with_current<R>(&self, unit: &Rc<ScriptUnit>, f: impl FnOnce() -> R) -> R {
        let previous = self.current.replace(Some(Rc::clone(unit)));
        let result = f();
        *self.current.borrow_mut() = previous;
        result
    }

    pub fn get(&self, name: &str) -> Option<Rc<ScriptUnit>> {
        self.scripts.borrow().get(name).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.scripts.borrow().contains_key(name)
    }

    /// Names of the loaded scripts, sorted.
    pub fn loaded_scripts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// Load a script file.
    ///
    /// A failure while running the top-level code rolls back everything the
    /// script registered. Loading an already-loaded name reloads it.
    pub fn load(&self, interp: &Interpreter, path: &Path) -> Result<()> {
        let name = script_name(path)?;

        if self.is_loaded(&name) {
            info!("Script '{}' already loaded, reloading", name);
            self.unload(interp, &name);
        }

        let source = std::fs::read_to_string(path).map_err(|e| {
            BotError::Script(format!("failed to read '{}': {}", path.display(), e))
        })?;

        let lua = interp.lua();
        let env = lua.create_table()?;
        let meta = lua.create_table()?;
        meta.set("__index", lua.globals())?;
        env.set_metatable(Some(meta));

        let chunk = lua
            .load(source.as_str())
            .set_name(format!("@{}", name))
            .set_environment(env.clone())
            .into_function()
            .map_err(|e| BotError::Script(format!("failed to compile '{}': {}", name, e)))?;

        let generation = self.last_generation.get() + 1;
        self.last_generation.set(generation);
        let unit = Rc::new(ScriptUnit {
            name: name.clone(),
            path: path.to_path_buf(),
            generation,
            env,
            on_unload: RefCell::new(None),
            commands: RefCell::new(Vec::new()),
        });
        self.scripts
            .borrow_mut()
            .insert(name.clone(), Rc::clone(&unit));

        if let Err(e) = self.with_current(&unit, || interp.call::<()>(&chunk, ())) {
            let removed = self.remove_registrations(&unit);
            self.scripts.borrow_mut().remove(&name);
            interp.expire_registry_values();
            debug!(
                "Rolled back '{}': {} hooks, {} commands, {} timers",
                name, removed.hooks, removed.commands, removed.timers
            );
            return Err(BotError::Script(format!(
                "failed to run '{}': {}",
                name, e
            )));
        }

        info!(
            "Loaded script '{}' ({} hooks, {} commands, {} timers)",
            name,
            self.hooks.count_for_script(&name),
            self.commands.count_for_script(&name),
            self.timers.count_for_script(&name)
        );
        Ok(())
    }

    /// Unload a script by name. Returns false if it was not loaded.
    pub fn unload(&self, interp: &Interpreter, name: &str) -> bool {
        let Some(unit) = self.get(name) else {
            warn!("Cannot unload '{}': script not loaded", name);
            return false;
        };

        let on_unload = unit.on_unload.borrow_mut().take();
        if let Some(callback) = on_unload {
            if let Err(e) = self.with_current(&unit, || interp.call::<()>(&callback, ())) {
                error!("Lua on_unload error in script '{}': {}", name, e);
            }
        }

        let removed = self.remove_registrations(&unit);
        self.scripts.borrow_mut().remove(name);
        interp.expire_registry_values();

        info!(
            "Unloaded script '{}' ({} hooks, {} commands, {} timers removed)",
            name, removed.hooks, removed.commands, removed.timers
        );
        true
    }

    /// Unload then load. A failed load leaves the script absent.
    pub fn reload(&self, interp: &Interpreter, path: &Path) -> Result<()> {
        let name = script_name(path)?;
        if self.is_loaded(&name) {
            self.unload(interp, &name);
        }
        self.load(interp, path)
    }

    /// Load every `.lua` file in `dir`, in sorted order.
    pub fn load_all(&self, interp: &Interpreter, dir: &Path) -> LoadSummary {
        let mut summary = LoadSummary::default();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to read scripts directory {:?}: {}", dir, e);
                return summary;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_script_file(path))
            .collect();
        paths.sort();

        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match self.load(interp, &path) {
                Ok(()) => summary.loaded.push(name),
                Err(e) => {
                    error!("Failed to load script '{}': {}", name, e);
                    summary.failed.push(name);
                }
            }
        }

        info!(
            "Loaded {} scripts from {:?} ({} failed)",
            summary.loaded.len(),
            dir,
            summary.failed.len()
        );
        summary
    }

    fn remove_registrations(&self, unit: &ScriptUnit) -> Removed {
        let hooks = self.hooks.remove_all_for_script(&unit.name);
        let timers = self.timers.unregister_script_timers(&unit.name);

        unit.commands.borrow_mut().clear();
        let commands = self.commands.remove_all_for_script(&unit.name).len();

        Removed {
            hooks,
            commands,
            timers,
        }
    }
}

/// Whether `path` names a loadable script: a non-hidden `.lua` file.
pub fn is_script_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "lua")
}

/// The script name for a path: its file name.
pub fn script_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| BotError::Script(format!("invalid script path {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::event::{HookKind, LuaRef};
    use crate::script::queue::EventQueue;
    use std::time::Duration;

    struct Fixture {
        interp: Interpreter,
        manager: Rc<ScriptManager>,
        hooks: Arc<HookRegistry>,
        commands: Arc<CommandRegistry>,
        timers: Arc<TimerManager>,
        dir: tempfile::TempDir,
        _runtime: tokio::runtime::Runtime,
    }

    /// Minimal host functions that register against the current script.
    fn fixture() -> Fixture {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (queue, _rx) = EventQueue::new(10);
        let hooks = Arc::new(HookRegistry::new());
        let commands = Arc::new(CommandRegistry::default());
        let timers = TimerManager::new(queue, runtime.handle().clone());
        let manager = Rc::new(ScriptManager::new(
            Arc::clone(&hooks),
            Arc::clone(&commands),
            Arc::clone(&timers),
        ));
        let interp = Interpreter::new().unwrap();
        let lua = interp.lua();

        let m = Rc::clone(&manager);
        let h = Arc::clone(&hooks);
        let register_hook = lua
            .create_function(move |lua, (name, f): (String, Function)| {
                let unit = m.current().unwrap();
                if name == "on_unload" {
                    unit.set_on_unload(f);
                } else {
                    h.register(
                        HookKind::from_name(&name).unwrap(),
                        LuaRef::new(lua, f)?,
                        unit.owner(),
                    );
                }
                Ok(())
            })
            .unwrap();
        lua.globals().set("register_hook", register_hook).unwrap();

        let m = Rc::clone(&manager);
        let c = Arc::clone(&commands);
        let register_command = lua
            .create_function(move |lua, (name, f): (String, Function)| {
                let unit = m.current().unwrap();
                if c.register(&name, "", LuaRef::new(lua, f)?, Duration::ZERO, unit.owner())
                    .is_ok()
                {
                    unit.add_command(&name);
                }
                Ok(())
            })
            .unwrap();
        lua.globals().set("register_command", register_command).unwrap();

        let m = Rc::clone(&manager);
        let t = Arc::clone(&timers);
        let register_timer = lua
            .create_function(move |lua, f: Function| {
                let unit = m.current().unwrap();
                Ok(t.register_repeating_timer(60.0, LuaRef::new(lua, f)?, None, unit.owner()))
            })
            .unwrap();
        lua.globals().set("register_timer", register_timer).unwrap();

        Fixture {
            interp,
            manager,
            hooks,
            commands,
            timers,
            dir: tempfile::tempdir().unwrap(),
            _runtime: runtime,
        }
    }

    fn write(f: &Fixture, name: &str, source: &str) -> PathBuf {
        let path = f.dir.path().join(name);
        std::fs::write(&path, source).unwrap();
        path
    }

    const FULL_SCRIPT: &str = r#"
        register_hook("on_channel_message", function(data) end)
        register_command("ping", function(data) end)
        register_timer(function() end)
        register_hook("on_unload", function() _G.unloaded = (_G.unloaded or 0) + 1 end)
    "#;

    #[test]
    fn test_load_registers_and_tracks() {
        let f = fixture();
        let path = write(&f, "full.lua", FULL_SCRIPT);

        f.manager.load(&f.interp, &path).unwrap();

        assert!(f.manager.is_loaded("full.lua"));
        assert_eq!(f.hooks.count_for_script("full.lua"), 1);
        assert_eq!(f.commands.count_for_script("full.lua"), 1);
        assert_eq!(f.timers.count_for_script("full.lua"), 1);
        let unit = f.manager.get("full.lua").unwrap();
        assert_eq!(unit.commands(), vec!["ping"]);
        assert!(unit.has_on_unload());
        assert!(f.manager.current().is_none());
    }

    #[test]
    fn test_unload_removes_everything() {
        let f = fixture();
        let path = write(&f, "full.lua", FULL_SCRIPT);
        f.manager.load(&f.interp, &path).unwrap();

        assert!(f.manager.unload(&f.interp, "full.lua"));

        assert!(!f.manager.is_loaded("full.lua"));
        assert!(f.hooks.is_empty());
        assert!(f.commands.is_empty());
        assert_eq!(f.timers.active_count(), 0);
        let calls: i64 = f.interp.get_global("unloaded").unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_unload_unknown_is_noop() {
        let f = fixture();
        assert!(!f.manager.unload(&f.interp, "ghost.lua"));
    }

    #[test]
    fn test_reload_does_not_duplicate() {
        let f = fixture();
        let path = write(&f, "full.lua", FULL_SCRIPT);
        f.manager.load(&f.interp, &path).unwrap();
        f.manager.reload(&f.interp, &path).unwrap();
        f.manager.load(&f.interp, &path).unwrap();

        assert_eq!(f.hooks.count_for_script("full.lua"), 1);
        assert_eq!(f.commands.count_for_script("full.lua"), 1);
        assert_eq!(f.timers.count_for_script("full.lua"), 1);
        let calls: i64 = f.interp.get_global("unloaded").unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_each_load_gets_new_generation() {
        let f = fixture();
        let path = write(&f, "full.lua", FULL_SCRIPT);
        f.manager.load(&f.interp, &path).unwrap();
        let first = f.manager.get("full.lua").unwrap().generation;

        f.manager.reload(&f.interp, &path).unwrap();
        let second = f.manager.get("full.lua").unwrap().generation;

        assert!(second > first);
        assert_eq!(f.commands.get("ping").unwrap().generation, second);
        assert_eq!(
            f.hooks.hooks_for(HookKind::ChannelMessage)[0].generation,
            second
        );
    }

    #[test]
    fn test_environments_are_isolated() {
        let f = fixture();
        let a = write(&f, "a.lua", "counter = 1");
        let b = write(&f, "b.lua", "counter = 2");
        f.manager.load(&f.interp, &a).unwrap();
        f.manager.load(&f.interp, &b).unwrap();

        let a_env = f.manager.get("a.lua").unwrap();
        let b_env = f.manager.get("b.lua").unwrap();
        assert_eq!(a_env.env().get::<i64>("counter").unwrap(), 1);
        assert_eq!(b_env.env().get::<i64>("counter").unwrap(), 2);
        assert!(f.interp.get_global::<Option<i64>>("counter").unwrap().is_none());
    }

    #[test]
    fn test_compile_error_loads_nothing() {
        let f = fixture();
        let path = write(&f, "broken.lua", "this is not lua");

        let err = f.manager.load(&f.interp, &path).unwrap_err();
        assert!(err.to_string().contains("broken.lua"));
        assert!(!f.manager.is_loaded("broken.lua"));
    }

    #[test]
    fn test_runtime_error_rolls_back() {
        let f = fixture();
        let path = write(
            &f,
            "half.lua",
            r#"
            register_hook("on_channel_message", function() end)
            register_command("half", function() end)
            error("boom")
            "#,
        );

        let err = f.manager.load(&f.interp, &path).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!f.manager.is_loaded("half.lua"));
        assert!(f.hooks.is_empty());
        assert!(f.commands.is_empty());
    }

    #[test]
    fn test_load_all_sorted_and_filtered() {
        let f = fixture();
        write(&f, "b.lua", "x = 1");
        write(&f, "a.lua", "x = 1");
        write(&f, "bad.lua", "error('no')");
        write(&f, ".hidden.lua", "x = 1");
        write(&f, "notes.txt", "not a script");
        std::fs::create_dir(f.dir.path().join("dir.lua")).unwrap();

        let summary = f.manager.load_all(&f.interp, f.dir.path());
        assert_eq!(summary.loaded, vec!["a.lua", "b.lua"]);
        assert_eq!(summary.failed, vec!["bad.lua"]);
        assert_eq!(f.manager.loaded_scripts(), vec!["a.lua", "b.lua"]);
    }

    #[test]
    fn test_load_all_missing_dir() {
        let f = fixture();
        let summary = f.manager.load_all(&f.interp, &f.dir.path().join("missing"));
        assert_eq!(summary, LoadSummary::default());
    }

    #[test]
    fn test_duplicate_command_across_scripts() {
        let f = fixture();
        let a = write(&f, "a.lua", r#"register_command("dup", function() end)"#);
        let b = write(&f, "b.lua", r#"register_command("dup", function() end)"#);
        f.manager.load(&f.interp, &a).unwrap();
        f.manager.load(&f.interp, &b).unwrap();

        assert_eq!(f.commands.get("dup").unwrap().script, "a.lua");
        assert!(f.manager.get("b.lua").unwrap().commands().is_empty());

        // Unloading the loser must not remove the winner's command.
        f.manager.unload(&f.interp, "b.lua");
        assert_eq!(f.commands.get("dup").unwrap().script, "a.lua");
    }

    #[test]
    fn test_is_script_file() {
        assert!(is_script_file(Path::new("scripts/hello.lua")));
        assert!(!is_script_file(Path::new("scripts/.hello.lua")));
        assert!(!is_script_file(Path::new("scripts/hello.txt")));
        assert!(!is_script_file(Path::new("scripts/hello")));
    }
}
