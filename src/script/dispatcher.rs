//! The script dispatcher.
//!
//! Runs on the single thread that owns the interpreter, pulling events off
//! the queue one at a time. No two callbacks ever run concurrently.

use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use mlua::{Function, IntoLua, Value};
use tracing::{debug, error, info};

use super::event::{Event, LuaRef, ScriptAction};
use super::hooks::HookRegistry;
use super::interpreter::Interpreter;
use super::lifecycle::{script_name, LoadSummary, ScriptManager};
use super::queue::EventReceiver;
use super::value::ScriptValue;

pub struct Dispatcher {
    interp: Interpreter,
    scripts: Rc<ScriptManager>,
    hooks: Arc<HookRegistry>,
}

impl Dispatcher {
    pub fn new(interp: Interpreter, scripts: Rc<ScriptManager>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            interp,
            scripts,
            hooks,
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interp
    }

    pub fn scripts(&self) -> &Rc<ScriptManager> {
        &self.scripts
    }

    /// Load the initial script set.
    pub fn load_all(&self, dir: &Path) -> LoadSummary {
        self.scripts.load_all(&self.interp, dir)
    }

    /// Process events until every producer is gone and the queue is empty.
    pub fn run(&self, rx: &mut EventReceiver) {
        info!("Script dispatcher started");
        while let Some(event) = rx.blocking_recv() {
            self.dispatch(event);
        }
        info!("Script dispatcher stopped");
    }

    /// Handle one event to completion.
    pub fn dispatch(&self, event: Event) {
        debug!("Dispatching {}", event.kind());

        match event {
            Event::Bot { hook, data } => {
                // Snapshot, so hooks registered by a callback wait for the next event.
                for registration in self.hooks.hooks_for(hook) {
                    let Some(arg) = self.to_lua(&registration.script, &data) else {
                        continue;
                    };
                    self.invoke(
                        &registration.callback,
                        &registration.script,
                        registration.generation,
                        arg,
                    );
                }
            }
            Event::Timer {
                timer_id,
                data,
                callback,
                script,
                generation,
            } => {
                let arg = match data {
                    Some(data) => match data.get::<Value>(self.interp.lua()) {
                        Ok(value) => value,
                        Err(e) => {
                            error!("Failed to read data for timer {}: {}", timer_id, e);
                            Value::Nil
                        }
                    },
                    None => Value::Nil,
                };
                self.invoke(&callback, &script, generation, arg);
            }
            Event::Command {
                name,
                data,
                callback,
                script,
                generation,
            } => {
                debug!("Running command '{}' from script '{}'", name, script);
                if let Some(arg) = self.to_lua(&script, &data) {
                    self.invoke(&callback, &script, generation, arg);
                }
            }
            Event::Script { action, path } => self.apply_script_action(action, &path),
        }

        self.interp.expire_registry_values();
    }

    fn apply_script_action(&self, action: ScriptAction, path: &Path) {
        let result = match action {
            ScriptAction::Load => self.scripts.load(&self.interp, path),
            ScriptAction::Reload => self.scripts.reload(&self.interp, path),
            ScriptAction::Unload => script_name(path).map(|name| {
                self.scripts.unload(&self.interp, &name);
            }),
        };

        if let Err(e) = result {
            error!("Script {} failed for {:?}: {}", action.as_str(), path, e);
        }
    }

    fn to_lua(&self, script: &str, data: &ScriptValue) -> Option<Value> {
        match data.clone().into_lua(self.interp.lua()) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Failed to convert event data for script '{}': {}", script, e);
                None
            }
        }
    }

    /// Call a script callback. Errors are logged and never propagate.
    ///
    /// Callbacks whose script has since been unloaded or reloaded are skipped.
    fn invoke(&self, callback: &LuaRef, script: &str, generation: u64, arg: Value) {
        let Some(unit) = self.scripts.get(script) else {
            debug!("Skipping callback of unloaded script '{}'", script);
            return;
        };
        if unit.generation != generation {
            debug!(
                "Skipping callback of replaced script '{}' (generation {}, now {})",
                script, generation, unit.generation
            );
            return;
        }

        let result = callback
            .get::<Function>(self.interp.lua())
            .and_then(|func| {
                self.scripts
                    .with_current(&unit, || self.interp.call::<()>(&func, arg))
            });

        if let Err(e) = result {
            error!("Lua hook error in script '{}': {}", script, e);
        }
    }
}
