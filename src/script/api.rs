//! Host functions exposed to Lua scripts.
//!
//! All functions are registered as globals. They run on the dispatcher
//! thread; async collaborators are driven with the runtime handle. Failures
//! are logged and reported to the script as `nil`, never raised.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::{Function, IntoLua, Lua, Result as LuaResult, Table, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::commands::CommandRegistry;
use super::event::{HookKind, LuaRef};
use super::hooks::HookRegistry;
use super::http::{HttpClient, HttpOptions, HttpResponse};
use super::lifecycle::{ScriptManager, ScriptUnit};
use super::timer::TimerManager;
use super::value::ScriptValue;
use crate::db::{Database, KvRepository};
use crate::platform::ChatPlatform;
use crate::Result;

/// Host API builder for registering functions with Lua.
#[derive(Clone)]
pub struct HostApi {
    platform: Arc<dyn ChatPlatform>,
    scripts: Rc<ScriptManager>,
    hooks: Arc<HookRegistry>,
    commands: Arc<CommandRegistry>,
    timers: Arc<TimerManager>,
    store: Database,
    http: HttpClient,
    runtime: Handle,
}

impl HostApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        scripts: Rc<ScriptManager>,
        hooks: Arc<HookRegistry>,
        commands: Arc<CommandRegistry>,
        timers: Arc<TimerManager>,
        store: Database,
        http: HttpClient,
        runtime: Handle,
    ) -> Self {
        Self {
            platform,
            scripts,
            hooks,
            commands,
            timers,
            store,
            http,
            runtime,
        }
    }

    /// Register every host function as a global.
    pub fn register(self, lua: &Lua) -> LuaResult<()> {
        // === Messaging ===
        self.register_messaging_functions(lua)?;

        // === Hooks and commands ===
        self.register_hook_functions(lua)?;
        self.register_command_functions(lua)?;

        // === Key-value store ===
        self.register_store_functions(lua)?;

        // === HTTP and JSON ===
        self.register_http_functions(lua)?;
        self.register_json_functions(lua)?;

        // === Timers ===
        self.register_timer_functions(lua)?;

        Ok(())
    }

    /// send_message(channel_id, text) and log(message).
    fn register_messaging_functions(&self, lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        let platform = Arc::clone(&self.platform);
        let send_fn = lua.create_function(move |_, (channel_id, text): (String, Value)| {
            if let Err(e) = platform.send_message(&channel_id, &value_to_string(&text)) {
                error!("send_message error: {}", e);
            }
            Ok(())
        })?;
        globals.set("send_message", send_fn)?;

        let log_fn = lua.create_function(|_, message: Value| {
            info!(target: "lua_script", "[Lua Script] {}", value_to_string(&message));
            Ok(())
        })?;
        globals.set("log", log_fn)?;

        Ok(())
    }

    /// register_hook(name, fn).
    fn register_hook_functions(&self, lua: &Lua) -> LuaResult<()> {
        let scripts = Rc::clone(&self.scripts);
        let hooks = Arc::clone(&self.hooks);

        let register_hook_fn = lua.create_function(move |lua, (name, callback): (String, Function)| {
            let Some(unit) = current_script(&scripts, "register_hook") else {
                return Ok(());
            };

            if name == "on_unload" {
                unit.set_on_unload(callback);
                return Ok(());
            }

            match HookKind::from_name(&name) {
                Some(kind) => {
                    hooks.register(kind, LuaRef::new(lua, callback)?, unit.owner());
                    debug!("Hook '{}' registered by script '{}'", name, unit.name);
                }
                None => warn!("Unknown hook name '{}' in script '{}'", name, unit.name),
            }
            Ok(())
        })?;
        lua.globals().set("register_hook", register_hook_fn)?;

        Ok(())
    }

    /// register_command(name, description, fn, [cooldown]) and get_commands().
    fn register_command_functions(&self, lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        let scripts = Rc::clone(&self.scripts);
        let commands = Arc::clone(&self.commands);
        let register_fn = lua.create_function(
            move |lua, (name, description, callback, cooldown): (String, String, Function, Option<f64>)| {
                let Some(unit) = current_script(&scripts, "register_command") else {
                    return Ok(());
                };

                let cooldown = cooldown
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .unwrap_or_default();
                let callback = LuaRef::new(lua, callback)?;

                match commands.register(&name, &description, callback, cooldown, unit.owner()) {
                    Ok(()) => {
                        unit.add_command(&name);
                        info!("Command '{}' registered by script '{}'", name, unit.name);
                    }
                    Err(e) => warn!("register_command in script '{}': {}", unit.name, e),
                }
                Ok(())
            },
        )?;
        globals.set("register_command", register_fn)?;

        let commands = Arc::clone(&self.commands);
        let get_commands_fn = lua.create_function(move |lua, ()| {
            let result = lua.create_table()?;
            for info in commands.list() {
                let entry = lua.create_table()?;
                entry.set("name", info.name.as_str())?;
                entry.set("description", info.description)?;
                entry.set("script", info.script)?;
                entry.set("cooldown", info.cooldown.as_secs_f64())?;
                result.set(info.name, entry)?;
            }
            Ok(result)
        })?;
        globals.set("get_commands", get_commands_fn)?;

        Ok(())
    }

    /// store_set / store_get / store_get_all / store_delete.
    fn register_store_functions(&self, lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        let (store, runtime) = (self.store.clone(), self.runtime.clone());
        let set_fn = lua.create_function(move |_, (namespace, key, value): (String, String, Value)| {
            let encoded = match encode_for_store(&value) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!("store_set error: {}", e);
                    return Ok(());
                }
            };
            let repo = KvRepository::new(store.pool());
            if let Err(e) = runtime.block_on(repo.set(&namespace, &key, &encoded)) {
                error!("store_set error: {}", e);
            }
            Ok(())
        })?;
        globals.set("store_set", set_fn)?;

        let (store, runtime) = (self.store.clone(), self.runtime.clone());
        let get_fn = lua.create_function(move |lua, (namespace, key): (String, String)| {
            let repo = KvRepository::new(store.pool());
            match runtime.block_on(repo.get(&namespace, &key)) {
                Ok(Some(raw)) => decode_stored(&raw).into_lua(lua),
                Ok(None) => Ok(Value::Nil),
                Err(e) => {
                    error!("store_get error: {}", e);
                    Ok(Value::Nil)
                }
            }
        })?;
        globals.set("store_get", get_fn)?;

        let (store, runtime) = (self.store.clone(), self.runtime.clone());
        let get_all_fn = lua.create_function(move |lua, namespace: String| {
            let repo = KvRepository::new(store.pool());
            match runtime.block_on(repo.get_all(&namespace)) {
                Ok(pairs) => {
                    let result = lua.create_table()?;
                    for (key, raw) in pairs {
                        result.set(key, decode_stored(&raw))?;
                    }
                    Ok(Value::Table(result))
                }
                Err(e) => {
                    error!("store_get_all error: {}", e);
                    Ok(Value::Nil)
                }
            }
        })?;
        globals.set("store_get_all", get_all_fn)?;

        let (store, runtime) = (self.store.clone(), self.runtime.clone());
        let delete_fn = lua.create_function(move |_, (namespace, key): (String, String)| {
            let repo = KvRepository::new(store.pool());
            if let Err(e) = runtime.block_on(repo.delete(&namespace, &key)) {
                error!("store_delete error: {}", e);
            }
            Ok(())
        })?;
        globals.set("store_delete", delete_fn)?;

        Ok(())
    }

    /// http_get(url, [options]) and http_post(url, body, [options]).
    fn register_http_functions(&self, lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        let (http, runtime) = (self.http.clone(), self.runtime.clone());
        let get_fn = lua.create_function(move |lua, (url, options): (String, Option<Table>)| {
            let options = parse_http_options(options.as_ref())?;
            match runtime.block_on(http.get(&url, &options)) {
                Ok(response) => response_to_lua(lua, response),
                Err(e) => {
                    error!("http_get error: {}", e);
                    Ok(Value::Nil)
                }
            }
        })?;
        globals.set("http_get", get_fn)?;

        let (http, runtime) = (self.http.clone(), self.runtime.clone());
        let post_fn = lua.create_function(
            move |lua, (url, body, options): (String, String, Option<Table>)| {
                let options = parse_http_options(options.as_ref())?;
                match runtime.block_on(http.post(&url, body, &options)) {
                    Ok(response) => response_to_lua(lua, response),
                    Err(e) => {
                        error!("http_post error: {}", e);
                        Ok(Value::Nil)
                    }
                }
            },
        )?;
        globals.set("http_post", post_fn)?;

        Ok(())
    }

    /// json_encode(value) and json_decode(text).
    fn register_json_functions(&self, lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        let encode_fn = lua.create_function(|lua, value: Value| {
            match ScriptValue::try_from_lua(&value).and_then(|v| v.to_json_string()) {
                Ok(json) => json.into_lua(lua),
                Err(e) => {
                    error!("json_encode error: {}", e);
                    Ok(Value::Nil)
                }
            }
        })?;
        globals.set("json_encode", encode_fn)?;

        let decode_fn = lua.create_function(|lua, text: String| {
            match ScriptValue::from_json_str(&text) {
                Ok(value) => value.into_lua(lua),
                Err(e) => {
                    error!("json_decode error: {}", e);
                    Ok(Value::Nil)
                }
            }
        })?;
        globals.set("json_decode", decode_fn)?;

        Ok(())
    }

    /// call_later, register_timer and unregister_timer.
    fn register_timer_functions(&self, lua: &Lua) -> LuaResult<()> {
        let globals = lua.globals();

        let (scripts, timers) = (Rc::clone(&self.scripts), Arc::clone(&self.timers));
        let call_later_fn = lua.create_function(
            move |lua, (seconds, callback, data): (f64, Function, Value)| {
                let Some(unit) = current_script(&scripts, "call_later") else {
                    return Ok(Value::Nil);
                };
                let callback = LuaRef::new(lua, callback)?;
                let data = timer_data(lua, data)?;
                timers
                    .register_timer(seconds, callback, data, unit.owner())
                    .into_lua(lua)
            },
        )?;
        globals.set("call_later", call_later_fn)?;

        let (scripts, timers) = (Rc::clone(&self.scripts), Arc::clone(&self.timers));
        let register_timer_fn = lua.create_function(
            move |lua, (seconds, callback, data): (f64, Function, Value)| {
                let Some(unit) = current_script(&scripts, "register_timer") else {
                    return Ok(Value::Nil);
                };
                let callback = LuaRef::new(lua, callback)?;
                let data = timer_data(lua, data)?;
                timers
                    .register_repeating_timer(seconds, callback, data, unit.owner())
                    .into_lua(lua)
            },
        )?;
        globals.set("register_timer", register_timer_fn)?;

        let timers = Arc::clone(&self.timers);
        let unregister_fn =
            lua.create_function(move |_, id: String| Ok(timers.unregister_timer(&id)))?;
        globals.set("unregister_timer", unregister_fn)?;

        Ok(())
    }
}

/// The script executing right now, or a logged error.
fn current_script(scripts: &ScriptManager, function: &str) -> Option<Rc<ScriptUnit>> {
    let current = scripts.current();
    if current.is_none() {
        error!("{} called outside of a script", function);
    }
    current
}

fn timer_data(lua: &Lua, data: Value) -> LuaResult<Option<LuaRef>> {
    if data.is_nil() {
        Ok(None)
    } else {
        LuaRef::new(lua, data).map(Some)
    }
}

/// Tables are stored as JSON, everything else as its string form.
fn encode_for_store(value: &Value) -> Result<String> {
    match value {
        Value::Table(_) => ScriptValue::try_from_lua(value)?.to_json_string(),
        other => Ok(value_to_string(other)),
    }
}

/// Decode a stored value as JSON, falling back to the raw string.
fn decode_stored(raw: &str) -> ScriptValue {
    ScriptValue::from_json_str(raw).unwrap_or_else(|_| ScriptValue::String(raw.to_string()))
}

fn parse_http_options(options: Option<&Table>) -> LuaResult<HttpOptions> {
    let mut parsed = HttpOptions::default();
    let Some(options) = options else {
        return Ok(parsed);
    };

    match options.get::<Value>("timeout")? {
        Value::Integer(secs) if secs > 0 => {
            parsed.timeout = Some(Duration::from_secs(secs as u64));
        }
        Value::Number(secs) if secs > 0.0 => {
            parsed.timeout = Duration::try_from_secs_f64(secs).ok();
        }
        _ => {}
    }

    if let Value::Table(headers) = options.get::<Value>("headers")? {
        for pair in headers.pairs::<Value, Value>() {
            let (name, value) = pair?;
            parsed
                .headers
                .push((value_to_string(&name), value_to_string(&value)));
        }
    }

    Ok(parsed)
}

fn response_to_lua(lua: &Lua, response: HttpResponse) -> LuaResult<Value> {
    let result = lua.create_table()?;
    result.set("status", response.status)?;
    result.set("body", response.body)?;

    let headers = lua.create_table()?;
    for (name, value) in response.headers {
        headers.set(name, value)?;
    }
    result.set("headers", headers)?;

    Ok(Value::Table(result))
}

/// Convert a Lua Value to a string for output.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy(),
        Value::Table(_) => "[table]".to_string(),
        Value::Function(_) => "[function]".to_string(),
        Value::Thread(_) => "[thread]".to_string(),
        Value::UserData(_) => "[userdata]".to_string(),
        Value::LightUserData(_) => "[lightuserdata]".to_string(),
        Value::Error(e) => format!("[error: {}]", e),
        _ => "[unknown]".to_string(),
    }
}
