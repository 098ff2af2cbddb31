//! The embedded Lua interpreter with optional sandboxing and resource limits.
//!
//! The interpreter is not thread-safe; it lives on the dispatcher thread for
//! its whole life.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{FromLuaMulti, Function, HookTriggers, IntoLuaMulti, Lua, Value, VmState};

use crate::config::ScriptingConfig;
use crate::{BotError, Result};

/// How often the instruction hook runs.
const INSTRUCTION_STEP: u32 = 10_000;

/// `os` functions kept by the sandbox.
const SAFE_OS_FUNCTIONS: &[&str] = &["time", "date", "clock", "difftime"];

/// Resource limits for script execution.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Instructions allowed per invocation (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl ResourceLimits {
    pub fn from_config(config: &ScriptingConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory_mb * 1024 * 1024,
        }
    }
}

/// Owner of the single Lua state.
pub struct Interpreter {
    lua: Lua,
    instruction_count: Arc<AtomicU64>,
    limits: ResourceLimits,
}

impl Interpreter {
    /// Create an interpreter without sandbox or limits.
    pub fn new() -> Result<Self> {
        Self::with_limits(ResourceLimits::default(), false)
    }

    /// Create an interpreter with the given limits.
    pub fn with_limits(limits: ResourceLimits, sandbox: bool) -> Result<Self> {
        let lua = Lua::new();

        if sandbox {
            Self::apply_sandbox(&lua)?;
        }

        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory)
                .map_err(|e| BotError::Script(format!("Failed to set memory limit: {}", e)))?;
        }

        let instruction_count = Arc::new(AtomicU64::new(0));
        if limits.max_instructions > 0 {
            let count = Arc::clone(&instruction_count);
            let limit = limits.max_instructions;
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(INSTRUCTION_STEP),
                move |_lua, _debug| {
                    let step = u64::from(INSTRUCTION_STEP);
                    let current = count.fetch_add(step, Ordering::SeqCst) + step;
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "Script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        Ok(Self {
            lua,
            instruction_count,
            limits,
        })
    }

    /// Create an interpreter from the scripting configuration.
    pub fn from_config(config: &ScriptingConfig) -> Result<Self> {
        Self::with_limits(ResourceLimits::from_config(config), config.sandbox)
    }

    /// Remove standard library functions that reach outside the process.
    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        let disable = |name: &str| {
            globals
                .set(name, Value::Nil)
                .map_err(|e| BotError::Script(format!("Failed to disable {}: {}", name, e)))
        };

        for name in [
            "io",
            "debug",
            "package",
            "require",
            "load",
            "loadfile",
            "dofile",
            "collectgarbage",
        ] {
            disable(name)?;
        }

        // Keep the harmless clock functions of `os`.
        let os: Option<mlua::Table> = globals
            .get("os")
            .map_err(|e| BotError::Script(format!("Failed to read os: {}", e)))?;
        let safe_os = lua.create_table()?;
        if let Some(os) = os {
            for name in SAFE_OS_FUNCTIONS {
                let func: Value = os.get(*name)?;
                safe_os.set(*name, func)?;
            }
        }
        globals
            .set("os", safe_os)
            .map_err(|e| BotError::Script(format!("Failed to restrict os: {}", e)))?;

        Ok(())
    }

    /// Reset the per-invocation instruction budget.
    pub fn reset_budget(&self) {
        self.instruction_count.store(0, Ordering::SeqCst);
    }

    /// Call a Lua function with a fresh instruction budget.
    pub fn call<R: FromLuaMulti>(&self, func: &Function, args: impl IntoLuaMulti) -> mlua::Result<R> {
        self.reset_budget();
        func.call(args)
    }

    /// Execute Lua source code in the global environment.
    pub fn execute(&self, source: &str) -> Result<()> {
        self.reset_budget();
        self.lua
            .load(source)
            .exec()
            .map_err(|e| BotError::Script(format!("Script error: {}", e)))
    }

    /// Get a global value.
    pub fn get_global<V: mlua::FromLua>(&self, name: &str) -> Result<V> {
        self.lua
            .globals()
            .get(name)
            .map_err(|e| BotError::Script(format!("Failed to get global '{}': {}", name, e)))
    }

    /// Release registry slots whose handles have been dropped.
    pub fn expire_registry_values(&self) {
        self.lua.expire_registry_values();
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandboxed() -> Interpreter {
        Interpreter::with_limits(ResourceLimits::default(), true).unwrap()
    }

    #[test]
    fn test_basic_execution() {
        let interp = Interpreter::new().unwrap();
        interp.execute("x = 1 + 2").unwrap();

        let result: i32 = interp.get_global("x").unwrap();
        assert_eq!(result, 3);
    }

    #[test]
    fn test_string_library_available() {
        let interp = sandboxed();
        interp.execute(r#"result = string.upper("hello")"#).unwrap();

        let result: String = interp.get_global("result").unwrap();
        assert_eq!(result, "HELLO");
    }

    #[test]
    fn test_sandbox_io_disabled() {
        let interp = sandboxed();
        assert!(interp.execute("io.open('/etc/passwd', 'r')").is_err());
    }

    #[test]
    fn test_sandbox_os_execute_disabled() {
        let interp = sandboxed();
        assert!(interp.execute("os.execute('ls')").is_err());
        assert!(interp.execute("os.remove('/tmp/x')").is_err());
    }

    #[test]
    fn test_sandbox_keeps_os_time() {
        let interp = sandboxed();
        interp.execute("t = os.time(); c = os.clock()").unwrap();
        let t: i64 = interp.get_global("t").unwrap();
        assert!(t > 0);
    }

    #[test]
    fn test_sandbox_loaders_disabled() {
        let interp = sandboxed();
        assert!(interp.execute("loadfile('/etc/passwd')").is_err());
        assert!(interp.execute("dofile('/etc/passwd')").is_err());
        assert!(interp.execute("load('return 1')").is_err());
        assert!(interp.execute("require('os')").is_err());
    }

    #[test]
    fn test_sandbox_debug_disabled() {
        let interp = sandboxed();
        assert!(interp.execute("debug.traceback()").is_err());
    }

    #[test]
    fn test_no_sandbox_keeps_stdlib() {
        let interp = Interpreter::new().unwrap();
        interp.execute("has_io = io ~= nil").unwrap();
        assert!(interp.get_global::<bool>("has_io").unwrap());
    }

    #[test]
    fn test_instruction_limit() {
        let limits = ResourceLimits {
            max_instructions: 1000,
            max_memory: 0,
        };
        let interp = Interpreter::with_limits(limits, true).unwrap();

        let result = interp.execute("while true do end");
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("instruction limit"));
    }

    #[test]
    fn test_instruction_budget_is_per_call() {
        let limits = ResourceLimits {
            max_instructions: 200_000,
            max_memory: 0,
        };
        let interp = Interpreter::with_limits(limits, false).unwrap();
        interp
            .execute("function work() local s = 0 for i = 1, 20000 do s = s + i end return s end")
            .unwrap();
        let work: Function = interp.get_global("work").unwrap();

        // Each call stays under the budget even though the total exceeds it.
        for _ in 0..10 {
            let _: i64 = interp.call(&work, ()).unwrap();
        }
    }

    #[test]
    fn test_memory_limit() {
        let limits = ResourceLimits {
            max_instructions: 0,
            max_memory: 1024 * 100,
        };
        let interp = Interpreter::with_limits(limits, false).unwrap();

        let result = interp.execute(
            r#"
            t = {}
            for i = 1, 100000 do
                t[i] = string.rep("x", 1000)
            end
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_runtime_error() {
        let interp = Interpreter::new().unwrap();
        let result = interp.execute("error('test error')");
        assert!(result.unwrap_err().to_string().contains("test error"));
    }

    #[test]
    fn test_from_config() {
        let config = ScriptingConfig::default();
        let interp = Interpreter::from_config(&config).unwrap();
        assert_eq!(interp.limits().max_memory, 64 * 1024 * 1024);
        assert!(interp.execute("io.write('x')").is_err());
    }
}
