//! Hook registry: event kind to ordered callbacks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::event::{HookKind, LuaRef, ScriptOwner};

/// A callback subscribed to a hook kind.
#[derive(Debug, Clone)]
pub struct HookRegistration {
    pub kind: HookKind,
    pub callback: LuaRef,
    /// Name of the script that registered the hook.
    pub script: String,
    /// Load generation of that script.
    pub generation: u64,
}

/// Registry of hook subscriptions.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<HashMap<HookKind, Vec<HookRegistration>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback for `kind`.
    pub fn register(&self, kind: HookKind, callback: LuaRef, owner: impl Into<ScriptOwner>) {
        let owner = owner.into();
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks.entry(kind).or_default().push(HookRegistration {
            kind,
            callback,
            script: owner.name,
            generation: owner.generation,
        });
    }

    /// Snapshot of the callbacks for `kind`, in registration order.
    pub fn hooks_for(&self, kind: HookKind) -> Vec<HookRegistration> {
        let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks.get(&kind).cloned().unwrap_or_default()
    }

    /// Remove every hook owned by `script`. Returns how many were removed.
    pub fn remove_all_for_script(&self, script: &str) -> usize {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for list in hooks.values_mut() {
            let before = list.len();
            list.retain(|hook| hook.script != script);
            removed += before - list.len();
        }
        removed
    }

    pub fn count_for_script(&self, script: &str) -> usize {
        let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks
            .values()
            .flatten()
            .filter(|hook| hook.script == script)
            .count()
    }

    /// Total number of registered hooks.
    pub fn len(&self) -> usize {
        let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
