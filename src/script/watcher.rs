//! Script directory watcher.
//!
//! Turns file system notifications into `Script` events on the queue, so
//! loads and unloads happen on the dispatcher thread like everything else.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info};

use super::event::{Event, ScriptAction};
use super::lifecycle::is_script_file;
use super::queue::EventQueue;
use crate::{BotError, Result};

/// Watches a scripts directory until dropped.
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl SourceWatcher {
    pub fn new(dir: &Path, queue: Arc<EventQueue>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    for (action, path) in classify(&event) {
                        debug!("Script file {:?} changed: {}", path, action.as_str());
                        queue.submit(Event::Script { action, path }, "watcher");
                    }
                }
                Err(e) => error!("Script watcher error: {}", e),
            },
        )
        .map_err(|e| BotError::Watch(format!("failed to create watcher: {}", e)))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| BotError::Watch(format!("failed to watch {:?}: {}", dir, e)))?;

        info!("Watching {:?} for script changes", dir);
        Ok(Self {
            _watcher: watcher,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Map a notification to the script actions it implies.
pub fn classify(event: &notify::Event) -> Vec<(ScriptAction, PathBuf)> {
    let scripts = || event.paths.iter().filter(|p| is_script_file(p)).cloned();

    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            scripts().map(|p| (ScriptAction::Load, p)).collect()
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            scripts().map(|p| (ScriptAction::Unload, p)).collect()
        }
        // Paths are [from, to].
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut actions = Vec::new();
            if let Some(from) = event.paths.first().filter(|p| is_script_file(p)) {
                actions.push((ScriptAction::Unload, from.clone()));
            }
            if let Some(to) = event.paths.get(1).filter(|p| is_script_file(p)) {
                actions.push((ScriptAction::Load, to.clone()));
            }
            actions
        }
        // Platforms that cannot tell the direction of a rename.
        EventKind::Modify(ModifyKind::Name(_)) => scripts()
            .map(|p| {
                let action = if p.exists() {
                    ScriptAction::Load
                } else {
                    ScriptAction::Unload
                };
                (action, p)
            })
            .collect(),
        EventKind::Modify(_) => scripts().map(|p| (ScriptAction::Reload, p)).collect(),
        _ => Vec::new(),
    }
}
