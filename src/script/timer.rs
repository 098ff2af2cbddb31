//! Timer manager.
//!
//! Each timer is a tokio task sleeping on the runtime. On expiry it submits a
//! timer event to the queue; callbacks are never invoked from the timer
//! task itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::event::{Event, LuaRef, ScriptOwner};
use super::queue::EventQueue;

/// Shortest interval a repeating timer may use.
pub const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(10);

struct TimerEntry {
    duration: Duration,
    callback: LuaRef,
    data: Option<LuaRef>,
    script: String,
    generation: u64,
    repeating: bool,
    task: AbortHandle,
}

/// Owns every scheduled timer.
pub struct TimerManager {
    timers: Mutex<HashMap<String, TimerEntry>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    queue: Arc<EventQueue>,
    runtime: Handle,
}

impl TimerManager {
    /// Create a manager scheduling its tasks on `runtime`.
    pub fn new(queue: Arc<EventQueue>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            timers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            queue,
            runtime,
        })
    }

    /// Schedule a one-shot timer firing after `seconds`.
    pub fn register_timer(
        self: &Arc<Self>,
        seconds: f64,
        callback: LuaRef,
        data: Option<LuaRef>,
        owner: impl Into<ScriptOwner>,
    ) -> String {
        self.schedule(to_duration(seconds), callback, data, owner.into(), false)
    }

    /// Schedule a timer firing every `seconds` until unregistered.
    pub fn register_repeating_timer(
        self: &Arc<Self>,
        seconds: f64,
        callback: LuaRef,
        data: Option<LuaRef>,
        owner: impl Into<ScriptOwner>,
    ) -> String {
        let interval = to_duration(seconds).max(MIN_REPEAT_INTERVAL);
        self.schedule(interval, callback, data, owner.into(), true)
    }

    fn schedule(
        self: &Arc<Self>,
        duration: Duration,
        callback: LuaRef,
        data: Option<LuaRef>,
        owner: ScriptOwner,
        repeating: bool,
    ) -> String {
        let id = format!("timer_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        if self.stopped.load(Ordering::SeqCst) {
            warn!(
                "Timer manager stopped, not scheduling {} for script '{}'",
                id, owner.name
            );
            return id;
        }

        // Hold the lock while spawning so the task cannot fire before its
        // entry exists.
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);

        let manager: Weak<TimerManager> = Arc::downgrade(self);
        let task_id = id.clone();
        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(duration).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !manager.fire(&task_id) {
                    break;
                }
            }
        });

        timers.insert(
            id.clone(),
            TimerEntry {
                duration,
                callback,
                data,
                script: owner.name.clone(),
                generation: owner.generation,
                repeating,
                task: task.abort_handle(),
            },
        );

        debug!(
            "Registered {} timer {} ({:?}) for script '{}'",
            if repeating { "repeating" } else { "one-shot" },
            id,
            duration,
            owner
        );
        id
    }

    /// Submit the timer event. Returns whether the timer should re-arm.
    fn fire(&self, id: &str) -> bool {
        let (event, repeating) = {
            let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = timers.get(id) else {
                return false;
            };
            (
                Event::Timer {
                    timer_id: id.to_string(),
                    data: entry.data.clone(),
                    callback: entry.callback.clone(),
                    script: entry.script.clone(),
                    generation: entry.generation,
                },
                entry.repeating,
            )
        };

        self.queue.submit(event, "timer");

        if !repeating {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            timers.remove(id);
        }

        repeating && !self.stopped.load(Ordering::SeqCst)
    }

    /// Cancel a timer. Returns false for unknown ids.
    pub fn unregister_timer(&self, id: &str) -> bool {
        let entry = {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            timers.remove(id)
        };
        match entry {
            Some(entry) => {
                entry.task.abort();
                debug!("Unregistered timer {}", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every timer owned by `script`. Returns how many were cancelled.
    pub fn unregister_script_timers(&self, script: &str) -> usize {
        let removed: Vec<TimerEntry> = {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = timers
                .iter()
                .filter(|(_, entry)| entry.script == script)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| timers.remove(id)).collect()
        };

        for entry in &removed {
            entry.task.abort();
        }
        removed.len()
    }

    /// Cancel every timer and refuse new ones.
    pub fn stop_all(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let removed: Vec<TimerEntry> = {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            timers.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &removed {
            entry.task.abort();
        }
        debug!("Stopped {} timers", removed.len());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ids of the active timers, sorted.
    pub fn active_timers(&self) -> Vec<String> {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = timers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count_for_script(&self, script: &str) -> usize {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.values().filter(|e| e.script == script).count()
    }

    /// Scheduled interval of a timer.
    pub fn interval(&self, id: &str) -> Option<Duration> {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.get(id).map(|e| e.duration)
    }
}

/// Seconds to a duration. Negative and non-finite values become zero.
fn to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}
