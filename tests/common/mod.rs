//! Test helpers for engine integration tests.
//!
//! Provides a recording chat platform, a scripts directory fixture, and a
//! polling helper.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use luabot::{ChatPlatform, Config, Database, Engine, Result};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform that records sent messages.
///
/// Tracks how many `send_message` calls overlap, so tests can check that
/// script callbacks never run concurrently.
#[derive(Default)]
pub struct RecordingPlatform {
    sent: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl RecordingPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A platform whose sends take `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ChatPlatform for RecordingPlatform {
    fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A temporary scripts directory.
pub struct ScriptDir {
    dir: tempfile::TempDir,
}

impl ScriptDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a script and return its path.
    pub fn write(&self, name: &str, source: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, source).unwrap();
        path
    }

    /// Configuration pointing at this directory, with watching off.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.scripting.scripts_dir = self.path().to_string_lossy().to_string();
        config.scripting.watch = false;
        config
    }
}

/// Start an engine with an in-memory store.
pub async fn start_engine(config: &Config, platform: Arc<RecordingPlatform>) -> Engine {
    let store = Database::open_in_memory().await.unwrap();
    Engine::start(config, platform, store).await.unwrap()
}

/// Poll `check` until it holds or `DEFAULT_TIMEOUT` passes.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
