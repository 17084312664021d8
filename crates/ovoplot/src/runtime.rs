//! Injected runtime capabilities: timers and persisted key/value state.
//!
//! Transports and the controller never reach for ambient timers or storage
//! directly; they take a [`Clock`] and (where they persist anything) a
//! [`KeyValueStore`] at construction so tests can run without real time or a
//! real filesystem.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

/// A boxed sleep future, so [`Clock`] stays object safe.
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Scheduling capability: the only way core code waits for wall time.
pub trait Clock: Send + Sync {
    /// Completes after roughly `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// The production clock, backed by the tokio timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A clock whose sleeps resolve immediately.
///
/// Forces every timeout race to the timeout branch (unless the awaited value
/// is already available), which makes timeout paths testable without wall
/// time.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantClock;

impl Clock for InstantClock {
    fn sleep(&self, _duration: Duration) -> SleepFuture {
        Box::pin(async {})
    }
}

/// Durable string key/value storage.
///
/// Used for the persisted serial port hint; deliberately tiny so a browser
/// localStorage, a config file or an in-memory map can all back it.
pub trait KeyValueStore: Send + Sync {
    /// Returns the stored value for `key`, if any.
    fn get(&self, key: &str) -> Option<String>;
    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str);
    /// Removes `key` if present.
    fn remove(&self, key: &str);
}

/// Volatile in-memory store; the default, and the one tests use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(key.to_owned(), value.to_owned());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(key);
        }
    }
}

/// A JSON-file-backed store so port hints survive process restarts.
///
/// Every mutation rewrites the whole file; the record is a handful of bytes.
/// Load and save failures are logged and treated as an empty store rather
/// than surfaced: losing a hint only costs the user one extra port prompt.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Opens (or lazily creates) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(err) => {
                    warn!("Ignoring malformed store file {:?}: {}", path, err);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    fn flush(&self, map: &HashMap<String, String>) {
        let text = match serde_json::to_string_pretty(map) {
            Ok(text) => text,
            Err(err) => {
                warn!("Could not serialize store: {}", err);
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&self.path, text) {
            warn!("Could not write store file {:?}: {}", self.path, err);
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(key.to_owned(), value.to_owned());
            self.flush(&map);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(key);
            self.flush(&map);
        }
    }
}

/// Blanket impls so `Arc<dyn …>` fields accept concrete types directly.
impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        (**self).sleep(duration)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }
}
