//! The cache plane: memoized step outputs keyed by hashpath.
//!
//! Reads short-circuit the pipeline; writes are negotiated among three
//! cache-control sources in options-wins precedence: the global cache
//! setting, the input's `Cache-Control` entry, and the sub-input's. A write
//! happens only when the global setting is not a disabling token and
//! neither message forbids storage. Writes may be forked onto a background
//! thread; background failures are logged and swallowed.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use crate::hashpath::Hashpath;
use crate::message::{Message, Value, CACHE_CONTROL_KEY};

/// The global cache setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSetting {
    /// Read and write per message-level negotiation.
    #[default]
    Auto,
    /// Read and write; message-level directives still veto storage.
    Always,
    /// Bypass reads; message-level directives still veto storage.
    NoCache,
    /// Read, but never store.
    NoStore,
    /// The cache plane is inert.
    #[serde(rename = "none")]
    Disabled,
}

impl CacheSetting {
    /// Whether stage-2 lookups consult the cache.
    #[must_use]
    pub const fn read_permitted(self) -> bool {
        matches!(self, Self::Auto | Self::Always | Self::NoStore)
    }

    /// Whether the setting alone permits storage.
    #[must_use]
    pub const fn write_permitted(self) -> bool {
        matches!(self, Self::Auto | Self::Always)
    }
}

/// Errors from cache backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Backend-specific failure.
    #[error("cache backend: {0}")]
    Backend(String),
}

/// Storage for memoized step outputs.
pub trait Cache: Send + Sync {
    /// Looks up the output stored under a hashpath.
    fn read(&self, key: &Hashpath) -> Option<Value>;

    /// Stores an output under a hashpath. Writers must be idempotent under
    /// identical hashpaths.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the backend cannot persist the entry.
    fn write(&self, key: &Hashpath, value: &Value) -> Result<(), CacheError>;
}

/// In-memory cache backend.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<Hashpath, Value>>,
}

impl MemoryCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of memoized entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing is memoized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn read(&self, key: &Hashpath) -> Option<Value> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn write(&self, key: &Hashpath, value: &Value) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.clone());
        Ok(())
    }
}

/// True when the message's `Cache-Control` entry forbids storing derived
/// results (`no-cache`, `no-store`, `no-transform`; underscore spellings
/// are accepted).
#[must_use]
pub fn message_forbids_store(msg: &Message) -> bool {
    let Some(value) = msg.get(CACHE_CONTROL_KEY) else {
        return false;
    };
    let mut tokens: Vec<String> = Vec::new();
    collect_tokens(value, &mut tokens);
    tokens.iter().any(|token| {
        matches!(token.as_str(), "no-cache" | "no-store" | "no-transform")
    })
}

fn collect_tokens(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Bytes(_) => {
            if let Some(text) = value.as_text() {
                out.extend(
                    text.split(',')
                        .map(|t| t.trim().to_ascii_lowercase().replace('_', "-"))
                        .filter(|t| !t.is_empty()),
                );
            }
        }
        Value::List(items) => {
            for item in items {
                collect_tokens(item, out);
            }
        }
        _ => {}
    }
}

/// The three-source write negotiation: the global setting must permit
/// storage and neither message may forbid it.
#[must_use]
pub fn write_permitted(setting: CacheSetting, input: &Message, sub: &Message) -> bool {
    setting.write_permitted() && !message_forbids_store(input) && !message_forbids_store(sub)
}

/// Performs a negotiated cache write, either inline or on a detached
/// thread.
///
/// Background failures are non-fatal (logged at `warn!`); synchronous
/// failures surface to the caller.
///
/// # Errors
///
/// Returns [`CacheError`] only for synchronous writes.
pub fn write_output(
    cache: &std::sync::Arc<dyn Cache>,
    key: &Hashpath,
    value: &Value,
    async_cache: bool,
) -> Result<(), CacheError> {
    if async_cache {
        let cache = std::sync::Arc::clone(cache);
        let key = key.clone();
        let value = value.clone();
        std::thread::spawn(move || {
            if let Err(e) = cache.write(&key, &value) {
                warn!(key = %key, error = %e, "background cache write failed");
            } else {
                debug!(key = %key, "background cache write");
            }
        });
        return Ok(());
    }
    cache.write(key, value)
}
