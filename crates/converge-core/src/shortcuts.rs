//! Ergonomic read/write helpers over the resolver.
//!
//! These wrappers keep calling code out of the sub-input plumbing: `get`
//! with a default, `set` from a patch message, deep `set` along a path
//! (descend, mutate the leaf, rebuild parents bottom-up through each
//! parent's device), `remove`, and `keys` with reserved-key filtering.

use crate::device::Device;
use crate::error::{ErrorStrategy, ResolveError, ResolveResult};
use crate::key::{key_to_binary, to_key, Key};
use crate::message::{
    Message, Value, CACHE_CONTROL_KEY, COMMITMENTS_KEY, DEVICE_KEY, PATH_KEY,
};
use crate::path::Path;
use crate::resolver::{resolve, Opts, SubInput};

/// Keys filtered by [`KeysMode::Remove`].
pub const RESERVED_KEYS: [&str; 4] = [DEVICE_KEY, PATH_KEY, COMMITMENTS_KEY, CACHE_CONTROL_KEY];

/// Reads a value.
///
/// # Errors
///
/// Any [`ResolveError`] from the underlying resolution.
pub fn get(msg: &Message, path: impl Into<SubInput>, opts: &Opts) -> ResolveResult<Value> {
    resolve(msg, path, opts)
}

/// Reads a value, falling back to `default` on any resolution error.
/// The error strategy is forced to `Return` for the probe so device panics
/// surface as the default instead of unwinding.
#[must_use]
pub fn get_or(msg: &Message, path: impl Into<SubInput>, default: Value, opts: &Opts) -> Value {
    let mut probe_opts = opts.clone();
    probe_opts.error_strategy = ErrorStrategy::Return;
    resolve(msg, path, &probe_opts).unwrap_or(default)
}

/// Reads a value through a different device: the input's device binding is
/// overridden for this call only, while its hashpath witness is preserved.
///
/// # Errors
///
/// Any [`ResolveError`] from the underlying resolution.
pub fn get_as(
    device: &Device,
    msg: &Message,
    path: impl Into<SubInput>,
    opts: &Opts,
) -> ResolveResult<Value> {
    let overridden = msg.with_device(device.clone());
    resolve(&overridden, path, opts)
}

/// Applies a patch message through the input's device: every key of the
/// patch (its hashpath witness and path selector stripped) is handed to the
/// device's `set` handler.
///
/// # Errors
///
/// Returns [`ResolveError::BadSubInput`] when `set` yields a scalar, or any
/// resolution error.
pub fn set(msg: &Message, patch: &Message, opts: &Opts) -> ResolveResult<Message> {
    let mut sub = patch.without_path();
    sub.clear_hashpath();
    sub.insert(PATH_KEY, Value::Path(Path::from_key(to_key("set"))));
    resolve(msg, SubInput::Message(sub), opts)?
        .into_map()
        .ok_or_else(|| ResolveError::BadSubInput {
            reason: "set produced a scalar".to_string(),
        })
}

/// Deep set: descends `path` by resolving one key at a time, replaces the
/// leaf through its parent's device, then rebuilds each ancestor by handing
/// it its child's new state. Devices along the way observe the rebuild and
/// may record their own side effects.
///
/// # Errors
///
/// Returns [`ResolveError::BadSubInput`] for an empty path or when the path
/// crosses a scalar, or any resolution error.
pub fn set_path(
    msg: &Message,
    path: &Path,
    value: impl Into<Value>,
    opts: &Opts,
) -> ResolveResult<Message> {
    let keys = path.keys();
    let Some((leaf_key, ancestors)) = keys.split_last() else {
        return Err(ResolveError::BadSubInput {
            reason: "deep set requires a non-empty path".to_string(),
        });
    };

    // Descend: parents[i] is the message reached after i path elements.
    let mut parents: Vec<Message> = Vec::with_capacity(ancestors.len() + 1);
    parents.push(msg.clone());
    for key in ancestors {
        let next = resolve(parents.last().unwrap_or(msg), SubInput::Key(key.clone()), opts)?
            .into_map()
            .ok_or_else(|| ResolveError::BadSubInput {
                reason: format!("deep set path crosses a scalar at {key}"),
            })?;
        parents.push(next);
    }

    // Mutate the leaf, then fold back up through each parent's device.
    let leaf_parent = parents.pop().unwrap_or_else(|| msg.clone());
    let mut rebuilt = set(
        &leaf_parent,
        &Message::new().with(leaf_key.clone(), value.into()),
        opts,
    )?;
    for (parent, key) in parents.iter().rev().zip(ancestors.iter().rev()) {
        rebuilt = set(
            parent,
            &Message::new().with(key.clone(), Value::Map(rebuilt)),
            opts,
        )?;
    }
    Ok(rebuilt)
}

/// Removes a key through the input's device.
///
/// # Errors
///
/// Returns [`ResolveError::BadSubInput`] when `remove` yields a scalar, or
/// any resolution error.
pub fn remove(msg: &Message, key: &Key, opts: &Opts) -> ResolveResult<Message> {
    let sub = Message::new()
        .with(PATH_KEY, Value::Path(Path::from_key(to_key("remove"))))
        .with("item", Value::Bytes(key_to_binary(key)));
    resolve(msg, SubInput::Message(sub), opts)?
        .into_map()
        .ok_or_else(|| ResolveError::BadSubInput {
            reason: "remove produced a scalar".to_string(),
        })
}

/// Which keys [`keys`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeysMode {
    /// Every key the device enumerates.
    #[default]
    All,
    /// Reserved keys filtered out.
    Remove,
}

/// Enumerates the message's keys through its device.
///
/// # Errors
///
/// Returns [`ResolveError::BadSubInput`] when the device's `keys` handler
/// yields something other than a list of byte strings, or any resolution
/// error.
pub fn keys(msg: &Message, opts: &Opts) -> ResolveResult<Vec<Key>> {
    keys_mode(msg, opts, KeysMode::All)
}

/// Enumerates keys with reserved-key filtering.
///
/// # Errors
///
/// See [`keys`].
pub fn keys_mode(msg: &Message, opts: &Opts, mode: KeysMode) -> ResolveResult<Vec<Key>> {
    let listed = resolve(msg, "keys", opts)?;
    let Value::List(items) = listed else {
        return Err(ResolveError::BadSubInput {
            reason: "keys did not produce a list".to_string(),
        });
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(text) = item.as_text() else {
            return Err(ResolveError::BadSubInput {
                reason: "keys produced a non-text entry".to_string(),
            });
        };
        out.push(to_key(text));
    }
    if mode == KeysMode::Remove {
        let reserved: Vec<Key> = RESERVED_KEYS.iter().map(|k| to_key(k)).collect();
        out.retain(|key| !reserved.contains(key));
    }
    Ok(out)
}
