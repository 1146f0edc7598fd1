//! The default identity device.
//!
//! Every message without a `device` binding dispatches here. Keys resolve to
//! the values they map to; `set`, `remove`, and `keys` provide the basic
//! write and enumeration operations other devices defer to.

use std::sync::Arc;

use crate::device::{DeviceError, DeviceInfo, DeviceModule, Handler};
use crate::key::{key_to_binary, to_key, Key};
use crate::message::{Message, Value, PATH_KEY};

/// The identity device over plain messages.
pub struct MessageDevice;

impl DeviceModule for MessageDevice {
    fn info(&self, _input: Option<&Message>, _opts: &crate::resolver::Opts) -> DeviceInfo {
        DeviceInfo {
            default: Some(Arc::new(|key, input, _sub, _opts| {
                input
                    .get_key(key)
                    .cloned()
                    .ok_or_else(|| DeviceError::NotFound {
                        key: key.render(),
                    })
            })),
            ..DeviceInfo::default()
        }
    }

    fn export(&self, key: &Key) -> Option<Handler> {
        match key {
            Key::Text(name) => match name.as_str() {
                "set" => Some(Handler::binary(set)),
                "remove" => Some(Handler::binary(remove)),
                "keys" => Some(Handler::unary(keys)),
                _ => None,
            },
            Key::Id(_) => None,
        }
    }
}

/// Applies every non-path key of the patch to the input, producing a fresh
/// message. The output carries no witness; the resolver links it.
fn set(input: &Message, patch: &Message) -> Result<Value, DeviceError> {
    let mut output = input.clone();
    output.clear_hashpath();
    let path_key = to_key(PATH_KEY);
    for (key, value) in patch.iter() {
        if *key == path_key {
            continue;
        }
        output.insert(key.clone(), value.clone());
    }
    Ok(Value::Map(output))
}

/// Removes the key named by `item` (or every key in `items`).
fn remove(input: &Message, sub: &Message) -> Result<Value, DeviceError> {
    let mut doomed: Vec<Key> = Vec::new();
    match (sub.get("item"), sub.get("items")) {
        (Some(item), _) => doomed.push(value_to_key(item)?),
        (None, Some(Value::List(items))) => {
            for item in items {
                doomed.push(value_to_key(item)?);
            }
        }
        _ => {
            return Err(DeviceError::failed("remove requires item or items"));
        }
    }

    let mut output = input.clone();
    output.clear_hashpath();
    for key in &doomed {
        output.remove_key(key);
    }
    Ok(Value::Map(output))
}

/// Enumerates the message's keys as canonical byte strings.
fn keys(input: &Message) -> Result<Value, DeviceError> {
    Ok(Value::List(
        input
            .keys()
            .iter()
            .map(|key| Value::Bytes(key_to_binary(key)))
            .collect(),
    ))
}

fn value_to_key(value: &Value) -> Result<Key, DeviceError> {
    value
        .as_text()
        .map(to_key)
        .ok_or_else(|| DeviceError::failed("key must be a byte string"))
}
