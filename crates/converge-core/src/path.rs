//! Path algebra.
//!
//! A path is the ordered sequence of keys a resolution walks through. The
//! head is the next key to resolve; the tail is the remainder; an absent
//! tail signals the terminal step. All operations here are pure.

use crate::error::{ResolveError, ResolveResult};
use crate::hashpath::Hashpath;
use crate::key::{to_key, Key};
use crate::message::{Message, Value};

/// An ordered sequence of path elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(Vec<Key>);

impl Path {
    /// An empty path.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Builds a path from keys.
    #[must_use]
    pub fn from_keys(keys: Vec<Key>) -> Self {
        Self(keys)
    }

    /// A single-element path.
    #[must_use]
    pub fn from_key(key: Key) -> Self {
        Self(vec![key])
    }

    /// Parses a `a/b/c` textual path.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self(
            text.split('/')
                .filter(|segment| !segment.is_empty())
                .map(to_key)
                .collect(),
        )
    }

    /// The first element, when present.
    #[must_use]
    pub fn head(&self) -> Option<&Key> {
        self.0.first()
    }

    /// The remainder after the head; `None` means the path is terminal.
    #[must_use]
    pub fn tail(&self) -> Option<Self> {
        if self.0.len() > 1 {
            Some(Self(self.0[1..].to_vec()))
        } else {
            None
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the path has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The elements in order.
    #[must_use]
    pub fn keys(&self) -> &[Key] {
        &self.0
    }

    /// Renders the path as `a/b/c`.
    #[must_use]
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(Key::render)
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl From<Key> for Path {
    fn from(key: Key) -> Self {
        Self::from_key(key)
    }
}

/// Returns the head of the message's path, or the whole path value when it
/// is atomic.
#[must_use]
pub fn head(msg: &Message) -> Option<Key> {
    msg.path().and_then(|p| p.head().cloned())
}

/// Returns the remainder of the message's path; `None` means terminal.
#[must_use]
pub fn tail(msg: &Message) -> Option<Path> {
    msg.path().and_then(|p| p.tail())
}

/// Coerces a term into a path.
///
/// Accepts path values, byte strings (`a/b/c`), lists of keys, and integers
/// (rendered as text elements).
///
/// # Errors
///
/// Returns [`ResolveError::BadSubInput`] for terms with no path rendering
/// (maps, devices, floats).
pub fn term_to_path(value: &Value) -> ResolveResult<Path> {
    match value {
        Value::Path(path) => Ok(path.clone()),
        Value::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| ResolveError::BadSubInput {
                reason: "path bytes are not UTF-8".to_string(),
            })?;
            Ok(Path::parse(text))
        }
        Value::Int(n) => Ok(Path::from_key(to_key(&n.to_string()))),
        Value::List(items) => {
            let mut keys = Vec::with_capacity(items.len());
            for item in items {
                let element = term_to_path(item)?;
                keys.extend(element.keys().iter().cloned());
            }
            Ok(Path::from_keys(keys))
        }
        Value::Map(_) | Value::Device(_) | Value::Float(_) | Value::Bool(_) => {
            Err(ResolveError::BadSubInput {
                reason: "term has no path rendering".to_string(),
            })
        }
    }
}

/// Computes the next hashpath: the input's witness (or its content id when
/// no witness exists yet) extended with the sub-input's commitment.
#[must_use]
pub fn push(input: &Message, sub: &Message) -> Hashpath {
    let base = input
        .hashpath()
        .cloned()
        .unwrap_or_else(|| Hashpath::seed(input.commit()));
    base.push(sub.commit())
}
