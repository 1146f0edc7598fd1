//! Key normalization.
//!
//! Message keys arrive in heterogeneous shapes: mixed-case text, id-shaped
//! 43-character strings, raw bytes. [`to_key`] canonicalizes them so that
//! `"Key1"`, `"KEY1"`, and `"key1"` address the same entry, while id-shaped
//! keys keep their identity instead of being case-folded.

use std::fmt;

use crate::hashpath::ContentId;

/// A canonicalized message key.
///
/// Textual keys are stored lowercase; id-shaped keys are stored as their
/// decoded 32-byte form. Ordering is derived, which makes `BTreeMap<Key, _>`
/// iteration deterministic (text before ids, both lexicographic).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// Canonical lowercase text.
    Text(String),
    /// A 43-character content id.
    Id(ContentId),
}

impl Key {
    /// Canonicalizes a textual key. Id-shaped input parses to [`Key::Id`].
    #[must_use]
    pub fn text(raw: &str) -> Self {
        to_key(raw)
    }

    /// True when the key is id-shaped.
    #[must_use]
    pub const fn is_id(&self) -> bool {
        matches!(self, Self::Id(_))
    }

    /// The id, when the key is id-shaped.
    #[must_use]
    pub const fn as_id(&self) -> Option<&ContentId> {
        match self {
            Self::Id(id) => Some(id),
            Self::Text(_) => None,
        }
    }

    /// The canonical textual form.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Id(id) => id.to_string(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "Key({text})"),
            Self::Id(id) => write!(f, "Key({id})"),
        }
    }
}

impl From<&str> for Key {
    fn from(raw: &str) -> Self {
        to_key(raw)
    }
}

impl From<String> for Key {
    fn from(raw: String) -> Self {
        to_key(&raw)
    }
}

impl From<ContentId> for Key {
    fn from(id: ContentId) -> Self {
        Self::Id(id)
    }
}

/// Canonicalizes a raw key representation.
///
/// A 43-character id-shaped string is kept as an id, unchanged in identity.
/// Everything else is case-folded to the canonical lowercase text form.
#[must_use]
pub fn to_key(raw: &str) -> Key {
    if let Ok(id) = ContentId::parse(raw) {
        return Key::Id(id);
    }
    Key::Text(raw.to_ascii_lowercase())
}

/// Renders a key as its canonical byte-string form.
#[must_use]
pub fn key_to_binary(key: &Key) -> Vec<u8> {
    key.render().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_folds_to_canonical_form() {
        assert_eq!(to_key("Key1"), to_key("key1"));
        assert_eq!(to_key("KEY1"), to_key("key1"));
        assert_eq!(to_key("key1"), Key::Text("key1".to_string()));
    }

    #[test]
    fn id_shaped_keys_stay_ids() {
        let id = ContentId::commit(b"device blob");
        let key = to_key(&id.to_string());
        assert_eq!(key, Key::Id(id));
        assert!(key.is_id());
    }

    #[test]
    fn almost_id_shaped_text_is_text() {
        // Right length, wrong alphabet.
        let not_an_id = "!".repeat(43);
        assert!(matches!(to_key(&not_an_id), Key::Text(_)));
    }

    #[test]
    fn binary_form_is_canonical_bytes() {
        assert_eq!(key_to_binary(&to_key("Balance")), b"balance".to_vec());
    }

    #[test]
    fn ordering_is_stable() {
        let mut keys = vec![to_key("b"), to_key("a"), to_key("c")];
        keys.sort();
        assert_eq!(
            keys,
            vec![to_key("a"), to_key("b"), to_key("c")]
        );
    }
}
