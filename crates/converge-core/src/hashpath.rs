//! Content ids and the hashpath accumulator.
//!
//! Every message commits to a 32-byte BLAKE3 digest, rendered as a
//! 43-character URL-safe base64 id (no padding). A [`Hashpath`] chains those
//! commitments: after each resolution step the output's hashpath is
//! `H(previous || commit(sub-input))`, so the terminal witness commits to
//! every input along the chain.
//!
//! Domain separation follows the convention used for tree hashing: commits
//! and links are prefixed with distinct tags so a commit digest can never be
//! confused with a link digest.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use thiserror::Error;

/// Size of a raw content id / hashpath digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Length of the textual rendering of a 32-byte digest: URL-safe base64
/// without padding.
pub const ID_ENCODED_LEN: usize = 43;

/// Domain separator for message commitments.
const COMMIT_PREFIX: &[u8] = b"converge:commit:";

/// Domain separator for hashpath links.
const LINK_PREFIX: &[u8] = b"converge:link:";

/// Errors from parsing textual ids.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdParseError {
    /// The textual form does not have the required length.
    #[error("id must be {ID_ENCODED_LEN} characters, got {len}")]
    BadLength {
        /// Observed length.
        len: usize,
    },
    /// The textual form is not valid URL-safe base64.
    #[error("id is not URL-safe base64")]
    BadEncoding,
}

/// A 32-byte content identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId([u8; DIGEST_SIZE]);

impl ContentId {
    /// Wraps a raw digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// Commits to a canonical byte encoding.
    #[must_use]
    pub fn commit(encoded: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(COMMIT_PREFIX);
        hasher.update(encoded);
        Self(*hasher.finalize().as_bytes())
    }

    /// Addresses a raw blob (store namespace, no commit prefix).
    #[must_use]
    pub fn of_blob(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// The raw digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Parses the 43-character textual form.
    ///
    /// # Errors
    ///
    /// Returns [`IdParseError`] when the input has the wrong length or is not
    /// URL-safe base64.
    pub fn parse(text: &str) -> Result<Self, IdParseError> {
        if text.len() != ID_ENCODED_LEN {
            return Err(IdParseError::BadLength { len: text.len() });
        }
        let decoded = URL_SAFE_NO_PAD
            .decode(text.as_bytes())
            .map_err(|_| IdParseError::BadEncoding)?;
        let bytes: [u8; DIGEST_SIZE] =
            decoded.try_into().map_err(|_| IdParseError::BadEncoding)?;
        Ok(Self(bytes))
    }

    /// Returns true when `text` has the shape of an encoded id.
    #[must_use]
    pub fn looks_like_id(text: &str) -> bool {
        Self::parse(text).is_ok()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", hex::encode(&self.0[..8]))
    }
}

/// A cryptographic accumulator over a resolution chain.
///
/// The digest alone cannot show that one hashpath extends another, so the
/// link count travels with it: a push produces a hashpath whose `links` is
/// exactly one greater than its predecessor's.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hashpath {
    digest: [u8; DIGEST_SIZE],
    links: u64,
}

impl Hashpath {
    /// Seeds a hashpath from a message's own content id (a message with no
    /// witness yet).
    #[must_use]
    pub const fn seed(id: ContentId) -> Self {
        Self {
            digest: *id.as_bytes(),
            links: 0,
        }
    }

    /// Reassembles a hashpath from its persisted parts.
    #[must_use]
    pub const fn from_parts(digest: [u8; DIGEST_SIZE], links: u64) -> Self {
        Self { digest, links }
    }

    /// Extends the accumulator with the commitment of a sub-input.
    #[must_use]
    pub fn push(&self, sub: ContentId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(LINK_PREFIX);
        hasher.update(&self.digest);
        hasher.update(sub.as_bytes());
        Self {
            digest: *hasher.finalize().as_bytes(),
            links: self.links + 1,
        }
    }

    /// The raw digest.
    #[must_use]
    pub const fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Number of links accumulated since the seed.
    #[must_use]
    pub const fn links(&self) -> u64 {
        self.links
    }

    /// True when `self` is one link deeper than `prev`. The digest itself is
    /// opaque; the count is the checkable facet of "strictly extends".
    #[must_use]
    pub const fn extends(&self, prev: &Self) -> bool {
        self.links == prev.links + 1
    }
}

impl fmt::Display for Hashpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", URL_SAFE_NO_PAD.encode(self.digest), self.links)
    }
}

impl fmt::Debug for Hashpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hashpath({}, links={})",
            hex::encode(&self.digest[..8]),
            self.links
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_id_is_43_chars() {
        let id = ContentId::commit(b"some canonical bytes");
        assert_eq!(id.to_string().len(), ID_ENCODED_LEN);
    }

    #[test]
    fn id_round_trips_through_text() {
        let id = ContentId::commit(b"round trip");
        let parsed = ContentId::parse(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(
            ContentId::parse("too-short"),
            Err(IdParseError::BadLength { len: 9 })
        );
    }

    #[test]
    fn parse_rejects_non_base64() {
        let bad = "!".repeat(ID_ENCODED_LEN);
        assert_eq!(ContentId::parse(&bad), Err(IdParseError::BadEncoding));
    }

    #[test]
    fn commit_and_blob_namespaces_differ() {
        let bytes = b"identical input";
        assert_ne!(ContentId::commit(bytes), ContentId::of_blob(bytes));
    }

    #[test]
    fn push_strictly_extends() {
        let base = Hashpath::seed(ContentId::commit(b"m0"));
        let step1 = base.push(ContentId::commit(b"s1"));
        let step2 = step1.push(ContentId::commit(b"s2"));

        assert!(step1.extends(&base));
        assert!(step2.extends(&step1));
        assert!(!step2.extends(&base));
        assert_ne!(step1.digest(), base.digest());
        assert_ne!(step2.digest(), step1.digest());
    }

    #[test]
    fn push_is_deterministic() {
        let base = Hashpath::seed(ContentId::commit(b"m0"));
        let sub = ContentId::commit(b"s1");
        assert_eq!(base.push(sub), base.push(sub));
    }

    #[test]
    fn push_is_order_sensitive() {
        let base = Hashpath::seed(ContentId::commit(b"m0"));
        let a = ContentId::commit(b"a");
        let b = ContentId::commit(b"b");
        assert_ne!(base.push(a).push(b), base.push(b).push(a));
    }
}
