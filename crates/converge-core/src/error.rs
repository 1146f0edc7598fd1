//! Resolution error kinds and the error-strategy policy.
//!
//! Every stage of the resolver reports failures through [`ResolveError`].
//! The enum is `Clone` on purpose: a group leader fans its outcome out to an
//! arbitrary number of joiners, so causes from device code and the store are
//! captured as strings rather than boxed sources.

use thiserror::Error;

/// How stage failures propagate out of the resolver.
///
/// `Return` (the conservative mode) converts everything, including panics
/// escaping device code, into structured [`ResolveError`] values. `Throw`
/// re-raises device panics with their original payload; structured failures
/// still surface as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Re-raise panics from device code; propagate structured errors.
    #[default]
    Throw,
    /// Capture panics as `device_call` failures; never unwind past the
    /// resolver boundary.
    Return,
}

/// Errors produced by the resolver pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolveError {
    /// A device reference was valid in form but could not be turned into a
    /// usable module (missing manifest field, wrong content type, codec
    /// failure).
    #[error("device not loadable: {reference}: {reason}")]
    DeviceNotLoadable {
        /// The textual form of the device reference.
        reference: String,
        /// Why loading failed.
        reason: String,
    },

    /// A content-addressed device was referenced while remote device loading
    /// is disabled.
    #[error("remote devices are disabled; refusing to load {id}")]
    RemoteDevicesDisabled {
        /// The refused content id.
        id: String,
    },

    /// None of the signers of a stored device blob are on the trusted list.
    #[error("no trusted signer for device blob {id}")]
    DeviceSignerNotTrusted {
        /// The content id of the rejected blob.
        id: String,
    },

    /// A symbolic device alias is not present in the preloaded-devices table.
    #[error("device module not admissable: {name}")]
    ModuleNotAdmissable {
        /// The unknown alias.
        name: String,
    },

    /// Terminal dispatch failure: the default device itself could not route
    /// the key. This signals a misconfigured node, not a user error.
    #[error("default device could not resolve key: {key}")]
    DefaultDeviceCouldNotResolveKey {
        /// The key that failed to dispatch.
        key: String,
    },

    /// A device handler failed (returned an error or panicked) during
    /// execution.
    #[error("device call failed: {device}/{key}: {reason}")]
    DeviceCall {
        /// Label of the device that was executing.
        device: String,
        /// The key being resolved.
        key: String,
        /// Stringified cause.
        reason: String,
    },

    /// The key does not exist in the input message.
    #[error("key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The underlying content store failed during reference-call expansion
    /// or remote device loading.
    #[error("store read failed for {id}: {reason}")]
    Store {
        /// The id that was being fetched.
        id: String,
        /// Stringified store error.
        reason: String,
    },

    /// A synchronous cache write failed.
    #[error("cache write failed: {reason}")]
    Cache {
        /// Stringified cache error.
        reason: String,
    },

    /// A joiner timed out waiting for its group leader.
    #[error("timed out waiting for the group leader")]
    GroupWaitTimeout,

    /// Resolution depth exceeded the configured cap. Reference-call
    /// expansion can introduce effective cycles; the cap breaks them.
    #[error("resolution depth {depth} exceeds the configured maximum")]
    DepthExceeded {
        /// The depth at which resolution was abandoned.
        depth: usize,
    },

    /// The sub-input could not be normalized into a resolvable message.
    #[error("bad sub-input: {reason}")]
    BadSubInput {
        /// Why normalization failed.
        reason: String,
    },
}

/// Result alias for resolver operations.
pub type ResolveResult<T> = Result<T, ResolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_key() {
        let err = ResolveError::DeviceCall {
            device: "message".to_string(),
            key: "balance".to_string(),
            reason: "arithmetic overflow".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "device call failed: message/balance: arithmetic overflow"
        );
    }

    #[test]
    fn errors_are_clone_and_send() {
        fn assert_clone_send_sync<T: Clone + Send + Sync>() {}
        assert_clone_send_sync::<ResolveError>();
    }

    #[test]
    fn default_strategy_is_throw() {
        assert_eq!(ErrorStrategy::default(), ErrorStrategy::Throw);
    }
}
