//! The device abstraction: pluggable units of executable logic.
//!
//! A device is one of three shapes: an inline map from key to handler, a
//! symbolic reference to a preloaded module, or a 43-character content id
//! naming a signed blob in the store. All three resolve (via the loader) to
//! something that can answer "which handler runs for this key".
//!
//! Handlers encode their arity in the type: a unary handler sees only the
//! input, a binary handler also sees the sub-input, a ternary handler sees
//! the options as well. Argument truncation is therefore structural; the
//! planner passes exactly what the variant declares.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::hashpath::ContentId;
use crate::key::{to_key, Key};
use crate::message::{Message, Value};
use crate::resolver::Opts;
use crate::worker::WorkerFn;

/// Failure shapes a handler can return without unwinding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The key has no value in the device's view of the input.
    #[error("not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },
    /// The handler failed for a domain reason.
    #[error("{reason}")]
    Failed {
        /// Stringified cause.
        reason: String,
    },
}

impl DeviceError {
    /// Convenience constructor for domain failures.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// What a handler returns.
pub type HandlerResult = Result<Value, DeviceError>;

/// A handler with its declared arity.
#[derive(Clone)]
pub enum Handler {
    /// `f(input)`.
    Unary(Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>),
    /// `f(input, sub_input)`.
    Binary(Arc<dyn Fn(&Message, &Message) -> HandlerResult + Send + Sync>),
    /// `f(input, sub_input, opts)`.
    Ternary(Arc<dyn Fn(&Message, &Message, &Opts) -> HandlerResult + Send + Sync>),
}

impl Handler {
    /// Builds a unary handler.
    pub fn unary(f: impl Fn(&Message) -> HandlerResult + Send + Sync + 'static) -> Self {
        Self::Unary(Arc::new(f))
    }

    /// Builds a binary handler.
    pub fn binary(f: impl Fn(&Message, &Message) -> HandlerResult + Send + Sync + 'static) -> Self {
        Self::Binary(Arc::new(f))
    }

    /// Builds a ternary handler.
    pub fn ternary(
        f: impl Fn(&Message, &Message, &Opts) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self::Ternary(Arc::new(f))
    }

    /// Declared arity, for diagnostics.
    #[must_use]
    pub const fn arity(&self) -> u8 {
        match self {
            Self::Unary(_) => 1,
            Self::Binary(_) => 2,
            Self::Ternary(_) => 3,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler/{}", self.arity())
    }
}

/// A fallback callable; receives the key it was asked for in addition to the
/// regular handler arguments.
pub type DefaultFn = Arc<dyn Fn(&Key, &Message, &Message, &Opts) -> HandlerResult + Send + Sync>;

/// Derives a custom deduplication group key from `(input, sub_input, opts)`.
pub type GroupFn = Arc<dyn Fn(&Message, &Message, &Opts) -> Vec<u8> + Send + Sync>;

/// A catch-all handler published via device info, with an exclusion list of
/// keys that fall back to the default device.
#[derive(Clone)]
pub struct InfoHandler {
    /// The function handling every non-excluded key.
    pub func: Handler,
    /// Keys deferred back to the default device.
    pub exclude: BTreeSet<Key>,
}

impl fmt::Debug for InfoHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfoHandler")
            .field("exclude", &self.exclude)
            .finish_non_exhaustive()
    }
}

/// Optional metadata a device publishes to steer dispatch and grouping.
#[derive(Clone, Default)]
pub struct DeviceInfo {
    /// Restricts which keys are callable as exports.
    pub exports: Option<BTreeSet<Key>>,
    /// A single function handling every key (minus its exclusions).
    pub handler: Option<InfoHandler>,
    /// Fallback callable for unknown keys; receives the key prepended.
    pub default: Option<DefaultFn>,
    /// Fallback device reference for unknown keys; the key is not prepended.
    pub default_mod: Option<Device>,
    /// Custom deduplication group key derivation.
    pub grouper: Option<GroupFn>,
    /// Custom long-lived worker loop.
    pub worker: Option<WorkerFn>,
}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInfo")
            .field("exports", &self.exports)
            .field("has_handler", &self.handler.is_some())
            .field("has_default", &self.default.is_some())
            .field("has_default_mod", &self.default_mod.is_some())
            .field("has_grouper", &self.grouper.is_some())
            .field("has_worker", &self.worker.is_some())
            .finish()
    }
}

/// An inline device: a literal map from key to handler, plus optional info.
#[derive(Clone, Default)]
pub struct InlineDevice {
    handlers: BTreeMap<Key, Handler>,
    info: DeviceInfo,
}

impl InlineDevice {
    /// An empty inline device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consuming builder: registers a handler for a key.
    #[must_use]
    pub fn handler(mut self, key: impl Into<Key>, handler: Handler) -> Self {
        self.handlers.insert(key.into(), handler);
        self
    }

    /// Consuming builder: attaches device info.
    #[must_use]
    pub fn info(mut self, info: DeviceInfo) -> Self {
        self.info = info;
        self
    }

    /// The published info.
    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    /// Looks up the handler registered for `key`.
    #[must_use]
    pub fn export(&self, key: &Key) -> Option<Handler> {
        self.handlers.get(key).cloned()
    }

    /// The registered keys, sorted.
    #[must_use]
    pub fn export_keys(&self) -> Vec<Key> {
        self.handlers.keys().cloned().collect()
    }
}

impl fmt::Debug for InlineDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineDevice")
            .field("keys", &self.export_keys())
            .finish_non_exhaustive()
    }
}

/// A device reference as carried inside a message.
#[derive(Clone)]
pub enum Device {
    /// A literal handler map.
    Inline(Arc<InlineDevice>),
    /// A symbolic reference to a preloaded module.
    Preloaded(Key),
    /// A content-addressed blob in the store.
    Remote(ContentId),
}

impl Device {
    /// Wraps an inline device.
    #[must_use]
    pub fn inline(device: InlineDevice) -> Self {
        Self::Inline(Arc::new(device))
    }

    /// References a preloaded module by name.
    #[must_use]
    pub fn preloaded(name: &str) -> Self {
        Self::Preloaded(to_key(name))
    }

    /// The stable label used when a device participates in a commitment.
    /// Closures have no canonical bytes, so inline devices commit by their
    /// sorted export names.
    #[must_use]
    pub fn commitment_label(&self) -> String {
        match self {
            Self::Inline(inline) => {
                let names: Vec<String> = inline.export_keys().iter().map(Key::render).collect();
                format!("inline:{}", names.join(","))
            }
            Self::Preloaded(name) => format!("mod:{}", name.render()),
            Self::Remote(id) => format!("cas:{id}"),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.commitment_label())
    }
}

/// The trait seam for preloaded device implementations.
pub trait DeviceModule: Send + Sync {
    /// Verifies the module is usable in this runtime. The loader probes
    /// this before any dispatch; a failing probe reports the reference as
    /// not loadable, distinct from the alias being unknown. The default
    /// succeeds.
    fn probe(&self) -> Result<(), String> {
        Ok(())
    }

    /// The device's published metadata. The default is empty info.
    fn info(&self, input: Option<&Message>, opts: &Opts) -> DeviceInfo {
        let _ = (input, opts);
        DeviceInfo::default()
    }

    /// Looks up an exported handler by key.
    fn export(&self, key: &Key) -> Option<Handler>;
}

/// Name of the default identity device.
pub const DEFAULT_DEVICE: &str = "message";

/// The preloaded-devices table: symbolic name to module implementation.
///
/// The table is shared and grows at runtime: loading a trusted remote device
/// installs its content id as an alias.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<BTreeMap<Key, Arc<dyn DeviceModule>>>>,
}

impl DeviceRegistry {
    /// An empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// A registry with the default message device installed.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.install(
            to_key(DEFAULT_DEVICE),
            Arc::new(crate::devices::message::MessageDevice),
        );
        registry
    }

    /// Installs (or replaces) a module under a symbolic name.
    pub fn install(&self, name: Key, module: Arc<dyn DeviceModule>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, module);
    }

    /// Looks up a module by name.
    #[must_use]
    pub fn lookup(&self, name: &Key) -> Option<Arc<dyn DeviceModule>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(Key::render)
            .collect();
        f.debug_tuple("DeviceRegistry").field(&names).finish()
    }
}

/// A device reference resolved by the loader into something executable.
#[derive(Clone)]
pub enum ResolvedDevice {
    /// An inline handler map.
    Inline(Arc<InlineDevice>),
    /// A registry-backed module.
    Module {
        /// The name the module resolved under.
        name: Key,
        /// The implementation.
        module: Arc<dyn DeviceModule>,
    },
}

impl ResolvedDevice {
    /// The device's published info.
    #[must_use]
    pub fn info(&self, input: Option<&Message>, opts: &Opts) -> DeviceInfo {
        match self {
            Self::Inline(inline) => inline.device_info(),
            Self::Module { module, .. } => module.info(input, opts),
        }
    }

    /// Looks up an exported handler.
    #[must_use]
    pub fn export(&self, key: &Key) -> Option<Handler> {
        match self {
            Self::Inline(inline) => inline.export(key),
            Self::Module { module, .. } => module.export(key),
        }
    }

    /// A diagnostic label.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Inline(inline) => Device::Inline(Arc::clone(inline)).commitment_label(),
            Self::Module { name, .. } => name.render(),
        }
    }

    /// True when this is the default identity device.
    #[must_use]
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Module { name, .. } if *name == to_key(DEFAULT_DEVICE))
    }
}

impl fmt::Debug for ResolvedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResolvedDevice({})", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_arity_is_declared_by_variant() {
        let h1 = Handler::unary(|_| Ok(Value::Int(1)));
        let h2 = Handler::binary(|_, _| Ok(Value::Int(2)));
        let h3 = Handler::ternary(|_, _, _| Ok(Value::Int(3)));
        assert_eq!((h1.arity(), h2.arity(), h3.arity()), (1, 2, 3));
    }

    #[test]
    fn inline_device_exports_registered_keys() {
        let device = InlineDevice::new()
            .handler("compute", Handler::unary(|_| Ok(Value::Bool(true))))
            .handler("Status", Handler::unary(|_| Ok(Value::Bool(false))));
        assert!(device.export(&to_key("compute")).is_some());
        // Keys canonicalize on registration.
        assert!(device.export(&to_key("status")).is_some());
        assert!(device.export(&to_key("missing")).is_none());
    }

    #[test]
    fn commitment_label_is_stable_for_inline_devices() {
        let build = || {
            Device::inline(
                InlineDevice::new()
                    .handler("b", Handler::unary(|_| Ok(Value::Int(0))))
                    .handler("a", Handler::unary(|_| Ok(Value::Int(0)))),
            )
        };
        assert_eq!(build().commitment_label(), "inline:a,b");
    }

    #[test]
    fn registry_installs_and_resolves_aliases() {
        struct Probe;
        impl DeviceModule for Probe {
            fn export(&self, _key: &Key) -> Option<Handler> {
                None
            }
        }

        let registry = DeviceRegistry::with_defaults();
        assert!(registry.lookup(&to_key(DEFAULT_DEVICE)).is_some());
        assert!(registry.lookup(&to_key("probe")).is_none());

        registry.install(to_key("probe"), Arc::new(Probe));
        assert!(registry.lookup(&to_key("probe")).is_some());
    }
}
