//! The dispatch planner.
//!
//! Given `(input, key, device)`, decides which concrete callable runs and
//! with which arguments, honoring device-declared overrides in this order:
//! a published catch-all `handler` (minus its exclusions), an exported
//! handler named after the key, a `default` callable (key prepended), a
//! `default_mod` fallback device (key not prepended), and finally the
//! default device. Failing on the default device itself is terminal.

use tracing::trace;

use crate::device::{DefaultFn, Device, DeviceInfo, Handler, ResolvedDevice, DEFAULT_DEVICE};
use crate::error::{ResolveError, ResolveResult};
use crate::key::Key;
use crate::loader;
use crate::message::Message;
use crate::resolver::Opts;

/// Fallback chains (`default_mod` hops, default-device reverts) are bounded
/// so a miswired device graph cannot loop the planner.
const MAX_DEVICE_HOPS: usize = 8;

/// How the chosen callable is invoked.
#[derive(Clone)]
pub enum Invocation {
    /// A plain handler; arguments follow its declared arity.
    Handler(Handler),
    /// A fallback callable; the key is prepended to the arguments.
    Default(DefaultFn),
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(h) => write!(f, "Invocation::{h:?}"),
            Self::Default(_) => f.write_str("Invocation::Default"),
        }
    }
}

/// The planner's output: the device that will execute, the callable, the
/// input the callable sees (possibly device-stripped), and options updated
/// to record whether the key is prepended.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The device that will execute the call.
    pub device: ResolvedDevice,
    /// The chosen callable.
    pub invocation: Invocation,
    /// The input as the callable will see it.
    pub input: Message,
    /// Options for the execution stage (`add_key` recorded).
    pub opts: Opts,
}

/// Plans the dispatch of `key` against `input` on `device`.
///
/// # Errors
///
/// Returns [`ResolveError::DefaultDeviceCouldNotResolveKey`] when even the
/// default device cannot route the key, or a loader error when a
/// `default_mod` reference fails to load.
pub fn plan(
    input: &Message,
    key: &Key,
    device: ResolvedDevice,
    info: &DeviceInfo,
    opts: &Opts,
) -> ResolveResult<Plan> {
    let mut current_device = device;
    let mut current_info = info.clone();
    let mut current_input = input.clone();

    for _ in 0..MAX_DEVICE_HOPS {
        // A published catch-all handler wins, unless the key is excluded;
        // excluded keys revert to the default device with the input's
        // device binding stripped.
        if let Some(catch_all) = current_info.handler.clone() {
            if catch_all.exclude.contains(key) {
                trace!(key = %key, device = %current_device.label(), "key excluded, reverting to default device");
                current_input = current_input.without_device();
                current_device = default_device(opts)?;
                current_info = current_device.info(Some(&current_input), opts);
                continue;
            }
            return Ok(Plan {
                device: current_device,
                invocation: Invocation::Handler(catch_all.func),
                input: current_input,
                opts: opts.clone(),
            });
        }

        // An exported handler named after the key, gated by the exports
        // list when the device publishes one.
        let exported = current_info
            .exports
            .as_ref()
            .map_or(true, |exports| exports.contains(key));
        if exported {
            if let Some(handler) = current_device.export(key) {
                trace!(key = %key, device = %current_device.label(), arity = handler.arity(), "export dispatch");
                return Ok(Plan {
                    device: current_device,
                    invocation: Invocation::Handler(handler),
                    input: current_input,
                    opts: opts.clone(),
                });
            }
        }

        // A `default` callable receives the key prepended; record that in
        // the options handed to the execution stage.
        if let Some(fallback) = current_info.default.clone() {
            let mut planned_opts = opts.clone();
            planned_opts.add_key = Some(key.clone());
            return Ok(Plan {
                device: current_device,
                invocation: Invocation::Default(fallback),
                input: current_input,
                opts: planned_opts,
            });
        }

        // A `default_mod` re-enters planning on the referenced device; the
        // key is not prepended there.
        if let Some(fallback_device) = current_info.default_mod.clone() {
            current_device = loader::load(&fallback_device, opts)?;
            current_info = current_device.info(Some(&current_input), opts);
            continue;
        }

        // Out of device-declared options: fall back to the default device,
        // unless we are already on it.
        if current_device.is_default() {
            return Err(ResolveError::DefaultDeviceCouldNotResolveKey {
                key: key.render(),
            });
        }
        current_device = default_device(opts)?;
        current_info = current_device.info(Some(&current_input), opts);
    }

    Err(ResolveError::DeviceNotLoadable {
        reference: input
            .device()
            .map_or_else(|| DEFAULT_DEVICE.to_string(), |d| d.commitment_label()),
        reason: "device fallback chain exceeds hop limit".to_string(),
    })
}

fn default_device(opts: &Opts) -> ResolveResult<ResolvedDevice> {
    loader::load(&Device::preloaded(DEFAULT_DEVICE), opts)
}
