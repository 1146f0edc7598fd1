//! Device loading with signer-trust policy.
//!
//! Inline maps pass through; symbolic names resolve against the
//! preloaded-devices table; content-addressed references are fetched from
//! the store and admitted only when remote loading is enabled, the blob's
//! signers intersect the trusted set, and the manifest declares a content
//! type this runtime understands. Every policy gate fails closed.

use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::device::{Device, ResolvedDevice};
use crate::error::{ResolveError, ResolveResult};
use crate::hashpath::ContentId;
use crate::key::{to_key, Key};
use crate::message::Message;
use crate::resolver::Opts;

/// Content type a remote device manifest must declare.
pub const MODULE_CONTENT_TYPE: &str = "application/converge-module";

/// Resolves a device reference to something executable.
///
/// # Errors
///
/// - [`ResolveError::ModuleNotAdmissable`] for symbolic aliases absent from
///   the preloaded-devices table;
/// - [`ResolveError::DeviceNotLoadable`] when a known module fails its
///   metadata probe, or for manifest/content-type problems on the remote
///   path;
/// - [`ResolveError::RemoteDevicesDisabled`] when a content-addressed
///   reference arrives with remote loading off;
/// - [`ResolveError::DeviceSignerNotTrusted`] when no signer of the stored
///   blob is trusted;
/// - [`ResolveError::Store`] when the blob cannot be fetched.
pub fn load(device: &Device, opts: &Opts) -> ResolveResult<ResolvedDevice> {
    match device {
        Device::Inline(inline) => Ok(ResolvedDevice::Inline(inline.clone())),
        Device::Preloaded(name) => {
            let module =
                opts.devices
                    .lookup(name)
                    .ok_or_else(|| ResolveError::ModuleNotAdmissable {
                        name: name.render(),
                    })?;
            if let Err(reason) = module.probe() {
                warn!(name = %name, reason = %reason, "preloaded device failed its probe");
                return Err(ResolveError::DeviceNotLoadable {
                    reference: name.render(),
                    reason,
                });
            }
            Ok(ResolvedDevice::Module {
                name: name.clone(),
                module,
            })
        }
        Device::Remote(id) => load_remote(*id, opts),
    }
}

fn load_remote(id: ContentId, opts: &Opts) -> ResolveResult<ResolvedDevice> {
    if !opts.load_remote_devices {
        warn!(id = %id, "refusing remote device: loading disabled");
        return Err(ResolveError::RemoteDevicesDisabled { id: id.to_string() });
    }

    // A previously admitted blob is already installed under its id.
    let alias = Key::Id(id);
    if let Some(module) = opts.devices.lookup(&alias) {
        return Ok(ResolvedDevice::Module {
            name: alias,
            module,
        });
    }

    let bytes = opts.store.read(&id).map_err(|e| ResolveError::Store {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    let manifest = Message::from_blob(&bytes).map_err(|e| ResolveError::DeviceNotLoadable {
        reference: id.to_string(),
        reason: format!("manifest decode failed: {e}"),
    })?;

    if !signer_trusted(&manifest, opts) {
        warn!(id = %id, "remote device rejected: no trusted signer");
        return Err(ResolveError::DeviceSignerNotTrusted { id: id.to_string() });
    }

    let content_type = manifest
        .get("content-type")
        .and_then(crate::message::Value::as_text)
        .unwrap_or_default();
    if content_type != MODULE_CONTENT_TYPE {
        return Err(ResolveError::DeviceNotLoadable {
            reference: id.to_string(),
            reason: format!("incompatible content type: {content_type:?}"),
        });
    }

    let module_name = manifest
        .get("module")
        .and_then(crate::message::Value::as_text)
        .ok_or_else(|| ResolveError::DeviceNotLoadable {
            reference: id.to_string(),
            reason: "manifest has no module field".to_string(),
        })?;
    let module =
        opts.devices
            .lookup(&to_key(module_name))
            .ok_or_else(|| ResolveError::DeviceNotLoadable {
                reference: id.to_string(),
                reason: format!("module {module_name:?} is not present in this runtime"),
            })?;
    if let Err(reason) = module.probe() {
        warn!(id = %id, module = module_name, reason = %reason, "aliased module failed its probe");
        return Err(ResolveError::DeviceNotLoadable {
            reference: id.to_string(),
            reason: format!("module {module_name:?} failed its probe: {reason}"),
        });
    }

    // Install the id as an alias so subsequent loads skip the store.
    opts.devices.install(Key::Id(id), module.clone());
    debug!(id = %id, module = module_name, "remote device admitted");

    Ok(ResolvedDevice::Module {
        name: Key::Id(id),
        module,
    })
}

/// Constant-time membership test of the manifest's signers against the
/// trusted set.
fn signer_trusted(manifest: &Message, opts: &Opts) -> bool {
    let signers = manifest.signers();
    let mut trusted = false;
    for signer in &signers {
        for candidate in &opts.trusted_device_signers {
            trusted |= signer.as_bytes().ct_eq(candidate.as_bytes()).unwrap_u8() == 1;
        }
    }
    trusted
}
