//! The resolver state machine.
//!
//! One resolution step runs nine stages:
//!
//! 1. normalize the sub-input (wrap bare keys/paths, expand reference calls)
//! 2. cache lookup keyed by the prospective hashpath
//! 3. device loading and dispatch planning
//! 4. group check: lead, or join and wait for the leader's reply
//! 5. handler execution (panics contained per the error strategy)
//! 6. cryptographic link: message outputs take the pushed hashpath
//! 7. negotiated cache write
//! 8. notify sweep: reply to joiners that queued while we worked
//! 9. recurse on the path tail, promote a worker, or return
//!
//! Ordering invariants:
//! - A failed execution is never linked (stage 6) or cached (stage 7).
//! - Joiners receive the leader's outcome verbatim, success or failure.
//! - The leader either leaves the group after the sweep or is swapped for
//!   its worker under one registry lock; callers never observe both absent.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cache::{self, Cache, CacheSetting, MemoryCache};
use crate::device::{Device, DeviceError, DeviceRegistry, Handler, DEFAULT_DEVICE};
use crate::dispatch::{self, Invocation, Plan};
use crate::error::{ErrorStrategy, ResolveError, ResolveResult};
use crate::group::{GroupKey, GroupRegistry, JoinOutcome, LeaderSlot};
use crate::hashpath::{ContentId, Hashpath};
use crate::key::Key;
use crate::loader;
use crate::message::{Message, Value, PATH_KEY};
use crate::path::{self, Path};
use crate::store::{MemoryStore, Store};
use crate::worker::{self, WorkerFn};

/// Whether stage 6 appends to the hashpath witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashpathPolicy {
    /// Message outputs take `push(input, sub-input)`.
    #[default]
    Update,
    /// Outputs keep whatever witness the handler produced (none, usually).
    Ignore,
}

/// Which scope wins when the same option key is present in both the
/// request-scoped and node-scoped option messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prefer {
    /// Request-scoped values win.
    #[default]
    Local,
    /// Node-scoped values win.
    Global,
}

/// Options steering a resolution.
///
/// Conceptually immutable: stage transitions pass updated clones rather
/// than mutating in place. The plane handles (`cache_plane`, `store`,
/// `group_registry`, `devices`) are shared via `Arc`, so clones are cheap.
#[derive(Clone)]
pub struct Opts {
    /// Stage-6 linking policy.
    pub hashpath: HashpathPolicy,
    /// Global cache setting (one of the three negotiation sources).
    pub cache: CacheSetting,
    /// Fork stage-7 writes onto a background thread.
    pub async_cache: bool,
    /// Promote a worker for terminal message outputs.
    pub spawn_worker: bool,
    /// Worker idle timeout; `None` means the worker never retires.
    pub worker_timeout: Option<Duration>,
    /// How long a joiner waits for its leader; `None` blocks indefinitely.
    pub join_timeout: Option<Duration>,
    /// Panic containment policy for device code.
    pub error_strategy: ErrorStrategy,
    /// Admit content-addressed devices from the store.
    pub load_remote_devices: bool,
    /// Signer ids trusted to publish remote devices.
    pub trusted_device_signers: BTreeSet<String>,
    /// Scope precedence for [`Opts::option`].
    pub prefer: Prefer,
    /// Resolution depth cap; reference expansion can introduce cycles.
    pub max_depth: usize,
    /// Request-scoped option values readable by device code.
    pub extra: Message,
    /// Node-scoped option values readable by device code.
    pub defaults: Message,
    /// Stack of group keys joined by ancestor resolutions (reentrancy
    /// bypass).
    pub groups: Vec<GroupKey>,
    /// Set by the planner when the chosen callable gets the key prepended.
    pub add_key: Option<Key>,
    /// Current resolution depth.
    pub depth: usize,
    /// The cache plane.
    pub cache_plane: Arc<dyn Cache>,
    /// The content store.
    pub store: Arc<dyn Store>,
    /// The deduplication registry.
    pub group_registry: Arc<GroupRegistry>,
    /// The preloaded-devices table.
    pub devices: DeviceRegistry,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            hashpath: HashpathPolicy::default(),
            cache: CacheSetting::default(),
            async_cache: false,
            spawn_worker: false,
            worker_timeout: Some(Duration::from_secs(30)),
            join_timeout: Some(Duration::from_secs(30)),
            error_strategy: ErrorStrategy::default(),
            load_remote_devices: false,
            trusted_device_signers: BTreeSet::new(),
            prefer: Prefer::default(),
            max_depth: 128,
            extra: Message::new(),
            defaults: Message::new(),
            groups: Vec::new(),
            add_key: None,
            depth: 0,
            cache_plane: Arc::new(MemoryCache::new()),
            store: Arc::new(MemoryStore::new()),
            group_registry: Arc::new(GroupRegistry::new()),
            devices: DeviceRegistry::with_defaults(),
        }
    }
}

impl Opts {
    /// Fresh options over fresh planes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a free-form option value, honoring the scope preference.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&Value> {
        match self.prefer {
            Prefer::Local => self.extra.get(key).or_else(|| self.defaults.get(key)),
            Prefer::Global => self.defaults.get(key).or_else(|| self.extra.get(key)),
        }
    }

    /// Options bootstrapped from a deserialized config, over fresh planes.
    #[must_use]
    pub fn from_config(config: &OptsConfig) -> Self {
        Self {
            hashpath: config.hashpath,
            cache: config.cache,
            async_cache: config.async_cache,
            spawn_worker: config.spawn_worker,
            worker_timeout: config.worker_timeout_ms.map(Duration::from_millis),
            join_timeout: config.join_timeout_ms.map(Duration::from_millis),
            error_strategy: config.error_strategy,
            load_remote_devices: config.load_remote_devices,
            trusted_device_signers: config.trusted_device_signers.clone(),
            prefer: config.prefer,
            max_depth: config.max_depth,
            ..Self::default()
        }
    }
}

/// The serializable subset of [`Opts`]: the policy knobs an embedder
/// configures, without the plane handles.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OptsConfig {
    /// Stage-6 linking policy.
    pub hashpath: HashpathPolicy,
    /// Global cache setting.
    pub cache: CacheSetting,
    /// Fork stage-7 writes onto a background thread.
    pub async_cache: bool,
    /// Promote workers for terminal message outputs.
    pub spawn_worker: bool,
    /// Worker idle timeout in milliseconds; absent means never retire.
    pub worker_timeout_ms: Option<u64>,
    /// Joiner wait timeout in milliseconds; absent blocks indefinitely.
    pub join_timeout_ms: Option<u64>,
    /// Panic containment policy.
    pub error_strategy: ErrorStrategy,
    /// Admit content-addressed devices from the store.
    pub load_remote_devices: bool,
    /// Signer ids trusted to publish remote devices.
    pub trusted_device_signers: BTreeSet<String>,
    /// Scope precedence for free-form option lookups.
    pub prefer: Prefer,
    /// Resolution depth cap.
    pub max_depth: usize,
}

impl Default for OptsConfig {
    fn default() -> Self {
        Self {
            hashpath: HashpathPolicy::default(),
            cache: CacheSetting::default(),
            async_cache: false,
            spawn_worker: false,
            worker_timeout_ms: Some(30_000),
            join_timeout_ms: Some(30_000),
            error_strategy: ErrorStrategy::default(),
            load_remote_devices: false,
            trusted_device_signers: BTreeSet::new(),
            prefer: Prefer::default(),
            max_depth: 128,
        }
    }
}

impl std::fmt::Debug for Opts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opts")
            .field("hashpath", &self.hashpath)
            .field("cache", &self.cache)
            .field("async_cache", &self.async_cache)
            .field("spawn_worker", &self.spawn_worker)
            .field("error_strategy", &self.error_strategy)
            .field("load_remote_devices", &self.load_remote_devices)
            .field("prefer", &self.prefer)
            .field("depth", &self.depth)
            .field("groups", &self.groups.len())
            .finish_non_exhaustive()
    }
}

/// The accepted sub-input shapes.
#[derive(Debug, Clone)]
pub enum SubInput {
    /// A full sub-input message (its `path` entry selects the key).
    Message(Message),
    /// A bare key, wrapped into a single-element path.
    Key(Key),
    /// A bare path.
    Path(Path),
}

impl From<Message> for SubInput {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}

impl From<&Message> for SubInput {
    fn from(msg: &Message) -> Self {
        Self::Message(msg.clone())
    }
}

impl From<Key> for SubInput {
    fn from(key: Key) -> Self {
        Self::Key(key)
    }
}

impl From<Path> for SubInput {
    fn from(path: Path) -> Self {
        Self::Path(path)
    }
}

impl From<&str> for SubInput {
    fn from(text: &str) -> Self {
        Self::Path(Path::parse(text))
    }
}

/// Resolves a sub-input against an input message.
///
/// Bare keys and paths are wrapped into path-only sub-input messages
/// (stage 1); multi-element paths recurse step by step, each step's output
/// becoming the next step's input.
///
/// # Errors
///
/// Any [`ResolveError`]; see the module docs for which stages raise what.
pub fn resolve(input: &Message, sub: impl Into<SubInput>, opts: &Opts) -> ResolveResult<Value> {
    let sub_msg = match sub.into() {
        SubInput::Message(msg) => msg,
        SubInput::Key(key) => Message::new().with(PATH_KEY, Value::Path(Path::from_key(key))),
        SubInput::Path(p) => {
            if p.is_empty() {
                return Err(ResolveError::BadSubInput {
                    reason: "empty path".to_string(),
                });
            }
            Message::new().with(PATH_KEY, Value::Path(p))
        }
    };
    resolve_many(input.clone(), sub_msg, opts)
}

/// The single-message form: splits `msg.path` off as the sub-input and
/// resolves it against the remainder of the message.
///
/// # Errors
///
/// Returns [`ResolveError::BadSubInput`] when the message carries no path.
pub fn resolve_message(msg: &Message, opts: &Opts) -> ResolveResult<Value> {
    let Some(p) = msg.path() else {
        return Err(ResolveError::BadSubInput {
            reason: "message has no path".to_string(),
        });
    };
    let input = msg.without_path();
    resolve(&input, SubInput::Path(p), opts)
}

fn resolve_many(input: Message, sub: Message, opts: &Opts) -> ResolveResult<Value> {
    let mut opts = opts.clone();
    opts.depth += 1;
    if opts.depth > opts.max_depth {
        return Err(ResolveError::DepthExceeded { depth: opts.depth });
    }

    let Some(p) = sub.path() else {
        return Err(ResolveError::BadSubInput {
            reason: "sub-input has no path".to_string(),
        });
    };
    let Some(head) = p.head().cloned() else {
        return Err(ResolveError::BadSubInput {
            reason: "sub-input path is empty".to_string(),
        });
    };
    let tail = p.tail();

    // Stage 1, reference call: an id-shaped head names a stored message.
    // Fetch it, resolve it against the input, continue with the tail.
    if let Key::Id(id) = &head {
        trace!(id = %id, "expanding reference call");
        let fetched = load_reference(*id, &opts)?;
        let out = resolve_many(input, fetched, &opts)?;
        return continue_tail(out, tail, &opts);
    }

    // A multi-element path applies the sub-input's payload to the first
    // step only; later steps see bare path messages.
    let step_sub = if tail.is_some() {
        sub.with_path(Path::from_key(head.clone()))
    } else {
        sub
    };

    let out = resolve_step(&input, &step_sub, &head, tail.is_none(), &opts)?;
    continue_tail(out, tail, &opts)
}

fn continue_tail(out: Value, tail: Option<Path>, opts: &Opts) -> ResolveResult<Value> {
    let Some(tail) = tail else {
        return Ok(out);
    };
    match out {
        Value::Map(next) => resolve_many(
            next,
            Message::new().with(PATH_KEY, Value::Path(tail)),
            opts,
        ),
        _ => Err(ResolveError::BadSubInput {
            reason: format!("cannot resolve {} into a scalar", tail.render()),
        }),
    }
}

fn load_reference(id: ContentId, opts: &Opts) -> ResolveResult<Message> {
    let bytes = opts.store.read(&id).map_err(|e| ResolveError::Store {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    Message::from_blob(&bytes).map_err(|e| ResolveError::BadSubInput {
        reason: format!("reference blob does not decode to a message: {e}"),
    })
}

/// One full step: stages 2 through 9 for a single head key.
fn resolve_step(
    input: &Message,
    sub: &Message,
    key: &Key,
    terminal: bool,
    opts: &Opts,
) -> ResolveResult<Value> {
    let input_id = input.commit();
    let sub_id = sub.commit();
    let prospective = path::push(input, sub);

    // Stage 2: cache lookup. A hit whose stored witness disagrees with the
    // lookup key is discarded, not returned.
    if opts.cache.read_permitted() {
        if let Some(hit) = opts.cache_plane.read(&prospective) {
            let consistent = match &hit {
                Value::Map(m) => m.hashpath().map_or(true, |w| *w == prospective),
                _ => true,
            };
            if consistent {
                debug!(key = %key, "cache hit");
                return Ok(hit);
            }
            warn!(key = %key, "cache entry witness disagrees with its key; treating as a miss");
        }
    }

    // Stage 3: device and handler resolution.
    let device_ref = input
        .device()
        .unwrap_or_else(|| Device::preloaded(DEFAULT_DEVICE));
    let resolved = loader::load(&device_ref, opts)?;
    let info = resolved.info(Some(input), opts);
    let plan = dispatch::plan(input, key, resolved, &info, opts)?;

    // Stage 4: group check.
    let group_key = match &info.grouper {
        Some(derive) => GroupKey::Custom(derive(input, sub, opts)),
        None => GroupKey::Pair(input_id, sub_id),
    };

    if opts.groups.contains(&group_key) {
        // A reentrant resolution would deadlock joining its ancestor's
        // group; execute directly instead.
        trace!(key = %key, "group key held by an ancestor, bypassing deduplication");
        return finish_as_leader(
            None,
            &plan,
            info.worker.clone(),
            input,
            sub,
            key,
            input_id,
            sub_id,
            &prospective,
            &group_key,
            terminal,
            opts,
        );
    }

    loop {
        match opts.group_registry.join_or_peek(&group_key) {
            JoinOutcome::Leader(slot) => {
                return finish_as_leader(
                    Some(slot),
                    &plan,
                    info.worker.clone(),
                    input,
                    sub,
                    key,
                    input_id,
                    sub_id,
                    &prospective,
                    &group_key,
                    terminal,
                    opts,
                );
            }
            JoinOutcome::Peer(member) => {
                let (reply_tx, reply_rx) = mpsc::channel();
                let request = crate::group::GroupRequest {
                    input: input.clone(),
                    sub: sub.clone(),
                    input_id,
                    sub_id,
                    reply: reply_tx,
                };
                if member.tx.send(request).is_err() {
                    // The serving member died without leaving; clear the
                    // stale registration and retry as a candidate leader.
                    opts.group_registry.leave(&group_key, member.id);
                    continue;
                }
                let reply = match opts.join_timeout {
                    Some(timeout) => reply_rx.recv_timeout(timeout),
                    None => reply_rx
                        .recv()
                        .map_err(|_| mpsc::RecvTimeoutError::Disconnected),
                };
                match reply {
                    Ok(result) => {
                        debug!(key = %key, "served by group leader");
                        return result;
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        // A timeout is the joiner's local failure; the
                        // leader stays registered.
                        return Err(ResolveError::GroupWaitTimeout);
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        // We landed in the window between the leader's
                        // sweep and its leave; restart the group check.
                        trace!(key = %key, "leader left before replying, retrying group check");
                        continue;
                    }
                }
            }
        }
    }
}

/// Releases group membership when the leader's frame ends, including by
/// unwinding: a panicking handler under the `Throw` strategy must not leave
/// a dead member registered, or joiners would wait on it forever.
struct MembershipGuard {
    registry: Arc<GroupRegistry>,
    key: GroupKey,
    member_id: u64,
}

impl Drop for MembershipGuard {
    fn drop(&mut self) {
        self.registry.leave(&self.key, self.member_id);
    }
}

/// Stages 5 through 9 on the leading side. `slot` is `None` for reentrant
/// executions that bypassed grouping.
#[allow(clippy::too_many_arguments)]
fn finish_as_leader(
    slot: Option<LeaderSlot>,
    plan: &Plan,
    worker_hook: Option<WorkerFn>,
    input: &Message,
    sub: &Message,
    key: &Key,
    input_id: ContentId,
    sub_id: ContentId,
    prospective: &Hashpath,
    group_key: &GroupKey,
    terminal: bool,
    opts: &Opts,
) -> ResolveResult<Value> {
    // Membership lapses with this frame; after a worker swap the guard's
    // leave is a no-op on the already-replaced id.
    let _guard = slot.as_ref().map(|slot| MembershipGuard {
        registry: Arc::clone(&opts.group_registry),
        key: group_key.clone(),
        member_id: slot.member_id,
    });

    // The handler sees options with our group recorded, so its own
    // recursive resolutions can detect the collision.
    let mut exec_opts = plan.opts.clone();
    exec_opts.groups.push(group_key.clone());

    // Stage 5: execute.
    let mut result = invoke_handler(plan, sub, key, &exec_opts);

    // Stage 6: cryptographic link. Scalars bypass linking; failures are
    // never attested.
    if let Ok(Value::Map(output)) = &mut result {
        if exec_opts.hashpath == HashpathPolicy::Update {
            output.set_hashpath(prospective.clone());
        }
    }

    // Stage 7: negotiated cache write. Only successful outputs are stored.
    if let Ok(output) = &result {
        if cache::write_permitted(exec_opts.cache, input, sub) {
            if let Err(e) = cache::write_output(
                &exec_opts.cache_plane,
                prospective,
                output,
                exec_opts.async_cache,
            ) {
                result = Err(ResolveError::Cache {
                    reason: e.to_string(),
                });
            }
        }
    }

    // Stage 8: notify joiners that queued while we worked.
    if let Some(slot) = &slot {
        let served = slot.sweep(&input_id, &sub_id, &result);
        if served > 0 {
            debug!(key = %key, served, "notified group joiners");
        }
    }

    // Stage 9: promote a worker holding the terminal state, or exit the
    // group (the guard's drop). The swap happens under one registry lock,
    // so callers never find the group empty between us and the worker.
    if let Some(slot) = slot {
        let held = match (&result, terminal && exec_opts.spawn_worker) {
            (Ok(Value::Map(output)), true) => Some(output.clone()),
            _ => None,
        };
        if let Some(held) = held {
            let (member, rx) = opts.group_registry.make_member();
            let member_id = member.id;
            opts.group_registry.swap(group_key, slot.member_id, member);
            worker::spawn(held, group_key.clone(), member_id, rx, worker_hook, opts.clone());
            debug!(key = %key, "promoted worker for terminal state");
        }
    }

    result
}

/// Stage 5 proper: invoke the planned callable with arity-truncated
/// arguments, containing panics per the error strategy.
fn invoke_handler(plan: &Plan, sub: &Message, key: &Key, opts: &Opts) -> ResolveResult<Value> {
    let input = &plan.input;
    let outcome = catch_unwind(AssertUnwindSafe(|| match &plan.invocation {
        Invocation::Handler(Handler::Unary(f)) => f(input),
        Invocation::Handler(Handler::Binary(f)) => f(input, sub),
        Invocation::Handler(Handler::Ternary(f)) => f(input, sub, opts),
        Invocation::Default(f) => f(key, input, sub, opts),
    }));

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(DeviceError::NotFound { key })) => Err(ResolveError::NotFound { key }),
        Ok(Err(DeviceError::Failed { reason })) => Err(ResolveError::DeviceCall {
            device: plan.device.label(),
            key: key.render(),
            reason,
        }),
        Err(payload) => {
            if opts.error_strategy == ErrorStrategy::Throw {
                resume_unwind(payload);
            }
            Err(ResolveError::DeviceCall {
                device: plan.device.label(),
                key: key.render(),
                reason: panic_text(payload.as_ref()),
            })
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "handler panicked".to_string())
        },
        |s| (*s).to_string(),
    )
}
