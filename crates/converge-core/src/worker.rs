//! The long-lived worker loop.
//!
//! Stage 9 can promote a resolution's terminal state into a worker: a
//! thread that keeps the hot message in memory and serves further
//! resolutions against it until an idle timeout fires. Workers do not
//! chain; every request resolves against the same held state. On
//! retirement the worker resolves `terminate` against the held state once,
//! with hashpath linking forced off, so devices can flush in-memory state.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use tracing::{debug, trace};

use crate::cache::CacheSetting;
use crate::group::{GroupKey, GroupRequest};
use crate::key::to_key;
use crate::message::Message;
use crate::resolver::{resolve, HashpathPolicy, Opts, SubInput};

/// A device-supplied replacement for the default worker loop.
pub type WorkerFn = Arc<dyn Fn(WorkerSeed) + Send + Sync>;

/// Everything a worker loop needs to serve its group.
pub struct WorkerSeed {
    /// The terminal state the worker holds.
    pub held: Message,
    /// Inbox of group requests.
    pub requests: Receiver<GroupRequest>,
    /// The group this worker serves.
    pub group_key: GroupKey,
    /// The worker's registry member id, for leaving on retirement.
    pub member_id: u64,
    /// Options the worker resolves with.
    pub opts: Opts,
}

/// Forks the worker thread. A device-published `worker` hook replaces the
/// default loop.
pub(crate) fn spawn(
    held: Message,
    group_key: GroupKey,
    member_id: u64,
    requests: Receiver<GroupRequest>,
    hook: Option<WorkerFn>,
    opts: Opts,
) {
    thread::spawn(move || {
        let seed = WorkerSeed {
            held,
            requests,
            group_key,
            member_id,
            opts,
        };
        match hook {
            Some(custom) => custom(seed),
            None => run(seed),
        }
    });
}

/// The default worker loop.
///
/// Serves requests until the idle timeout (`worker_timeout`; `None` never
/// retires), then leaves the group, serves any stragglers already queued,
/// and resolves `terminate` against the held state.
pub fn run(seed: WorkerSeed) {
    let WorkerSeed {
        held,
        requests,
        group_key,
        member_id,
        mut opts,
    } = seed;

    // Resolutions of the held state must not rejoin the group this worker
    // serves, and a serving worker does not breed further workers.
    opts.groups.push(group_key.clone());
    opts.spawn_worker = false;

    loop {
        let request = match opts.worker_timeout {
            Some(timeout) => match requests.recv_timeout(timeout) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    opts.group_registry.leave(&group_key, member_id);
                    return;
                }
            },
            None => match requests.recv() {
                Ok(request) => request,
                Err(_) => {
                    opts.group_registry.leave(&group_key, member_id);
                    return;
                }
            },
        };
        serve(&held, request, &opts);
    }

    // Leave first so new callers elect a fresh leader, then drain what
    // already queued.
    opts.group_registry.leave(&group_key, member_id);
    while let Ok(request) = requests.try_recv() {
        serve(&held, request, &opts);
    }
    retire(&held, &opts);
}

fn serve(held: &Message, request: GroupRequest, opts: &Opts) {
    trace!("worker serving resolution against held state");
    let result = resolve(held, SubInput::Message(request.sub), opts);
    let _ = request.reply.send(result);
}

fn retire(held: &Message, opts: &Opts) {
    let mut retire_opts = opts.clone();
    retire_opts.hashpath = HashpathPolicy::Ignore;
    retire_opts.cache = CacheSetting::Disabled;
    if let Err(e) = resolve(held, SubInput::Key(to_key("terminate")), &retire_opts) {
        debug!(error = %e, "terminate resolution reported an error");
    }
    debug!("worker retired");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::device::{Device, Handler, InlineDevice};
    use crate::hashpath::ContentId;
    use crate::message::Value;

    fn request_for(sub: Message) -> (GroupRequest, mpsc::Receiver<crate::group::GroupReply>) {
        let (reply_tx, reply_rx) = mpsc::channel();
        let request = GroupRequest {
            input: Message::new(),
            sub: sub.clone(),
            input_id: ContentId::commit(b"input"),
            sub_id: sub.commit(),
            reply: reply_tx,
        };
        (request, reply_rx)
    }

    fn seed_with(held: Message, opts: Opts) -> (WorkerSeed, mpsc::Sender<GroupRequest>) {
        let (tx, rx) = mpsc::channel();
        let seed = WorkerSeed {
            held,
            requests: rx,
            group_key: GroupKey::Custom(b"worker-test".to_vec()),
            member_id: 1,
            opts,
        };
        (seed, tx)
    }

    #[test]
    fn worker_serves_resolutions_of_the_held_state() {
        let mut opts = Opts::default();
        opts.worker_timeout = Some(Duration::from_millis(200));
        let held = Message::new().with("status", "ready");
        let (seed, tx) = seed_with(held, opts);

        let handle = thread::spawn(move || run(seed));

        let sub = Message::new().with(
            "path",
            Value::Path(crate::path::Path::parse("status")),
        );
        let (request, reply_rx) = request_for(sub);
        tx.send(request).expect("send");

        let reply = reply_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("worker reply");
        assert_eq!(reply, Ok(Value::text("ready")));

        drop(tx);
        handle.join().expect("worker thread");
    }

    #[test]
    fn idle_timeout_triggers_a_terminate_resolution() {
        static FLUSHED: AtomicBool = AtomicBool::new(false);

        let device = Device::inline(InlineDevice::new().handler(
            "terminate",
            Handler::unary(|_held| {
                FLUSHED.store(true, Ordering::SeqCst);
                Ok(Value::Bool(true))
            }),
        ));

        let mut opts = Opts::default();
        opts.worker_timeout = Some(Duration::from_millis(20));
        let held = Message::new().with("device", device).with("state", 1i64);
        let (seed, tx) = seed_with(held, opts);

        let handle = thread::spawn(move || run(seed));
        handle.join().expect("worker thread");
        assert!(FLUSHED.load(Ordering::SeqCst));
        drop(tx);
    }

    #[test]
    fn disconnected_inbox_ends_the_loop_without_terminate() {
        let mut opts = Opts::default();
        opts.worker_timeout = None;
        let (seed, tx) = seed_with(Message::new().with("a", 1i64), opts);
        drop(tx);
        // recv() sees the disconnect immediately; run returns.
        run(seed);
    }
}
