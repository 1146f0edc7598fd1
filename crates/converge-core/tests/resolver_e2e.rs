//! End-to-end resolver scenarios.
//!
//! These tests exercise the full pipeline at the crate boundary: dispatch
//! across handler arities, device-published overrides, path recursion and
//! deep sets, in-flight deduplication across threads, worker promotion
//! through a device-supplied group key, and key-representation
//! equivalence.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use converge_core::{
    get, get_as, get_or, resolve, set, set_path, to_key, CacheSetting, Device, DeviceInfo,
    Handler, InfoHandler, InlineDevice, Message, Opts, Path, ResolveError, SubInput, Value,
};

/// Scenario: a scalar key present in the input resolves to its value, and
/// the output carries no witness.
#[test]
fn direct_key_fetch() {
    let opts = Opts::default();
    let input = Message::new().with("a", 1i64);
    assert_eq!(resolve(&input, "a", &opts), Ok(Value::Int(1)));
}

/// Scenario: the reserved `path` key resolves like any other entry.
#[test]
fn path_fetch() {
    let opts = Opts::default();
    let input = Message::new().with("path", Value::Path(Path::parse("test_path")));
    assert_eq!(
        resolve(&input, "path", &opts),
        Ok(Value::Path(Path::parse("test_path")))
    );
}

/// Scenario: deep set descends the path and rebuilds every parent.
#[test]
fn deep_set_rebuilds_the_tree() {
    let opts = Opts::default();
    let input = Message::new().with(
        "a",
        Message::new().with("b", Message::new().with("c", 1i64)),
    );
    let updated = set_path(&input, &Path::parse("a/b/c"), 2i64, &opts).expect("deep set");
    let expected = Message::new().with(
        "a",
        Message::new().with("b", Message::new().with("c", 2i64)),
    );
    assert_eq!(updated, expected);

    // Siblings and the original message are untouched.
    assert_eq!(
        resolve(&input, "a/b/c", &opts),
        Ok(Value::Int(1))
    );
}

fn concat(parts: &[&str]) -> Value {
    Value::text(&parts.concat())
}

/// Scenario: one device exposing handlers of arity 1, 2, and 3; each sees
/// exactly the arguments its arity declares.
#[test]
fn handler_arities_truncate_arguments() {
    let device = Device::inline(
        InlineDevice::new()
            .handler(
                "k1",
                Handler::unary(|state| {
                    let s = state.get("state_key").and_then(Value::as_text).unwrap_or("");
                    Ok(concat(&[s]))
                }),
            )
            .handler(
                "k2",
                Handler::binary(|state, sub| {
                    let s = state.get("state_key").and_then(Value::as_text).unwrap_or("");
                    let m = sub.get("msg_key").and_then(Value::as_text).unwrap_or("");
                    Ok(concat(&[s, m]))
                }),
            )
            .handler(
                "k3",
                Handler::ternary(|state, sub, opts| {
                    let s = state.get("state_key").and_then(Value::as_text).unwrap_or("");
                    let m = sub.get("msg_key").and_then(Value::as_text).unwrap_or("");
                    let o = opts.option("opts_key").and_then(Value::as_text).unwrap_or("");
                    Ok(concat(&[s, m, o]))
                }),
            ),
    );
    let input = Message::new()
        .with("device", device)
        .with("state_key", "1");

    let opts = Opts::default();
    assert_eq!(resolve(&input, "k1", &opts), Ok(Value::text("1")));

    let sub2 = Message::new()
        .with("path", Value::Path(Path::parse("k2")))
        .with("msg_key", "3");
    assert_eq!(
        resolve(&input, SubInput::Message(sub2), &opts),
        Ok(Value::text("13"))
    );

    let mut opts3 = Opts::default();
    opts3.extra = Message::new().with("opts_key", "37");
    let sub3 = Message::new()
        .with("path", Value::Path(Path::parse("k3")))
        .with("msg_key", "3");
    assert_eq!(
        resolve(&input, SubInput::Message(sub3), &opts3),
        Ok(Value::text("1337"))
    );
}

/// Scenario: a device declaring only a `default` callable serves unknown
/// keys from it and still exposes its own state.
#[test]
fn default_callable_handles_unknown_keys() {
    let device = Device::inline(InlineDevice::new().info(DeviceInfo {
        default: Some(Arc::new(|key, input, _sub, _opts| {
            Ok(input
                .get_key(key)
                .cloned()
                .unwrap_or_else(|| Value::text("DEFAULT")))
        })),
        ..DeviceInfo::default()
    }));
    let input = Message::new()
        .with("device", device)
        .with("state_key", "mine");

    let opts = Opts::default();
    assert_eq!(resolve(&input, "unknown", &opts), Ok(Value::text("DEFAULT")));
    assert_eq!(resolve(&input, "state_key", &opts), Ok(Value::text("mine")));
}

/// Scenario: `handler: {func, exclude: [set]}` routes everything through
/// the catch-all except `set`, which the default device serves with the
/// input's device binding stripped.
#[test]
fn exclude_list_delegates_to_the_default_device() {
    let mut exclude = BTreeSet::new();
    exclude.insert(to_key("set"));
    let device = Device::inline(InlineDevice::new().info(DeviceInfo {
        handler: Some(InfoHandler {
            func: Handler::unary(|_| Ok(Value::text("HANDLED"))),
            exclude,
        }),
        ..DeviceInfo::default()
    }));
    let input = Message::new().with("device", device).with("a", 1i64);

    let opts = Opts::default();
    assert_eq!(resolve(&input, "a", &opts), Ok(Value::text("HANDLED")));
    assert_eq!(resolve(&input, "anything", &opts), Ok(Value::text("HANDLED")));

    let updated = set(&input, &Message::new().with("a", 2i64), &opts).expect("set");
    assert_eq!(updated.get("a"), Some(&Value::Int(2)));
    // The delegation stripped the device binding for that call.
    assert!(updated.device().is_none());
}

/// Scenario: concurrent identical resolutions invoke the handler at most
/// once; every caller sees the same output, and the result is memoized.
#[test]
fn concurrent_identical_calls_deduplicate() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let device = Device::inline(InlineDevice::new().handler(
        "slow",
        Handler::unary(move |_input| {
            counted.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(500));
            Ok(Value::Int(42))
        }),
    ));

    let opts = Opts::default();
    let input = Message::new().with("device", device).with("seed", 1i64);

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let opts = opts.clone();
        let input = input.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            resolve(&input, "slow", &opts)
        }));
    }

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();
    assert_eq!(results[0], Ok(Value::Int(42)));
    assert_eq!(results[0], results[1]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Memoized: a third call is served by the cache.
    assert_eq!(resolve(&input, "slow", &opts), Ok(Value::Int(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Scenario: heterogeneous key representations address the same entry.
#[test]
fn key_representations_are_equivalent() {
    let opts = Opts::default();
    let msg = Message::new().with("key1", "value");

    let a = get(&msg, "Key1", &opts);
    let b = get(&msg, "key1", &opts);
    let c = get(&msg, "KEY1", &opts);
    assert_eq!(a, Ok(Value::text("value")));
    assert_eq!(a, b);
    assert_eq!(b, c);
}

/// A device-supplied group key routes later resolutions of other keys to
/// the promoted worker, which serves them from its held state.
#[test]
fn worker_promotion_serves_later_calls_from_held_state() {
    let device = Device::inline(
        InlineDevice::new()
            .handler(
                "boot",
                Handler::unary(|_input| Ok(Value::Map(Message::new().with("status", "ready")))),
            )
            .info(DeviceInfo {
                grouper: Some(Arc::new(|_input, _sub, _opts| b"proc-1".to_vec())),
                ..DeviceInfo::default()
            }),
    );

    let mut opts = Opts::default();
    opts.spawn_worker = true;
    opts.cache = CacheSetting::Disabled;
    opts.worker_timeout = Some(Duration::from_secs(5));

    let input = Message::new().with("device", device);

    // First call leads, executes, and hands the group to a worker holding
    // the boot output.
    let Value::Map(booted) = resolve(&input, "boot", &opts).expect("boot") else {
        panic!("boot must produce a message");
    };
    assert_eq!(booted.get("status"), Some(&Value::text("ready")));

    // Same group key, different sub-input: the worker answers from the
    // held state, not from the original input.
    assert_eq!(resolve(&input, "status", &opts), Ok(Value::text("ready")));
}

/// The `as` override dispatches through another device without touching
/// the input's own binding.
#[test]
fn as_override_is_call_scoped() {
    let shouty = Device::inline(InlineDevice::new().info(DeviceInfo {
        handler: Some(InfoHandler {
            func: Handler::unary(|_| Ok(Value::text("LOUD"))),
            exclude: BTreeSet::new(),
        }),
        ..DeviceInfo::default()
    }));

    let opts = Opts::default();
    let msg = Message::new().with("greeting", "quiet");

    assert_eq!(get_as(&shouty, &msg, "greeting", &opts), Ok(Value::text("LOUD")));
    assert_eq!(get(&msg, "greeting", &opts), Ok(Value::text("quiet")));
}

/// Errors surface structurally and `get_or` maps them to the default.
#[test]
fn missing_keys_error_and_default() {
    let opts = Opts::default();
    let msg = Message::new().with("present", 1i64);
    assert!(matches!(
        resolve(&msg, "absent", &opts),
        Err(ResolveError::NotFound { .. })
    ));
    assert_eq!(get_or(&msg, "absent", Value::Int(0), &opts), Value::Int(0));
}

/// Joiners see the leader's failure verbatim.
#[test]
fn joiners_receive_the_leaders_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let device = Device::inline(InlineDevice::new().handler(
        "doomed",
        Handler::unary(move |_input| {
            counted.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(400));
            Err(converge_core::DeviceError::failed("deliberate"))
        }),
    ));

    let opts = Opts::default();
    let input = Message::new().with("device", device);

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let opts = opts.clone();
        let input = input.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            resolve(&input, "doomed", &opts)
        }));
    }
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();

    assert!(results.iter().all(Result::is_err));
    assert_eq!(results[0], results[1]);
    // Failures are not cached, but the in-flight callers shared one run.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
