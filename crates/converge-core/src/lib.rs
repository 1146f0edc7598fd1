//! Converge: message-against-message resolution.
//!
//! Every computational step in a Converge node is the resolution of a
//! *message* against another message through a *device* (an inline handler
//! map, a preloaded module, or a signed content-addressed blob). The
//! resolver composes steps into arbitrarily long paths, memoizes outputs in
//! a content-addressed cache, chains each step into a *hashpath* witnessing
//! the computation, and deduplicates concurrent identical executions
//! through an intra-node group registry.
//!
//! # Quick tour
//!
//! ```
//! use converge_core::{resolve, Message, Opts, Value};
//!
//! let opts = Opts::default();
//! let msg = Message::new().with("balance", 100i64);
//! assert_eq!(resolve(&msg, "balance", &opts), Ok(Value::Int(100)));
//! ```
//!
//! The planes a resolution runs over (cache, store, group registry, device
//! table) travel inside [`Opts`]; embedders swap in their own backends via
//! the [`cache::Cache`] and [`store::Store`] traits.

#![forbid(unsafe_code)]

pub mod cache;
pub mod device;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod group;
pub mod hashpath;
pub mod key;
pub mod loader;
pub mod message;
pub mod path;
pub mod resolver;
pub mod shortcuts;
pub mod store;
pub mod worker;

pub use cache::{Cache, CacheSetting, MemoryCache};
pub use device::{
    Device, DeviceError, DeviceInfo, DeviceModule, DeviceRegistry, Handler, InfoHandler,
    InlineDevice,
};
pub use error::{ErrorStrategy, ResolveError, ResolveResult};
pub use group::{GroupKey, GroupRegistry};
pub use hashpath::{ContentId, Hashpath};
pub use key::{key_to_binary, to_key, Key};
pub use message::{Message, Value};
pub use path::Path;
pub use resolver::{resolve, resolve_message, HashpathPolicy, Opts, OptsConfig, Prefer, SubInput};
pub use shortcuts::{get, get_as, get_or, keys, keys_mode, remove, set, set_path, KeysMode};
pub use store::{DiskStore, MemoryStore, Store};
pub use worker::{WorkerFn, WorkerSeed};
