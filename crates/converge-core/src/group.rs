//! The deduplication plane: execution groups for in-flight resolutions.
//!
//! Concurrent callers resolving the same `(input, sub-input)` pair join one
//! execution group. The first member is the leader and does the work; later
//! members hand it a request over its channel and block on the reply. The
//! registry is a sharded multimap from group key to members; joins, leaves,
//! and the leader-to-worker swap each happen under a single shard lock, so
//! membership changes are atomic from any caller's perspective.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::error::ResolveError;
use crate::hashpath::ContentId;
use crate::message::{Message, Value};

const SHARD_COUNT: usize = 16;

/// Identifies an execution group: the default `(input, sub-input)` pair or
/// a device-supplied custom key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// The default pairing of input and sub-input commitments.
    Pair(ContentId, ContentId),
    /// A device-derived key.
    Custom(Vec<u8>),
}

/// What a joiner (or the worker's clients) send to the serving member.
pub struct GroupRequest {
    /// The input message the caller is resolving.
    pub input: Message,
    /// The sub-input message.
    pub sub: Message,
    /// Commitment of `input`, for sweep matching.
    pub input_id: ContentId,
    /// Commitment of `sub`, for sweep matching.
    pub sub_id: ContentId,
    /// Where the serving member sends the outcome.
    pub reply: Sender<GroupReply>,
}

/// The outcome fanned out to joiners.
pub type GroupReply = Result<Value, ResolveError>;

/// A registered group member: an id and the channel requests reach it on.
#[derive(Clone)]
pub struct Member {
    /// Registry-unique member id.
    pub id: u64,
    /// The member's request inbox.
    pub tx: Sender<GroupRequest>,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Member({})", self.id)
    }
}

/// The leader's side of its membership: the inbox requests arrive on.
pub struct LeaderSlot {
    /// This leader's member id.
    pub member_id: u64,
    /// Inbox of joiner requests.
    pub rx: Receiver<GroupRequest>,
}

impl LeaderSlot {
    /// The notify sweep: drains the inbox without blocking and replies to
    /// every pending request for the same `(input, sub-input)` pair.
    ///
    /// Requests for a different pair are dropped; their reply channel
    /// disconnects and the sender restarts its group check as a new leader.
    pub fn sweep(&self, input_id: &ContentId, sub_id: &ContentId, result: &GroupReply) -> usize {
        let mut served = 0;
        while let Ok(request) = self.rx.try_recv() {
            if request.input_id == *input_id && request.sub_id == *sub_id {
                if request.reply.send(result.clone()).is_ok() {
                    served += 1;
                }
            } else {
                trace!("dropping mismatched group request during sweep");
            }
        }
        served
    }
}

/// Outcome of a group check.
pub enum JoinOutcome {
    /// The group was empty; the caller is now its leader.
    Leader(LeaderSlot),
    /// The group is occupied; hand the request to this member.
    Peer(Member),
}

/// Sharded registry of execution groups.
pub struct GroupRegistry {
    shards: Vec<Mutex<HashMap<GroupKey, Vec<Member>>>>,
    next_id: AtomicU64,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &GroupKey) -> MutexGuard<'_, HashMap<GroupKey, Vec<Member>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % SHARD_COUNT;
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a member (id plus channel pair) without registering it.
    #[must_use]
    pub fn make_member(&self) -> (Member, Receiver<GroupRequest>) {
        let (tx, rx) = mpsc::channel();
        let member = Member {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (member, rx)
    }

    /// Atomically checks the group: joins as leader when empty, otherwise
    /// returns the first member to hand the request to.
    #[must_use]
    pub fn join_or_peek(&self, key: &GroupKey) -> JoinOutcome {
        let (member, rx) = self.make_member();
        let mut shard = self.shard(key);
        let members = shard.entry(key.clone()).or_default();
        if let Some(first) = members.first() {
            return JoinOutcome::Peer(first.clone());
        }
        let member_id = member.id;
        members.push(member);
        drop(shard);
        debug!(id = member_id, "became group leader");
        JoinOutcome::Leader(LeaderSlot { member_id, rx })
    }

    /// Registers a member unconditionally.
    pub fn join(&self, key: &GroupKey, member: Member) {
        self.shard(key).entry(key.clone()).or_default().push(member);
    }

    /// Removes a member. Empty groups are dropped from the map.
    pub fn leave(&self, key: &GroupKey, member_id: u64) {
        let mut shard = self.shard(key);
        if let Some(members) = shard.get_mut(key) {
            members.retain(|m| m.id != member_id);
            if members.is_empty() {
                shard.remove(key);
            }
        }
    }

    /// Atomically replaces one member with another: the leader leaves and
    /// its worker joins in its place under a single lock.
    pub fn swap(&self, key: &GroupKey, old_id: u64, replacement: Member) {
        let mut shard = self.shard(key);
        let members = shard.entry(key.clone()).or_default();
        members.retain(|m| m.id != old_id);
        members.push(replacement);
        debug!(old = old_id, "group membership handed off");
    }

    /// Snapshot of the group's members.
    #[must_use]
    pub fn members(&self, key: &GroupKey) -> Vec<Member> {
        self.shard(key).get(key).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupRegistry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> GroupKey {
        GroupKey::Pair(ContentId::commit(b"input"), ContentId::commit(b"sub"))
    }

    #[test]
    fn first_join_leads_second_peeks() {
        let registry = GroupRegistry::new();
        let JoinOutcome::Leader(slot) = registry.join_or_peek(&key()) else {
            panic!("first caller must lead");
        };
        let JoinOutcome::Peer(member) = registry.join_or_peek(&key()) else {
            panic!("second caller must peek the leader");
        };
        assert_eq!(member.id, slot.member_id);
    }

    #[test]
    fn leave_empties_the_group() {
        let registry = GroupRegistry::new();
        let JoinOutcome::Leader(slot) = registry.join_or_peek(&key()) else {
            panic!("must lead");
        };
        registry.leave(&key(), slot.member_id);
        assert!(registry.members(&key()).is_empty());
        assert!(matches!(
            registry.join_or_peek(&key()),
            JoinOutcome::Leader(_)
        ));
    }

    #[test]
    fn sweep_replies_to_matching_requests_only() {
        let registry = GroupRegistry::new();
        let JoinOutcome::Leader(slot) = registry.join_or_peek(&key()) else {
            panic!("must lead");
        };
        let leader = registry.members(&key()).remove(0);

        let input_id = ContentId::commit(b"input-msg");
        let sub_id = ContentId::commit(b"sub-msg");

        let (reply_tx, reply_rx) = mpsc::channel();
        leader
            .tx
            .send(GroupRequest {
                input: Message::new(),
                sub: Message::new(),
                input_id,
                sub_id,
                reply: reply_tx,
            })
            .expect("send");

        let (other_tx, other_rx) = mpsc::channel();
        leader
            .tx
            .send(GroupRequest {
                input: Message::new(),
                sub: Message::new(),
                input_id: ContentId::commit(b"different"),
                sub_id,
                reply: other_tx,
            })
            .expect("send");

        let served = slot.sweep(&input_id, &sub_id, &Ok(Value::Int(1)));
        assert_eq!(served, 1);
        assert_eq!(reply_rx.recv().expect("reply"), Ok(Value::Int(1)));
        // The mismatched request was dropped; its channel disconnects.
        assert!(other_rx.recv().is_err());
    }

    #[test]
    fn swap_hands_the_group_to_a_replacement() {
        let registry = GroupRegistry::new();
        let JoinOutcome::Leader(slot) = registry.join_or_peek(&key()) else {
            panic!("must lead");
        };
        let (replacement, _rx) = registry.make_member();
        let replacement_id = replacement.id;
        registry.swap(&key(), slot.member_id, replacement);

        let members = registry.members(&key());
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, replacement_id);
    }

    #[test]
    fn plain_join_registers_additional_members() {
        let registry = GroupRegistry::new();
        let JoinOutcome::Leader(_slot) = registry.join_or_peek(&key()) else {
            panic!("must lead");
        };
        let (extra, _rx) = registry.make_member();
        registry.join(&key(), extra);
        assert_eq!(registry.members(&key()).len(), 2);
    }

    #[test]
    fn groups_with_distinct_keys_are_independent() {
        let registry = GroupRegistry::new();
        let other = GroupKey::Custom(b"custom".to_vec());
        assert!(matches!(registry.join_or_peek(&key()), JoinOutcome::Leader(_)));
        assert!(matches!(registry.join_or_peek(&other), JoinOutcome::Leader(_)));
    }
}
