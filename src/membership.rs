//! System membership.
//!
//! The membership table is the authoritative in-memory record of the members of the system,
//! keyed by rank. Updates are serialized per rank by the map's shard locks, so joins for
//! distinct ranks proceed in parallel.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::models::{Member, MemberState, Rank};

const METRIC_MEMBERS: &str = "hadron_mgmt_members";
const METRIC_MEMBERS_JOINED: &str = "hadron_mgmt_members_joined";

/// A concurrency-safe table of system members.
#[derive(Clone, Default)]
pub struct Membership {
    members: Arc<DashMap<Rank, Member>>,
    /// The number of members in the joined state, adjusted under the lock of the updated entry.
    joined: Arc<AtomicI64>,
}

impl Membership {
    /// Create a new instance.
    pub fn new() -> Self {
        metrics::register_gauge!(METRIC_MEMBERS, metrics::Unit::Count, "the number of members in the system membership table");
        metrics::register_gauge!(METRIC_MEMBERS_JOINED, metrics::Unit::Count, "the number of members currently joined to the system");
        Self::default()
    }

    /// Add the given member, or update the existing member of the same rank.
    ///
    /// Returns `true` if the member was created, else the state of the existing member prior to
    /// the update. The identity of an existing member is preserved, only its address and state
    /// are replaced.
    pub fn add_or_update(&self, member: Member) -> (bool, Option<MemberState>) {
        let rank = member.rank;
        let new_state = member.state;
        let res = match self.members.entry(rank) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                let old_state = existing.state;
                existing.addr = member.addr;
                existing.state = member.state;
                self.adjust_joined(Some(old_state), new_state);
                (false, Some(old_state))
            }
            Entry::Vacant(entry) => {
                entry.insert(member);
                self.adjust_joined(None, new_state);
                (true, None)
            }
        };
        if res.0 {
            metrics::increment_gauge!(METRIC_MEMBERS, 1.0);
        }
        metrics::gauge!(METRIC_MEMBERS_JOINED, self.joined() as f64);
        res
    }

    /// Get a copy of the member with the given rank.
    pub fn get(&self, rank: Rank) -> Option<Member> {
        self.members.get(&rank).map(|member| member.value().clone())
    }

    /// The number of members currently in the joined state.
    pub fn joined(&self) -> usize {
        self.joined.load(Ordering::SeqCst).max(0) as usize
    }

    /// The number of members in the table.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    fn adjust_joined(&self, old_state: Option<MemberState>, new_state: MemberState) {
        let was_joined = old_state == Some(MemberState::Joined);
        let is_joined = new_state == MemberState::Joined;
        if was_joined && !is_joined {
            self.joined.fetch_sub(1, Ordering::SeqCst);
        } else if is_joined && !was_joined {
            self.joined.fetch_add(1, Ordering::SeqCst);
        }
    }
}
