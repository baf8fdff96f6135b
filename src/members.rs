//! src/members.rs
//!
//! The per-node member registry. This module is the single source of truth
//! for cluster membership state: each member's sequence clock, status,
//! metadata and per-peer known-clock vector, plus the status indexes used
//! for random peer selection and the change notification channel.

use crate::config::Config;
use crate::packet::{Source, Validity, VALIDITY_LEN};
use crate::shuffle::Shuffle;
use crate::status::Status;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// Statuses that keep a live selection index. Aggregates are indexed too so
/// queries like `find(1, AVAILABLE, ..)` stay O(1).
const INDEXED_STATUSES: [Status; 6] = [
    Status::ONLINE,
    Status::SUSPECT,
    Status::OFFLINE,
    Status::AVAILABLE,
    Status::UNAVAILABLE,
    Status::ALL,
];

/// Buffered change notifications per subscriber before it starts lagging.
const NOTIFY_CAPACITY: usize = 256;

/// A member's metadata mapping, or the distinguished "not yet learned"
/// value. `Unknown` is distinct from an empty map: a member whose state has
/// never been received must not be gossiped onward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Metadata {
    Unknown,
    Known(Arc<HashMap<String, Vec<u8>>>),
}

impl Metadata {
    pub fn known(map: HashMap<String, Vec<u8>>) -> Self {
        Metadata::Known(Arc::new(map))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Metadata::Unknown)
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Vec<u8>>> {
        match self {
            Metadata::Unknown => None,
            Metadata::Known(map) => Some(map),
        }
    }

    /// The form carried inside a gossip packet: `None` when unknown.
    pub fn to_wire(&self) -> Option<HashMap<String, Vec<u8>>> {
        self.as_map().cloned()
    }
}

/// An immutable snapshot of one member, published to change subscribers.
#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub name: Arc<str>,
    pub local: bool,
    pub clock: u64,
    pub status: Status,
    pub status_time: Instant,
    pub metadata: Metadata,
}

/// The state needed to build one outgoing gossip assertion about a member.
#[derive(Clone, Debug)]
pub struct GossipState {
    pub name: Arc<str>,
    pub clock: u64,
    pub status: Status,
    pub metadata: Metadata,
}

#[derive(Debug)]
struct Member {
    name: Arc<str>,
    local: bool,
    clock: u64,
    validity: Validity,
    status: Status,
    status_time: Instant,
    metadata: Metadata,
    /// For each other member, the highest clock this peer is known to have
    /// received. Absent means nothing is known to have been received.
    known_clocks: HashMap<Arc<str>, u64>,
}

impl Member {
    fn new(name: Arc<str>, local: bool) -> Self {
        let mut validity = [0u8; VALIDITY_LEN];
        rand::thread_rng().fill_bytes(&mut validity);
        Self {
            name,
            local,
            clock: 0,
            validity,
            status: Status::OFFLINE,
            status_time: Instant::now(),
            metadata: Metadata::Unknown,
            known_clocks: HashMap::new(),
        }
    }

    /// Whether this peer still needs to hear about `member`'s latest state.
    fn needs_gossip(&self, member: &Member) -> bool {
        match self.known_clocks.get(member.name.as_ref()) {
            Some(&known) => member.clock > known,
            None => true,
        }
    }

    fn info(&self) -> MemberInfo {
        MemberInfo {
            name: self.name.clone(),
            local: self.local,
            clock: self.clock,
            status: self.status,
            status_time: self.status_time,
            metadata: self.metadata.clone(),
        }
    }

    fn gossip_state(&self) -> GossipState {
        GossipState {
            name: self.name.clone(),
            clock: self.clock,
            status: self.status,
            metadata: self.metadata.clone(),
        }
    }
}

/// Manages the members of the cluster.
///
/// The registry owns the local member and every peer it has heard of. All
/// mutation funnels through [`Members::update`] (local-origin changes, which
/// consume the next sequence clock) and [`Members::apply`] (remote-origin
/// gossip, applied under the embedded clock), so the per-member clock can
/// never regress and every committed change publishes exactly one
/// notification.
pub struct Members {
    next_clock: u64,
    local_name: Arc<str>,
    members: HashMap<Arc<str>, Member>,
    non_local: Vec<Arc<str>>,
    statuses: HashMap<Status, Shuffle<Arc<str>>>,
    notify_tx: broadcast::Sender<MemberInfo>,
}

impl Members {
    /// Creates the registry with the local member marked online and every
    /// configured peer pre-registered as offline/unknown.
    pub fn new(config: &Config) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let local_name: Arc<str> = Arc::from(config.local_name.as_str());
        let local = Member::new(local_name.clone(), true);
        let mut registry = Self {
            next_clock: 1,
            local_name: local_name.clone(),
            members: HashMap::from([(local_name, local)]),
            non_local: Vec::new(),
            statuses: INDEXED_STATUSES
                .iter()
                .map(|status| (*status, Shuffle::new()))
                .collect(),
            notify_tx,
        };
        for peer in &config.peers {
            registry.get(peer, None);
        }
        registry.update(
            &config.local_name,
            Some(Status::ONLINE),
            Some(config.local_metadata_bytes()),
        );
        registry
    }

    /// Subscribes to committed membership changes. Every subscriber receives
    /// every notification; a slow subscriber lags and misses old entries
    /// rather than ever blocking the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<MemberInfo> {
        self.notify_tx.subscribe()
    }

    /// The local member for this process.
    pub fn local(&self) -> MemberInfo {
        self.members[self.local_name.as_ref()].info()
    }

    /// The local member's packet source, `(name, validity)`.
    pub fn local_source(&self) -> Source {
        let local = &self.members[self.local_name.as_ref()];
        Source {
            name: local.name.to_string(),
            validity: local.validity,
        }
    }

    /// Names of all non-local cluster members.
    pub fn non_local(&self) -> &[Arc<str>] {
        &self.non_local
    }

    /// A snapshot of the named member, if it exists.
    pub fn info(&self, name: &str) -> Option<MemberInfo> {
        self.members.get(name).map(Member::info)
    }

    /// Returns the member with the given name, creating it if it does not
    /// exist. A new member starts offline at clock zero with unknown
    /// metadata.
    ///
    /// If `validity` is given and differs from the stored value on an
    /// existing non-local member, the peer restarted: its known-clock vector
    /// is cleared so its state gets re-gossiped in full.
    pub fn get(&mut self, name: &str, validity: Option<Validity>) -> Arc<str> {
        let name = match self.members.get_key_value(name) {
            Some((existing, _)) => existing.clone(),
            None => {
                let name: Arc<str> = Arc::from(name);
                self.members
                    .insert(name.clone(), Member::new(name.clone(), false));
                self.non_local.push(name.clone());
                self.refresh_statuses(&name);
                name
            }
        };
        if let Some(validity) = validity {
            let member = self.members.get_mut(name.as_ref()).expect("just fetched");
            if !member.local && member.validity != validity {
                tracing::debug!(
                    member = %member.name,
                    validity = %hex::encode(validity),
                    "peer validity changed; resetting its known clocks"
                );
                member.known_clocks.clear();
                member.validity = validity;
            }
        }
        name
    }

    /// Returns up to `count` random non-local members in `status`, never
    /// including anything in `exclude`.
    pub fn find(&self, count: usize, status: Status, exclude: &[&str]) -> Vec<Arc<str>> {
        let Some(shuffle) = self.statuses.get(&status) else {
            return Vec::new();
        };
        let num_excluded = exclude
            .iter()
            .filter(|name| shuffle.contains(**name))
            .count();
        let num_results = count.min(shuffle.len().saturating_sub(num_excluded));
        let mut results: Vec<Arc<str>> = Vec::with_capacity(num_results);
        while results.len() < num_results {
            let Some(pick) = shuffle.choice() else {
                break;
            };
            if exclude.contains(&pick.as_ref()) || results.iter().any(|r| r == pick) {
                continue;
            }
            results.push(pick.clone());
        }
        results
    }

    /// Names of all non-local members currently in `status` (real or
    /// aggregate).
    pub fn get_status(&self, status: Status) -> Vec<Arc<str>> {
        self.statuses
            .get(&status)
            .map(|shuffle| shuffle.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A local-origin change to a member's status or metadata, stamped with
    /// the next sequence clock.
    pub fn update(
        &mut self,
        name: &str,
        new_status: Option<Status>,
        new_metadata: Option<HashMap<String, Vec<u8>>>,
    ) {
        let name = self.get(name, None);
        let clock = self.next_clock;
        self.commit(&name, None, clock, new_status, new_metadata);
    }

    /// Applies a disseminated update from `source` asserting `name`'s state
    /// at `clock`.
    pub fn apply(
        &mut self,
        name: &str,
        source: &str,
        clock: u64,
        status: Status,
        metadata: Option<HashMap<String, Vec<u8>>>,
    ) {
        let name = self.get(name, None);
        let source = self.get(source, None);
        self.commit(&name, Some(&source), clock, Some(status), metadata);
    }

    /// Collects the members whose state `target` has not yet acknowledged.
    /// Non-local members with unknown metadata are withheld; the local
    /// member is always eligible.
    pub fn get_gossip(&self, target: &str) -> Vec<GossipState> {
        let Some(target) = self.members.get(target) else {
            return Vec::new();
        };
        let mut gossip = Vec::new();
        let local = &self.members[self.local_name.as_ref()];
        if target.needs_gossip(local) {
            gossip.push(local.gossip_state());
        }
        for name in &self.non_local {
            let member = &self.members[name.as_ref()];
            if !member.metadata.is_unknown() && target.needs_gossip(member) {
                gossip.push(member.gossip_state());
            }
        }
        gossip
    }

    /// Records that `source` has received updates about `name` up to the
    /// given sequence clock, so that gossip stops being repeated.
    pub fn ack_gossip(&mut self, name: &str, source: &str, clock: u64) {
        let Some(member) = self.members.get(name) else {
            return;
        };
        let member_name = member.name.clone();
        // Clamp so a bogus ack can never claim a clock ahead of the member.
        let clock = clock.min(member.clock);
        let Some(source) = self.members.get_mut(source) else {
            return;
        };
        source.known_clocks.insert(member_name, clock);
    }

    /// Stages and commits one change to a member, publishing a notification
    /// iff anything actually changed.
    ///
    /// `source` is `None` for local-origin changes. For remote-origin
    /// changes it is the member that disseminated the update: an update
    /// whose clock is stale is dropped unless the member is asserting its
    /// own state, and an update targeting the local member has its content
    /// ignored while the local clock is bumped to reassert authority.
    fn commit(
        &mut self,
        name: &Arc<str>,
        source: Option<&Arc<str>>,
        clock: u64,
        new_status: Option<Status>,
        new_metadata: Option<HashMap<String, Vec<u8>>>,
    ) {
        let next_clock = self.next_clock;
        let Some(member) = self.members.get_mut(name.as_ref()) else {
            return;
        };

        let pending_clock = (clock > member.clock).then_some(clock);
        let pending_status = new_status.and_then(|status| {
            let transition = member.status.transition(status);
            (transition != member.status).then_some(transition)
        });
        let pending_metadata = new_metadata.and_then(|map| match &member.metadata {
            Metadata::Known(current) if **current == map => None,
            _ => Some(map),
        });

        let is_self_assertion = source.map_or(false, |source| source == name);
        let ignore_update = member.local && source.is_some();
        let pending_clock = if pending_clock.is_none() && !is_self_assertion {
            return;
        } else if ignore_update {
            Some(next_clock)
        } else {
            pending_clock
        };

        let mut updated = false;
        if let Some(status) = pending_status {
            updated = true;
            if !ignore_update {
                member.status = status;
                member.status_time = Instant::now();
            }
        }
        if let Some(map) = pending_metadata {
            updated = true;
            if !ignore_update {
                member.metadata = Metadata::known(map);
            }
        }
        if updated {
            if let Some(pending_clock) = pending_clock {
                member.clock = pending_clock;
            }
        }

        let member_clock = member.clock;
        let local = member.local;
        let info = updated.then(|| member.info());
        if let Some(info) = info {
            if !local {
                self.refresh_statuses(name);
            }
            let _ = self.notify_tx.send(info);
        }
        if member_clock >= self.next_clock {
            self.next_clock = member_clock + 1;
        }
    }

    /// Re-indexes a non-local member into the per-status shuffles after a
    /// transition.
    fn refresh_statuses(&mut self, name: &Arc<str>) {
        let status = self.members[name.as_ref()].status;
        for indexed in INDEXED_STATUSES {
            let shuffle = self
                .statuses
                .get_mut(&indexed)
                .expect("all indexed statuses exist");
            if status.intersects(indexed) {
                shuffle.add(name.clone());
            } else {
                shuffle.discard(name.as_ref());
            }
        }
    }
}
