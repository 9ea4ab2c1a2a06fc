//! The TTL map state machine.
//!
//! A replicated key/value store. Each entry retains the whole commit that
//! installed it: TTL checks need the commit timestamp, and ephemerality
//! needs the authoring session. Expiry is lazy: an inactive entry lingers
//! until the next access touches its key, at which point it is evicted and
//! treated as absent.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::rsm::{
    resolve_session, ApplyContext, Commit, CommitData, Compaction, CompactionKind, Mode,
    ReplicatedStateMachine, SessionHandle, SessionTable, SnapshotStream, StateMachineError,
};

use super::ops::{MapOperation, MapOutput, TtlRequest};

/// Snapshot payload schema version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MapSnapshot {
    time_ms: i64,
    sessions: Vec<u64>,
    /// Entries sorted by key so the encoding is canonical.
    entries: Vec<(String, CommitData<MapOperation>)>,
}

/// Replicated map with per-entry TTL and persistence mode.
pub struct TtlMapStateMachine {
    entries: HashMap<String, Commit<MapOperation>>,
    /// Ids of sessions currently live, for ephemeral-entry checks.
    sessions: BTreeSet<u64>,
    /// Logical clock: max commit timestamp seen. Never the system clock.
    time_ms: i64,
}

impl TtlMapStateMachine {
    pub fn new() -> Self {
        TtlMapStateMachine {
            entries: HashMap::new(),
            sessions: BTreeSet::new(),
            time_ms: 0,
        }
    }

    /// Advance the logical clock. Runs first in every handler so TTL
    /// checks within a commit use that commit's own timestamp.
    fn update_time(&mut self, timestamp_ms: i64) {
        if timestamp_ms > self.time_ms {
            self.time_ms = timestamp_ms;
        }
    }

    fn ttl_request(commit: &Commit<MapOperation>) -> &TtlRequest {
        match commit.operation() {
            MapOperation::Put(request) | MapOperation::PutIfAbsent(request) => request,
            _ => unreachable!("map entries hold ttl commands"),
        }
    }

    /// Whether an entry commit is observable: its session is still live if
    /// it is ephemeral, and its TTL (if any) has not elapsed on the
    /// logical clock.
    fn is_active(&self, commit: &Commit<MapOperation>) -> bool {
        let request = Self::ttl_request(commit);
        if request.mode == Mode::Ephemeral && !self.sessions.contains(&commit.session().id()) {
            return false;
        }
        if request.ttl_ms != 0 && request.ttl_ms < self.time_ms - commit.timestamp_ms() {
            return false;
        }
        true
    }

    /// Lazy expiry at the access point: evicts an inactive resident entry.
    /// Returns whether an active entry remains under `key`.
    fn evict_if_inactive(&mut self, key: &str) -> bool {
        let active = match self.entries.get(key) {
            Some(entry) => self.is_active(entry),
            None => return false,
        };
        if !active {
            if let Some(evicted) = self.entries.remove(key) {
                evicted.release();
            }
        }
        active
    }

    fn active_value(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .get(key)
            .map(|entry| Self::ttl_request(entry).value.clone())
    }

    /// Raw entry count, counting lazily-expired residents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The logical clock, for inspection.
    pub fn time_ms(&self) -> i64 {
        self.time_ms
    }

    fn put(&mut self, request: TtlRequest, commit: Commit<MapOperation>) -> MapOutput {
        let previous = self.entries.insert(request.key, commit);
        let result = match &previous {
            Some(prev) if self.is_active(prev) => Some(Self::ttl_request(prev).value.clone()),
            _ => None,
        };
        if let Some(prev) = previous {
            prev.release();
        }
        MapOutput::Value(result)
    }

    fn put_if_absent(&mut self, request: TtlRequest, commit: Commit<MapOperation>) -> MapOutput {
        if self.evict_if_inactive(&request.key) {
            // An active entry blocks installation; the new commit is dead
            // on arrival.
            commit.release();
            MapOutput::Value(self.active_value(&request.key))
        } else {
            self.entries.insert(request.key, commit);
            MapOutput::Value(None)
        }
    }

    fn remove(&mut self, key: String, expected: Option<Vec<u8>>) -> MapOutput {
        match expected {
            // Compare-and-remove by byte equality.
            Some(expected) => {
                if !self.evict_if_inactive(&key) {
                    return MapOutput::Bool(false);
                }
                let matches = self
                    .active_value(&key)
                    .map(|value| value == expected)
                    .unwrap_or(false);
                if matches {
                    if let Some(removed) = self.entries.remove(&key) {
                        removed.release();
                    }
                }
                MapOutput::Bool(matches)
            }
            // Unconditional removal returns the prior active value.
            None => {
                let removed = self.entries.remove(&key);
                let result = match &removed {
                    Some(entry) if self.is_active(entry) => {
                        Some(Self::ttl_request(entry).value.clone())
                    }
                    _ => None,
                };
                if let Some(removed) = removed {
                    removed.release();
                }
                MapOutput::Value(result)
            }
        }
    }
}

impl Default for TtlMapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedStateMachine for TtlMapStateMachine {
    type Operation = MapOperation;
    type Output = MapOutput;

    fn on_register(&mut self, session: &SessionHandle, ctx: &ApplyContext) {
        self.update_time(ctx.time_ms());
        self.sessions.insert(session.id());
    }

    fn on_expire(&mut self, session: &SessionHandle, ctx: &ApplyContext) {
        self.update_time(ctx.time_ms());
        self.sessions.remove(&session.id());
    }

    fn on_close(&mut self, session: &SessionHandle, ctx: &ApplyContext) {
        self.update_time(ctx.time_ms());
        self.sessions.remove(&session.id());
    }

    fn apply(
        &mut self,
        commit: Commit<MapOperation>,
        _ctx: &ApplyContext,
    ) -> Result<MapOutput, StateMachineError> {
        self.update_time(commit.timestamp_ms());

        let operation = commit.operation().clone();
        match operation {
            MapOperation::Put(request) => Ok(self.put(request, commit)),
            MapOperation::PutIfAbsent(request) => Ok(self.put_if_absent(request, commit)),
            MapOperation::Get { key, .. } => {
                let result = if self.evict_if_inactive(&key) {
                    self.active_value(&key)
                } else {
                    None
                };
                commit.release();
                Ok(MapOutput::Value(result))
            }
            MapOperation::GetOrDefault { key, default, .. } => {
                let result = if self.evict_if_inactive(&key) {
                    self.active_value(&key).unwrap_or(default)
                } else {
                    default
                };
                commit.release();
                Ok(MapOutput::Value(Some(result)))
            }
            MapOperation::ContainsKey { key, .. } => {
                let present = self.evict_if_inactive(&key);
                commit.release();
                Ok(MapOutput::Bool(present))
            }
            MapOperation::Remove { key, value } => {
                // The remove commit itself stays retained as a tombstone;
                // the major-compaction filter reclaims it.
                Ok(self.remove(key, value))
            }
            MapOperation::Size { .. } => {
                // Raw cardinality: lazily-expired entries still count until
                // a keyed access evicts them.
                let size = self.entries.len();
                commit.release();
                Ok(MapOutput::Size(size))
            }
            MapOperation::IsEmpty { .. } => {
                let empty = self.entries.is_empty();
                commit.release();
                Ok(MapOutput::Bool(empty))
            }
            MapOperation::Clear => {
                for (_, entry) in self.entries.drain() {
                    entry.release();
                }
                Ok(MapOutput::Unit)
            }
        }
    }

    fn filter(&self, commit: &Commit<MapOperation>, compaction: &Compaction) -> bool {
        match commit.operation() {
            // A put survives while it is the current, active entry for its
            // key.
            MapOperation::Put(request) | MapOperation::PutIfAbsent(request) => {
                match self.entries.get(&request.key) {
                    Some(current) => {
                        current.index() == commit.index() && self.is_active(current)
                    }
                    None => false,
                }
            }
            // Tombstones survive until a major compaction catches up.
            MapOperation::Remove { .. } | MapOperation::Clear => match compaction.kind() {
                CompactionKind::Major => commit.index() > compaction.index(),
                CompactionKind::Minor => true,
            },
            _ => false,
        }
    }

    fn snapshot(&self) -> SnapshotStream {
        let mut entries: Vec<(String, CommitData<MapOperation>)> = self
            .entries
            .iter()
            .map(|(key, commit)| (key.clone(), commit.to_data()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let snapshot = MapSnapshot {
            time_ms: self.time_ms,
            sessions: self.sessions.iter().copied().collect(),
            entries,
        };
        let data = bincode::serialize(&snapshot).expect("map snapshot serialization");
        SnapshotStream {
            schema_version: SNAPSHOT_VERSION,
            data,
        }
    }

    fn restore(
        &mut self,
        stream: SnapshotStream,
        sessions: &SessionTable,
    ) -> Result<(), StateMachineError> {
        if stream.schema_version != SNAPSHOT_VERSION {
            return Err(StateMachineError::Serialization(format!(
                "unknown map snapshot version: {}",
                stream.schema_version
            )));
        }
        let snapshot: MapSnapshot = bincode::deserialize(&stream.data)?;

        self.time_ms = snapshot.time_ms;
        self.sessions = snapshot.sessions.into_iter().collect();
        self.entries = snapshot
            .entries
            .into_iter()
            .map(|(key, data)| {
                let session = resolve_session(sessions, data.session_id);
                (key, Commit::from_data(data, session))
            })
            .collect();
        Ok(())
    }

    fn delete(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.release();
        }
    }
}
