//! The group state machine.
//!
//! A replicated membership registry with deterministic leader election and
//! per-member message queues. All replicas apply the same commit stream and
//! therefore agree on the member list, the leader, the term, and every
//! message assignment. Randomness comes exclusively from the two
//! deterministic generators, and time exclusively from the logical clock.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rsm::{
    resolve_session, ApplyContext, Commit, CommitData, Compaction, DeterministicRandom,
    ReplicatedStateMachine, SessionHandle, SessionTable, SnapshotStream, StateMachineError,
    GROUP_RANDOM_SEED,
};

use super::listener::GroupListener;
use super::member::Member;
use super::message::Message;
use super::ops::{ids, DeliveryPolicy, DispatchPolicy, GroupOperation, GroupOutput};

/// Snapshot payload schema version.
const SNAPSHOT_VERSION: u32 = 1;

/// Group configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Grace period before a sessionless persistent member is reported as
    /// departed. Zero reports immediately.
    pub expiration_ms: i64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig { expiration_ms: 0 }
    }
}

/// A scheduled check that a persistent member is still sessionless once
/// its grace period elapses. Expressed against the logical clock so replay
/// reproduces identical firings.
struct ExpirationCheck {
    member_id: String,
    deadline_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct MemberSnapshot {
    member_id: String,
    join: CommitData<GroupOperation>,
    session_id: Option<u64>,
    current: Option<CommitData<GroupOperation>>,
    queue: Vec<CommitData<GroupOperation>>,
}

#[derive(Serialize, Deserialize)]
struct GroupSnapshot {
    time_ms: i64,
    term: u64,
    leader: Option<String>,
    random: DeterministicRandom,
    /// Members in join order.
    members: Vec<MemberSnapshot>,
    candidates: Vec<String>,
    listeners: Vec<u64>,
    expirations: Vec<(String, i64)>,
}

/// Replicated group membership, leadership, and messaging coordinator.
pub struct GroupStateMachine {
    config: GroupConfig,
    /// The instance random for random message dispatch. Fixed seed; its
    /// state advances identically on every replica.
    random: DeterministicRandom,
    /// Listener sessions registered via `Listen`.
    listeners: BTreeMap<u64, GroupListener>,
    members: HashMap<String, Member>,
    /// Member ids in join order. Every iteration with observable side
    /// effects walks this list, never the map.
    member_order: Vec<String>,
    /// Members eligible for election. Never contains the leader.
    candidates: Vec<String>,
    leader: Option<String>,
    /// Commit index at the last leadership change; 0 means no term yet.
    term: u64,
    /// Logical clock: max callback time seen.
    time_ms: i64,
    expirations: Vec<ExpirationCheck>,
}

impl GroupStateMachine {
    pub fn new(config: GroupConfig) -> Self {
        GroupStateMachine {
            config,
            random: DeterministicRandom::new(GROUP_RANDOM_SEED),
            listeners: BTreeMap::new(),
            members: HashMap::new(),
            member_order: Vec::new(),
            candidates: Vec::new(),
            leader: None,
            term: 0,
            time_ms: 0,
            expirations: Vec::new(),
        }
    }

    /// Current leader id, if any.
    pub fn leader_id(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Current term. Terms are commit indices; 0 means no term yet.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Member ids in join order.
    pub fn member_ids(&self) -> &[String] {
        &self.member_order
    }

    /// Ids currently eligible for election.
    pub fn candidate_ids(&self) -> &[String] {
        &self.candidates
    }

    /// Index of the message in flight at `member_id`, if any.
    pub fn in_flight(&self, member_id: &str) -> Option<u64> {
        self.members.get(member_id).and_then(Member::in_flight_index)
    }

    /// The logical clock, for inspection.
    pub fn time_ms(&self) -> i64 {
        self.time_ms
    }

    fn update_time(&mut self, time_ms: i64) {
        if time_ms > self.time_ms {
            self.time_ms = time_ms;
        }
    }

    /// Fire every scheduled expiration check the clock has passed, in
    /// deadline order then insertion order. The check republishes `leave`
    /// only if the member is still present and sessionless; a Join that
    /// rebound the member in the meantime cancels the report.
    fn fire_expirations(&mut self) {
        if self.expirations.is_empty() {
            return;
        }
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.expirations.len() {
            if self.expirations[i].deadline_ms <= self.time_ms {
                due.push(self.expirations.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|check| check.deadline_ms);
        for check in due {
            let still_unbound = self
                .members
                .get(&check.member_id)
                .map(|member| member.session().is_none())
                .unwrap_or(false);
            if still_unbound {
                for listener in self.listeners.values() {
                    listener.leave(&check.member_id);
                }
            }
        }
    }

    /// Advance the term to the current commit index and announce it.
    /// Always precedes an election.
    fn increment_term(&mut self, ctx: &ApplyContext) {
        self.term = ctx.index();
        debug!(term = self.term, "term advanced");
        for listener in self.listeners.values() {
            listener.term(self.term);
        }
    }

    /// Strip leadership, announcing the resignation. `to_candidate`
    /// recycles the former leader into the candidate pool (a rebinding
    /// handoff); otherwise it is discarded (departure).
    fn resign_leader(&mut self, to_candidate: bool) {
        if let Some(leader_id) = self.leader.take() {
            for listener in self.listeners.values() {
                listener.resign(&leader_id);
            }
            if to_candidate {
                self.candidates.push(leader_id);
            }
        }
    }

    /// Elect a leader by deterministic pseudo-random selection seeded by
    /// the term. Candidates are consumed as they are sampled: a sampled
    /// member without an active session loses candidacy until it rejoins.
    fn elect_leader(&mut self) {
        let mut random = DeterministicRandom::new(self.term as i64);
        while !self.candidates.is_empty() {
            let index = random.next_index(self.candidates.len());
            let member_id = self.candidates.remove(index);
            let active = self
                .members
                .get(&member_id)
                .map(Member::session_active)
                .unwrap_or(false);
            if active {
                debug!(member = %member_id, term = self.term, "leader elected");
                for listener in self.listeners.values() {
                    listener.elect(&member_id);
                }
                self.leader = Some(member_id);
                return;
            }
        }
    }

    fn join(
        &mut self,
        commit: Commit<GroupOperation>,
        ctx: &ApplyContext,
    ) -> Result<GroupOutput, StateMachineError> {
        let request = match commit.operation() {
            GroupOperation::Join(request) => request.clone(),
            _ => unreachable!("join handler receives join commits"),
        };

        if let Some(member) = self.members.get_mut(&request.member_id) {
            // Ephemeral identities cannot be recreated.
            if !member.persistent() {
                commit.release();
                return Err(StateMachineError::InvalidArgument(
                    "cannot recreate ephemeral member".to_string(),
                ));
            }

            // Reattach the persistent member to the new session. A pending
            // in-flight message is republished to it by the rebind.
            member.set_session(Some(commit.session().clone()));
            let info = member.info();

            let is_leader = self.leader.as_deref() == Some(request.member_id.as_str());
            if !is_leader && !self.candidates.contains(&request.member_id) {
                // Candidacy was revoked at session loss; the rebind
                // restores it.
                self.candidates.push(request.member_id.clone());
            }

            for listener in self.listeners.values() {
                listener.join(&info);
            }

            // If the member is the leader, it may have been reopened on
            // another node: force a handoff.
            if is_leader {
                self.resign_leader(true);
                self.increment_term(ctx);
                self.elect_leader();
            }

            // The original join commit remains the authoritative
            // membership record; this one is redundant.
            commit.release();
            return Ok(GroupOutput::Member(info));
        }

        let member = Member::new(commit);
        let info = member.info();
        debug!(member = %request.member_id, index = info.index, "member joined");
        self.members.insert(request.member_id.clone(), member);
        self.member_order.push(request.member_id.clone());
        self.candidates.push(request.member_id);

        for listener in self.listeners.values() {
            listener.join(&info);
        }
        if self.term == 0 {
            self.increment_term(ctx);
        }
        if self.leader.is_none() {
            self.elect_leader();
        }
        Ok(GroupOutput::Member(info))
    }

    fn leave(
        &mut self,
        commit: Commit<GroupOperation>,
        ctx: &ApplyContext,
    ) -> Result<GroupOutput, StateMachineError> {
        let member_id = match commit.operation() {
            GroupOperation::Leave(request) => request.member_id.clone(),
            _ => unreachable!("leave handler receives leave commits"),
        };

        if let Some(member) = self.members.remove(&member_id) {
            self.member_order.retain(|id| id != &member_id);
            self.candidates.retain(|id| id != &member_id);

            if self.leader.as_deref() == Some(member_id.as_str()) {
                self.resign_leader(false);
                self.increment_term(ctx);
                self.elect_leader();
            }

            // Close before publishing `leave` so observers see a
            // consistent terminal state.
            self.close_member(member);
            for listener in self.listeners.values() {
                listener.leave(&member_id);
            }
            debug!(member = %member_id, "member left");
        }
        commit.release();
        Ok(GroupOutput::Unit)
    }

    fn listen(&mut self, commit: Commit<GroupOperation>) -> Result<GroupOutput, StateMachineError> {
        let session = commit.session().clone();
        self.listeners
            .insert(session.id(), GroupListener::new(session));

        let mut members = Vec::new();
        for member_id in &self.member_order {
            if let Some(member) = self.members.get(member_id) {
                if member.session_active() {
                    members.push(member.info());
                }
            }
        }
        commit.release();
        Ok(GroupOutput::Members(members))
    }

    fn submit(&mut self, commit: Commit<GroupOperation>) -> Result<GroupOutput, StateMachineError> {
        let (target, dispatch) = match commit.operation() {
            GroupOperation::Submit(request) => (request.member.clone(), request.dispatch),
            _ => unreachable!("submit handler receives submit commits"),
        };
        let message = Message::new(commit);

        if let Some(target) = target {
            match self.members.get_mut(&target) {
                Some(member) => member.submit(message),
                None => {
                    // not-found: fail the producer; no error surfaces.
                    message.fail();
                    message.release();
                }
            }
        } else if dispatch == DispatchPolicy::Random {
            if self.member_order.is_empty() {
                // empty-group: fail the producer.
                message.fail();
                message.release();
            } else {
                let index = self.random.next_index(self.member_order.len());
                let member_id = self.member_order[index].clone();
                if let Some(member) = self.members.get_mut(&member_id) {
                    member.submit(message);
                }
            }
        } else {
            // Broadcast. With no members the completion rule holds
            // vacuously: ack the producer immediately.
            if self.member_order.is_empty() {
                message.ack();
                message.release();
            } else {
                let order = self.member_order.clone();
                for member_id in &order {
                    if let Some(member) = self.members.get_mut(member_id) {
                        member.submit(message.clone());
                    }
                }
            }
        }
        Ok(GroupOutput::Unit)
    }

    fn ack(&mut self, commit: Commit<GroupOperation>) -> Result<GroupOutput, StateMachineError> {
        let request = match commit.operation() {
            GroupOperation::Ack(request) => request.clone(),
            _ => unreachable!("ack handler receives ack commits"),
        };

        let message = self
            .members
            .get_mut(&request.member)
            .and_then(|member| member.take_in_flight(request.id));

        if let Some(message) = message {
            if request.succeeded {
                if self.is_complete(&message) {
                    message.ack();
                    message.release();
                }
            } else if message.direct() {
                message.fail();
                message.release();
            } else if self.is_complete(&message) {
                // The failure is recorded at this member; completion of a
                // non-direct message still acks the producer.
                message.ack();
                message.release();
            }

            if let Some(member) = self.members.get_mut(&request.member) {
                member.advance();
            }
        }
        commit.release();
        Ok(GroupOutput::Unit)
    }

    /// A submission is complete when no relevant member still holds a
    /// message at or before its index.
    fn is_complete(&self, message: &Message) -> bool {
        let index = message.index();
        match &message.request().member {
            Some(target) => match self.members.get(target) {
                Some(member) => !member.holds_at_or_before(index),
                None => true,
            },
            None => self
                .members
                .values()
                .all(|member| !member.holds_at_or_before(index)),
        }
    }

    /// Unilateral member termination: drain its pipeline, re-dispatching
    /// Random+Retry messages to a surviving member and failing the rest,
    /// then release the Join commit. The member has already been removed
    /// from every collection, so re-dispatch sees the surviving group.
    fn close_member(&mut self, mut member: Member) {
        for message in member.drain_messages() {
            let redispatch = message.dispatch() == DispatchPolicy::Random
                && message.delivery() == DeliveryPolicy::Retry
                && !self.member_order.is_empty();
            if redispatch {
                let index = self.random.next_index(self.member_order.len());
                let member_id = self.member_order[index].clone();
                if let Some(target) = self.members.get_mut(&member_id) {
                    target.submit(message);
                }
            } else {
                message.fail();
                message.release();
            }
        }
        member.release_commit();
    }

    /// A session died (expired or closed). Ephemeral members owned by it
    /// are removed; persistent members go sessionless and lose candidacy,
    /// reported after the configured grace period. A leader among the
    /// affected members triggers re-election.
    fn session_departed(&mut self, session: &SessionHandle, ctx: &ApplyContext) {
        self.update_time(ctx.time_ms());
        self.fire_expirations();

        self.listeners.remove(&session.id());

        let mut departed: Vec<Member> = Vec::new();
        let mut unbound: Vec<String> = Vec::new();
        let order = self.member_order.clone();
        for member_id in order {
            let bound = self
                .members
                .get(&member_id)
                .and_then(Member::session)
                .map(|bound| bound.id() == session.id())
                .unwrap_or(false);
            if !bound {
                continue;
            }

            let persistent = self
                .members
                .get(&member_id)
                .map(Member::persistent)
                .unwrap_or(false);
            if !persistent {
                if let Some(member) = self.members.remove(&member_id) {
                    self.member_order.retain(|id| id != &member_id);
                    self.candidates.retain(|id| id != &member_id);
                    departed.push(member);
                }
            } else {
                if let Some(member) = self.members.get_mut(&member_id) {
                    member.set_session(None);
                }
                self.candidates.retain(|id| id != &member_id);
                unbound.push(member_id.clone());

                if self.config.expiration_ms == 0 {
                    for listener in self.listeners.values() {
                        listener.leave(&member_id);
                    }
                } else {
                    self.expirations.push(ExpirationCheck {
                        member_id: member_id.clone(),
                        deadline_ms: self.time_ms + self.config.expiration_ms,
                    });
                }
            }
        }

        // Re-elect after all affected members are out of the candidate
        // pool, whether the leader left outright or merely lost its
        // session.
        let leader_lost = match &self.leader {
            Some(leader_id) => {
                departed.iter().any(|member| member.id() == leader_id.as_str())
                    || unbound.iter().any(|id| id == leader_id)
            }
            None => false,
        };
        if leader_lost {
            self.resign_leader(false);
            self.increment_term(ctx);
            self.elect_leader();
        }

        // Close each removed member, then publish its `leave`, preserving
        // observer ordering.
        for member in departed {
            let member_id = member.id().to_string();
            self.close_member(member);
            for listener in self.listeners.values() {
                listener.leave(&member_id);
            }
        }
    }
}

impl Default for GroupStateMachine {
    fn default() -> Self {
        Self::new(GroupConfig::default())
    }
}

impl ReplicatedStateMachine for GroupStateMachine {
    type Operation = GroupOperation;
    type Output = GroupOutput;

    fn on_register(&mut self, _session: &SessionHandle, ctx: &ApplyContext) {
        self.update_time(ctx.time_ms());
        self.fire_expirations();
    }

    fn on_expire(&mut self, session: &SessionHandle, ctx: &ApplyContext) {
        self.session_departed(session, ctx);
    }

    fn on_close(&mut self, session: &SessionHandle, ctx: &ApplyContext) {
        self.session_departed(session, ctx);
    }

    fn apply(
        &mut self,
        commit: Commit<GroupOperation>,
        ctx: &ApplyContext,
    ) -> Result<GroupOutput, StateMachineError> {
        self.update_time(ctx.time_ms());
        self.fire_expirations();

        match commit.operation().type_id() {
            ids::JOIN => self.join(commit, ctx),
            ids::LEAVE => self.leave(commit, ctx),
            ids::LISTEN => self.listen(commit),
            ids::SUBMIT => self.submit(commit),
            ids::ACK => self.ack(commit),
            id => {
                commit.release();
                Err(StateMachineError::UnknownOperation(id))
            }
        }
    }

    fn filter(&self, commit: &Commit<GroupOperation>, _compaction: &Compaction) -> bool {
        match commit.operation() {
            // A join survives while it is the registered member's
            // authoritative record.
            GroupOperation::Join(request) => self
                .members
                .get(&request.member_id)
                .map(|member| member.index() == commit.index())
                .unwrap_or(false),
            // A submit survives while some member still holds it.
            GroupOperation::Submit(_) => self
                .members
                .values()
                .any(|member| member.holds_submit(commit.index())),
            _ => false,
        }
    }

    fn snapshot(&self) -> SnapshotStream {
        let members = self
            .member_order
            .iter()
            .filter_map(|id| self.members.get(id))
            .map(|member| MemberSnapshot {
                member_id: member.id().to_string(),
                join: member.join_data(),
                session_id: member.session().map(SessionHandle::id),
                current: member.current().map(|message| message.commit().to_data()),
                queue: member
                    .queued()
                    .map(|message| message.commit().to_data())
                    .collect(),
            })
            .collect();

        let snapshot = GroupSnapshot {
            time_ms: self.time_ms,
            term: self.term,
            leader: self.leader.clone(),
            random: self.random.clone(),
            members,
            candidates: self.candidates.clone(),
            listeners: self.listeners.keys().copied().collect(),
            expirations: self
                .expirations
                .iter()
                .map(|check| (check.member_id.clone(), check.deadline_ms))
                .collect(),
        };
        let data = bincode::serialize(&snapshot).expect("group snapshot serialization");
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
                "unknown group snapshot version: {}",
                stream.schema_version
            )));
        }
        let snapshot: GroupSnapshot = bincode::deserialize(&stream.data)?;

        self.time_ms = snapshot.time_ms;
        self.term = snapshot.term;
        self.leader = snapshot.leader;
        self.random = snapshot.random;
        self.candidates = snapshot.candidates;
        self.listeners = snapshot
            .listeners
            .into_iter()
            .map(|id| (id, GroupListener::new(resolve_session(sessions, id))))
            .collect();
        self.expirations = snapshot
            .expirations
            .into_iter()
            .map(|(member_id, deadline_ms)| ExpirationCheck {
                member_id,
                deadline_ms,
            })
            .collect();

        self.members.clear();
        self.member_order.clear();
        for MemberSnapshot {
            member_id,
            join,
            session_id,
            current,
            queue,
        } in snapshot.members
        {
            let join_session = resolve_session(sessions, join.session_id);
            let mut member = Member::new(Commit::from_data(join, join_session));
            // Rebind before the pipeline is restored, so nothing is
            // republished: delivery already happened before the snapshot.
            member.set_session(session_id.map(|id| resolve_session(sessions, id)));

            let current = current.map(|data| {
                let session = resolve_session(sessions, data.session_id);
                Message::new(Commit::from_data(data, session))
            });
            let queue = queue
                .into_iter()
                .map(|data| {
                    let session = resolve_session(sessions, data.session_id);
                    Message::new(Commit::from_data(data, session))
                })
                .collect();
            member.restore_pipeline(current, queue);

            self.member_order.push(member_id.clone());
            self.members.insert(member_id, member);
        }
        Ok(())
    }

    fn delete(&mut self) {
        // Teardown fails every message outright; there is no surviving
        // group to re-dispatch into.
        let order = std::mem::take(&mut self.member_order);
        for member_id in order {
            if let Some(mut member) = self.members.remove(&member_id) {
                for message in member.drain_messages() {
                    message.fail();
                    message.release();
                }
                member.release_commit();
            }
        }
        self.members.clear();
        self.candidates.clear();
        self.listeners.clear();
        self.expirations.clear();
        self.leader = None;
    }
}
