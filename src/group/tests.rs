//! Group state machine scenario tests.
//!
//! Driven through the in-memory substrate so session lifecycle, commit
//! indices, and event channels behave exactly as they do under the real
//! consensus engine.

use crate::rsm::{CompactionKind, Event, ReplicatedStateMachine, SessionTable, StateMachineError};
use crate::substrate::MemorySubstrate;

use super::listener::names;
use super::ops::{
    AckRequest, DeliveryPolicy, DispatchPolicy, GroupOperation, GroupOutput, JoinRequest,
    LeaveRequest, MemberInfo, MessageNotice, SubmitRequest,
};
use super::state_machine::{GroupConfig, GroupStateMachine};

type Substrate = MemorySubstrate<GroupStateMachine>;

fn harness(expiration_ms: i64) -> Substrate {
    MemorySubstrate::new(GroupStateMachine::new(GroupConfig { expiration_ms }))
}

fn join(substrate: &mut Substrate, session: u64, member_id: &str, persist: bool) -> GroupOutput {
    substrate
        .commit(
            session,
            GroupOperation::Join(JoinRequest {
                member_id: member_id.to_string(),
                persist,
            }),
        )
        .unwrap()
}

fn leave(substrate: &mut Substrate, session: u64, member_id: &str) {
    substrate
        .commit(
            session,
            GroupOperation::Leave(LeaveRequest {
                member_id: member_id.to_string(),
            }),
        )
        .unwrap();
}

fn listen(substrate: &mut Substrate, session: u64) -> Vec<MemberInfo> {
    match substrate.commit(session, GroupOperation::Listen).unwrap() {
        GroupOutput::Members(members) => members,
        other => panic!("unexpected listen result: {:?}", other),
    }
}

fn submit(substrate: &mut Substrate, session: u64, request: SubmitRequest) {
    substrate
        .commit(session, GroupOperation::Submit(request))
        .unwrap();
}

fn direct(member_id: &str, id: u64) -> SubmitRequest {
    SubmitRequest {
        member: Some(member_id.to_string()),
        dispatch: DispatchPolicy::Direct,
        delivery: DeliveryPolicy::Once,
        id,
        message_type: "task".to_string(),
        payload: b"payload".to_vec(),
    }
}

fn random(delivery: DeliveryPolicy, id: u64) -> SubmitRequest {
    SubmitRequest {
        member: None,
        dispatch: DispatchPolicy::Random,
        delivery,
        id,
        message_type: "task".to_string(),
        payload: b"payload".to_vec(),
    }
}

fn broadcast(id: u64) -> SubmitRequest {
    SubmitRequest {
        member: None,
        dispatch: DispatchPolicy::Broadcast,
        delivery: DeliveryPolicy::Once,
        id,
        message_type: "task".to_string(),
        payload: b"payload".to_vec(),
    }
}

fn ack(substrate: &mut Substrate, session: u64, member_id: &str, id: u64, succeeded: bool) {
    substrate
        .commit(
            session,
            GroupOperation::Ack(AckRequest {
                member: member_id.to_string(),
                id,
                succeeded,
            }),
        )
        .unwrap();
}

fn event_names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|event| event.name).collect()
}

#[test]
fn test_first_join_sets_term_and_elects_itself() {
    let mut substrate = harness(0);
    let session = substrate.open_session();

    let result = join(&mut substrate, session, "m1", false);
    let info = match result {
        GroupOutput::Member(info) => info,
        other => panic!("unexpected join result: {:?}", other),
    };

    assert_eq!(info.member_id, "m1");
    assert_eq!(substrate.machine().leader_id(), Some("m1"));
    // Terms are commit indices; the join commit itself set the term.
    assert_eq!(substrate.machine().term(), info.index);
    // The leader never appears in the candidate pool.
    assert!(substrate.machine().candidate_ids().is_empty());
}

#[test]
fn test_listener_sees_join_term_elect_in_order() {
    let mut substrate = harness(0);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let worker = substrate.open_session();
    join(&mut substrate, worker, "m1", false);

    let events = substrate.drain_events(listener);
    assert_eq!(event_names(&events), vec![names::JOIN, names::TERM, names::ELECT]);
    assert_eq!(events[0].decode::<MemberInfo>().unwrap().member_id, "m1");
    assert_eq!(
        events[1].decode::<u64>().unwrap(),
        substrate.machine().term()
    );
    assert_eq!(events[2].decode::<String>().unwrap(), "m1");
}

#[test]
fn test_listen_snapshot_is_active_members_in_join_order() {
    let mut substrate = harness(0);
    let session = substrate.open_session();
    join(&mut substrate, session, "m1", false);
    join(&mut substrate, session, "m2", true);
    join(&mut substrate, session, "m3", false);

    let observer = substrate.open_session();
    let members = listen(&mut substrate, observer);
    let ids: Vec<&str> = members.iter().map(|m| m.member_id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[test]
fn test_ephemeral_member_cannot_be_recreated() {
    let mut substrate = harness(0);
    let session = substrate.open_session();
    join(&mut substrate, session, "m1", false);

    let other = substrate.open_session();
    let result = substrate.commit(
        other,
        GroupOperation::Join(JoinRequest {
            member_id: "m1".to_string(),
            persist: false,
        }),
    );
    assert!(matches!(result, Err(StateMachineError::InvalidArgument(_))));
    // The group is untouched.
    assert_eq!(substrate.machine().member_ids(), ["m1".to_string()]);
}

/// A persistent leader rejoins via a new session.
///
/// The rebind forces a leadership handoff: resign to candidate, bump the
/// term, re-elect. With a single member the re-election lands on the same
/// id, but under a strictly larger term.
#[test]
fn test_persistent_rejoin_forces_leadership_handoff() {
    let mut substrate = harness(0);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let first = substrate.open_session();
    join(&mut substrate, first, "m1", true);
    let old_term = substrate.machine().term();
    substrate.drain_events(listener);

    let second = substrate.open_session();
    join(&mut substrate, second, "m1", true);

    assert!(substrate.machine().term() > old_term);
    assert_eq!(substrate.machine().leader_id(), Some("m1"));

    let events = substrate.drain_events(listener);
    assert_eq!(
        event_names(&events),
        vec![names::JOIN, names::RESIGN, names::TERM, names::ELECT]
    );
}

#[test]
fn test_leave_reelects_and_orders_leave_after_elect() {
    let mut substrate = harness(0);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let session = substrate.open_session();
    join(&mut substrate, session, "m1", false);
    join(&mut substrate, session, "m2", false);
    assert_eq!(substrate.machine().leader_id(), Some("m1"));
    substrate.drain_events(listener);

    leave(&mut substrate, session, "m1");

    assert_eq!(substrate.machine().leader_id(), Some("m2"));
    let events = substrate.drain_events(listener);
    assert_eq!(
        event_names(&events),
        vec![names::RESIGN, names::TERM, names::ELECT, names::LEAVE]
    );
    assert_eq!(events[3].decode::<String>().unwrap(), "m1");
}

/// An ephemeral member's session closes; the persistent
/// leader is unaffected.
#[test]
fn test_ephemeral_session_close_leaves_leader_alone() {
    let mut substrate = harness(0);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let session_x = substrate.open_session();
    let session_y = substrate.open_session();
    join(&mut substrate, session_x, "a", true);
    join(&mut substrate, session_y, "b", false);
    let term = substrate.machine().term();
    substrate.drain_events(listener);

    substrate.close_session(session_y);

    assert_eq!(substrate.machine().leader_id(), Some("a"));
    assert_eq!(substrate.machine().term(), term);
    assert_eq!(substrate.machine().member_ids(), ["a".to_string()]);

    let events = substrate.drain_events(listener);
    assert_eq!(event_names(&events), vec![names::LEAVE]);
    assert_eq!(events[0].decode::<String>().unwrap(), "b");
}

/// The persistent leader's session closes with no grace
/// period. The member survives sessionless but leadership does not.
#[test]
fn test_persistent_leader_session_close_resigns() {
    let mut substrate = harness(0);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let session_x = substrate.open_session();
    join(&mut substrate, session_x, "a", true);
    substrate.drain_events(listener);

    substrate.close_session(session_x);

    // The member record survives, sessionless and without candidacy.
    assert_eq!(substrate.machine().member_ids(), ["a".to_string()]);
    assert!(substrate.machine().candidate_ids().is_empty());
    assert_eq!(substrate.machine().leader_id(), None);

    let events = substrate.drain_events(listener);
    assert_eq!(
        event_names(&events),
        vec![names::LEAVE, names::RESIGN, names::TERM]
    );
}

#[test]
fn test_grace_period_defers_leave_until_deadline() {
    let mut substrate = harness(500);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let session_x = substrate.open_session();
    substrate.advance_clock(1_000);
    join(&mut substrate, session_x, "a", true);
    substrate.drain_events(listener);

    substrate.close_session(session_x);
    // The leadership fallout is reported immediately; the departure is not.
    let events = substrate.drain_events(listener);
    assert!(!event_names(&events).contains(&names::LEAVE));

    // Before the deadline nothing fires.
    substrate.advance_clock(1_400);
    substrate.commit(listener, GroupOperation::Listen).unwrap();
    assert!(event_names(&substrate.drain_events(listener)).is_empty());

    // Past the deadline the next callback reports the departure.
    substrate.advance_clock(1_600);
    substrate.commit(listener, GroupOperation::Listen).unwrap();
    let events = substrate.drain_events(listener);
    assert_eq!(event_names(&events), vec![names::LEAVE]);
    assert_eq!(events[0].decode::<String>().unwrap(), "a");
}

#[test]
fn test_rejoin_within_grace_period_cancels_leave() {
    let mut substrate = harness(500);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let session_x = substrate.open_session();
    substrate.advance_clock(1_000);
    join(&mut substrate, session_x, "a", true);
    substrate.close_session(session_x);
    substrate.drain_events(listener);

    // The member rebinds before the deadline.
    let session_y = substrate.open_session();
    join(&mut substrate, session_y, "a", true);
    substrate.drain_events(listener);

    substrate.advance_clock(2_000);
    substrate.commit(listener, GroupOperation::Listen).unwrap();
    let events = substrate.drain_events(listener);
    assert!(
        !event_names(&events).contains(&names::LEAVE),
        "rebound member must not be reported as departed: {:?}",
        event_names(&events)
    );
}

#[test]
fn test_rejoin_restores_candidacy() {
    let mut substrate = harness(0);
    let session_x = substrate.open_session();
    let session_y = substrate.open_session();
    join(&mut substrate, session_x, "a", true);
    join(&mut substrate, session_y, "b", true);
    assert_eq!(substrate.machine().leader_id(), Some("a"));

    substrate.close_session(session_y);
    assert!(substrate.machine().candidate_ids().is_empty());

    let session_z = substrate.open_session();
    join(&mut substrate, session_z, "b", true);
    assert_eq!(substrate.machine().candidate_ids(), ["b".to_string()]);
    assert_eq!(substrate.machine().leader_id(), Some("a"));
}

/// Random dispatch is seeded identically on every replica.
#[test]
fn test_random_dispatch_is_deterministic_across_replicas() {
    let run = || {
        let mut substrate = harness(0);
        let workers = substrate.open_session();
        join(&mut substrate, workers, "a", false);
        join(&mut substrate, workers, "b", false);
        join(&mut substrate, workers, "c", false);

        let producer = substrate.open_session();
        submit(&mut substrate, producer, random(DeliveryPolicy::Once, 1));

        let holder: Vec<String> = substrate
            .machine()
            .member_ids()
            .iter()
            .filter(|id| substrate.machine().in_flight(id).is_some())
            .cloned()
            .collect();
        (holder, substrate.fingerprint())
    };

    let (holder_a, fingerprint_a) = run();
    let (holder_b, fingerprint_b) = run();
    assert_eq!(holder_a.len(), 1);
    assert_eq!(holder_a, holder_b);
    assert_eq!(fingerprint_a, fingerprint_b);
}

#[test]
fn test_direct_submit_to_missing_member_fails_producer() {
    let mut substrate = harness(0);
    let producer = substrate.open_session();
    let request = direct("nobody", 7);
    submit(&mut substrate, producer, request.clone());

    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::FAIL]);
    assert_eq!(events[0].decode::<SubmitRequest>().unwrap(), request);
}

#[test]
fn test_random_submit_with_no_members_fails_producer() {
    let mut substrate = harness(0);
    let producer = substrate.open_session();
    submit(&mut substrate, producer, random(DeliveryPolicy::Retry, 7));

    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::FAIL]);
}

#[test]
fn test_broadcast_with_no_members_completes_vacuously() {
    let mut substrate = harness(0);
    let producer = substrate.open_session();
    submit(&mut substrate, producer, broadcast(7));

    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::ACK]);
}

/// A broadcast acks the producer exactly once, when the last
/// member's pipeline has advanced past it.
#[test]
fn test_broadcast_acks_producer_exactly_once() {
    let mut substrate = harness(0);
    let session_a = substrate.open_session();
    let session_b = substrate.open_session();
    join(&mut substrate, session_a, "a", false);
    join(&mut substrate, session_b, "b", false);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, broadcast(9));

    let index = substrate.machine().in_flight("a").unwrap();
    assert_eq!(substrate.machine().in_flight("b"), Some(index));

    ack(&mut substrate, session_a, "a", index, true);
    assert_eq!(substrate.machine().in_flight("a"), None);
    assert!(substrate.drain_events(producer).is_empty());

    ack(&mut substrate, session_b, "b", index, true);
    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::ACK]);
}

#[test]
fn test_member_pipeline_is_fifo_with_one_in_flight() {
    let mut substrate = harness(0);
    let worker = substrate.open_session();
    join(&mut substrate, worker, "m1", false);
    substrate.drain_events(worker);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, direct("m1", 1));
    submit(&mut substrate, producer, direct("m1", 2));
    submit(&mut substrate, producer, direct("m1", 3));

    // Only the head of the queue is in flight and delivered.
    let first = substrate.machine().in_flight("m1").unwrap();
    let delivered: Vec<MessageNotice> = substrate
        .drain_events(worker)
        .iter()
        .map(|event| event.decode::<MessageNotice>().unwrap())
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].index, first);

    // Acking advances the queue in submit order.
    ack(&mut substrate, worker, "m1", first, true);
    let second = substrate.machine().in_flight("m1").unwrap();
    assert!(second > first);
    ack(&mut substrate, worker, "m1", second, true);
    let third = substrate.machine().in_flight("m1").unwrap();
    assert!(third > second);

    // The producer got one ack per direct message.
    let producer_events = substrate.drain_events(producer);
    assert_eq!(event_names(&producer_events), vec![names::ACK, names::ACK]);
}

#[test]
fn test_failed_direct_message_fails_producer() {
    let mut substrate = harness(0);
    let worker = substrate.open_session();
    join(&mut substrate, worker, "m1", false);

    let producer = substrate.open_session();
    let request = direct("m1", 5);
    submit(&mut substrate, producer, request.clone());
    let index = substrate.machine().in_flight("m1").unwrap();

    ack(&mut substrate, worker, "m1", index, false);

    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::FAIL]);
    assert_eq!(events[0].decode::<SubmitRequest>().unwrap(), request);
}

#[test]
fn test_spurious_ack_is_ignored() {
    let mut substrate = harness(0);
    let worker = substrate.open_session();
    join(&mut substrate, worker, "m1", false);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, direct("m1", 5));
    let index = substrate.machine().in_flight("m1").unwrap();

    // Wrong id: the in-flight slot is untouched, nothing is published.
    ack(&mut substrate, worker, "m1", index + 999, true);
    assert_eq!(substrate.machine().in_flight("m1"), Some(index));
    assert!(substrate.drain_events(producer).is_empty());

    // Acking an idle member is also a no-op.
    ack(&mut substrate, worker, "m1", index, true);
    ack(&mut substrate, worker, "m1", index, true);
    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::ACK]);
}

#[test]
fn test_member_close_redispatches_random_retry_messages() {
    let mut substrate = harness(0);
    let session_a = substrate.open_session();
    let session_b = substrate.open_session();
    join(&mut substrate, session_a, "a", false);
    join(&mut substrate, session_b, "b", false);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, random(DeliveryPolicy::Retry, 1));

    let (holder, holder_session, survivor) =
        if substrate.machine().in_flight("a").is_some() {
            ("a", session_a, "b")
        } else {
            ("b", session_b, "a")
        };
    assert!(substrate.machine().in_flight(holder).is_some());

    substrate.close_session(holder_session);

    // Retry reassigned the message to the survivor; the producer saw no
    // failure.
    assert!(substrate.machine().in_flight(survivor).is_some());
    assert!(substrate.drain_events(producer).is_empty());
}

#[test]
fn test_member_close_fails_once_delivery_messages() {
    let mut substrate = harness(0);
    let session_a = substrate.open_session();
    let session_b = substrate.open_session();
    join(&mut substrate, session_a, "a", false);
    join(&mut substrate, session_b, "b", false);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, random(DeliveryPolicy::Once, 1));

    let (holder_session, survivor) = if substrate.machine().in_flight("a").is_some() {
        (session_a, "b")
    } else {
        (session_b, "a")
    };

    substrate.close_session(holder_session);

    assert_eq!(substrate.machine().in_flight(survivor), None);
    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::FAIL]);
}

#[test]
fn test_compaction_keeps_joins_and_held_submits() {
    let mut substrate = harness(0);
    let worker = substrate.open_session();
    join(&mut substrate, worker, "m1", false);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, direct("m1", 1));
    let message_index = substrate.machine().in_flight("m1").unwrap();

    substrate.commit(producer, GroupOperation::Listen).unwrap();

    substrate.compact(CompactionKind::Minor);
    let retained = substrate.retained_indices();
    assert!(retained.contains(&message_index));
    assert_eq!(retained.len(), 2); // the join and the held submit

    // Acking completes the message; its commit is reclaimable.
    ack(&mut substrate, worker, "m1", message_index, true);
    substrate.compact(CompactionKind::Minor);
    assert!(!substrate.retained_indices().contains(&message_index));
}

#[test]
fn test_snapshot_restore_reproduces_fingerprint() {
    let mut substrate = harness(250);
    let listener = substrate.open_session();
    substrate.commit(listener, GroupOperation::Listen).unwrap();

    let session_a = substrate.open_session();
    let session_b = substrate.open_session();
    substrate.advance_clock(100);
    join(&mut substrate, session_a, "a", true);
    join(&mut substrate, session_b, "b", false);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, broadcast(1));
    submit(&mut substrate, producer, direct("a", 2));

    let mut restored = GroupStateMachine::new(GroupConfig { expiration_ms: 250 });
    let table: SessionTable = substrate.sessions().clone();
    restored.restore(substrate.snapshot(), &table).unwrap();

    assert_eq!(restored.fingerprint(), substrate.machine().fingerprint());
    assert_eq!(restored.leader_id(), substrate.machine().leader_id());
    assert_eq!(restored.term(), substrate.machine().term());
    assert_eq!(restored.member_ids(), substrate.machine().member_ids());
    assert_eq!(restored.in_flight("a"), substrate.machine().in_flight("a"));
}

#[test]
fn test_delete_fails_messages_and_releases_commits() {
    let mut substrate = harness(0);
    let worker = substrate.open_session();
    join(&mut substrate, worker, "m1", false);

    let producer = substrate.open_session();
    submit(&mut substrate, producer, direct("m1", 1));
    submit(&mut substrate, producer, direct("m1", 2));

    substrate.delete();

    let events = substrate.drain_events(producer);
    assert_eq!(event_names(&events), vec![names::FAIL, names::FAIL]);
    assert!(substrate.machine().member_ids().is_empty());

    // Every retained commit was released: compaction reclaims the log.
    let report = substrate.compact(CompactionKind::Minor);
    assert_eq!(report.kept, 0);
}

/// Identical commit streams produce identical observable state and event
/// streams on every replica.
#[test]
fn test_scripted_run_is_deterministic() {
    let run = || {
        let mut substrate = harness(300);
        let listener = substrate.open_session();
        substrate.commit(listener, GroupOperation::Listen).unwrap();

        let session_a = substrate.open_session();
        let session_b = substrate.open_session();
        let session_c = substrate.open_session();
        join(&mut substrate, session_a, "a", true);
        join(&mut substrate, session_b, "b", false);
        join(&mut substrate, session_c, "c", false);

        let producer = substrate.open_session();
        submit(&mut substrate, producer, broadcast(1));
        submit(&mut substrate, producer, random(DeliveryPolicy::Retry, 2));

        substrate.advance_clock(500);
        substrate.close_session(session_b);
        leave(&mut substrate, session_c, "c");

        substrate.advance_clock(1_000);
        substrate.commit(listener, GroupOperation::Listen).unwrap();

        let events = substrate.drain_events(listener);
        (substrate.fingerprint(), event_names(&events))
    };

    let (fingerprint_a, events_a) = run();
    let (fingerprint_b, events_b) = run();
    assert_eq!(fingerprint_a, fingerprint_b);
    assert_eq!(events_a, events_b);
}
