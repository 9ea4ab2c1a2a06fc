//! A registered group member and its delivery queue.
//!
//! A member holds at most one in-flight message; further submissions queue
//! in FIFO order. Logic that needs group-wide state (completion checks,
//! re-dispatch on termination, leader bookkeeping) lives on the state
//! machine and addresses members by id.

use std::collections::VecDeque;

use crate::rsm::{Commit, SessionHandle};

use super::listener::names;
use super::message::Message;
use super::ops::{GroupOperation, MemberInfo};

pub(crate) struct Member {
    /// The original Join commit: the authoritative membership record,
    /// retained for the member's lifetime.
    commit: Commit<GroupOperation>,
    index: u64,
    member_id: String,
    persistent: bool,
    /// The session currently bound to the member. A persistent member
    /// survives session loss with `None` here until a Join reattaches.
    session: Option<SessionHandle>,
    current: Option<Message>,
    queue: VecDeque<Message>,
}

impl Member {
    pub fn new(commit: Commit<GroupOperation>) -> Self {
        let (member_id, persistent) = match commit.operation() {
            GroupOperation::Join(request) => (request.member_id.clone(), request.persist),
            _ => unreachable!("members are created from join commits"),
        };
        let index = commit.index();
        let session = Some(commit.session().clone());
        Member {
            commit,
            index,
            member_id,
            persistent,
            session,
            current: None,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.member_id
    }

    /// Index of the original Join commit: the member's stable identity tag.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            index: self.index,
            member_id: self.member_id.clone(),
        }
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn session_active(&self) -> bool {
        self.session.as_ref().map(|s| s.is_active()).unwrap_or(false)
    }

    /// Rebind (or clear) the member's session. When a session is attached
    /// and a message is in flight, the `message` event is re-published so
    /// the reopened member resumes processing.
    pub fn set_session(&mut self, session: Option<SessionHandle>) {
        self.session = session;
        if let Some(message) = &self.current {
            self.publish_message(message);
        }
    }

    fn publish_message(&self, message: &Message) {
        if let Some(session) = &self.session {
            session.publish(names::MESSAGE, &message.notice(&self.member_id));
        }
    }

    /// Hand the member a message: deliver immediately if idle, else queue.
    pub fn submit(&mut self, message: Message) {
        if self.current.is_none() {
            self.publish_message(&message);
            self.current = Some(message);
        } else {
            self.queue.push_back(message);
        }
    }

    /// Index of the in-flight message, if any.
    pub fn in_flight_index(&self) -> Option<u64> {
        self.current.as_ref().map(Message::index)
    }

    /// Whether the member's in-flight message is at or before `index`.
    /// Drives the completion rule for broadcast and direct submissions.
    pub fn holds_at_or_before(&self, index: u64) -> bool {
        self.in_flight_index().map_or(false, |held| held <= index)
    }

    /// Clear and return the in-flight message iff its index matches `id`.
    /// A stale or spurious acknowledgement leaves the slot untouched.
    pub fn take_in_flight(&mut self, id: u64) -> Option<Message> {
        if self.in_flight_index() == Some(id) {
            self.current.take()
        } else {
            None
        }
    }

    /// Promote the next queued message into the in-flight slot.
    pub fn advance(&mut self) {
        self.current = self.queue.pop_front();
        if let Some(message) = &self.current {
            self.publish_message(message);
        }
    }

    /// Whether the member still holds the submit committed at `index`,
    /// in flight or queued.
    pub fn holds_submit(&self, index: u64) -> bool {
        self.in_flight_index() == Some(index)
            || self.queue.iter().any(|message| message.index() == index)
    }

    /// Drain the in-flight slot and the queue, FIFO, for termination.
    pub fn drain_messages(&mut self) -> Vec<Message> {
        self.current.take().into_iter().chain(self.queue.drain(..)).collect()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    pub fn current(&self) -> Option<&Message> {
        self.current.as_ref()
    }

    /// Restore pipeline contents from a snapshot without publishing.
    pub fn restore_pipeline(&mut self, current: Option<Message>, queue: Vec<Message>) {
        self.current = current;
        self.queue = queue.into();
    }

    /// Snapshot form of the member's Join commit.
    pub fn join_data(&self) -> crate::rsm::CommitData<GroupOperation> {
        self.commit.to_data()
    }

    /// Release the member's Join commit on termination.
    pub fn release_commit(&self) {
        self.commit.release();
    }
}
