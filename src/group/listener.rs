//! Per-listener-session event publisher.
//!
//! Every publish is silently skipped if the bound session is not Active.
//! Within a single commit handler, publication order follows invocation
//! order; callers are responsible for invoking in the contract's order
//! (members are closed before their `leave` is published).

use crate::rsm::SessionHandle;

use super::ops::MemberInfo;

/// Stable published event names.
pub mod names {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const TERM: &str = "term";
    pub const ELECT: &str = "elect";
    pub const RESIGN: &str = "resign";
    pub const MESSAGE: &str = "message";
    pub const ACK: &str = "ack";
    pub const FAIL: &str = "fail";
}

/// A group listener: a session registered via `Listen` that receives
/// membership and leadership events.
pub struct GroupListener {
    session: SessionHandle,
}

impl GroupListener {
    pub fn new(session: SessionHandle) -> Self {
        GroupListener { session }
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// A member joined, or a persistent member reattached.
    pub fn join(&self, info: &MemberInfo) {
        self.session.publish(names::JOIN, info);
    }

    /// A member left the group.
    pub fn leave(&self, member_id: &str) {
        self.session.publish(names::LEAVE, member_id);
    }

    /// The term advanced.
    pub fn term(&self, term: u64) {
        self.session.publish(names::TERM, &term);
    }

    /// A leader was elected.
    pub fn elect(&self, member_id: &str) {
        self.session.publish(names::ELECT, member_id);
    }

    /// The leader resigned.
    pub fn resign(&self, member_id: &str) {
        self.session.publish(names::RESIGN, member_id);
    }
}
