//! A message in a member's delivery pipeline.
//!
//! Wraps the retained Submit commit. Clones share the commit, so a
//! broadcast enqueues the same underlying submission at every member and
//! the commit is released exactly once, when the completion rule fires.

use crate::rsm::{Commit, SessionHandle};

use super::listener::names;
use super::ops::{DeliveryPolicy, DispatchPolicy, GroupOperation, MessageNotice, SubmitRequest};

#[derive(Clone)]
pub(crate) struct Message {
    commit: Commit<GroupOperation>,
}

impl Message {
    pub fn new(commit: Commit<GroupOperation>) -> Self {
        debug_assert!(matches!(commit.operation(), GroupOperation::Submit(_)));
        Message { commit }
    }

    pub fn request(&self) -> &SubmitRequest {
        match self.commit.operation() {
            GroupOperation::Submit(request) => request,
            _ => unreachable!("messages wrap submit commits"),
        }
    }

    /// The commit index; doubles as the ack identifier.
    pub fn index(&self) -> u64 {
        self.commit.index()
    }

    /// Direct iff a target member was specified.
    pub fn direct(&self) -> bool {
        self.request().member.is_some()
    }

    pub fn dispatch(&self) -> DispatchPolicy {
        self.request().dispatch
    }

    pub fn delivery(&self) -> DeliveryPolicy {
        self.request().delivery
    }

    /// Payload of the `message` event as delivered to `member_id`.
    pub fn notice(&self, member_id: &str) -> MessageNotice {
        let request = self.request();
        MessageNotice {
            index: self.index(),
            member_id: member_id.to_string(),
            message_type: request.message_type.clone(),
            payload: request.payload.clone(),
        }
    }

    fn producer(&self) -> &SessionHandle {
        self.commit.session()
    }

    /// Notify the producer of successful completion, echoing the request.
    pub fn ack(&self) {
        self.producer().publish(names::ACK, self.request());
    }

    /// Notify the producer of failure, echoing the request.
    pub fn fail(&self) {
        self.producer().publish(names::FAIL, self.request());
    }

    /// Release the underlying Submit commit.
    pub fn release(&self) {
        self.commit.release();
    }

    pub fn commit(&self) -> &Commit<GroupOperation> {
        &self.commit
    }
}
