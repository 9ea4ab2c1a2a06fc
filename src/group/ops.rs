//! Group operations.
//!
//! All group operations are commands; the group publishes its read side as
//! events to listener sessions. Every operation has a stable numeric type
//! id used by the wire codec.

use serde::{Deserialize, Serialize};

/// Stable operation type ids (contiguous block above the map's).
pub mod ids {
    pub const JOIN: u16 = 460;
    pub const LEAVE: u16 = 461;
    pub const LISTEN: u16 = 462;
    pub const SUBMIT: u16 = 463;
    pub const ACK: u16 = 464;
}

/// How a submitted message is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchPolicy {
    /// To the named target member only.
    Direct,
    /// To one member chosen by the group's deterministic random.
    Random,
    /// To every member.
    Broadcast,
}

impl DispatchPolicy {
    pub fn ordinal(self) -> u8 {
        match self {
            DispatchPolicy::Direct => 0,
            DispatchPolicy::Random => 1,
            DispatchPolicy::Broadcast => 2,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(DispatchPolicy::Direct),
            1 => Some(DispatchPolicy::Random),
            2 => Some(DispatchPolicy::Broadcast),
            _ => None,
        }
    }
}

/// What happens to an undelivered message when its holder terminates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryPolicy {
    /// Fail back to the producer.
    Once,
    /// Random-dispatch messages are reassigned to a surviving member.
    Retry,
}

impl DeliveryPolicy {
    pub fn ordinal(self) -> u8 {
        match self {
            DeliveryPolicy::Once => 0,
            DeliveryPolicy::Retry => 1,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(DeliveryPolicy::Once),
            1 => Some(DeliveryPolicy::Retry),
            _ => None,
        }
    }
}

/// Register a member, or reattach a persistent member to a new session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member_id: String,
    pub persist: bool,
}

/// Deregister a member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member_id: String,
}

/// Enqueue a message to one or all members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Target member; present iff the message is direct.
    pub member: Option<String>,
    pub dispatch: DispatchPolicy,
    pub delivery: DeliveryPolicy,
    /// Producer-side message id, echoed back in `ack`/`fail`.
    pub id: u64,
    pub message_type: String,
    pub payload: Vec<u8>,
}

/// Acknowledge (or fail) delivery of an in-flight message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub member: String,
    /// The message's commit index, as carried by the `message` event.
    pub id: u64,
    pub succeeded: bool,
}

/// The group's operation set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperation {
    Join(JoinRequest),
    Leave(LeaveRequest),
    Listen,
    Submit(SubmitRequest),
    Ack(AckRequest),
}

impl GroupOperation {
    /// The operation's stable type id.
    pub fn type_id(&self) -> u16 {
        match self {
            GroupOperation::Join(_) => ids::JOIN,
            GroupOperation::Leave(_) => ids::LEAVE,
            GroupOperation::Listen => ids::LISTEN,
            GroupOperation::Submit(_) => ids::SUBMIT,
            GroupOperation::Ack(_) => ids::ACK,
        }
    }
}

/// A member as seen by listeners: the id plus the index of the original
/// join commit, which serves as a stable identity tag.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberInfo {
    pub index: u64,
    pub member_id: String,
}

/// Payload of the `message` event. `index` doubles as the ack identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNotice {
    pub index: u64,
    pub member_id: String,
    pub message_type: String,
    pub payload: Vec<u8>,
}

/// Results returned by group operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOutput {
    /// `Join`: the registered member.
    Member(MemberInfo),
    /// `Listen`: snapshot of members with active sessions, in join order.
    Members(Vec<MemberInfo>),
    /// `Leave`, `Submit`, `Ack`.
    Unit,
}
