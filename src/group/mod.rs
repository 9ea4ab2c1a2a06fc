//! The replicated group: membership, leadership, and messaging.

pub mod listener;
mod member;
mod message;
pub mod ops;
pub mod state_machine;

#[cfg(test)]
mod tests;

pub use listener::{names, GroupListener};
pub use ops::{
    AckRequest, DeliveryPolicy, DispatchPolicy, GroupOperation, GroupOutput, JoinRequest,
    LeaveRequest, MemberInfo, MessageNotice, SubmitRequest,
};
pub use state_machine::{GroupConfig, GroupStateMachine};
