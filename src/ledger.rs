//! Durable state: tasks, approvals, policy decisions, group fabric, settings.

pub mod group;
pub mod queries;
pub mod store;

pub use store::{
    ApprovalRow, ApprovalStatus, DeliveryStatus, Ledger, NewTask, TaskRow, TaskStatus,
};
