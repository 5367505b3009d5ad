//! Request-reply correlation engine.
//!
//! Per request: registered (entry inserted) -> sent -> awaiting reply ->
//! completed, timed out, cancelled or failed. The entry is always inserted
//! before the request is transmitted, and exactly one of the finishing paths
//! removes it.

pub mod manager;
pub mod pending;
pub mod table;

pub use manager::{CorrelationManager, SweepNow};
pub use pending::PendingReply;
pub use table::{CorrelationCallback, DeliveryOutcome, ReplyOutcome};
