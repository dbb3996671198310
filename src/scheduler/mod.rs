//! Priority Scheduler & Preemption.

mod preemption;
mod queue;

pub use preemption::{select_preemption_candidates, PreemptionRecord, PreemptionReason};
pub use queue::PriorityQueue;
