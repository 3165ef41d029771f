//! Periodic-task scheduling.
//!
//! - [`schedule_thread`]: the background worker firing tasks at fixed
//!   intervals
//! - [`binary_heap`]: the timer min-heap with predicate-erase

pub mod binary_heap;
pub mod schedule_thread;

pub use binary_heap::BinaryHeap;
pub use schedule_thread::{ScheduleTask, ScheduleThread};
