//! # windlass-jobs
//!
//! Job, instance and workflow type definitions shared across the windlass
//! scheduler.
//!
//! ## Design Principles
//!
//! - One [`Task`] type with a uniform scheduling surface; job-type specifics
//!   live in the [`TaskKind`] tagged union and are resolved by pattern match
//! - Only scheduling-relevant attributes are modeled (status, cost, dependency
//!   edges, timestamps, placement fields); payload details stay with the API
//!   layer that owns them
//! - Status transitions are monotonic; terminal statuses are never left
//! - State transitions driven by the scheduler are published as explicit
//!   [`SchedulerEvent`] records

mod error;
mod events;
mod types;

pub use error::ModelError;
pub use events::{event_types, SchedulerEvent};
pub use types::*;
