//! windlass scheduler library.
//!
//! This crate primarily ships a `windlass-scheduler` binary, but we expose a
//! small library surface to enable integration testing and reuse.

pub mod capacity;
pub mod config;
pub mod db;
pub mod dependency_graph;
pub mod dispatch;
pub mod locking;
pub mod managers;
pub mod sinks;
pub mod store;
