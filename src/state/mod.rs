//! State Management Module
//!
//! Handles persistent state tracking for the node.

mod tracker;

pub use tracker::{AppliedState, StateTracker};
