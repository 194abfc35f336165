//! Tools for interning more than just strings
//!
//! Profilers emit huge amounts of call stacks which share most of their
//! frames. This crate deduplicates frame names and (leaf frame, parent stack)
//! chains into small integer handles which are cheap to compare and store.

#![deny(missing_docs)]

pub mod callstack;

pub use callstack::{CallStackIndex, CallStackInterner, FrameIndex};

/// Re-export used crates to avoid duplicate dependencies
pub use lasso;
