//! Protocol types, identifiers and value objects (no I/O).

pub mod control;
pub mod identity;
pub mod topic;
pub mod tracker;
