//! Drive adapters.

pub mod memory;
