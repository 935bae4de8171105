//! Terminal rendering of command results

pub mod summary;
