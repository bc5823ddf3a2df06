//! Keel — declarative host configuration.
//!
//! A catalog of resources (files, commands) is converged concurrently,
//! gated only by the ordering constraints each resource declares.

pub mod cli;
pub mod core;
pub mod resources;
