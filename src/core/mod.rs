//! Core engine — data model, catalog decoding, graph, execution.

pub mod catalog;
pub mod duration;
pub mod error;
pub mod executor;
pub mod graph;
pub mod types;
