//! Batch/MRN genealogy for recall and compliance tracing.
//!
//! Pure domain logic: the graph is an arena of nodes with adjacency lists,
//! owned and locked by the engine in `lonerp-infra`.

pub mod cancel;
pub mod graph;
pub mod link;

pub use cancel::CancelToken;
pub use graph::{Direction, NodeIndex, TraceGraph, TraceStep, TraceWalk};
pub use link::{TraceEndpoint, TraceLink, TraceNode};
