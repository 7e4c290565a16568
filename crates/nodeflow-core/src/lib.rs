//! Graph inputs for message-passing layers.
//!
//! This crate owns everything a graph layer reads besides node features:
//!
//! - [`EdgeIndex`] - sparse adjacency in COO layout with optional weights
//! - [`DisjointGraphs`] - many graphs packed block-diagonally
//! - [`Adjacency`] - the tagged union a forward call receives
//! - [`Mode`] / [`AdjacencyKind`] - execution modes and their representations
//! - [`Error`] - the error type shared by the workspace
//!
//! # Execution Modes
//!
//! | Mode | Features | Adjacency |
//! |------|----------|-----------|
//! | single | `(N, F)` | `Dense (N, N)` or `Sparse` |
//! | disjoint | `(N, F)` | `Disjoint` |
//! | mixed | `(B, N, F)` | `Mixed` (one shared edge list) |
//! | batch | `(B, N, F)` | `Batch (B, N, N)` |
//!
//! Nothing here converts between representations implicitly; the helpers in
//! [`transform`] and [`EdgeIndex::from_dense`] are explicit, caller-side steps.

pub mod adjacency;
pub mod error;
pub mod mode;
pub mod transform;

pub use adjacency::{Adjacency, DisjointGraphs, EdgeIndex};
pub use error::{Error, Result};
pub use mode::{AdjacencyKind, Mode};
pub use transform::{normalize_dense, random_walk_dense};
