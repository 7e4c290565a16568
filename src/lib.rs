//! `nodeflow`: message-passing graph convolutions on candle tensors.
//!
//! This crate re-exports the two workspace crates so downstream code needs a
//! single dependency:
//!
//! - [`nodeflow_core`]: adjacency representations, execution modes, errors
//! - [`nodeflow_nn`]: the message-passing engine, parameter options and
//!   convolution layers
//!
//! Enable the `petgraph` feature for `EdgeIndex::from_petgraph`.

pub use nodeflow_core::{
    self, normalize_dense, random_walk_dense, Adjacency, AdjacencyKind, DisjointGraphs, EdgeIndex, Error, Mode,
    Result,
};
pub use nodeflow_nn::{self, *};
