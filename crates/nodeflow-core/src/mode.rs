//! Execution modes and the adjacency kinds that realize them.
//!
//! | Mode | Features | Adjacency |
//! |------|----------|-----------|
//! | Single | `(N, F)` | dense `(N, N)` or sparse edge list |
//! | Disjoint | `(N, F)` | block-diagonal edge list + graph ids |
//! | Mixed | `(B, N, F)` | one shared edge list |
//! | Batch | `(B, N, F)` | dense `(B, N, N)`, zero rows for padding |

use std::fmt;

use serde::{Deserialize, Serialize};

/// How multiple graphs or feature sets are packed into one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One graph.
    Single,
    /// Many small graphs packed into one block-diagonal adjacency.
    Disjoint,
    /// One adjacency shared by a batch of feature sets.
    Mixed,
    /// One dense padded adjacency per sample.
    Batch,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Single => "single",
            Self::Disjoint => "disjoint",
            Self::Mixed => "mixed",
            Self::Batch => "batch",
        };
        f.write_str(s)
    }
}

/// Concrete adjacency representation, the unit layers declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjacencyKind {
    /// Dense `(N, N)` matrix, single mode.
    Dense,
    /// Edge list, single mode.
    Sparse,
    /// Block-diagonal edge list, disjoint mode.
    Disjoint,
    /// Shared edge list, mixed mode.
    Mixed,
    /// Dense `(B, N, N)` tensor, batch mode.
    Batch,
}

impl AdjacencyKind {
    /// All kinds, in declaration order.
    pub const ALL: [AdjacencyKind; 5] = [
        AdjacencyKind::Dense,
        AdjacencyKind::Sparse,
        AdjacencyKind::Disjoint,
        AdjacencyKind::Mixed,
        AdjacencyKind::Batch,
    ];

    /// The execution mode this representation belongs to.
    pub fn mode(self) -> Mode {
        match self {
            Self::Dense | Self::Sparse => Mode::Single,
            Self::Disjoint => Mode::Disjoint,
            Self::Mixed => Mode::Mixed,
            Self::Batch => Mode::Batch,
        }
    }

    /// Whether messages are computed per edge (as opposed to a dense product).
    pub fn is_sparse(self) -> bool {
        matches!(self, Self::Sparse | Self::Disjoint | Self::Mixed)
    }

    /// Rank of the node feature tensor expected with this kind.
    pub fn feature_rank(self) -> usize {
        match self.mode() {
            Mode::Single | Mode::Disjoint => 2,
            Mode::Mixed | Mode::Batch => 3,
        }
    }
}

impl fmt::Display for AdjacencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dense => "dense",
            Self::Sparse => "sparse",
            Self::Disjoint => "disjoint",
            Self::Mixed => "mixed",
            Self::Batch => "batch",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_and_sparse_are_single_mode() {
        assert_eq!(AdjacencyKind::Dense.mode(), Mode::Single);
        assert_eq!(AdjacencyKind::Sparse.mode(), Mode::Single);
        assert_eq!(AdjacencyKind::Mixed.mode(), Mode::Mixed);
    }

    #[test]
    fn feature_rank_follows_mode() {
        assert_eq!(AdjacencyKind::Disjoint.feature_rank(), 2);
        assert_eq!(AdjacencyKind::Batch.feature_rank(), 3);
        assert!(AdjacencyKind::Mixed.is_sparse());
        assert!(!AdjacencyKind::Batch.is_sparse());
    }
}
