//! Graph convolutions built on [`MessagePassing`](crate::message::MessagePassing).
//!
//! Each variant is a serializable spec (`GINConv`, `GCNConv`, ...) and a
//! built layer (`GINLayer`, `GCNLayer`, ...). The built layer implements
//! [`MessageFunction`](crate::message::MessageFunction) for the parts of the
//! message → aggregate → update pipeline it changes and
//! [`GraphLayer`](crate::layer::GraphLayer) for the forward pass.
//!
//! | variant | adjacency kinds | rule |
//! |---------|-----------------|------|
//! | [`GINConv`] | all | `MLP((1 + eps) x_i + Σ_j x_j)` |
//! | [`GCNConv`] | all | `act(Â X W + b)` |
//! | [`GATConv`] | sparse, disjoint, mixed | multi-head attention |
//! | [`GraphSageConv`] | sparse, disjoint, mixed | `act(norm([x_i ‖ AGG_j x_j] W + b))` |
//! | [`ChebConv`] | all | `act(Σ_k T_k(L̂) X W_k + b)` |
//! | [`GatedGraphConv`] | sparse, disjoint, mixed | GRU over repeated propagation |
//! | [`ECCConv`] | sparse, disjoint, mixed | `act(x_i W_root + Σ_j x_j K(e_ji) + b)` |
//! | [`ARMAConv`] | all | mean of recursive `Â X W + X V` stacks |
//! | [`DiffusionConv`] | all | `act(Σ_k θ_k Σ_f (T^k X)_f + b)` per channel |

mod arma;
mod cheb;
mod diffusion;
mod ecc;
mod gat;
mod gated;
mod gcn;
mod gin;
mod sage;

pub use arma::{ARMAConv, ARMALayer};
pub use cheb::{ChebConv, ChebLayer};
pub use diffusion::{DiffusionConv, DiffusionLayer};
pub use ecc::{ECCConv, ECCLayer};
pub use gat::{GATConv, GATLayer};
pub use gated::{GatedGraphConv, GatedGraphLayer};
pub use gcn::{GCNConv, GCNLayer};
pub use gin::{GINConv, GINLayer};
pub use sage::{GraphSageConv, GraphSageLayer};

use nodeflow_core::AdjacencyKind;

const ALL_KINDS: &[AdjacencyKind] = &AdjacencyKind::ALL;

const SPARSE_KINDS: &[AdjacencyKind] = &[AdjacencyKind::Sparse, AdjacencyKind::Disjoint, AdjacencyKind::Mixed];

fn default_true() -> bool {
    true
}
