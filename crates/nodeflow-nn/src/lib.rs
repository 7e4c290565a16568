//! Message-passing graph layers on candle tensors.
//!
//! ## The Message Passing Framework
//!
//! Every layer here follows the same pattern ([Gilmer et al. 2017](https://arxiv.org/abs/1704.01212)):
//!
//! ```text
//! h_i' = UPDATE(h_i, AGGREGATE({MESSAGE(h_j, h_i, e_ji) : j ∈ N(i)}))
//! ```
//!
//! 1. **MESSAGE**: each edge produces a value from its endpoints (and edge features)
//! 2. **AGGREGATE**: messages into a node are reduced (sum, mean, max, softmax)
//! 3. **UPDATE**: the reduction is combined with the node's own features
//!
//! There is one engine, [`MessagePassing`], and one strategy trait,
//! [`MessageFunction`]. A convolution overrides only the steps it changes;
//! everything else (validation, gathering, reduction) is shared.
//!
//! ## Lifecycle
//!
//! ```text
//! ConvSpec ──build(InputSpec, VarBuilder)──▶ GraphLayer ──forward──▶ Tensor
//! ```
//!
//! Specs are serde-serializable configuration. Building checks the spec,
//! rejects adjacency kinds the variant does not implement, and creates the
//! parameters; the built layer never changes afterwards. [`LazyLayer`] defers
//! building to the first forward call.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use nodeflow_core::{Adjacency, AdjacencyKind, EdgeIndex};
//! use nodeflow_nn::{ConvSpec, GINConv, GraphLayer, InputSpec};
//!
//! # fn main() -> nodeflow_core::Result<()> {
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//!
//! let layer = GINConv::new(16).build(InputSpec::new(8, AdjacencyKind::Sparse), vb)?;
//! let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0), (1, 2)], 3)?;
//! let x = Tensor::randn(0f32, 1f32, (3, 8), &device)?;
//! let h = layer.forward(&x, &Adjacency::Sparse(edges), None)?;
//! assert_eq!(h.dims(), &[3, 16]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Variants
//!
//! | Layer | Aggregation | Kinds |
//! |-------|-------------|-------|
//! | [`GINConv`] | sum (configurable) | all |
//! | [`GCNConv`] | sum over `Â` | all |
//! | [`GATConv`] | softmax attention | sparse, disjoint, mixed |
//! | [`GraphSageConv`] | mean (configurable) | sparse, disjoint, mixed |
//! | [`ChebConv`] | Chebyshev recursion over `L̂` | all |
//! | [`GatedGraphConv`] | sum + GRU | sparse, disjoint, mixed |
//! | [`ECCConv`] | sum (configurable), edge-conditioned kernels | sparse, disjoint, mixed |
//! | [`ARMAConv`] | sum over `Â`, averaged stacks | all |
//! | [`DiffusionConv`] | sum over `T`, K hops | all |
//!
//! ## Logging
//!
//! Builds are logged at `debug`, propagations at `trace`, and configurations
//! that change a layer's guarantees at `warn`, all through `tracing`. No
//! subscriber is installed here.

pub mod aggregate;
pub mod conv;
pub mod dense;
pub mod layer;
pub mod message;
pub mod params;

pub use aggregate::{segment_softmax, Aggregation};
pub use conv::{
    ARMAConv, ARMALayer, ChebConv, ChebLayer, DiffusionConv, DiffusionLayer, ECCConv, ECCLayer, GATConv, GATLayer,
    GCNConv, GCNLayer, GINConv, GINLayer, GatedGraphConv, GatedGraphLayer, GraphSageConv, GraphSageLayer,
};
pub use dense::{Dense, Mlp};
pub use layer::{ConvSpec, GraphLayer, InputSpec, LazyLayer};
pub use message::{EdgeContext, Message, MessageFunction, MessagePassing};
pub use params::{Activation, Constraint, Initializer, LayerOptions, Param, Regularizer};
