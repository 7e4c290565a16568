//! The message-passing engine.
//!
//! ```text
//! h_i' = UPDATE(h_i, AGGREGATE({MESSAGE(h_j, h_i, e_ji) : j ∈ N(i)}))
//! ```
//!
//! [`MessagePassing`] owns the parts every convolution shares: mode and shape
//! validation, gathering endpoint features per edge, and the reduction. A
//! convolution supplies the parts that differ through [`MessageFunction`].
//!
//! # Dense adjacency
//!
//! With `Dense` and `Batch` adjacency there is no edge list to gather along.
//! The message is evaluated once per node (as a source) and mixed through the
//! matrix, so on these kinds a message may depend only on its source. Each
//! entry `a_ij` scales message `j` the way a weighted edge scales the default
//! sparse message, so both paths agree on weighted graphs.

use candle_core::Tensor;
use nodeflow_core::{Adjacency, AdjacencyKind, EdgeIndex, Error, Result};
use tracing::trace;

use crate::aggregate::{self, Aggregation};

/// A per-edge message, optionally with attention scores for
/// [`Aggregation::Softmax`].
#[derive(Debug, Clone)]
pub struct Message {
    pub value: Tensor,
    pub score: Option<Tensor>,
}

impl Message {
    pub fn new(value: Tensor) -> Self {
        Self { value, score: None }
    }

    pub fn scored(value: Tensor, score: Tensor) -> Self {
        Self {
            value,
            score: Some(score),
        }
    }
}

/// Per-edge data handed to [`MessageFunction::message`].
#[derive(Debug, Clone)]
pub struct EdgeContext<'a> {
    features: Option<&'a Tensor>,
    weights: Option<Tensor>,
    axis: usize,
    num_edges: usize,
}

impl<'a> EdgeContext<'a> {
    /// Context for node-level messages on dense adjacency.
    fn nodes(axis: usize, num_nodes: usize) -> Self {
        Self {
            features: None,
            weights: None,
            axis,
            num_edges: num_nodes,
        }
    }

    /// Edge features `(E, S)`, aligned with the edge list.
    pub fn features(&self) -> Option<&'a Tensor> {
        self.features
    }

    /// Edge weights `(E,)`.
    pub fn weights(&self) -> Option<&Tensor> {
        self.weights.as_ref()
    }

    /// Axis of the gathered tensors that runs over edges.
    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    /// Scale a per-edge tensor by the edge weights, if any.
    pub fn weigh(&self, t: &Tensor) -> Result<Tensor> {
        let Some(w) = &self.weights else {
            return Ok(t.clone());
        };
        let mut shape = vec![1usize; t.rank()];
        shape[self.axis] = self.num_edges;
        let w = w.to_dtype(t.dtype())?.reshape(shape)?;
        Ok(t.broadcast_mul(&w)?)
    }
}

/// The strategy a convolution plugs into [`MessagePassing`].
pub trait MessageFunction {
    /// Message for every edge, given the gathered source and target features.
    ///
    /// Default: the source feature scaled by the edge weight.
    fn message(&self, source: &Tensor, _target: &Tensor, edges: &EdgeContext<'_>) -> Result<Message> {
        Ok(Message::new(edges.weigh(source)?))
    }

    /// Post-process normalized softmax coefficients (e.g. attention dropout).
    fn attention(&self, coefficients: Tensor, _train: bool) -> Result<Tensor> {
        Ok(coefficients)
    }

    /// Combine the aggregated messages with the node's own features.
    ///
    /// Default: the aggregated messages unchanged.
    fn update(&self, aggregated: Tensor, _x: &Tensor, _train: bool) -> Result<Tensor> {
        Ok(aggregated)
    }
}

/// Message → aggregate → update, shared by every convolution.
#[derive(Debug, Clone)]
pub struct MessagePassing {
    name: &'static str,
    aggregation: Aggregation,
    supports: &'static [AdjacencyKind],
}

impl MessagePassing {
    pub fn new(name: &'static str, aggregation: Aggregation, supports: &'static [AdjacencyKind]) -> Self {
        Self {
            name,
            aggregation,
            supports,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn supports(&self) -> &'static [AdjacencyKind] {
        self.supports
    }

    /// Fails with [`Error::UnsupportedMode`] unless `kind` is supported.
    pub fn check(&self, kind: AdjacencyKind) -> Result<()> {
        check_support(self.name, self.supports, kind)
    }

    /// Validate a call and return the node axis of `x`.
    pub fn validate(&self, x: &Tensor, adjacency: &Adjacency, edge_features: Option<&Tensor>) -> Result<usize> {
        let kind = adjacency.kind();
        self.check(kind)?;

        let rank = kind.feature_rank();
        if x.rank() != rank {
            return Err(Error::shape(format!(
                "{} expects rank-{rank} node features with {kind} adjacency, got {:?}",
                self.name,
                x.dims()
            )));
        }
        let axis = rank - 2;
        let nodes = x.dim(axis)?;
        let declared = adjacency.num_nodes()?;
        if nodes != declared {
            return Err(Error::shape(format!(
                "node features {:?} have {nodes} nodes but the adjacency declares {declared}",
                x.dims()
            )));
        }
        if let Some(batch) = adjacency.batch_size()? {
            if x.dim(0)? != batch {
                return Err(Error::shape(format!(
                    "node features {:?} have batch size {} but the adjacency has {batch}",
                    x.dims(),
                    x.dim(0)?
                )));
            }
        }
        if let Some(ef) = edge_features {
            let Some(edges) = adjacency.edges() else {
                return Err(Error::shape(format!(
                    "edge features {:?} need an edge list, got {kind} adjacency",
                    ef.dims()
                )));
            };
            if ef.rank() == 0 || ef.dim(0)? != edges.num_edges() {
                return Err(Error::shape(format!(
                    "edge features {:?} for {} edges",
                    ef.dims(),
                    edges.num_edges()
                )));
            }
        }
        Ok(axis)
    }

    /// Aggregated messages per node, before the update step.
    pub fn propagate<F: MessageFunction + ?Sized>(
        &self,
        f: &F,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let axis = self.validate(x, adjacency, edge_features)?;
        trace!(
            layer = self.name,
            kind = %adjacency.kind(),
            aggregation = %self.aggregation,
            shape = ?x.dims(),
            edges = adjacency.edges().map(EdgeIndex::num_edges),
            "propagate"
        );
        match (adjacency.edges(), adjacency.matrix()) {
            (Some(edges), _) => self.propagate_sparse(f, x, edges, axis, edge_features, train),
            (None, Some(a)) => self.propagate_dense(f, x, a, axis, train),
            (None, None) => Err(Error::shape(format!("{} adjacency carries no edges", adjacency.kind()))),
        }
    }

    /// `update(propagate(..), x)`.
    pub fn run<F: MessageFunction + ?Sized>(
        &self,
        f: &F,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let aggregated = self.propagate(f, x, adjacency, edge_features, train)?;
        f.update(aggregated, x, train)
    }

    fn propagate_sparse<F: MessageFunction + ?Sized>(
        &self,
        f: &F,
        x: &Tensor,
        edges: &EdgeIndex,
        axis: usize,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let n = edges.num_nodes();
        if edges.num_edges() == 0 {
            // Evaluate the message on the nodes themselves for its shape; no edge contributes.
            let shaped = f.message(x, x, &EdgeContext::nodes(axis, n))?;
            return Ok(shaped.value.zeros_like()?);
        }

        let (targets, sources) = edges.index_tensors(x.device())?;
        let source = x.index_select(&sources, axis)?;
        let target = x.index_select(&targets, axis)?;
        let ctx = EdgeContext {
            features: edge_features,
            weights: edges.weight_tensor(x.device())?,
            axis,
            num_edges: edges.num_edges(),
        };
        let msg = f.message(&source, &target, &ctx)?;
        if msg.value.rank() <= axis || msg.value.dim(axis)? != edges.num_edges() {
            return Err(Error::shape(format!(
                "{} produced messages {:?} for {} edges",
                self.name,
                msg.value.dims(),
                edges.num_edges()
            )));
        }

        let index = edges.targets();
        match self.aggregation {
            Aggregation::Softmax => {
                let scores = msg.score.as_ref().unwrap_or(&msg.value);
                let alpha = aggregate::segment_softmax(scores, index, n, axis)?;
                let alpha = f.attention(alpha, train)?;
                aggregate::weighted_sum(&msg.value, &alpha, index, n, axis)
            }
            other => aggregate::scatter(&msg.value, index, n, axis, other),
        }
    }

    fn propagate_dense<F: MessageFunction + ?Sized>(
        &self,
        f: &F,
        x: &Tensor,
        a: &Tensor,
        axis: usize,
        train: bool,
    ) -> Result<Tensor> {
        let msg = f.message(x, x, &EdgeContext::nodes(axis, x.dim(axis)?))?;
        match self.aggregation {
            Aggregation::Softmax => {
                let alpha = match &msg.score {
                    Some(scores) => aggregate::dense_attention(a, scores)?,
                    None => aggregate::dense_message_attention(a, &msg.value)?,
                };
                let alpha = f.attention(alpha, train)?;
                aggregate::dense_weighted_sum(&alpha, a, &msg.value)
            }
            other => aggregate::dense_aggregate(a, &msg.value, other),
        }
    }
}

/// Fails with [`Error::UnsupportedMode`] unless `kind` is in `supports`.
pub fn check_support(layer: &'static str, supports: &[AdjacencyKind], kind: AdjacencyKind) -> Result<()> {
    if supports.contains(&kind) {
        Ok(())
    } else {
        Err(Error::UnsupportedMode {
            layer,
            kind,
            mode: kind.mode(),
        })
    }
}
