//! Per-node reductions of per-edge messages.
//!
//! Sparse reductions take values laid out along an edge axis and the target
//! node of each edge; dense reductions take node-level messages and mix them
//! through an adjacency matrix. Every reduction is invariant to edge order
//! and yields zero for nodes without incoming edges.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor, D};
use nodeflow_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// How messages arriving at one node are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Σ m. Injective over multisets.
    #[default]
    Sum,
    /// Σ m / in-degree.
    Mean,
    /// Element-wise maximum.
    Max,
    /// Softmax-weighted sum; weights come from message scores, or from the
    /// messages themselves channel by channel.
    Softmax,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Max => "max",
            Self::Softmax => "softmax",
        };
        f.write_str(s)
    }
}

impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            "max" => Ok(Self::Max),
            "softmax" => Ok(Self::Softmax),
            other => Err(Error::config(format!("unknown aggregation: {other}"))),
        }
    }
}

fn check_edge_axis(values: &Tensor, index: &[u32], axis: usize) -> Result<()> {
    let got = values.dim(axis)?;
    if got != index.len() {
        return Err(Error::shape(format!(
            "{} target indices for {got} messages along axis {axis} of {:?}",
            index.len(),
            values.dims()
        )));
    }
    Ok(())
}

fn node_shape(values: &Tensor, axis: usize, num_nodes: usize) -> Vec<usize> {
    let mut shape = values.dims().to_vec();
    shape[axis] = num_nodes;
    shape
}

/// Σ of values per target node.
pub fn scatter_sum(values: &Tensor, index: &[u32], num_nodes: usize, axis: usize) -> Result<Tensor> {
    check_edge_axis(values, index, axis)?;
    let zeros = Tensor::zeros(node_shape(values, axis, num_nodes), values.dtype(), values.device())?;
    if index.is_empty() {
        return Ok(zeros);
    }
    let idx = Tensor::new(index, values.device())?;
    Ok(zeros.index_add(&idx, &values.contiguous()?, axis)?)
}

/// Mean of values per target node; empty nodes stay zero.
pub fn scatter_mean(values: &Tensor, index: &[u32], num_nodes: usize, axis: usize) -> Result<Tensor> {
    let sum = scatter_sum(values, index, num_nodes, axis)?;
    let mut counts = vec![0f32; num_nodes];
    for &t in index {
        counts[t as usize] += 1.0;
    }
    for c in &mut counts {
        *c = c.max(1.0);
    }
    let mut shape = vec![1usize; values.rank()];
    shape[axis] = num_nodes;
    let counts = Tensor::from_vec(counts, shape, values.device())?.to_dtype(values.dtype())?;
    Ok(sum.broadcast_div(&counts)?)
}

/// Element-wise maximum of values per target node; empty nodes are zero.
pub fn scatter_max(values: &Tensor, index: &[u32], num_nodes: usize, axis: usize) -> Result<Tensor> {
    check_edge_axis(values, index, axis)?;
    let mut shape = values.dims().to_vec();
    shape[axis] = 1;
    let zero = Tensor::zeros(shape, values.dtype(), values.device())?;
    if num_nodes == 0 {
        return Ok(Tensor::zeros(node_shape(values, axis, 0), values.dtype(), values.device())?);
    }

    let mut groups = vec![Vec::new(); num_nodes];
    for (e, &t) in index.iter().enumerate() {
        groups[t as usize].push(e as u32);
    }
    // One reduction per node: candle has no scatter-max kernel.
    let rows = groups
        .iter()
        .map(|edges| {
            if edges.is_empty() {
                Ok(zero.clone())
            } else {
                let ids = Tensor::new(edges.as_slice(), values.device())?;
                values.index_select(&ids, axis)?.max_keepdim(axis)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&rows, axis)?)
}

/// Softmax of `scores` over the edges sharing a target node.
///
/// Scores are shifted by their per-node maximum first, so every node with
/// incoming edges has a denominator of at least one.
pub fn segment_softmax(scores: &Tensor, index: &[u32], num_nodes: usize, axis: usize) -> Result<Tensor> {
    check_edge_axis(scores, index, axis)?;
    if index.is_empty() {
        return Ok(scores.zeros_like()?);
    }
    let idx = Tensor::new(index, scores.device())?;
    let max = scatter_max(scores, index, num_nodes, axis)?;
    let shifted = (scores - max.index_select(&idx, axis)?)?.exp()?;
    let denom = scatter_sum(&shifted, index, num_nodes, axis)?;
    Ok((shifted / denom.index_select(&idx, axis)?)?)
}

/// Reduce per-edge values with `aggregation`.
///
/// `Softmax` uses the values as their own scores.
pub fn scatter(
    values: &Tensor,
    index: &[u32],
    num_nodes: usize,
    axis: usize,
    aggregation: Aggregation,
) -> Result<Tensor> {
    match aggregation {
        Aggregation::Sum => scatter_sum(values, index, num_nodes, axis),
        Aggregation::Mean => scatter_mean(values, index, num_nodes, axis),
        Aggregation::Max => scatter_max(values, index, num_nodes, axis),
        Aggregation::Softmax => {
            let alpha = segment_softmax(values, index, num_nodes, axis)?;
            weighted_sum(values, &alpha, index, num_nodes, axis)
        }
    }
}

/// Σ alpha · value per target node. `alpha` may have fewer trailing axes
/// than `values` (e.g. one coefficient per attention head).
pub fn weighted_sum(
    values: &Tensor,
    alpha: &Tensor,
    index: &[u32],
    num_nodes: usize,
    axis: usize,
) -> Result<Tensor> {
    let mut alpha = alpha.clone();
    while alpha.rank() < values.rank() {
        alpha = alpha.unsqueeze(alpha.rank())?;
    }
    scatter_sum(&values.broadcast_mul(&alpha)?, index, num_nodes, axis)
}

fn check_dense(a: &Tensor, messages: &Tensor) -> Result<()> {
    let rank = a.rank();
    if rank < 2 || messages.rank() != rank || messages.dims()[..rank - 1] != a.dims()[..rank - 1] {
        return Err(Error::shape(format!(
            "dense adjacency {:?} cannot mix node messages {:?}",
            a.dims(),
            messages.dims()
        )));
    }
    Ok(())
}

/// Neighbour mask and messages broadcast to `(.., N, N, F)`; entry
/// `[.., i, j, :]` is message `j` as seen from node `i`.
fn neighbour_grid(a: &Tensor, messages: &Tensor) -> Result<(Tensor, Tensor)> {
    let rank = a.rank();
    let mut shape = a.dims().to_vec();
    shape.push(messages.dim(D::Minus1)?);
    let mask = a.ne(0.0)?.unsqueeze(rank)?.broadcast_as(shape.as_slice())?;
    let grid = messages.unsqueeze(rank - 2)?.broadcast_as(shape.as_slice())?;
    Ok((mask, grid))
}

/// Like [`neighbour_grid`], with entry `[.., i, j, :]` scaled by `a[.., i, j]`
/// the way a weighted edge scales its message.
fn weighted_grid(a: &Tensor, messages: &Tensor) -> Result<(Tensor, Tensor)> {
    let (mask, grid) = neighbour_grid(a, messages)?;
    let grid = grid.broadcast_mul(&a.unsqueeze(a.rank())?)?;
    Ok((mask, grid))
}

/// Number of non-zero entries per row, shaped `(.., N, 1)`.
fn dense_degrees(a: &Tensor, dtype: DType) -> Result<Tensor> {
    Ok(a.ne(0.0)?.to_dtype(dtype)?.sum_keepdim(D::Minus1)?)
}

/// Reduce node-level messages through a dense `(N, N)` or `(B, N, N)`
/// adjacency. Every term is the message scaled by its entry, `a_ij · m_j`,
/// which matches the default sparse message over the same weighted edges.
pub fn dense_aggregate(a: &Tensor, messages: &Tensor, aggregation: Aggregation) -> Result<Tensor> {
    check_dense(a, messages)?;
    let a = a.to_dtype(messages.dtype())?;
    let m = messages.contiguous()?;
    match aggregation {
        Aggregation::Sum => Ok(a.matmul(&m)?),
        Aggregation::Mean => {
            let deg = dense_degrees(&a, m.dtype())?.maximum(1.0)?;
            Ok(a.matmul(&m)?.broadcast_div(&deg)?)
        }
        Aggregation::Max => {
            let rank = a.rank();
            let (mask, grid) = weighted_grid(&a, &m)?;
            let neg_inf = grid.ones_like()?.affine(0.0, f64::NEG_INFINITY)?;
            let max = mask.where_cond(&grid, &neg_inf)?.max(rank - 1)?;
            let has_edges = dense_degrees(&a, m.dtype())?.gt(0.0)?.broadcast_as(max.shape())?;
            Ok(has_edges.where_cond(&max, &max.zeros_like()?)?)
        }
        Aggregation::Softmax => {
            let alpha = dense_message_attention(&a, &m)?;
            dense_weighted_sum(&alpha, &a, &m)
        }
    }
}

/// Softmax coefficients over each node's neighbours, shaped `(.., N, N, S)`
/// for node-level scores `(.., N, S)`. Non-neighbours get zero. Scores are
/// not scaled by the entries of `a`; only its sparsity pattern counts.
pub fn dense_attention(a: &Tensor, scores: &Tensor) -> Result<Tensor> {
    check_dense(a, scores)?;
    let (mask, grid) = neighbour_grid(a, scores)?;
    masked_softmax(a, &mask, &grid)
}

/// Softmax coefficients that use the scaled messages `a_ij · m_j` as their
/// own scores, the dense counterpart of unscored sparse softmax.
pub fn dense_message_attention(a: &Tensor, messages: &Tensor) -> Result<Tensor> {
    check_dense(a, messages)?;
    let a = a.to_dtype(messages.dtype())?;
    let (mask, grid) = weighted_grid(&a, messages)?;
    masked_softmax(&a, &mask, &grid)
}

fn masked_softmax(a: &Tensor, mask: &Tensor, grid: &Tensor) -> Result<Tensor> {
    let rank = a.rank();
    let neg_inf = grid.ones_like()?.affine(0.0, f64::NEG_INFINITY)?;
    let masked = mask.where_cond(grid, &neg_inf)?;

    // rows without neighbours have a -inf maximum; shift those by zero instead
    let row_max = masked.max_keepdim(rank - 1)?;
    let has_edges = dense_degrees(a, grid.dtype())?
        .gt(0.0)?
        .unsqueeze(rank)?
        .broadcast_as(row_max.shape())?;
    let row_max = has_edges.where_cond(&row_max, &row_max.zeros_like()?)?;

    let e = masked.broadcast_sub(&row_max)?.exp()?;
    let denom = e.sum_keepdim(rank - 1)?;
    let denom = denom.gt(0.0)?.where_cond(&denom, &denom.ones_like()?)?;
    Ok(e.broadcast_div(&denom)?)
}

/// Σ_j alpha[.., i, j, :] · a[.., i, j] · m[.., j, :].
pub fn dense_weighted_sum(alpha: &Tensor, a: &Tensor, messages: &Tensor) -> Result<Tensor> {
    check_dense(a, messages)?;
    let a = a.to_dtype(messages.dtype())?;
    let (_, grid) = weighted_grid(&a, messages)?;
    Ok(alpha.broadcast_mul(&grid)?.sum(a.rank() - 1)?)
}
