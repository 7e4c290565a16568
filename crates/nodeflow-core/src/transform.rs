//! Adjacency preprocessing for filters that expect a normalized operator.
//!
//! These run on the caller's side, once per graph, before the forward pass:
//!
//! ```text
//! gcn_normalized:     Â = D^{-1/2} (A + I) D^{-1/2}
//! sym_normalized:     D^{-1/2} A D^{-1/2}
//! random_walk:        T = D^{-1} A   (each row sums to one)
//! scaled_laplacian:   L̂ = 2L / λ_max - I  with λ_max ≈ 2, i.e. -D^{-1/2} A D^{-1/2}
//! ```
//!
//! Degrees are weighted and counted per target row.

use candle_core::{Tensor, D};

use crate::adjacency::EdgeIndex;
use crate::error::{Error, Result};

fn inv_sqrt(deg: &[f32]) -> Vec<f32> {
    deg.iter()
        .map(|&d| if d > 0.0 { d.sqrt().recip() } else { 0.0 })
        .collect()
}

impl EdgeIndex {
    /// Symmetric GCN normalization with self-loops.
    pub fn gcn_normalized(&self) -> Self {
        let looped = self.with_self_loops();
        let d = inv_sqrt(&looped.weighted_degrees());
        looped.map_weights(|_, t, s, w| w * d[t as usize] * d[s as usize])
    }

    /// Symmetric normalization without self-loops.
    pub fn sym_normalized(&self) -> Self {
        let d = inv_sqrt(&self.weighted_degrees());
        self.map_weights(|_, t, s, w| w * d[t as usize] * d[s as usize])
    }

    /// Random-walk transition operator: every edge into a node is divided by
    /// that node's weighted degree.
    pub fn random_walk(&self) -> Self {
        let deg = self.weighted_degrees();
        self.map_weights(|_, t, _, w| {
            let d = deg[t as usize];
            if d != 0.0 {
                w / d
            } else {
                0.0
            }
        })
    }

    /// Rescaled normalized Laplacian for Chebyshev filters.
    ///
    /// Uses the λ_max ≈ 2 approximation, so the identity terms cancel and
    /// only the off-diagonal `-D^{-1/2} A D^{-1/2}` entries remain.
    pub fn scaled_laplacian(&self) -> Self {
        let d = inv_sqrt(&self.weighted_degrees());
        self.map_weights(|_, t, s, w| -w * d[t as usize] * d[s as usize])
    }
}

/// Symmetric normalization of a dense `(N, N)` or `(B, N, N)` adjacency.
///
/// Rows with zero degree (padding nodes without self-loops) stay zero.
pub fn normalize_dense(a: &Tensor, add_self_loops: bool) -> Result<Tensor> {
    let rank = a.rank();
    if rank != 2 && rank != 3 {
        return Err(Error::shape(format!(
            "dense adjacency must have rank 2 or 3, got {:?}",
            a.dims()
        )));
    }
    let n = a.dim(D::Minus1)?;
    let a = if add_self_loops {
        let eye = Tensor::eye(n, a.dtype(), a.device())?;
        a.broadcast_add(&eye)?
    } else {
        a.clone()
    };
    let deg = a.sum_keepdim(D::Minus1)?;
    let zeros = deg.zeros_like()?;
    // where_cond selects, so the inf from zero degrees never reaches the output
    let inv = deg.gt(0.0)?.where_cond(&deg.powf(-0.5)?, &zeros)?;
    let inv_t = inv.transpose(rank - 1, rank - 2)?;
    Ok(a.broadcast_mul(&inv)?.broadcast_mul(&inv_t)?)
}

/// Row normalization `D^{-1} A` of a dense `(N, N)` or `(B, N, N)`
/// adjacency; zero rows stay zero.
pub fn random_walk_dense(a: &Tensor) -> Result<Tensor> {
    let rank = a.rank();
    if rank != 2 && rank != 3 {
        return Err(Error::shape(format!(
            "dense adjacency must have rank 2 or 3, got {:?}",
            a.dims()
        )));
    }
    let deg = a.sum_keepdim(D::Minus1)?;
    let safe = deg.ne(0.0)?.where_cond(&deg, &deg.ones_like()?)?;
    Ok(a.broadcast_div(&safe)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn gcn_weights_are_symmetric_for_undirected_graph() {
        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0), (1, 2), (2, 1)], 3).unwrap();
        let norm = edges.gcn_normalized();
        let w = norm.weights().unwrap();
        // deg with loops: [2, 3, 2]
        let expected = 1.0 / (2.0f32 * 3.0).sqrt();
        assert!((w[0] - expected).abs() < 1e-6);
        assert!((w[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn scaled_laplacian_is_negated_normalized_adjacency() {
        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0)], 2).unwrap();
        let lap = edges.scaled_laplacian();
        assert_eq!(lap.weights().unwrap(), &[-1.0, -1.0]);
    }

    #[test]
    fn dense_normalization_matches_sparse() {
        let device = Device::Cpu;
        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0), (1, 2), (2, 1)], 3).unwrap();
        let dense = normalize_dense(&edges.to_dense(&device).unwrap(), true).unwrap();
        let sparse = edges.gcn_normalized().to_dense(&device).unwrap();
        let diff = (dense - sparse)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "diff = {diff}");
    }

    #[test]
    fn random_walk_rows_sum_to_one() {
        let device = Device::Cpu;
        let edges = EdgeIndex::from_pairs(&[(0, 1), (0, 2), (1, 0)], 4)
            .unwrap()
            .with_weights(vec![3.0, 1.0, 2.0])
            .unwrap();
        let walk = edges.random_walk();
        assert_eq!(walk.weights().unwrap(), &[0.75, 0.25, 1.0]);

        let dense = random_walk_dense(&edges.to_dense(&device).unwrap()).unwrap();
        let rows = dense.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(rows, vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(dense.to_vec2::<f32>().unwrap(), walk.to_dense(&device).unwrap().to_vec2::<f32>().unwrap());
    }

    #[test]
    fn sym_normalization_has_no_self_loops() {
        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0), (1, 2), (2, 1)], 3).unwrap();
        let norm = edges.sym_normalized();
        assert_eq!(norm.num_edges(), 4);
        let expected = 1.0 / 2f32.sqrt();
        assert!((norm.weights().unwrap()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn padding_rows_stay_zero() {
        let device = Device::Cpu;
        let a = Tensor::zeros((2, 3, 3), DType::F32, &device).unwrap();
        let norm = normalize_dense(&a, false).unwrap();
        let total = norm.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 0.0);
    }
}
