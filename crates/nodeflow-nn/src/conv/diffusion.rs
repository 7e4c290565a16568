use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use nodeflow_core::{Adjacency, AdjacencyKind, Error, Result};
use serde::{Deserialize, Serialize};

use super::ALL_KINDS;
use crate::aggregate::Aggregation;
use crate::dense::Dense;
use crate::layer::{check_width, ConvSpec, GraphLayer, InputSpec};
use crate::message::{MessageFunction, MessagePassing};
use crate::params::{total_penalty, Activation, LayerOptions, Param};

fn default_k() -> usize {
    6
}

/// Diffusion convolution.
///
/// Each output channel `q` is a learned polynomial in the random-walk
/// transition operator `T`, applied to the features and summed over them:
///
/// ```text
/// Z_{:, q} = act(Σ_{k<K} θ_{q,k} Σ_f (T^k X)_{:, f} + b_q)
/// ```
///
/// `T` is whatever adjacency is passed in; build it with
/// [`EdgeIndex::random_walk`](nodeflow_core::EdgeIndex::random_walk) or
/// [`random_walk_dense`](nodeflow_core::random_walk_dense). `θ` is the
/// `(channels, k)` matrix `weight`.
///
/// # Reference
///
/// Li et al., "Diffusion Convolutional Recurrent Neural Network:
/// Data-Driven Traffic Forecasting", ICLR 2018.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConv {
    pub channels: usize,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl DiffusionConv {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            k: default_k(),
            options: LayerOptions::default(),
        }
    }
}

impl ConvSpec for DiffusionConv {
    type Layer = DiffusionLayer;

    const NAME: &'static str = "DiffusionConv";

    const SUPPORTS: &'static [AdjacencyKind] = ALL_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::config("DiffusionConv: channels must be positive"));
        }
        if self.k == 0 {
            return Err(Error::config("DiffusionConv: k must be at least 1"));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<DiffusionLayer> {
        let filters = Dense::projection(self.k, self.channels, &self.options, vb.clone())?;
        let bias = if self.options.use_bias {
            Some(self.options.bias(&vb, self.channels, "bias")?)
        } else {
            None
        };
        Ok(DiffusionLayer {
            engine: MessagePassing::new(Self::NAME, Aggregation::Sum, Self::SUPPORTS),
            filters,
            bias,
            k: self.k,
            in_features: input.features,
            activation: self.options.activation,
        })
    }
}

/// A built [`DiffusionConv`].
#[derive(Debug, Clone)]
pub struct DiffusionLayer {
    engine: MessagePassing,
    filters: Dense,
    bias: Option<Param>,
    k: usize,
    in_features: usize,
    activation: Activation,
}

/// One diffusion step: weighted-source messages summed per node.
impl MessageFunction for DiffusionLayer {}

impl GraphLayer for DiffusionLayer {
    fn name(&self) -> &'static str {
        DiffusionConv::NAME
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.filters.out_features()
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        DiffusionConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(DiffusionConv::NAME, self.in_features, x)?;
        self.engine.validate(x, adjacency, edge_features)?;

        // hop k, summed over features: (.., N, 1)
        let mut hops = Vec::with_capacity(self.k);
        let mut diffused = x.clone();
        hops.push(diffused.sum_keepdim(D::Minus1)?);
        for _ in 1..self.k {
            diffused = self.engine.propagate(self, &diffused, adjacency, None, train)?;
            hops.push(diffused.sum_keepdim(D::Minus1)?);
        }
        let out = self.filters.forward(&Tensor::cat(&hops, D::Minus1)?)?;
        let out = match &self.bias {
            Some(b) => out.broadcast_add(&b.value()?)?,
            None => out,
        };
        self.activation.apply(&out)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        total_penalty(self.filters.params().chain(self.bias.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use nodeflow_core::{random_walk_dense, EdgeIndex};

    fn cycle() -> EdgeIndex {
        EdgeIndex::from_pairs(&[(0, 1), (1, 2), (2, 0), (0, 2)], 3).unwrap()
    }

    #[test]
    fn one_hop_filter_reads_neighbour_sums() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = DiffusionConv::new(2);
        spec.k = 2;
        spec.options.use_bias = false;
        let layer = spec.build(InputSpec::new(2, AdjacencyKind::Sparse), vb).unwrap();
        // channel 0 keeps hop 0, channel 1 keeps hop 1
        varmap
            .set_one("weight", Tensor::eye(2, DType::F32, &device).unwrap())
            .unwrap();

        let x = Tensor::new(&[[1f32, 1.0], [2.0, 0.0], [0.0, 4.0]], &device).unwrap();
        let out = layer
            .forward(&x, &cycle().random_walk().into(), None)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        // node 0 averages nodes 1 and 2; nodes 1 and 2 copy one neighbour
        assert_eq!(out, vec![vec![2.0, 3.0], vec![2.0, 4.0], vec![4.0, 2.0]]);
    }

    #[test]
    fn dense_and_sparse_agree() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let spec = DiffusionConv::new(3);
        let sparse = spec.build(InputSpec::new(2, AdjacencyKind::Sparse), vb.clone()).unwrap();
        let dense = spec.build(InputSpec::new(2, AdjacencyKind::Dense), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();
        let t = random_walk_dense(&cycle().to_dense(&device).unwrap()).unwrap();
        let s = sparse.forward(&x, &cycle().random_walk().into(), None).unwrap();
        let d = dense.forward(&x, &Adjacency::dense(t).unwrap(), None).unwrap();
        let diff = (s - d).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5, "{diff}");
    }

    #[test]
    fn batch_mode_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = DiffusionConv::new(4)
            .build(InputSpec::new(2, AdjacencyKind::Batch), vb)
            .unwrap();
        let m = cycle().to_dense(&device).unwrap();
        let a = Tensor::stack(&[m.clone(), m], 0).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 2), &device).unwrap();
        let out = layer
            .forward(&x, &Adjacency::batch(random_walk_dense(&a).unwrap()).unwrap(), None)
            .unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
    }

    #[test]
    fn zero_hops_are_rejected() {
        let mut spec = DiffusionConv::new(2);
        spec.k = 0;
        assert!(matches!(spec.validate(), Err(Error::InvalidConfig(_))));
    }
}
