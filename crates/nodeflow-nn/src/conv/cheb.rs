use candle_core::Tensor;
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
    1
}

/// Chebyshev spectral convolution.
///
/// ```text
/// T_0 = X,  T_1 = L̂ X,  T_k = 2 L̂ T_{k-1} - T_{k-2}
/// X'  = act(Σ_{k<K} T_k W_k + b)
/// ```
///
/// The adjacency must carry the scaled Laplacian `L̂`, e.g. from
/// [`EdgeIndex::scaled_laplacian`](nodeflow_core::EdgeIndex::scaled_laplacian).
/// Kernel `k` lives under `kernel_{k}.*`.
///
/// # Reference
///
/// Defferrard et al., "Convolutional Neural Networks on Graphs with Fast
/// Localized Spectral Filtering", NeurIPS 2016.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChebConv {
    pub channels: usize,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl ChebConv {
    pub fn new(channels: usize, k: usize) -> Self {
        Self {
            channels,
            k,
            options: LayerOptions::default(),
        }
    }
}

impl ConvSpec for ChebConv {
    type Layer = ChebLayer;

    const NAME: &'static str = "ChebConv";

    const SUPPORTS: &'static [AdjacencyKind] = ALL_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::config("ChebConv: channels must be positive"));
        }
        if self.k == 0 {
            return Err(Error::config("ChebConv: k must be at least 1"));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<ChebLayer> {
        let kernels = (0..self.k)
            .map(|k| Dense::projection(input.features, self.channels, &self.options, vb.pp(format!("kernel_{k}"))))
            .collect::<Result<Vec<_>>>()?;
        let bias = if self.options.use_bias {
            Some(self.options.bias(&vb, self.channels, "bias")?)
        } else {
            None
        };
        Ok(ChebLayer {
            engine: MessagePassing::new(Self::NAME, Aggregation::Sum, Self::SUPPORTS),
            kernels,
            bias,
            in_features: input.features,
            channels: self.channels,
            activation: self.options.activation,
        })
    }
}

/// A built [`ChebConv`].
#[derive(Debug, Clone)]
pub struct ChebLayer {
    engine: MessagePassing,
    kernels: Vec<Dense>,
    bias: Option<Param>,
    in_features: usize,
    channels: usize,
    activation: Activation,
}

/// Weighted-source messages summed per node: one application of `L̂`.
impl MessageFunction for ChebLayer {}

impl GraphLayer for ChebLayer {
    fn name(&self) -> &'static str {
        ChebConv::NAME
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.channels
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        ChebConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(ChebConv::NAME, self.in_features, x)?;
        self.engine.validate(x, adjacency, edge_features)?;

        let mut prev = x.clone();
        let mut out = self.kernels[0].forward(&prev)?;
        if let Some(kernel) = self.kernels.get(1) {
            let mut cur = self.engine.propagate(self, x, adjacency, None, train)?;
            out = (out + kernel.forward(&cur)?)?;
            for kernel in &self.kernels[2..] {
                let next = (self.engine.propagate(self, &cur, adjacency, None, train)?.affine(2.0, 0.0)? - &prev)?;
                out = (out + kernel.forward(&next)?)?;
                prev = cur;
                cur = next;
            }
        }

        let out = match &self.bias {
            Some(b) => out.broadcast_add(&b.value()?)?,
            None => out,
        };
        self.activation.apply(&out)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        total_penalty(self.kernels.iter().flat_map(Dense::params).chain(self.bias.as_ref()))
    }
}
