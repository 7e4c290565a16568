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

/// Graph Convolutional Network layer.
///
/// ```text
/// X' = act(Â X W + b)
/// ```
///
/// `Â` is whatever adjacency is passed in; normalize it beforehand with
/// [`EdgeIndex::gcn_normalized`](nodeflow_core::EdgeIndex::gcn_normalized)
/// or [`normalize_dense`](nodeflow_core::normalize_dense).
///
/// # Reference
///
/// Kipf & Welling, "Semi-Supervised Classification with Graph Convolutional
/// Networks", ICLR 2017.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GCNConv {
    pub channels: usize,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl GCNConv {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            options: LayerOptions::default(),
        }
    }
}

impl ConvSpec for GCNConv {
    type Layer = GCNLayer;

    const NAME: &'static str = "GCNConv";

    const SUPPORTS: &'static [AdjacencyKind] = ALL_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::config("GCNConv: channels must be positive"));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<GCNLayer> {
        let kernel = Dense::projection(input.features, self.channels, &self.options, vb.clone())?;
        let bias = if self.options.use_bias {
            Some(self.options.bias(&vb, self.channels, "bias")?)
        } else {
            None
        };
        Ok(GCNLayer {
            engine: MessagePassing::new(Self::NAME, Aggregation::Sum, Self::SUPPORTS),
            kernel,
            bias,
            activation: self.options.activation,
        })
    }
}

/// A built [`GCNConv`].
#[derive(Debug, Clone)]
pub struct GCNLayer {
    engine: MessagePassing,
    kernel: Dense,
    bias: Option<Param>,
    activation: Activation,
}

impl MessageFunction for GCNLayer {
    fn update(&self, aggregated: Tensor, _x: &Tensor, _train: bool) -> Result<Tensor> {
        let out = match &self.bias {
            Some(b) => aggregated.broadcast_add(&b.value()?)?,
            None => aggregated,
        };
        self.activation.apply(&out)
    }
}

impl GraphLayer for GCNLayer {
    fn name(&self) -> &'static str {
        GCNConv::NAME
    }

    fn in_features(&self) -> usize {
        self.kernel.in_features()
    }

    fn out_features(&self) -> usize {
        self.kernel.out_features()
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        GCNConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(GCNConv::NAME, self.in_features(), x)?;
        let h = self.kernel.forward(x)?;
        self.engine.run(self, &h, adjacency, edge_features, train)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        total_penalty(self.kernel.params().chain(self.bias.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use nodeflow_core::{normalize_dense, EdgeIndex};

    #[test]
    fn dense_and_sparse_normalization_agree() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let spec = GCNConv::new(4);
        let dense_layer = spec.build(InputSpec::new(3, AdjacencyKind::Dense), vb.clone()).unwrap();
        let sparse_layer = spec.build(InputSpec::new(3, AdjacencyKind::Sparse), vb).unwrap();

        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0), (1, 2), (2, 1)], 4).unwrap();
        let a = normalize_dense(&edges.to_dense(&device).unwrap(), true).unwrap();
        let x = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();

        let d = dense_layer.forward(&x, &Adjacency::Dense(a), None).unwrap();
        let s = sparse_layer
            .forward(&x, &Adjacency::Sparse(edges.gcn_normalized()), None)
            .unwrap();
        let diff = (d - s).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5, "{diff}");
    }

    #[test]
    fn batch_mode_keeps_batch_axis() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = GCNConv::new(2)
            .build(InputSpec::new(3, AdjacencyKind::Batch), vb)
            .unwrap();
        let a = Tensor::ones((2, 4, 4), DType::F32, &device).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 4, 3), &device).unwrap();
        let out = layer.forward(&x, &Adjacency::batch(a).unwrap(), None).unwrap();
        assert_eq!(out.dims(), &[2, 4, 2]);
    }
}
