use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use nodeflow_core::{Adjacency, AdjacencyKind, Error, Result};
use serde::{Deserialize, Serialize};

use super::SPARSE_KINDS;
use crate::aggregate::Aggregation;
use crate::dense::Dense;
use crate::layer::{check_width, ConvSpec, GraphLayer, InputSpec};
use crate::message::{MessageFunction, MessagePassing};
use crate::params::{total_penalty, Activation, LayerOptions, Param};

/// Gated graph convolution.
///
/// ```text
/// h_0 = [x ‖ 0]
/// m_l = Σ_{j ∈ N(i)} h_{l-1, j} W_l
/// h_l = GRU(m_l, h_{l-1})
/// x'  = act(h_L)
/// ```
///
/// Inputs narrower than `channels` are zero-padded; wider inputs cannot be
/// built.
///
/// # Reference
///
/// Li et al., "Gated Graph Sequence Neural Networks", ICLR 2016.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatedGraphConv {
    pub channels: usize,
    pub n_layers: usize,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl GatedGraphConv {
    pub fn new(channels: usize, n_layers: usize) -> Self {
        Self {
            channels,
            n_layers,
            options: LayerOptions::default(),
        }
    }
}

impl ConvSpec for GatedGraphConv {
    type Layer = GatedGraphLayer;

    const NAME: &'static str = "GatedGraphConv";

    const SUPPORTS: &'static [AdjacencyKind] = SPARSE_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::config("GatedGraphConv: channels must be positive"));
        }
        if self.n_layers == 0 {
            return Err(Error::config("GatedGraphConv: n_layers must be at least 1"));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<GatedGraphLayer> {
        if input.features > self.channels {
            return Err(Error::shape(format!(
                "GatedGraphConv with {} channels cannot take {} input features",
                self.channels, input.features
            )));
        }
        let kernels = (0..self.n_layers)
            .map(|l| Dense::projection(self.channels, self.channels, &self.options, vb.pp(format!("kernel_{l}"))))
            .collect::<Result<Vec<_>>>()?;
        let gru = GruCell::new(self.channels, &self.options, vb.pp("gru"))?;
        Ok(GatedGraphLayer {
            engine: MessagePassing::new(Self::NAME, Aggregation::Sum, Self::SUPPORTS),
            kernels,
            gru,
            in_features: input.features,
            channels: self.channels,
            activation: self.options.activation,
        })
    }
}

/// Gated recurrent unit over feature vectors, gates ordered `[z, r, n]`.
#[derive(Debug, Clone)]
struct GruCell {
    input: Dense,
    recurrent: Dense,
    channels: usize,
}

impl GruCell {
    fn new(channels: usize, options: &LayerOptions, vb: VarBuilder) -> Result<Self> {
        let input = Dense::new(channels, 3 * channels, Activation::Linear, true, options, vb.pp("input"))?;
        let recurrent = Dense::new(channels, 3 * channels, Activation::Linear, true, options, vb.pp("recurrent"))?;
        Ok(Self {
            input,
            recurrent,
            channels,
        })
    }

    fn gate(&self, t: &Tensor, i: usize) -> Result<Tensor> {
        Ok(t.narrow(D::Minus1, i * self.channels, self.channels)?)
    }

    fn step(&self, m: &Tensor, h: &Tensor) -> Result<Tensor> {
        let xi = self.input.forward(m)?;
        let hh = self.recurrent.forward(h)?;
        let z = candle_nn::ops::sigmoid(&(self.gate(&xi, 0)? + self.gate(&hh, 0)?)?)?;
        let r = candle_nn::ops::sigmoid(&(self.gate(&xi, 1)? + self.gate(&hh, 1)?)?)?;
        let n = (self.gate(&xi, 2)? + (r * self.gate(&hh, 2)?)?)?.tanh()?;
        // h' = z * h + (1 - z) * n
        Ok(((&z * h)? + (z.affine(-1.0, 1.0)? * n)?)?)
    }

    fn params(&self) -> impl Iterator<Item = &Param> {
        self.input.params().chain(self.recurrent.params())
    }
}

/// A built [`GatedGraphConv`].
#[derive(Debug, Clone)]
pub struct GatedGraphLayer {
    engine: MessagePassing,
    kernels: Vec<Dense>,
    gru: GruCell,
    in_features: usize,
    channels: usize,
    activation: Activation,
}

impl GatedGraphLayer {
    fn pad(&self, x: &Tensor) -> Result<Tensor> {
        let missing = self.channels - self.in_features;
        if missing == 0 {
            return Ok(x.clone());
        }
        let mut shape = x.dims().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = missing;
        }
        let zeros = Tensor::zeros(shape, x.dtype(), x.device())?;
        Ok(Tensor::cat(&[x, &zeros], D::Minus1)?)
    }
}

impl MessageFunction for GatedGraphLayer {}

impl GraphLayer for GatedGraphLayer {
    fn name(&self) -> &'static str {
        GatedGraphConv::NAME
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.channels
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        GatedGraphConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(GatedGraphConv::NAME, self.in_features, x)?;
        self.engine.validate(x, adjacency, edge_features)?;
        let mut h = self.pad(x)?;
        for kernel in &self.kernels {
            let m = self.engine.propagate(self, &kernel.forward(&h)?, adjacency, None, train)?;
            h = self.gru.step(&m, &h)?;
        }
        self.activation.apply(&h)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        total_penalty(self.kernels.iter().flat_map(Dense::params).chain(self.gru.params()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use nodeflow_core::EdgeIndex;

    #[test]
    fn narrow_input_is_padded() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = GatedGraphConv::new(6, 2)
            .build(InputSpec::new(4, AdjacencyKind::Sparse), vb)
            .unwrap();
        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 2), (2, 0)], 3).unwrap();
        let x = Tensor::randn(0f32, 1f32, (3, 4), &device).unwrap();
        let out = layer.forward(&x, &edges.into(), None).unwrap();
        assert_eq!(out.dims(), &[3, 6]);
    }

    #[test]
    fn wide_input_is_rejected_at_build() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let err = GatedGraphConv::new(2, 1)
            .build(InputSpec::new(3, AdjacencyKind::Sparse), vb)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn mixed_mode_runs_per_sample() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = GatedGraphConv::new(3, 3)
            .build(InputSpec::new(3, AdjacencyKind::Mixed), vb)
            .unwrap();
        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0)], 2).unwrap();
        let x = Tensor::randn(0f32, 1f32, (4, 2, 3), &device).unwrap();
        let out = layer.forward(&x, &Adjacency::Mixed(edges), None).unwrap();
        assert_eq!(out.dims(), &[4, 2, 3]);
    }
}
