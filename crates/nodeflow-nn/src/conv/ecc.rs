use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use nodeflow_core::{Adjacency, AdjacencyKind, Error, Result};
use serde::{Deserialize, Serialize};

use super::{default_true, SPARSE_KINDS};
use crate::aggregate::Aggregation;
use crate::dense::{Dense, Mlp};
use crate::layer::{check_width, ConvSpec, GraphLayer, InputSpec};
use crate::message::{EdgeContext, Message, MessageFunction, MessagePassing};
use crate::params::{total_penalty, Activation, LayerOptions, Param};

/// Edge-conditioned convolution.
///
/// A kernel network maps the features `e_ji` of every edge to a full
/// `(F, channels)` weight matrix, so each edge filters its source in its own
/// way:
///
/// ```text
/// x_i' = act(x_i W_root + AGG_j x_j K(e_ji) + b)
/// ```
///
/// `K` is an MLP with ReLU hidden layers of width `kernel_network` and a
/// linear output of width `F * channels`. Build with
/// [`InputSpec::with_edge_features`] and pass edge features on every call.
/// Edge weights scale the messages.
///
/// Parameters: `kernel_network.*` (an [`Mlp`]), `root.weight`, `bias`.
///
/// # Reference
///
/// Simonovsky & Komodakis, "Dynamic Edge-Conditioned Filters in
/// Convolutional Neural Networks on Graphs", CVPR 2017.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ECCConv {
    pub channels: usize,
    #[serde(default)]
    pub kernel_network: Vec<usize>,
    #[serde(default = "default_true")]
    pub root: bool,
    #[serde(default)]
    pub aggregate: Aggregation,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl ECCConv {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            kernel_network: Vec::new(),
            root: true,
            aggregate: Aggregation::Sum,
            options: LayerOptions::default(),
        }
    }
}

impl ConvSpec for ECCConv {
    type Layer = ECCLayer;

    const NAME: &'static str = "ECCConv";

    const SUPPORTS: &'static [AdjacencyKind] = SPARSE_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::config("ECCConv: channels must be positive"));
        }
        if self.kernel_network.contains(&0) {
            return Err(Error::config("ECCConv: kernel_network widths must be positive"));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<ECCLayer> {
        if input.edge_features == 0 {
            return Err(Error::shape(
                "ECCConv needs an edge feature width; build with InputSpec::with_edge_features",
            ));
        }
        let kernel_options = LayerOptions {
            activation: Activation::Linear,
            use_bias: true,
            ..self.options.clone()
        };
        let kernel_network = Mlp::new(
            input.edge_features,
            &self.kernel_network,
            input.features * self.channels,
            Activation::Relu,
            false,
            &kernel_options,
            vb.pp("kernel_network"),
        )?;
        let root = if self.root {
            Some(Dense::projection(input.features, self.channels, &self.options, vb.pp("root"))?)
        } else {
            None
        };
        let bias = if self.options.use_bias {
            Some(self.options.bias(&vb, self.channels, "bias")?)
        } else {
            None
        };
        Ok(ECCLayer {
            engine: MessagePassing::new(Self::NAME, self.aggregate, Self::SUPPORTS),
            kernel_network,
            root,
            bias,
            in_features: input.features,
            edge_features: input.edge_features,
            channels: self.channels,
            activation: self.options.activation,
        })
    }
}

/// A built [`ECCConv`].
#[derive(Debug, Clone)]
pub struct ECCLayer {
    engine: MessagePassing,
    kernel_network: Mlp,
    root: Option<Dense>,
    bias: Option<Param>,
    in_features: usize,
    edge_features: usize,
    channels: usize,
    activation: Activation,
}

impl ECCLayer {
    pub fn edge_features(&self) -> usize {
        self.edge_features
    }

    /// Per-edge kernels `(E, F, channels)`.
    fn kernels(&self, edge_features: &Tensor, num_edges: usize) -> Result<Tensor> {
        let e = edge_features.reshape((num_edges, self.edge_features))?;
        let flat = self.kernel_network.forward_t(&e, false)?;
        Ok(flat.reshape((num_edges, self.in_features, self.channels))?)
    }
}

impl MessageFunction for ECCLayer {
    fn message(&self, source: &Tensor, _target: &Tensor, edges: &EdgeContext<'_>) -> Result<Message> {
        let Some(features) = edges.features() else {
            // edgeless graph: the engine only reads the message shape
            let mut dims = source.dims().to_vec();
            if let Some(last) = dims.last_mut() {
                *last = self.channels;
            }
            return Ok(Message::new(Tensor::zeros(dims, source.dtype(), source.device())?));
        };
        let kernels = self.kernels(features, edges.num_edges())?.to_dtype(source.dtype())?;
        // (.., E, F, 1) * (E, F, C) summed over F
        let filtered = source
            .unsqueeze(source.rank())?
            .broadcast_mul(&kernels)?
            .sum(edges.axis() + 1)?;
        Ok(Message::new(edges.weigh(&filtered)?))
    }

    fn update(&self, aggregated: Tensor, x: &Tensor, _train: bool) -> Result<Tensor> {
        let mut out = aggregated;
        if let Some(root) = &self.root {
            out = (out + root.forward(x)?)?;
        }
        if let Some(b) = &self.bias {
            out = out.broadcast_add(&b.value()?)?;
        }
        self.activation.apply(&out)
    }
}

impl GraphLayer for ECCLayer {
    fn name(&self) -> &'static str {
        ECCConv::NAME
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.channels
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        ECCConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(ECCConv::NAME, self.in_features, x)?;
        let Some(ef) = edge_features else {
            return Err(Error::shape("ECCConv needs edge features on every call"));
        };
        let width = if ef.rank() >= 2 { ef.dim(D::Minus1)? } else { 1 };
        if width != self.edge_features {
            return Err(Error::shape(format!(
                "ECCConv was built for {} edge features, got {:?}",
                self.edge_features,
                ef.dims()
            )));
        }
        self.engine.run(self, x, adjacency, Some(ef), train)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        let root = self.root.iter().flat_map(Dense::params);
        total_penalty(self.kernel_network.params().chain(root).chain(self.bias.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use nodeflow_core::EdgeIndex;

    fn edges() -> EdgeIndex {
        EdgeIndex::from_pairs(&[(0, 1), (0, 2), (1, 0), (2, 2)], 3).unwrap()
    }

    fn input() -> InputSpec {
        InputSpec::new(2, AdjacencyKind::Sparse).with_edge_features(3)
    }

    #[test]
    fn constant_identity_kernel_sums_neighbours() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = ECCConv::new(2);
        spec.root = false;
        spec.options.use_bias = false;
        let layer = spec.build(input(), vb).unwrap();
        varmap
            .set_one("kernel_network.out.weight", Tensor::zeros((4, 3), DType::F32, &device).unwrap())
            .unwrap();
        // K(e) = I for every edge, laid out (F, C) row-major
        varmap
            .set_one("kernel_network.out.bias", Tensor::new(&[1f32, 0.0, 0.0, 1.0], &device).unwrap())
            .unwrap();

        let x = Tensor::new(&[[1f32, 2.0], [3.0, 4.0], [5.0, 6.0]], &device).unwrap();
        let ef = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let out = layer.forward(&x, &edges().into(), Some(&ef)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out, vec![vec![8.0, 10.0], vec![1.0, 2.0], vec![5.0, 6.0]]);
    }

    #[test]
    fn edge_features_change_the_output() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = ECCConv::new(4);
        spec.kernel_network = vec![8];
        let layer = spec.build(input(), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();
        let a = Tensor::ones((4, 3), DType::F32, &device).unwrap();
        let b = a.affine(-2.0, 0.5).unwrap();
        let adj: Adjacency = edges().into();
        let out_a = layer.forward(&x, &adj, Some(&a)).unwrap();
        let out_b = layer.forward(&x, &adj, Some(&b)).unwrap();
        assert_eq!(out_a.dims(), &[3, 4]);
        let diff = (out_a - out_b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn mixed_mode_shares_edge_kernels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let input = InputSpec::new(2, AdjacencyKind::Mixed).with_edge_features(3);
        let layer = ECCConv::new(5).build(input, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 3, 2), &device).unwrap();
        let ef = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let out = layer.forward(&x, &Adjacency::Mixed(edges()), Some(&ef)).unwrap();
        assert_eq!(out.dims(), &[2, 3, 5]);
    }

    #[test]
    fn edge_features_are_required() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let err = ECCConv::new(2)
            .build(InputSpec::new(2, AdjacencyKind::Sparse), vb.clone())
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)), "{err}");

        let layer = ECCConv::new(2).build(input(), vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();
        let err = layer.forward(&x, &edges().into(), None).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)), "{err}");

        let narrow = Tensor::ones((4, 2), DType::F32, &device).unwrap();
        let err = layer.forward(&x, &edges().into(), Some(&narrow)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)), "{err}");
    }

    #[test]
    fn edgeless_graph_keeps_the_root_term() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = ECCConv::new(3).build(input(), vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();
        let ef = Tensor::zeros((0, 3), DType::F32, &device).unwrap();
        let out = layer.forward(&x, &EdgeIndex::empty(3).into(), Some(&ef)).unwrap();
        assert_eq!(out.dims(), &[3, 3]);
    }
}
