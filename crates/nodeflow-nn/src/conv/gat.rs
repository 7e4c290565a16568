use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use nodeflow_core::{Adjacency, AdjacencyKind, EdgeIndex, Error, Result};
use serde::{Deserialize, Serialize};

use super::{default_true, SPARSE_KINDS};
use crate::aggregate::{segment_softmax, Aggregation};
use crate::dense::Dense;
use crate::layer::{check_width, ConvSpec, GraphLayer, InputSpec};
use crate::message::{EdgeContext, Message, MessageFunction, MessagePassing};
use crate::params::{total_penalty, Activation, Constraint, Initializer, LayerOptions, Param, Regularizer};

fn default_heads() -> usize {
    1
}

fn default_dropout() -> f64 {
    0.5
}

fn default_slope() -> f64 {
    0.2
}

/// Graph Attention Network layer.
///
/// For every head `h`:
///
/// ```text
/// e_ij    = LeakyReLU(a_src · W x_j + a_dst · W x_i)
/// alpha_ij = softmax_j(e_ij)
/// x_i'    = Σ_j alpha_ij W x_j
/// ```
///
/// Heads are concatenated (`channels * attn_heads` outputs) or averaged
/// (`channels` outputs). Dropout on `alpha` applies in training only. Edge
/// weights and edge features are not used.
///
/// The attention vectors `a_src`, `a_dst` take their initializer,
/// regularizer and constraint from the `attn_kernel_*` fields; the
/// `kernel_*` options cover `W` only.
///
/// # Reference
///
/// Velickovic et al., "Graph Attention Networks", ICLR 2018.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GATConv {
    pub channels: usize,
    #[serde(default = "default_heads")]
    pub attn_heads: usize,
    #[serde(default = "default_true")]
    pub concat_heads: bool,
    #[serde(default = "default_dropout")]
    pub dropout_rate: f64,
    #[serde(default = "default_slope")]
    pub negative_slope: f64,
    #[serde(default = "default_true")]
    pub add_self_loops: bool,
    #[serde(default)]
    pub attn_kernel_initializer: Initializer,
    #[serde(default)]
    pub attn_kernel_regularizer: Option<Regularizer>,
    #[serde(default)]
    pub attn_kernel_constraint: Option<Constraint>,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl GATConv {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            attn_heads: default_heads(),
            concat_heads: true,
            dropout_rate: default_dropout(),
            negative_slope: default_slope(),
            add_self_loops: true,
            attn_kernel_initializer: Initializer::default(),
            attn_kernel_regularizer: None,
            attn_kernel_constraint: None,
            options: LayerOptions::default(),
        }
    }

    fn output_width(&self) -> usize {
        if self.concat_heads {
            self.channels * self.attn_heads
        } else {
            self.channels
        }
    }
}

impl ConvSpec for GATConv {
    type Layer = GATLayer;

    const NAME: &'static str = "GATConv";

    const SUPPORTS: &'static [AdjacencyKind] = SPARSE_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.attn_heads == 0 {
            return Err(Error::config("GATConv: channels and attn_heads must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::config(format!(
                "GATConv: dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<GATLayer> {
        let (heads, channels) = (self.attn_heads, self.channels);
        let kernel = Dense::projection(input.features, heads * channels, &self.options, vb.clone())?;
        // attention vectors are (heads, channels) kernels with fan_in = channels
        let attn = LayerOptions {
            kernel_initializer: self.attn_kernel_initializer,
            kernel_regularizer: self.attn_kernel_regularizer,
            kernel_constraint: self.attn_kernel_constraint,
            ..self.options.clone()
        };
        let attn_src = attn.kernel(&vb, channels, heads, "attn_src")?;
        let attn_dst = attn.kernel(&vb, channels, heads, "attn_dst")?;
        let bias = if self.options.use_bias {
            Some(self.options.bias(&vb, self.output_width(), "bias")?)
        } else {
            None
        };
        Ok(GATLayer {
            engine: MessagePassing::new(Self::NAME, Aggregation::Softmax, Self::SUPPORTS),
            kernel,
            attn_src,
            attn_dst,
            bias,
            heads,
            channels,
            concat_heads: self.concat_heads,
            dropout_rate: self.dropout_rate,
            negative_slope: self.negative_slope,
            add_self_loops: self.add_self_loops,
            activation: self.options.activation,
        })
    }
}

/// A built [`GATConv`].
#[derive(Debug, Clone)]
pub struct GATLayer {
    engine: MessagePassing,
    kernel: Dense,
    attn_src: Param,
    attn_dst: Param,
    bias: Option<Param>,
    heads: usize,
    channels: usize,
    concat_heads: bool,
    dropout_rate: f64,
    negative_slope: f64,
    add_self_loops: bool,
    activation: Activation,
}

impl GATLayer {
    /// Per-head score `a · h` for features shaped `(.., heads, channels)`.
    fn head_scores(h: &Tensor, attn: &Param) -> Result<Tensor> {
        Ok(h.broadcast_mul(&attn.value()?)?.sum(D::Minus1)?)
    }

    /// Attention coefficients `(E, heads)` (or `(B, E, heads)` in mixed mode),
    /// aligned with the edge list the layer actually propagates over.
    pub fn attention_coefficients(&self, x: &Tensor, adjacency: &Adjacency) -> Result<(EdgeIndex, Tensor)> {
        check_width(GATConv::NAME, self.in_features(), x)?;
        let adjacency = self.with_loops(adjacency)?;
        self.engine.validate(x, &adjacency, None)?;
        let Some(edges) = adjacency.edges() else {
            return Err(Error::shape("GATConv needs an edge list"));
        };
        let axis = x.rank() - 2;
        let h = self.kernel.forward(x)?;
        let (targets, sources) = edges.index_tensors(x.device())?;
        let src = self.split_heads(&h.index_select(&sources, axis)?)?;
        let dst = self.split_heads(&h.index_select(&targets, axis)?)?;
        let scores = self.score(&src, &dst)?;
        let alpha = segment_softmax(&scores, edges.targets(), edges.num_nodes(), axis)?;
        Ok((edges.clone(), alpha))
    }

    fn with_loops(&self, adjacency: &Adjacency) -> Result<Adjacency> {
        if self.add_self_loops {
            adjacency.map_edges(EdgeIndex::with_self_loops)
        } else {
            Ok(adjacency.clone())
        }
    }

    /// `(.., heads * channels)` → `(.., heads, channels)`.
    fn split_heads(&self, h: &Tensor) -> Result<Tensor> {
        let mut shape = h.dims().to_vec();
        shape.pop();
        shape.extend([self.heads, self.channels]);
        Ok(h.reshape(shape)?)
    }

    fn score(&self, source: &Tensor, target: &Tensor) -> Result<Tensor> {
        let e = (Self::head_scores(source, &self.attn_src)? + Self::head_scores(target, &self.attn_dst)?)?;
        Ok(candle_nn::ops::leaky_relu(&e, self.negative_slope)?)
    }
}

impl MessageFunction for GATLayer {
    fn message(&self, source: &Tensor, target: &Tensor, _edges: &EdgeContext<'_>) -> Result<Message> {
        let source = self.split_heads(source)?;
        let target = self.split_heads(target)?;
        let score = self.score(&source, &target)?;
        Ok(Message::scored(source, score))
    }

    fn attention(&self, coefficients: Tensor, train: bool) -> Result<Tensor> {
        if train && self.dropout_rate > 0.0 {
            Ok(candle_nn::ops::dropout(&coefficients, self.dropout_rate as f32)?)
        } else {
            Ok(coefficients)
        }
    }

    fn update(&self, aggregated: Tensor, _x: &Tensor, _train: bool) -> Result<Tensor> {
        // aggregated: (.., N, heads, channels)
        let out = if self.concat_heads {
            aggregated.flatten_from(aggregated.rank() - 2)?
        } else {
            aggregated.mean(aggregated.rank() - 2)?
        };
        let out = match &self.bias {
            Some(b) => out.broadcast_add(&b.value()?)?,
            None => out,
        };
        self.activation.apply(&out)
    }
}

impl GraphLayer for GATLayer {
    fn name(&self) -> &'static str {
        GATConv::NAME
    }

    fn in_features(&self) -> usize {
        self.kernel.in_features()
    }

    fn out_features(&self) -> usize {
        if self.concat_heads {
            self.heads * self.channels
        } else {
            self.channels
        }
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        GATConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(GATConv::NAME, self.in_features(), x)?;
        // edge features are checked against the caller's edge list, before loops are added
        self.engine.validate(x, adjacency, edge_features)?;
        let adjacency = self.with_loops(adjacency)?;
        let h = self.kernel.forward(x)?;
        self.engine.run(self, &h, &adjacency, None, train)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        let params = self
            .kernel
            .params()
            .chain([&self.attn_src, &self.attn_dst])
            .chain(self.bias.as_ref());
        total_penalty(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn ring() -> EdgeIndex {
        EdgeIndex::from_pairs(&[(0, 1), (1, 2), (2, 3), (3, 0), (0, 2)], 4).unwrap()
    }

    #[test]
    fn heads_concat_or_average() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (4, 5), &device).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = GATConv::new(3);
        spec.attn_heads = 2;
        let concat = spec.build(InputSpec::new(5, AdjacencyKind::Sparse), vb).unwrap();
        let out = concat.forward(&x, &ring().into(), None).unwrap();
        assert_eq!(out.dims(), &[4, 6]);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        spec.concat_heads = false;
        let averaged = spec.build(InputSpec::new(5, AdjacencyKind::Sparse), vb).unwrap();
        let out = averaged.forward(&x, &ring().into(), None).unwrap();
        assert_eq!(out.dims(), &[4, 3]);
    }

    #[test]
    fn coefficients_sum_to_one_per_node() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = GATConv::new(2);
        spec.attn_heads = 3;
        let layer = spec.build(InputSpec::new(5, AdjacencyKind::Sparse), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (4, 5), &device).unwrap();
        let (edges, alpha) = layer.attention_coefficients(&x, &ring().into()).unwrap();
        let alpha = alpha.to_vec2::<f32>().unwrap();
        for node in 0..4u32 {
            for head in 0..3 {
                let total: f32 = edges
                    .targets()
                    .iter()
                    .zip(&alpha)
                    .filter(|(t, _)| **t == node)
                    .map(|(_, a)| a[head])
                    .sum();
                assert!((total - 1.0).abs() < 1e-5, "node {node} head {head}: {total}");
            }
        }
    }

    #[test]
    fn mixed_mode_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = GATConv::new(4);
        spec.attn_heads = 2;
        let layer = spec.build(InputSpec::new(3, AdjacencyKind::Mixed), vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 4, 3), &device).unwrap();
        let out = layer.forward_t(&x, &Adjacency::Mixed(ring()), None, true).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);
    }

    #[test]
    fn kernel_constraint_leaves_attention_vectors_alone() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = GATConv::new(2);
        spec.options.kernel_constraint = Some(Constraint::NonNeg);
        let layer = spec.build(InputSpec::new(3, AdjacencyKind::Sparse), vb).unwrap();
        varmap
            .set_one("attn_src", Tensor::full(-1f32, (1, 2), &device).unwrap())
            .unwrap();
        varmap
            .set_one("weight", Tensor::full(-1f32, (2, 3), &device).unwrap())
            .unwrap();

        let attn = layer.attn_src.value().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(attn, vec![vec![-1.0, -1.0]]);
        let w = layer.kernel.params().next().unwrap().value().unwrap();
        assert_eq!(w.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

        spec.attn_kernel_constraint = Some(Constraint::NonNeg);
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = spec.build(InputSpec::new(3, AdjacencyKind::Sparse), vb).unwrap();
        varmap
            .set_one("attn_src", Tensor::full(-1f32, (1, 2), &device).unwrap())
            .unwrap();
        let attn = layer.attn_src.value().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(attn, vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn dense_adjacency_is_unsupported() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let err = GATConv::new(4)
            .build(InputSpec::new(3, AdjacencyKind::Dense), vb)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedMode { layer: "GATConv", .. }));
    }
}
