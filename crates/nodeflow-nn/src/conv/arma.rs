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

fn default_one() -> usize {
    1
}

fn default_gcn_activation() -> Activation {
    Activation::Relu
}

/// ARMA convolution: an average of `order` parallel stacks, each running
/// `iterations` recursive graph convolution steps with a skip connection to
/// the layer input.
///
/// ```text
/// X_k^(0)   = X
/// X_k^(t+1) = gcn_act(Â X_k^(t) W_k^(t) + dropout(X) V_k^(t) + b_k^(t))
/// X'        = act(mean_k X_k^(T))
/// ```
///
/// `Â` is expected to be the symmetrically normalized adjacency without
/// self-loops ([`EdgeIndex::sym_normalized`](nodeflow_core::EdgeIndex::sym_normalized)
/// or [`normalize_dense`](nodeflow_core::normalize_dense) with
/// `add_self_loops = false`). With `share_weights`, every step after the
/// first reuses the second step's parameters within its stack.
///
/// Parameters of step `t` in stack `k` live under `stack_{k}.iter_{t}`:
/// `kernel.weight`, `root.weight` and `bias`.
///
/// # Reference
///
/// Bianchi et al., "Graph Neural Networks with Convolutional ARMA Filters",
/// IEEE TPAMI 2021.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ARMAConv {
    pub channels: usize,
    #[serde(default = "default_one")]
    pub order: usize,
    #[serde(default = "default_one")]
    pub iterations: usize,
    #[serde(default)]
    pub share_weights: bool,
    #[serde(default = "default_gcn_activation")]
    pub gcn_activation: Activation,
    #[serde(default)]
    pub dropout_rate: f64,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl ARMAConv {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            order: 1,
            iterations: 1,
            share_weights: false,
            gcn_activation: default_gcn_activation(),
            dropout_rate: 0.0,
            options: LayerOptions::default(),
        }
    }

    /// Steps with their own parameters per stack.
    fn distinct_steps(&self) -> usize {
        if self.share_weights {
            self.iterations.min(2)
        } else {
            self.iterations
        }
    }
}

impl ConvSpec for ARMAConv {
    type Layer = ARMALayer;

    const NAME: &'static str = "ARMAConv";

    const SUPPORTS: &'static [AdjacencyKind] = ALL_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.order == 0 || self.iterations == 0 {
            return Err(Error::config("ARMAConv: channels, order and iterations must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::config(format!(
                "ARMAConv: dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<ARMALayer> {
        let mut stacks = Vec::with_capacity(self.order);
        for k in 0..self.order {
            let steps = (0..self.distinct_steps())
                .map(|t| {
                    let vb = vb.pp(format!("stack_{k}.iter_{t}"));
                    let width = if t == 0 { input.features } else { self.channels };
                    ArmaStep::new(width, input.features, self.channels, &self.options, vb)
                })
                .collect::<Result<Vec<_>>>()?;
            stacks.push(steps);
        }
        Ok(ARMALayer {
            engine: MessagePassing::new(Self::NAME, Aggregation::Sum, Self::SUPPORTS),
            stacks,
            iterations: self.iterations,
            in_features: input.features,
            channels: self.channels,
            gcn_activation: self.gcn_activation,
            dropout_rate: self.dropout_rate,
            activation: self.options.activation,
        })
    }
}

/// One recursive step: propagate through `kernel`, skip through `root`.
#[derive(Debug, Clone)]
struct ArmaStep {
    kernel: Dense,
    root: Dense,
    bias: Option<Param>,
}

impl ArmaStep {
    fn new(width: usize, in_features: usize, channels: usize, options: &LayerOptions, vb: VarBuilder) -> Result<Self> {
        let bias = if options.use_bias {
            Some(options.bias(&vb, channels, "bias")?)
        } else {
            None
        };
        Ok(Self {
            kernel: Dense::projection(width, channels, options, vb.pp("kernel"))?,
            root: Dense::projection(in_features, channels, options, vb.pp("root"))?,
            bias,
        })
    }

    fn params(&self) -> impl Iterator<Item = &Param> {
        self.kernel.params().chain(self.root.params()).chain(self.bias.as_ref())
    }
}

/// A built [`ARMAConv`].
#[derive(Debug, Clone)]
pub struct ARMALayer {
    engine: MessagePassing,
    stacks: Vec<Vec<ArmaStep>>,
    iterations: usize,
    in_features: usize,
    channels: usize,
    gcn_activation: Activation,
    dropout_rate: f64,
    activation: Activation,
}

/// Weighted-source messages summed per node: one application of `Â`.
impl MessageFunction for ARMALayer {}

impl ARMALayer {
    fn stack(&self, steps: &[ArmaStep], x: &Tensor, adjacency: &Adjacency, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for t in 0..self.iterations {
            let step = &steps[t.min(steps.len() - 1)];
            let skip = if train && self.dropout_rate > 0.0 {
                candle_nn::ops::dropout(x, self.dropout_rate as f32)?
            } else {
                x.clone()
            };
            let propagated = self
                .engine
                .propagate(self, &step.kernel.forward(&h)?, adjacency, None, train)?;
            let mut out = (propagated + step.root.forward(&skip)?)?;
            if let Some(b) = &step.bias {
                out = out.broadcast_add(&b.value()?)?;
            }
            h = self.gcn_activation.apply(&out)?;
        }
        Ok(h)
    }
}

impl GraphLayer for ARMALayer {
    fn name(&self) -> &'static str {
        ARMAConv::NAME
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.channels
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        ARMAConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(ARMAConv::NAME, self.in_features, x)?;
        self.engine.validate(x, adjacency, edge_features)?;

        let outputs = self
            .stacks
            .iter()
            .map(|steps| self.stack(steps, x, adjacency, train))
            .collect::<Result<Vec<_>>>()?;
        let rank = x.rank();
        let mean = Tensor::stack(&outputs, rank)?.mean(rank)?;
        self.activation.apply(&mean)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        total_penalty(self.stacks.iter().flatten().flat_map(ArmaStep::params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use nodeflow_core::{normalize_dense, EdgeIndex};

    fn path() -> EdgeIndex {
        EdgeIndex::from_pairs(&[(0, 1), (1, 0), (1, 2), (2, 1)], 3).unwrap()
    }

    #[test]
    fn shared_weights_create_two_steps_per_stack() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = ARMAConv::new(4);
        spec.order = 2;
        spec.iterations = 3;
        spec.share_weights = true;
        let layer = spec.build(InputSpec::new(2, AdjacencyKind::Sparse), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();
        let out = layer.forward(&x, &path().sym_normalized().into(), None).unwrap();
        assert_eq!(out.dims(), &[3, 4]);

        let data = varmap.data().lock().unwrap();
        // kernel, root, bias for steps 0 and 1 of two stacks
        assert_eq!(data.len(), 12);
        assert!(data.contains_key("stack_1.iter_1.kernel.weight"));
        assert!(!data.contains_key("stack_0.iter_2.kernel.weight"));
    }

    #[test]
    fn single_step_is_gcn_plus_skip() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = ARMAConv::new(2);
        spec.gcn_activation = Activation::Linear;
        spec.options.use_bias = false;
        let layer = spec.build(InputSpec::new(2, AdjacencyKind::Sparse), vb).unwrap();
        let eye = Tensor::eye(2, DType::F32, &device).unwrap();
        varmap.set_one("stack_0.iter_0.kernel.weight", eye.clone()).unwrap();
        varmap.set_one("stack_0.iter_0.root.weight", eye).unwrap();

        let x = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [2.0, 2.0]], &device).unwrap();
        let out = layer.forward(&x, &path().into(), None).unwrap().to_vec2::<f32>().unwrap();
        // x_i + Σ_j x_j
        assert_eq!(out, vec![vec![1.0, 1.0], vec![3.0, 3.0], vec![2.0, 3.0]]);
    }

    #[test]
    fn dense_and_sparse_agree() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut spec = ARMAConv::new(3);
        spec.order = 2;
        spec.iterations = 2;
        let sparse = spec.build(InputSpec::new(2, AdjacencyKind::Sparse), vb.clone()).unwrap();
        let dense = spec.build(InputSpec::new(2, AdjacencyKind::Dense), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();
        let a = normalize_dense(&path().to_dense(&device).unwrap(), false).unwrap();
        let s = sparse.forward(&x, &path().sym_normalized().into(), None).unwrap();
        let d = dense.forward(&x, &Adjacency::dense(a).unwrap(), None).unwrap();
        let diff = (s - d).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5, "{diff}");
    }

    #[test]
    fn zero_iterations_are_rejected() {
        let mut spec = ARMAConv::new(2);
        spec.iterations = 0;
        assert!(matches!(spec.validate(), Err(Error::InvalidConfig(_))));
    }
}
