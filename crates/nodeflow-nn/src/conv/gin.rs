use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use nodeflow_core::{Adjacency, AdjacencyKind, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{default_true, ALL_KINDS};
use crate::aggregate::Aggregation;
use crate::dense::Mlp;
use crate::layer::{check_width, ConvSpec, GraphLayer, InputSpec};
use crate::message::{MessageFunction, MessagePassing};
use crate::params::{total_penalty, Activation, LayerOptions};

fn default_mlp_activation() -> Activation {
    Activation::Relu
}

/// Graph Isomorphism Network convolution.
///
/// ```text
/// x_i' = MLP((1 + eps) · x_i + Σ_{j ∈ N(i)} x_j)
/// ```
///
/// `eps` is a learned scalar (parameter `eps`, initialized to zero) unless
/// `learn_epsilon` is off, in which case it is `epsilon` or zero. The MLP
/// lives under `mlp.*`; its output layer carries the layer activation and
/// bias flag.
///
/// Sum aggregation keeps the update injective over neighbour multisets.
/// Other aggregations are accepted but lose that property.
///
/// # Reference
///
/// Xu et al., "How Powerful are Graph Neural Networks?", ICLR 2019.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GINConv {
    pub channels: usize,
    #[serde(default)]
    pub epsilon: Option<f64>,
    #[serde(default = "default_true")]
    pub learn_epsilon: bool,
    #[serde(default)]
    pub mlp_hidden: Vec<usize>,
    #[serde(default = "default_mlp_activation")]
    pub mlp_activation: Activation,
    #[serde(default = "default_true")]
    pub mlp_batchnorm: bool,
    #[serde(default)]
    pub aggregate: Aggregation,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl GINConv {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            epsilon: None,
            learn_epsilon: true,
            mlp_hidden: Vec::new(),
            mlp_activation: default_mlp_activation(),
            mlp_batchnorm: true,
            aggregate: Aggregation::Sum,
            options: LayerOptions::default(),
        }
    }

    /// Keep `eps` fixed at `epsilon` instead of learning it.
    pub fn fixed_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self.learn_epsilon = false;
        self
    }
}

impl ConvSpec for GINConv {
    type Layer = GINLayer;

    const NAME: &'static str = "GINConv";

    const SUPPORTS: &'static [AdjacencyKind] = ALL_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::config("GINConv: channels must be positive"));
        }
        if self.learn_epsilon && self.epsilon.is_some() {
            return Err(Error::config(
                "GINConv: learn_epsilon cannot be combined with a fixed epsilon",
            ));
        }
        if self.mlp_hidden.contains(&0) {
            return Err(Error::config("GINConv: mlp_hidden widths must be positive"));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<GINLayer> {
        if self.aggregate != Aggregation::Sum {
            warn!(
                aggregate = %self.aggregate,
                "GINConv with non-sum aggregation is no longer injective over neighbour multisets"
            );
        }
        let eps = if self.learn_epsilon {
            Epsilon::Learned(vb.get_with_hints(1, "eps", Init::Const(0.0))?)
        } else {
            Epsilon::Fixed(self.epsilon.unwrap_or(0.0))
        };
        let mlp = Mlp::new(
            input.features,
            &self.mlp_hidden,
            self.channels,
            self.mlp_activation,
            self.mlp_batchnorm,
            &self.options,
            vb.pp("mlp"),
        )?;
        Ok(GINLayer {
            engine: MessagePassing::new(Self::NAME, self.aggregate, Self::SUPPORTS),
            eps,
            mlp,
            in_features: input.features,
        })
    }
}

#[derive(Debug, Clone)]
enum Epsilon {
    Learned(Tensor),
    Fixed(f64),
}

/// A built [`GINConv`].
#[derive(Debug, Clone)]
pub struct GINLayer {
    engine: MessagePassing,
    eps: Epsilon,
    mlp: Mlp,
    in_features: usize,
}

impl GINLayer {
    /// Current value of `eps`.
    pub fn epsilon(&self) -> Result<f64> {
        match &self.eps {
            Epsilon::Learned(t) => Ok(t.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?[0]),
            Epsilon::Fixed(v) => Ok(*v),
        }
    }
}

impl MessageFunction for GINLayer {
    fn update(&self, aggregated: Tensor, x: &Tensor, train: bool) -> Result<Tensor> {
        let own = match &self.eps {
            Epsilon::Learned(eps) => x.broadcast_mul(&eps.affine(1.0, 1.0)?)?,
            Epsilon::Fixed(eps) => x.affine(1.0 + eps, 0.0)?,
        };
        self.mlp.forward_t(&(own + aggregated)?, train)
    }
}

impl GraphLayer for GINLayer {
    fn name(&self) -> &'static str {
        GINConv::NAME
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.mlp.out_features()
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        GINConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(GINConv::NAME, self.in_features, x)?;
        self.engine.run(self, x, adjacency, edge_features, train)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        total_penalty(self.mlp.params())
    }
}
