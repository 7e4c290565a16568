use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use nodeflow_core::{Adjacency, AdjacencyKind, Error, Result};
use serde::{Deserialize, Serialize};

use super::{default_true, SPARSE_KINDS};
use crate::aggregate::Aggregation;
use crate::dense::Dense;
use crate::layer::{check_width, ConvSpec, GraphLayer, InputSpec};
use crate::message::{MessageFunction, MessagePassing};
use crate::params::{total_penalty, Activation, LayerOptions};

const L2_EPS: f64 = 1e-12;

fn default_aggregate() -> Aggregation {
    Aggregation::Mean
}

/// GraphSAGE layer.
///
/// ```text
/// x_i' = act(norm([x_i ‖ AGG_{j ∈ N(i)} x_j] W + b))
/// ```
///
/// `norm` is row-wise L2 normalization when `normalize` is set.
///
/// # Reference
///
/// Hamilton et al., "Inductive Representation Learning on Large Graphs",
/// NeurIPS 2017.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSageConv {
    pub channels: usize,
    #[serde(default = "default_aggregate")]
    pub aggregate: Aggregation,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(flatten)]
    pub options: LayerOptions,
}

impl GraphSageConv {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            aggregate: default_aggregate(),
            normalize: true,
            options: LayerOptions::default(),
        }
    }
}

impl ConvSpec for GraphSageConv {
    type Layer = GraphSageLayer;

    const NAME: &'static str = "GraphSageConv";

    const SUPPORTS: &'static [AdjacencyKind] = SPARSE_KINDS;

    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(Error::config("GraphSageConv: channels must be positive"));
        }
        Ok(())
    }

    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<GraphSageLayer> {
        let dense = Dense::new(
            2 * input.features,
            self.channels,
            Activation::Linear,
            self.options.use_bias,
            &self.options,
            vb,
        )?;
        Ok(GraphSageLayer {
            engine: MessagePassing::new(Self::NAME, self.aggregate, Self::SUPPORTS),
            dense,
            in_features: input.features,
            normalize: self.normalize,
            activation: self.options.activation,
        })
    }
}

/// A built [`GraphSageConv`].
#[derive(Debug, Clone)]
pub struct GraphSageLayer {
    engine: MessagePassing,
    dense: Dense,
    in_features: usize,
    normalize: bool,
    activation: Activation,
}

impl MessageFunction for GraphSageLayer {
    fn update(&self, aggregated: Tensor, x: &Tensor, _train: bool) -> Result<Tensor> {
        let h = self.dense.forward(&Tensor::cat(&[x, &aggregated], D::Minus1)?)?;
        let h = if self.normalize {
            let norm = h.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(L2_EPS)?;
            h.broadcast_div(&norm)?
        } else {
            h
        };
        self.activation.apply(&h)
    }
}

impl GraphLayer for GraphSageLayer {
    fn name(&self) -> &'static str {
        GraphSageConv::NAME
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.dense.out_features()
    }

    fn supports(&self) -> &'static [AdjacencyKind] {
        GraphSageConv::SUPPORTS
    }

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        check_width(GraphSageConv::NAME, self.in_features, x)?;
        self.engine.run(self, x, adjacency, edge_features, train)
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>> {
        total_penalty(self.dense.params())
    }
}
