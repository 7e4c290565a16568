//! Layer lifecycle: unbuilt specs, built layers, lazy building.
//!
//! A [`ConvSpec`] is plain configuration. [`ConvSpec::build`] checks it
//! against an [`InputSpec`], creates the parameters through a `VarBuilder`
//! and returns an immutable [`GraphLayer`]. Nothing is mutated after build;
//! building again yields a new layer (sharing variables if the `VarBuilder`
//! is backed by the same `VarMap`).

use std::sync::OnceLock;

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use nodeflow_core::{Adjacency, AdjacencyKind, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::message::check_support;

/// What a layer is built for: input feature width, adjacency kind and, for
/// layers that read them, the edge feature width (zero when absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub features: usize,
    pub kind: AdjacencyKind,
    pub edge_features: usize,
}

impl InputSpec {
    pub fn new(features: usize, kind: AdjacencyKind) -> Self {
        Self {
            features,
            kind,
            edge_features: 0,
        }
    }

    pub fn with_edge_features(self, edge_features: usize) -> Self {
        Self { edge_features, ..self }
    }

    /// Read the widths and kind off real inputs.
    pub fn infer(x: &Tensor, adjacency: &Adjacency, edge_features: Option<&Tensor>) -> Result<Self> {
        if x.rank() == 0 {
            return Err(Error::shape("node features must have at least one axis"));
        }
        // (E,) is one scalar per edge
        let edge_features = match edge_features {
            Some(e) if e.rank() >= 2 => e.dim(D::Minus1)?,
            Some(_) => 1,
            None => 0,
        };
        Ok(Self {
            features: x.dim(D::Minus1)?,
            kind: adjacency.kind(),
            edge_features,
        })
    }
}

/// A built graph layer.
pub trait GraphLayer {
    fn name(&self) -> &'static str;

    fn in_features(&self) -> usize;

    fn out_features(&self) -> usize;

    /// Adjacency kinds accepted by [`GraphLayer::forward_t`].
    fn supports(&self) -> &'static [AdjacencyKind];

    fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor>;

    /// Inference-mode forward pass.
    fn forward(&self, x: &Tensor, adjacency: &Adjacency, edge_features: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(x, adjacency, edge_features, false)
    }

    /// Sum of the configured regularizer penalties, `None` if there are none.
    fn regularization_loss(&self) -> Result<Option<Tensor>>;
}

/// Configuration of a convolution, before it is built.
pub trait ConvSpec: Clone + Serialize + DeserializeOwned {
    type Layer: GraphLayer;

    const NAME: &'static str;

    const SUPPORTS: &'static [AdjacencyKind];

    /// Reject inconsistent options.
    fn validate(&self) -> Result<()>;

    /// Create parameters and the built layer. Called by [`ConvSpec::build`]
    /// after validation.
    fn build_layer(&self, input: InputSpec, vb: VarBuilder) -> Result<Self::Layer>;

    fn supports(&self) -> &'static [AdjacencyKind] {
        Self::SUPPORTS
    }

    fn build(&self, input: InputSpec, vb: VarBuilder) -> Result<Self::Layer> {
        self.validate()?;
        check_support(Self::NAME, Self::SUPPORTS, input.kind)?;
        if input.features == 0 {
            return Err(Error::shape(format!("{} cannot be built for zero input features", Self::NAME)));
        }
        let layer = self.build_layer(input, vb)?;
        debug!(
            layer = Self::NAME,
            kind = %input.kind,
            in_features = layer.in_features(),
            out_features = layer.out_features(),
            "built graph layer"
        );
        Ok(layer)
    }

    fn config(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::config(format!("{} config serialized to {other}", Self::NAME))),
        }
    }

    fn from_config(map: Map<String, Value>) -> Result<Self> {
        let spec: Self = serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::config(format!("{}: {e}", Self::NAME)))?;
        spec.validate()?;
        Ok(spec)
    }
}

/// Fails with [`Error::ShapeMismatch`] unless `x` has `expected` features.
pub fn check_width(layer: &str, expected: usize, x: &Tensor) -> Result<()> {
    let width = x.dim(D::Minus1)?;
    if width != expected {
        return Err(Error::shape(format!(
            "{layer} was built for {expected} input features, got {:?}",
            x.dims()
        )));
    }
    Ok(())
}

/// A spec that builds itself on the first forward call.
pub struct LazyLayer<'a, S: ConvSpec> {
    spec: S,
    vb: VarBuilder<'a>,
    layer: OnceLock<S::Layer>,
}

impl<'a, S: ConvSpec> LazyLayer<'a, S> {
    pub fn new(spec: S, vb: VarBuilder<'a>) -> Self {
        Self {
            spec,
            vb,
            layer: OnceLock::new(),
        }
    }

    pub fn spec(&self) -> &S {
        &self.spec
    }

    /// The built layer, once a forward call has happened.
    pub fn layer(&self) -> Option<&S::Layer> {
        self.layer.get()
    }

    pub fn is_built(&self) -> bool {
        self.layer.get().is_some()
    }

    /// The stored layer, building it for `input` if needed.
    pub fn get_or_build(&self, input: InputSpec) -> Result<&S::Layer> {
        if let Some(layer) = self.layer.get() {
            return Ok(layer);
        }
        let built = self.spec.build(input, self.vb.clone())?;
        Ok(self.layer.get_or_init(|| built))
    }

    pub fn forward_t(
        &self,
        x: &Tensor,
        adjacency: &Adjacency,
        edge_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let layer = self.get_or_build(InputSpec::infer(x, adjacency, edge_features)?)?;
        layer.forward_t(x, adjacency, edge_features, train)
    }

    pub fn forward(&self, x: &Tensor, adjacency: &Adjacency, edge_features: Option<&Tensor>) -> Result<Tensor> {
        self.forward_t(x, adjacency, edge_features, false)
    }
}
