//! Feed-forward building blocks used by update transforms.
//!
//! Parameter names under the caller's `VarBuilder` prefix:
//!
//! | block | names |
//! |-------|-------|
//! | [`Dense`] | `weight` `(out, in)`, `bias` `(out,)` |
//! | [`Mlp`] | `dense_{i}.*`, `norm_{i}.*` for hidden layer `i`, `out.*` |

use candle_core::{Tensor, D};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Linear, Module, ModuleT, VarBuilder};
use nodeflow_core::Result;

use crate::params::{Activation, LayerOptions, Param};

/// Affine transform followed by an activation. Accepts `(N, F)` and
/// `(B, N, F)` inputs.
#[derive(Debug, Clone)]
pub struct Dense {
    kernel: Param,
    bias: Option<Param>,
    activation: Activation,
    in_features: usize,
    out_features: usize,
}

impl Dense {
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        use_bias: bool,
        options: &LayerOptions,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kernel = options.kernel(&vb, in_features, out_features, "weight")?;
        let bias = if use_bias {
            Some(options.bias(&vb, out_features, "bias")?)
        } else {
            None
        };
        Ok(Self {
            kernel,
            bias,
            activation,
            in_features,
            out_features,
        })
    }

    /// A bias-free linear projection.
    pub fn projection(
        in_features: usize,
        out_features: usize,
        options: &LayerOptions,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::new(in_features, out_features, Activation::Linear, false, options, vb)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        std::iter::once(&self.kernel).chain(self.bias.as_ref())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let bias = self.bias.as_ref().map(Param::value).transpose()?;
        let linear = Linear::new(self.kernel.value()?, bias);
        let y = linear.forward(x)?;
        self.activation.apply(&y)
    }
}

/// Feature-wise batch normalization over every leading axis.
#[derive(Debug, Clone)]
struct FeatureNorm(BatchNorm);

impl FeatureNorm {
    fn new(features: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self(batch_norm(features, BatchNormConfig::default(), vb)?))
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let features = x.dim(D::Minus1)?;
        let flat = x.reshape((x.elem_count() / features, features))?;
        Ok(self.0.forward_t(&flat, train)?.reshape(dims)?)
    }
}

/// Stack of [`Dense`] layers with optional batch normalization after each
/// hidden layer.
#[derive(Debug, Clone)]
pub struct Mlp {
    hidden: Vec<(Dense, Option<FeatureNorm>)>,
    output: Dense,
}

impl Mlp {
    /// `options.activation` and `options.use_bias` apply to the output layer;
    /// hidden layers use `hidden_activation` and always carry a bias.
    pub fn new(
        in_features: usize,
        hidden: &[usize],
        out_features: usize,
        hidden_activation: Activation,
        batchnorm: bool,
        options: &LayerOptions,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(hidden.len());
        let mut width = in_features;
        for (i, &h) in hidden.iter().enumerate() {
            let dense = Dense::new(width, h, hidden_activation, true, options, vb.pp(format!("dense_{i}")))?;
            let norm = if batchnorm {
                Some(FeatureNorm::new(h, vb.pp(format!("norm_{i}")))?)
            } else {
                None
            };
            layers.push((dense, norm));
            width = h;
        }
        let output = Dense::new(
            width,
            out_features,
            options.activation,
            options.use_bias,
            options,
            vb.pp("out"),
        )?;
        Ok(Self {
            hidden: layers,
            output,
        })
    }

    pub fn out_features(&self) -> usize {
        self.output.out_features()
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.hidden
            .iter()
            .flat_map(|(d, _)| d.params())
            .chain(self.output.params())
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for (dense, norm) in &self.hidden {
            h = dense.forward(&h)?;
            if let Some(norm) = norm {
                h = norm.forward_t(&h, train)?;
            }
        }
        self.output.forward(&h)
    }
}
