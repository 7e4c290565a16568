//! Parameter options shared by every layer.
//!
//! These mirror the usual layer keyword arguments (activation, bias flag,
//! initializers, regularizers, constraints) and are flattened into each
//! layer's config, so a config map reads like:
//!
//! ```text
//! { "channels": 8, "activation": "relu", "use_bias": true,
//!   "kernel_initializer": "glorot_uniform", "bias_initializer": "zeros",
//!   "kernel_regularizer": { "l2": { "l2": 0.01 } }, "kernel_constraint": null, ... }
//! ```
//!
//! Initializers map onto [`candle_nn::Init`]. Regularizers are reported as a
//! penalty tensor for the caller's loss. Constraints are applied as a
//! projection each time a parameter is read, so the effective weights always
//! satisfy them.

use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};
use nodeflow_core::Result;
use serde::{Deserialize, Serialize};

/// Element-wise activation applied to a layer's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Identity.
    #[default]
    Linear,
    Relu,
    Elu,
    Selu,
    Sigmoid,
    Tanh,
    /// Exact (erf) GELU.
    Gelu,
    Silu,
    /// Leaky ReLU with slope 0.2.
    LeakyRelu,
    Softplus,
    /// Softmax over the last axis.
    Softmax,
}

impl Activation {
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        let y = match self {
            Self::Linear => x.clone(),
            Self::Relu => x.relu()?,
            Self::Elu => x.elu(1.0)?,
            Self::Selu => x.elu(1.673_263_242_354_377_3)?.affine(1.050_700_987_355_480_5, 0.0)?,
            Self::Sigmoid => candle_nn::ops::sigmoid(x)?,
            Self::Tanh => x.tanh()?,
            Self::Gelu => x.gelu_erf()?,
            Self::Silu => x.silu()?,
            Self::LeakyRelu => candle_nn::ops::leaky_relu(x, 0.2)?,
            // max(x, 0) + log(1 + exp(-|x|)) stays finite for large |x|
            Self::Softplus => (x.relu()? + x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?)?,
            Self::Softmax => candle_nn::ops::softmax_last_dim(x)?,
        };
        Ok(y)
    }
}

/// How a parameter is filled when it is first created.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    #[default]
    GlorotUniform,
    GlorotNormal,
    HeUniform,
    HeNormal,
    LecunNormal,
    Zeros,
    Ones,
    Constant { value: f64 },
    Normal { mean: f64, stddev: f64 },
    Uniform { low: f64, high: f64 },
}

impl Initializer {
    /// The candle init for a parameter with the given fans.
    pub fn init(self, fan_in: usize, fan_out: usize) -> Init {
        let (fan_in, fan_out) = (fan_in.max(1) as f64, fan_out.max(1) as f64);
        match self {
            Self::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                Init::Uniform { lo: -limit, up: limit }
            }
            Self::GlorotNormal => Init::Randn {
                mean: 0.0,
                stdev: (2.0 / (fan_in + fan_out)).sqrt(),
            },
            Self::HeUniform => {
                let limit = (6.0 / fan_in).sqrt();
                Init::Uniform { lo: -limit, up: limit }
            }
            Self::HeNormal => Init::Randn {
                mean: 0.0,
                stdev: (2.0 / fan_in).sqrt(),
            },
            Self::LecunNormal => Init::Randn {
                mean: 0.0,
                stdev: (1.0 / fan_in).sqrt(),
            },
            Self::Zeros => Init::Const(0.0),
            Self::Ones => Init::Const(1.0),
            Self::Constant { value } => Init::Const(value),
            Self::Normal { mean, stddev } => Init::Randn { mean, stdev: stddev },
            Self::Uniform { low, high } => Init::Uniform { lo: low, up: high },
        }
    }
}

/// Weight penalty added to the training loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regularizer {
    L1 { l1: f64 },
    L2 { l2: f64 },
    L1l2 { l1: f64, l2: f64 },
}

impl Regularizer {
    /// Scalar penalty for one parameter tensor.
    pub fn penalty(self, w: &Tensor) -> Result<Tensor> {
        let (l1, l2) = match self {
            Self::L1 { l1 } => (l1, 0.0),
            Self::L2 { l2 } => (0.0, l2),
            Self::L1l2 { l1, l2 } => (l1, l2),
        };
        let abs = w.abs()?.sum_all()?.affine(l1, 0.0)?;
        let sq = w.sqr()?.sum_all()?.affine(l2, 0.0)?;
        Ok((abs + sq)?)
    }
}

/// Projection applied to a parameter before use.
///
/// Norms are taken over the last axis: per output unit for `(out, in)`
/// kernels, over the whole vector for biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    NonNeg,
    MaxNorm { max_value: f64 },
    UnitNorm,
    MinMaxNorm { min_value: f64, max_value: f64 },
}

const NORM_EPS: f64 = 1e-7;

impl Constraint {
    pub fn project(self, w: &Tensor) -> Result<Tensor> {
        let (lo, hi) = match self {
            Self::NonNeg => return Ok(w.relu()?),
            Self::MaxNorm { max_value } => (0.0, max_value),
            Self::UnitNorm => (1.0, 1.0),
            Self::MinMaxNorm {
                min_value,
                max_value,
            } => (min_value, max_value),
        };
        let norm = w.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        let desired = norm.clamp(lo, hi)?;
        let scale = (desired / norm.affine(1.0, NORM_EPS)?)?;
        Ok(w.broadcast_mul(&scale)?)
    }
}

/// Options every layer accepts, flattened into the layer config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerOptions {
    pub activation: Activation,
    pub use_bias: bool,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub kernel_regularizer: Option<Regularizer>,
    pub bias_regularizer: Option<Regularizer>,
    pub kernel_constraint: Option<Constraint>,
    pub bias_constraint: Option<Constraint>,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            activation: Activation::Linear,
            use_bias: true,
            kernel_initializer: Initializer::GlorotUniform,
            bias_initializer: Initializer::Zeros,
            kernel_regularizer: None,
            bias_regularizer: None,
            kernel_constraint: None,
            bias_constraint: None,
        }
    }
}

impl LayerOptions {
    /// Create a kernel parameter of shape `(fan_out, fan_in)`.
    pub fn kernel(&self, vb: &VarBuilder, fan_in: usize, fan_out: usize, name: &str) -> Result<Param> {
        let tensor = vb.get_with_hints(
            (fan_out, fan_in),
            name,
            self.kernel_initializer.init(fan_in, fan_out),
        )?;
        Ok(Param {
            tensor,
            constraint: self.kernel_constraint,
            regularizer: self.kernel_regularizer,
        })
    }

    /// Create a bias parameter of shape `(size,)`.
    pub fn bias(&self, vb: &VarBuilder, size: usize, name: &str) -> Result<Param> {
        let tensor = vb.get_with_hints(size, name, self.bias_initializer.init(size, size))?;
        Ok(Param {
            tensor,
            constraint: self.bias_constraint,
            regularizer: self.bias_regularizer,
        })
    }
}

/// A learned tensor with its constraint and regularizer.
#[derive(Debug, Clone)]
pub struct Param {
    tensor: Tensor,
    constraint: Option<Constraint>,
    regularizer: Option<Regularizer>,
}

impl Param {
    /// The stored tensor, before any constraint.
    pub fn raw(&self) -> &Tensor {
        &self.tensor
    }

    /// The tensor as layers use it, with the constraint applied.
    pub fn value(&self) -> Result<Tensor> {
        match self.constraint {
            Some(c) => c.project(&self.tensor),
            None => Ok(self.tensor.clone()),
        }
    }

    pub fn penalty(&self) -> Result<Option<Tensor>> {
        self.regularizer.map(|r| r.penalty(&self.tensor)).transpose()
    }
}

/// Sum of the penalties of `params`, `None` when none is regularized.
pub fn total_penalty<'a>(params: impl IntoIterator<Item = &'a Param>) -> Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for p in params {
        if let Some(pen) = p.penalty()? {
            total = Some(match total {
                Some(t) => (t + pen)?,
                None => pen,
            });
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn activation_names_round_trip() {
        let json = serde_json::to_string(&Activation::LeakyRelu).unwrap();
        assert_eq!(json, "\"leaky_relu\"");
        let back: Activation = serde_json::from_str("\"relu\"").unwrap();
        assert_eq!(back, Activation::Relu);
    }

    #[test]
    fn relu_clips_negatives() {
        let x = Tensor::new(&[-1f32, 0.5], &Device::Cpu).unwrap();
        let y = Activation::Relu.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![0.0, 0.5]);
    }

    #[test]
    fn softplus_is_finite_for_large_inputs() {
        let x = Tensor::new(&[100f32, -100.0, 0.0], &Device::Cpu).unwrap();
        let y = Activation::Softplus.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!((y[0] - 100.0).abs() < 1e-4, "{y:?}");
        assert!(y[1] >= 0.0 && y[1] < 1e-6, "{y:?}");
        assert!((y[2] - std::f32::consts::LN_2).abs() < 1e-6, "{y:?}");
    }

    #[test]
    fn l2_penalty_matches_hand_computation() {
        let w = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let p = Regularizer::L2 { l2: 0.1 }.penalty(&w).unwrap();
        let v = p.to_scalar::<f32>().unwrap();
        assert!((v - 3.0).abs() < 1e-5, "{v}");
    }

    #[test]
    fn unit_norm_rows() {
        let w = Tensor::new(&[[3f32, 4.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let p = Constraint::UnitNorm.project(&w).unwrap();
        let rows = p.to_vec2::<f32>().unwrap();
        assert!((rows[0][0] - 0.6).abs() < 1e-5);
        assert!((rows[1][1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn max_norm_leaves_small_rows_alone() {
        let w = Tensor::new(&[[0.3f32, 0.4]], &Device::Cpu).unwrap();
        let p = Constraint::MaxNorm { max_value: 2.0 }.project(&w).unwrap();
        let rows = p.to_vec2::<f32>().unwrap();
        assert!((rows[0][0] - 0.3).abs() < 1e-5);
    }

    #[test]
    fn kernel_has_out_in_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let opts = LayerOptions::default();
        let k = opts.kernel(&vb, 4, 3, "weight").unwrap();
        assert_eq!(k.raw().dims(), &[3, 4]);
        assert!(k.penalty().unwrap().is_none());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: LayerOptions =
            serde_json::from_str(r#"{"activation": "tanh", "kernel_regularizer": {"l2": {"l2": 0.01}}}"#)
                .unwrap();
        assert_eq!(opts.activation, Activation::Tanh);
        assert!(opts.use_bias);
        assert_eq!(opts.kernel_regularizer, Some(Regularizer::L2 { l2: 0.01 }));
    }
}
