use serde::Serialize;

use crate::dtype::DType;
use crate::programs::{KernelDescriptor, OpKind, Scalar};

const SELU_SCALE: f32 = 1.050_700_987_355_480_5;
const SELU_ALPHA: f32 = 1.673_263_242_354_377_3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnaryOp {
    Neg,
    Ceil,
    Floor,
    Sign,
    Round,
    Exp,
    Expm1,
    Log,
    Log1p,
    Sqrt,
    Rsqrt,
    Square,
    Reciprocal,
    Relu,
    Elu,
    Selu,
    Abs,
    Sigmoid,
    Softplus,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Erf,
    Step { alpha: Scalar },
    LogicalNot,
    ToInt,
    Clip { min: Scalar, max: Scalar },
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Floor => "floor",
            UnaryOp::Sign => "sign",
            UnaryOp::Round => "round",
            UnaryOp::Exp => "exp",
            UnaryOp::Expm1 => "expm1",
            UnaryOp::Log => "log",
            UnaryOp::Log1p => "log1p",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Square => "square",
            UnaryOp::Reciprocal => "reciprocal",
            UnaryOp::Relu => "relu",
            UnaryOp::Elu => "elu",
            UnaryOp::Selu => "selu",
            UnaryOp::Abs => "abs",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Softplus => "softplus",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Asin => "asin",
            UnaryOp::Acos => "acos",
            UnaryOp::Atan => "atan",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Asinh => "asinh",
            UnaryOp::Acosh => "acosh",
            UnaryOp::Atanh => "atanh",
            UnaryOp::Erf => "erf",
            UnaryOp::Step { .. } => "step",
            UnaryOp::LogicalNot => "logical_not",
            UnaryOp::ToInt => "to_int",
            UnaryOp::Clip { .. } => "clip",
        }
    }

    /// Output dtype when it differs from the input's.
    pub fn output_dtype(self) -> Option<DType> {
        match self {
            UnaryOp::LogicalNot => Some(DType::Bool),
            UnaryOp::ToInt => Some(DType::I32),
            _ => None,
        }
    }

    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Ceil => x.ceil(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Sign => {
                if x.is_nan() {
                    x
                } else if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Round => x.round_ties_even(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Expm1 => x.exp_m1(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Log1p => x.ln_1p(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Rsqrt => x.sqrt().recip(),
            UnaryOp::Square => x * x,
            UnaryOp::Reciprocal => x.recip(),
            UnaryOp::Relu => {
                if x < 0.0 {
                    0.0
                } else {
                    x
                }
            }
            UnaryOp::Elu => {
                if x >= 0.0 {
                    x
                } else {
                    x.exp() - 1.0
                }
            }
            UnaryOp::Selu => {
                if x >= 0.0 {
                    SELU_SCALE * x
                } else {
                    SELU_SCALE * SELU_ALPHA * (x.exp() - 1.0)
                }
            }
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Softplus => softplus(x),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tan => x.tan(),
            UnaryOp::Asin => x.asin(),
            UnaryOp::Acos => x.acos(),
            UnaryOp::Atan => x.atan(),
            UnaryOp::Sinh => x.sinh(),
            UnaryOp::Cosh => x.cosh(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Asinh => (x + (x * x + 1.0).sqrt()).ln(),
            UnaryOp::Acosh => (x + (x * x - 1.0).sqrt()).ln(),
            UnaryOp::Atanh => {
                if !(-1.0..=1.0).contains(&x) {
                    f32::NAN
                } else {
                    0.5 * ((1.0 + x) / (1.0 - x)).ln()
                }
            }
            UnaryOp::Erf => libm::erff(x),
            UnaryOp::Step { alpha } => {
                if x.is_nan() {
                    x
                } else if x > 0.0 {
                    1.0
                } else {
                    alpha.get()
                }
            }
            UnaryOp::LogicalNot => f32::from(u8::from(x < 1.0)),
            UnaryOp::ToInt => x.trunc(),
            UnaryOp::Clip { min, max } => {
                if x.is_nan() {
                    x
                } else {
                    x.clamp(min.get(), max.get())
                }
            }
        }
    }
}

// Switches to the asymptotes where exp overflows or underflows.
fn softplus(x: f32) -> f32 {
    let threshold = f32::EPSILON.ln() + 2.0;
    if x > -threshold {
        x
    } else if x < threshold {
        x.exp()
    } else {
        (x.exp() + 1.0).ln()
    }
}

pub fn descriptor(op: UnaryOp, shape: &[usize]) -> KernelDescriptor {
    let descriptor = KernelDescriptor::new(OpKind::Unary(op), shape.to_vec());
    match op.output_dtype() {
        Some(dtype) => descriptor.with_dtype(dtype),
        None => descriptor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_is_half_to_even() {
        assert_eq!(UnaryOp::Round.apply(2.5), 2.0);
        assert_eq!(UnaryOp::Round.apply(3.5), 4.0);
        assert_eq!(UnaryOp::Round.apply(-1.5), -2.0);
    }

    #[test]
    fn softplus_saturates() {
        assert_eq!(UnaryOp::Softplus.apply(100.0), 100.0);
        assert!((UnaryOp::Softplus.apply(0.0) - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn step_and_clip_keep_nan() {
        let step = UnaryOp::Step {
            alpha: Scalar::new(0.25),
        };
        assert_eq!(step.apply(-3.0), 0.25);
        assert!(step.apply(f32::NAN).is_nan());
        let clip = UnaryOp::Clip {
            min: Scalar::new(-1.0),
            max: Scalar::new(1.0),
        };
        assert_eq!(clip.apply(5.0), 1.0);
        assert!(clip.apply(f32::NAN).is_nan());
    }
}
