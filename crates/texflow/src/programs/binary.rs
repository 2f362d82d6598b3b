use serde::Serialize;

use crate::dtype::DType;
use crate::error::{BackendError, BackendResult};
use crate::programs::{KernelDescriptor, OpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Floor division of integral operands.
    IntDiv,
    Pow,
    Minimum,
    Maximum,
    Mod,
    SquaredDifference,
    Atan2,
    EluDer,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "subtract",
            BinaryOp::Mul => "multiply",
            BinaryOp::Div => "divide",
            BinaryOp::IntDiv => "int_divide",
            BinaryOp::Pow => "pow",
            BinaryOp::Minimum => "minimum",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Mod => "mod",
            BinaryOp::SquaredDifference => "squared_difference",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::EluDer => "elu_der",
            BinaryOp::Equal => "equal",
            BinaryOp::NotEqual => "not_equal",
            BinaryOp::Less => "less",
            BinaryOp::LessEqual => "less_equal",
            BinaryOp::Greater => "greater",
            BinaryOp::GreaterEqual => "greater_equal",
            BinaryOp::LogicalAnd => "logical_and",
            BinaryOp::LogicalOr => "logical_or",
        }
    }

    /// Output dtype for the given operand dtypes; `None` inherits from `a`.
    pub fn output_dtype(self, a: DType, b: DType) -> Option<DType> {
        match self {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Pow => Some(a.upcast(b)),
            BinaryOp::Div => Some(DType::F32),
            BinaryOp::IntDiv => Some(DType::I32),
            BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::Less
            | BinaryOp::LessEqual
            | BinaryOp::Greater
            | BinaryOp::GreaterEqual
            | BinaryOp::LogicalAnd
            | BinaryOp::LogicalOr => Some(DType::Bool),
            _ => None,
        }
    }

    pub fn apply(self, a: f32, b: f32) -> f32 {
        let truth = |value: bool| f32::from(u8::from(value));
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::IntDiv => (a.round() / b.round()).floor(),
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Minimum => {
                if a.is_nan() || b.is_nan() {
                    f32::NAN
                } else {
                    a.min(b)
                }
            }
            BinaryOp::Maximum => {
                if a.is_nan() || b.is_nan() {
                    f32::NAN
                } else {
                    a.max(b)
                }
            }
            BinaryOp::Mod => a - b * (a / b).floor(),
            BinaryOp::SquaredDifference => (a - b) * (a - b),
            BinaryOp::Atan2 => a.atan2(b),
            BinaryOp::EluDer => {
                if b >= 0.0 {
                    a
                } else {
                    a * (b + 1.0)
                }
            }
            BinaryOp::Equal => truth(a == b),
            BinaryOp::NotEqual => truth(a != b),
            BinaryOp::Less => truth(a < b),
            BinaryOp::LessEqual => truth(a <= b),
            BinaryOp::Greater => truth(a > b),
            BinaryOp::GreaterEqual => truth(a >= b),
            BinaryOp::LogicalAnd => truth(a >= 1.0 && b >= 1.0),
            BinaryOp::LogicalOr => truth(a >= 1.0 || b >= 1.0),
        }
    }
}

/// Numpy-style broadcast of two shapes, aligned on trailing axes.
pub fn broadcast_shapes(op: &'static str, a: &[usize], b: &[usize]) -> BackendResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for axis in 0..rank {
        let da = dim_from_end(a, rank - 1 - axis);
        let db = dim_from_end(b, rank - 1 - axis);
        out[axis] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(BackendError::invalid(
                    op,
                    format!("shapes {a:?} and {b:?} cannot be broadcast"),
                ))
            }
        };
    }
    Ok(out)
}

fn dim_from_end(shape: &[usize], from_end: usize) -> usize {
    if from_end < shape.len() {
        shape[shape.len() - 1 - from_end]
    } else {
        1
    }
}

pub fn descriptor(
    op: BinaryOp,
    a: (&[usize], DType),
    b: (&[usize], DType),
) -> BackendResult<KernelDescriptor> {
    let output_shape = broadcast_shapes(op.name(), a.0, b.0)?;
    let descriptor = KernelDescriptor::new(OpKind::Binary(op), output_shape);
    Ok(match op.output_dtype(a.1, b.1) {
        Some(dtype) => descriptor.with_dtype(dtype),
        None => descriptor,
    })
}

/// `divide` picks floor division when both operands are integral.
pub fn divide_op(a: DType, b: DType) -> BinaryOp {
    if a == DType::I32 && b == DType::I32 {
        BinaryOp::IntDiv
    } else {
        BinaryOp::Div
    }
}
