use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};

/// Element types a texture-backed tensor can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I32,
    Bool,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::I32 => "int32",
            DType::Bool => "bool",
        }
    }

    /// Result dtype of arithmetic between `self` and `other`.
    pub fn upcast(self, other: DType) -> DType {
        match (self, other) {
            (DType::F32, _) | (_, DType::F32) => DType::F32,
            (DType::I32, _) | (_, DType::I32) => DType::I32,
            (DType::Bool, DType::Bool) => DType::Bool,
        }
    }

    /// Accumulator dtype used by `sum`.
    pub fn sum_output(self) -> DType {
        match self {
            DType::F32 => DType::F32,
            DType::I32 | DType::Bool => DType::I32,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(DType::F32),
            "int32" | "i32" => Ok(DType::I32),
            "bool" => Ok(DType::Bool),
            other => Err(BackendError::unsupported_dtype(other)),
        }
    }
}

/// Typed host buffer backing a storage record.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<u8>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::I32(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widens the buffer to the float layout used inside textures.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            TensorData::F32(values) => values.clone(),
            TensorData::I32(values) => values.iter().map(|&v| v as f32).collect(),
            TensorData::Bool(values) => values.iter().map(|&v| f32::from(v)).collect(),
        }
    }

    /// Converts downloaded texel floats into the record's dtype.
    ///
    /// Integral and boolean values travel as floats and are rounded back.
    pub fn from_packed(values: Vec<f32>, dtype: DType) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(values),
            DType::I32 => TensorData::I32(values.iter().map(|v| v.round() as i32).collect()),
            DType::Bool => TensorData::Bool(values.iter().map(|v| v.round() as u8).collect()),
        }
    }

    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::I32 => TensorData::I32(vec![0; len]),
            DType::Bool => TensorData::Bool(vec![0; len]),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            TensorData::I32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[u8]> {
        match self {
            TensorData::Bool(values) => Some(values),
            _ => None,
        }
    }
}

impl From<Vec<f32>> for TensorData {
    fn from(values: Vec<f32>) -> Self {
        TensorData::F32(values)
    }
}

impl From<Vec<i32>> for TensorData {
    fn from(values: Vec<i32>) -> Self {
        TensorData::I32(values)
    }
}

impl From<Vec<bool>> for TensorData {
    fn from(values: Vec<bool>) -> Self {
        TensorData::Bool(values.into_iter().map(u8::from).collect())
    }
}

pub(crate) fn ensure_dtype(op: &'static str, found: DType, allowed: &[DType]) -> BackendResult<()> {
    if allowed.contains(&found) {
        Ok(())
    } else {
        Err(BackendError::unsupported_dtype(format!("{found} (in {op})")))
    }
}
