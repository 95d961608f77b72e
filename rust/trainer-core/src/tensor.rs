// rust/trainer-core/src/tensor.rs

//! Concrete tensor values that flow through a session and across the bridge.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Int64,
    String,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Float32 => f.write_str("float32"),
            DType::Int64 => f.write_str("int64"),
            DType::String => f.write_str("string"),
        }
    }
}

/// Flat element storage of a [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Data {
    Float32(Vec<f32>),
    Int64(Vec<i64>),
    String(Vec<String>),
}

impl Data {
    fn len(&self) -> usize {
        match self {
            Data::Float32(v) => v.len(),
            Data::Int64(v) => v.len(),
            Data::String(v) => v.len(),
        }
    }
}

/// A dense, row-major tensor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    shape: Vec<usize>,
    data: Data,
}

impl Value {
    /// Creates a value, checking that `shape` covers exactly the elements in `data`.
    pub fn new(shape: Vec<usize>, data: Data) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TrainerError::graph(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn f32_vec(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            data: Data::Float32(values),
        }
    }

    pub fn i64_vec(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: Data::Int64(values),
        }
    }

    pub fn strings<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        Self {
            shape: vec![values.len()],
            data: Data::String(values),
        }
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: Data::Float32(vec![value]),
        }
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self {
            shape: Vec::new(),
            data: Data::Int64(vec![value]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            Data::Float32(_) => DType::Float32,
            Data::Int64(_) => DType::Int64,
            Data::String(_) => DType::String,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            Data::Float32(v) => Ok(v),
            _ => Err(self.type_error(DType::Float32)),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            Data::Int64(v) => Ok(v),
            _ => Err(self.type_error(DType::Int64)),
        }
    }

    pub fn as_strings(&self) -> Result<&[String]> {
        match &self.data {
            Data::String(v) => Ok(v),
            _ => Err(self.type_error(DType::String)),
        }
    }

    fn type_error(&self, wanted: DType) -> TrainerError {
        TrainerError::graph(format!("expected {wanted} tensor, got {}", self.dtype()))
    }
}
