// src/schema/types.rs

use serde::{Deserialize, Serialize};

/// Logical column types the pipeline declares for its datasets.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Int32,
    Int64,
    Float64,
    Date,
    Text,
}

/// A single declared column.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Hash)]
pub struct Column {
    pub name: String,
    pub ty: LogicalType,
}

impl Column {
    pub fn new(name: &str, ty: LogicalType) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}
