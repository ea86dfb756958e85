// src/schema/arrow.rs

use arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema, SchemaRef};
use std::sync::Arc;

use super::types::{Column, LogicalType};

/// Map a declared logical type onto its Arrow storage type.
///
/// - Int32   → Int32
/// - Int64   → Int64
/// - Float64 → Float64
/// - Date    → Date32 (days since epoch)
/// - Text    → Utf8
pub fn map_to_arrow_type(ty: LogicalType) -> DataType {
    match ty {
        LogicalType::Int32 => DataType::Int32,
        LogicalType::Int64 => DataType::Int64,
        LogicalType::Float64 => DataType::Float64,
        LogicalType::Date => DataType::Date32,
        LogicalType::Text => DataType::Utf8,
    }
}

/// Inverse of [`map_to_arrow_type`]; `None` for types the pipeline never declares.
pub fn logical_type_of(dt: &DataType) -> Option<LogicalType> {
    match dt {
        DataType::Int32 => Some(LogicalType::Int32),
        DataType::Int64 => Some(LogicalType::Int64),
        DataType::Float64 => Some(LogicalType::Float64),
        DataType::Date32 => Some(LogicalType::Date),
        DataType::Utf8 => Some(LogicalType::Text),
        _ => None,
    }
}

/// Build an Arrow schema from declared columns. Every field is nullable:
/// failed casts surface as nulls rather than errors.
pub fn build_arrow_schema(cols: &[Column]) -> SchemaRef {
    let fields: Vec<ArrowField> = cols
        .iter()
        .map(|col| ArrowField::new(&col.name, map_to_arrow_type(col.ty), true))
        .collect();

    Arc::new(ArrowSchema::new(fields))
}

/// Declared columns of an Arrow schema, or `None` if any field has a type
/// outside [`LogicalType`].
pub fn columns_of(schema: &ArrowSchema) -> Option<Vec<Column>> {
    schema
        .fields()
        .iter()
        .map(|f| {
            logical_type_of(f.data_type()).map(|ty| Column {
                name: f.name().clone(),
                ty,
            })
        })
        .collect()
}
