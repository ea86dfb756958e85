use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, UInt32Array},
    compute::{cast, take},
    datatypes::{DataType, Field, Float64Type, Int64Type, Schema, SchemaRef},
    record_batch::RecordBatch,
    row::{OwnedRow, RowConverter, SortField},
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::schema::entities::{
    AVERAGE_TRANSACTION_VALUE, NUMBER_OF_TRANSACTIONS, QUANTITY, TOTAL_AMOUNT,
    TOTAL_QUANTITY_SOLD, TOTAL_SALES_AMOUNT, TRANSACTION_ID,
};

pub const METRIC_COLUMNS: [&str; 4] = [
    TOTAL_QUANTITY_SOLD,
    TOTAL_SALES_AMOUNT,
    NUMBER_OF_TRANSACTIONS,
    AVERAGE_TRANSACTION_VALUE,
];

/// Check that every grain column exists in the conformed schema.
pub fn check_grain(silver: &Schema, grain: &[String]) -> Result<(), PipelineError> {
    for col in grain {
        if silver.index_of(col).is_err() || METRIC_COLUMNS.contains(&col.as_str()) {
            return Err(PipelineError::InvalidGrain(col.clone()));
        }
    }
    Ok(())
}

/// Schema of the summary: grain columns as typed in the conformed table,
/// followed by the four metrics.
pub fn summary_schema(silver: &Schema, grain: &[String]) -> Result<SchemaRef> {
    check_grain(silver, grain)?;
    let mut fields: Vec<Field> = grain
        .iter()
        .map(|name| {
            let f = silver.field_with_name(name)?;
            Ok(Field::new(name, f.data_type().clone(), true))
        })
        .collect::<Result<_, arrow::error::ArrowError>>()?;
    fields.push(Field::new(TOTAL_QUANTITY_SOLD, DataType::Int64, true));
    fields.push(Field::new(TOTAL_SALES_AMOUNT, DataType::Float64, true));
    fields.push(Field::new(NUMBER_OF_TRANSACTIONS, DataType::Int64, true));
    fields.push(Field::new(AVERAGE_TRANSACTION_VALUE, DataType::Float64, true));
    Ok(Arc::new(Schema::new(fields)))
}

/// Running metrics of one grain group.
#[derive(Debug)]
struct GroupState {
    /// First conformed row of the group; grain values are taken from it.
    first_row: u32,
    quantity: Option<i64>,
    amount: Option<f64>,
    amount_count: u64,
    transactions: HashSet<i64>,
}

impl GroupState {
    fn new(first_row: u32) -> Self {
        Self {
            first_row,
            quantity: None,
            amount: None,
            amount_count: 0,
            transactions: HashSet::new(),
        }
    }

    fn average(&self) -> Option<f64> {
        self.amount.map(|sum| sum / self.amount_count as f64)
    }
}

fn metric_input(batch: &RecordBatch, name: &str, to: &DataType) -> Result<ArrayRef> {
    let col = batch.column_by_name(name).ok_or_else(|| PipelineError::MissingColumn {
        dataset: "conformed transactions".into(),
        column: name.to_string(),
    })?;
    cast(col, to).with_context(|| format!("reading `{}` as {}", name, to))
}

/// Group the conformed table by `grain` and compute per-group totals.
///
/// - `total_quantity_sold`: sum of quantity
/// - `total_sales_amount`: sum of total_amount
/// - `number_of_transactions`: distinct non-null transaction_id values
/// - `average_transaction_value`: mean of total_amount over the group's rows
///
/// Nulls are skipped by every metric; a sum or mean over no values is null.
/// Rows come out ordered by grain key, nulls first.
#[instrument(level = "info", skip(silver), fields(rows = silver.num_rows()))]
pub fn summarize(silver: &Dataset, grain: &[String]) -> Result<Dataset> {
    let schema = summary_schema(&silver.schema(), grain)?;
    let batch = silver.concat()?;

    let keys: Vec<ArrayRef> = grain
        .iter()
        .map(|name| batch.column_by_name(name).cloned())
        .collect::<Option<_>>()
        .context("grain column vanished from conformed batch")?;
    let converter = RowConverter::new(
        keys.iter()
            .map(|k| SortField::new(k.data_type().clone()))
            .collect(),
    )
    .context("building grain row converter")?;
    let rows = converter
        .convert_columns(&keys)
        .context("encoding grain keys")?;

    let quantity = metric_input(&batch, QUANTITY, &DataType::Int64)?;
    let quantity = quantity.as_primitive::<Int64Type>();
    let amount = metric_input(&batch, TOTAL_AMOUNT, &DataType::Float64)?;
    let amount = amount.as_primitive::<Float64Type>();
    let txn = metric_input(&batch, TRANSACTION_ID, &DataType::Int64)?;
    let txn = txn.as_primitive::<Int64Type>();

    let mut groups: BTreeMap<OwnedRow, GroupState> = BTreeMap::new();
    for i in 0..batch.num_rows() {
        let g = groups
            .entry(rows.row(i).owned())
            .or_insert_with(|| GroupState::new(i as u32));
        if quantity.is_valid(i) {
            g.quantity = Some(g.quantity.unwrap_or(0).wrapping_add(quantity.value(i)));
        }
        if amount.is_valid(i) {
            g.amount = Some(g.amount.unwrap_or(0.0) + amount.value(i));
            g.amount_count += 1;
        }
        if txn.is_valid(i) {
            g.transactions.insert(txn.value(i));
        }
    }

    let firsts = UInt32Array::from_iter_values(groups.values().map(|g| g.first_row));
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for key in &keys {
        columns.push(take(key, &firsts, None).context("gathering grain values")?);
    }
    columns.push(Arc::new(
        groups.values().map(|g| g.quantity).collect::<Int64Array>(),
    ));
    columns.push(Arc::new(
        groups.values().map(|g| g.amount).collect::<Float64Array>(),
    ));
    columns.push(Arc::new(Int64Array::from_iter_values(
        groups.values().map(|g| g.transactions.len() as i64),
    )));
    columns.push(Arc::new(
        groups.values().map(GroupState::average).collect::<Float64Array>(),
    ));

    let summary = RecordBatch::try_new(schema.clone(), columns).context("building summary batch")?;
    info!(groups = summary.num_rows(), "aggregated conformed transactions");
    if summary.num_rows() == 0 {
        return Ok(Dataset::empty(schema));
    }
    Ok(Dataset::from_batch(summary))
}
