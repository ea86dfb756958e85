//! Consistency checks between a committed conformed table and its summary.

use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, AsArray},
    compute::cast,
    datatypes::{DataType, Float64Type, Int64Type},
    record_batch::RecordBatch,
    row::{RowConverter, SortField},
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

use crate::aggregate::{summarize, METRIC_COLUMNS};
use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::schema::entities::{PRICE, QUANTITY, TOTAL_AMOUNT, TOTAL_QUANTITY_SOLD};

const TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    pub checks: Vec<Check>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    fn record(&mut self, name: &'static str, passed: bool, detail: String) {
        if passed {
            info!(check = name, %detail, "check passed");
        } else {
            warn!(check = name, %detail, "check failed");
        }
        self.checks.push(Check {
            name,
            passed,
            detail,
        });
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.checks {
            let mark = if c.passed { "ok  " } else { "FAIL" };
            writeln!(f, "[{}] {:<28} {}", mark, c.name, c.detail)?;
        }
        Ok(())
    }
}

fn column_as(batch: &RecordBatch, name: &str, to: &DataType) -> Result<ArrayRef> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::MissingColumn {
            dataset: "verified table".into(),
            column: name.to_string(),
        })?;
    cast(col, to).with_context(|| format!("reading `{}` as {}", name, to))
}

fn check_total_amount(silver: &RecordBatch) -> Result<(bool, String)> {
    let qty = column_as(silver, QUANTITY, &DataType::Float64)?;
    let qty = qty.as_primitive::<Float64Type>();
    let price = column_as(silver, PRICE, &DataType::Float64)?;
    let price = price.as_primitive::<Float64Type>();
    let total = column_as(silver, TOTAL_AMOUNT, &DataType::Float64)?;
    let total = total.as_primitive::<Float64Type>();

    let mut bad = 0usize;
    for i in 0..silver.num_rows() {
        let ok = if qty.is_valid(i) && price.is_valid(i) {
            let expected = qty.value(i) * price.value(i);
            total.is_valid(i) && (total.value(i) - expected).abs() <= TOLERANCE * expected.abs().max(1.0)
        } else {
            total.is_null(i)
        };
        if !ok {
            bad += 1;
        }
    }
    Ok((bad == 0, format!("{} of {} rows disagree", bad, silver.num_rows())))
}

fn check_quantity_conserved(silver: &RecordBatch, gold: &RecordBatch) -> Result<(bool, String)> {
    let sum = |batch: &RecordBatch, name: &str| -> Result<i64> {
        let col = column_as(batch, name, &DataType::Int64)?;
        Ok(col
            .as_primitive::<Int64Type>()
            .iter()
            .flatten()
            .fold(0i64, |acc, v| acc.wrapping_add(v)))
    };
    let in_silver = sum(silver, QUANTITY)?;
    let in_gold = sum(gold, TOTAL_QUANTITY_SOLD)?;
    Ok((
        in_silver == in_gold,
        format!("silver {} vs gold {}", in_silver, in_gold),
    ))
}

fn check_groups_unique(gold: &RecordBatch, grain: &[String]) -> Result<(bool, String)> {
    let keys: Vec<ArrayRef> = grain
        .iter()
        .map(|g| gold.column_by_name(g).cloned())
        .collect::<Option<_>>()
        .context("grain column missing from summary")?;
    let converter = RowConverter::new(
        keys.iter()
            .map(|k| SortField::new(k.data_type().clone()))
            .collect(),
    )?;
    let rows = converter.convert_columns(&keys)?;
    let distinct: HashSet<_> = rows.iter().collect();
    Ok((
        distinct.len() == gold.num_rows(),
        format!("{} groups, {} distinct keys", gold.num_rows(), distinct.len()),
    ))
}

fn check_recomputed(silver: &Dataset, gold: &RecordBatch, grain: &[String]) -> Result<(bool, String)> {
    let again = summarize(silver, grain)?.concat()?;
    if again.num_rows() != gold.num_rows() {
        return Ok((
            false,
            format!("recomputed {} groups, stored {}", again.num_rows(), gold.num_rows()),
        ));
    }
    let mut differing = Vec::new();
    for field in gold.schema().fields() {
        let (Some(stored), Some(fresh)) = (
            gold.column_by_name(field.name()),
            again.column_by_name(field.name()),
        ) else {
            differing.push(field.name().clone());
            continue;
        };
        let same = if *field.data_type() == DataType::Float64 {
            let a = stored.as_primitive::<Float64Type>();
            let b = fresh.as_primitive::<Float64Type>();
            a.iter().zip(b.iter()).all(|pair| match pair {
                (Some(x), Some(y)) => (x - y).abs() <= TOLERANCE * x.abs().max(1.0),
                (None, None) => true,
                _ => false,
            })
        } else {
            stored.to_data() == fresh.to_data()
        };
        if !same {
            differing.push(field.name().clone());
        }
    }
    Ok((
        differing.is_empty(),
        if differing.is_empty() {
            format!("{} groups match", gold.num_rows())
        } else {
            format!("columns differ: {}", differing.join(", "))
        },
    ))
}

/// Re-derive the summary's properties from the conformed table.
///
/// The grain is taken from the summary itself: every column that is not a
/// metric.
pub fn verify_tables(silver: &Dataset, gold: &Dataset) -> Result<VerifyReport> {
    let silver_batch = silver.concat()?;
    let gold_batch = gold.concat()?;
    let grain: Vec<String> = gold
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|n| !METRIC_COLUMNS.contains(&n.as_str()))
        .collect();

    let mut report = VerifyReport::default();
    let (ok, detail) = check_total_amount(&silver_batch)?;
    report.record("total_amount = quantity * price", ok, detail);
    let (ok, detail) = check_quantity_conserved(&silver_batch, &gold_batch)?;
    report.record("quantity conserved", ok, detail);
    let (ok, detail) = check_groups_unique(&gold_batch, &grain)?;
    report.record("one row per group", ok, detail);
    let (ok, detail) = check_recomputed(silver, &gold_batch, &grain)?;
    report.record("summary matches recompute", ok, detail);
    Ok(report)
}
