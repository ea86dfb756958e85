//! Fixtures shared by the unit tests.

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::{fs, fs::File, path::Path, sync::Arc};

use crate::config::PipelineConfig;

pub fn str_col(values: &[Option<&str>]) -> ArrayRef {
    Arc::new(StringArray::from(values.to_vec()))
}

pub fn int_col(values: &[Option<i64>]) -> ArrayRef {
    Arc::new(Int64Array::from(values.to_vec()))
}

pub fn float_col(values: &[Option<f64>]) -> ArrayRef {
    Arc::new(Float64Array::from(values.to_vec()))
}

/// Write the given columns as a single-batch parquet file, creating parents.
pub fn write_parquet(path: &Path, columns: &[(&str, ArrayRef)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let batch = RecordBatch::try_from_iter(columns.iter().map(|(n, a)| (*n, a.clone())))
        .context("building fixture batch")?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// A loosely typed bronze layer under `root`:
///
/// - tx 1, 2: customer 10, product 5, store 2 on 2023-01-01 (qty 3 and 2)
/// - tx 3: customer 7, product 6, store 2 on 2023-01-02
/// - tx 4: store 99 does not exist
/// - tx 5: customer 11 does not exist
/// - tx 6: quantity `"lots"` fails to cast
/// - customer 7 appears twice with different emails
pub fn write_bronze(root: &Path) -> Result<PipelineConfig> {
    let cfg = PipelineConfig::from_root(root);
    write_parquet(
        &cfg.sources.transactions.join("part-0.parquet"),
        &[
            ("transaction_id", str_col(&[Some("1"), Some("2"), Some("3")])),
            ("customer_id", str_col(&[Some("10"), Some("10"), Some("7")])),
            ("product_id", str_col(&[Some("5"), Some("5"), Some("6")])),
            ("store_id", str_col(&[Some("2"), Some("2"), Some("2")])),
            ("quantity", str_col(&[Some("3"), Some("2"), Some("1")])),
            (
                "transaction_date",
                str_col(&[Some("2023-01-01"), Some("2023-01-01"), Some("2023-01-02")]),
            ),
        ],
    )?;
    write_parquet(
        &cfg.sources.transactions.join("part-1.parquet"),
        &[
            ("transaction_id", str_col(&[Some("4"), Some("5"), Some("6")])),
            ("customer_id", str_col(&[Some("10"), Some("11"), Some("7")])),
            ("product_id", str_col(&[Some("5"), Some("5"), Some("6")])),
            ("store_id", str_col(&[Some("99"), Some("2"), Some("2")])),
            ("quantity", str_col(&[Some("4"), Some("1"), Some("lots")])),
            (
                "transaction_date",
                str_col(&[Some("2023-01-01"), Some("2023-01-01"), Some("2023-01-02")]),
            ),
        ],
    )?;
    write_parquet(
        &cfg.sources.products.join("products.parquet"),
        &[
            ("product_id", int_col(&[Some(5), Some(6)])),
            ("product_name", str_col(&[Some("Espresso"), Some("Teapot")])),
            ("category", str_col(&[Some("Coffee"), Some("Kitchen")])),
            ("price", float_col(&[Some(9.99), Some(25.0)])),
        ],
    )?;
    write_parquet(
        &cfg.sources.stores.join("stores.parquet"),
        &[
            ("store_id", int_col(&[Some(2)])),
            ("store_name", str_col(&[Some("Harbour")])),
            ("location", str_col(&[Some("Bergen")])),
        ],
    )?;
    write_parquet(
        &cfg.sources.customers.join("customers.parquet"),
        &[
            ("customer_id", int_col(&[Some(10), Some(7), Some(7)])),
            ("first_name", str_col(&[Some("Ada"), Some("Bo"), Some("Bo")])),
            ("last_name", str_col(&[Some("Lane"), Some("Berg"), Some("Berg")])),
            (
                "email",
                str_col(&[Some("ada@x.io"), Some("bo@x.io"), Some("bo.berg@x.io")]),
            ),
            ("city", str_col(&[Some("Oslo"), Some("Bergen"), Some("Bergen")])),
            (
                "registration_date",
                str_col(&[Some("2021-03-04"), Some("2022-01-01"), Some("2020-06-30")]),
            ),
        ],
    )?;
    Ok(cfg)
}
