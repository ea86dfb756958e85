// src/normalize/mod.rs
pub mod cast;
pub mod dedup;

use anyhow::{Context, Result};
use arrow::{
    array::ArrayRef,
    datatypes::{Schema, SchemaRef},
    record_batch::RecordBatch,
};
use rayon::prelude::*;
use tracing::{info, instrument, warn};

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::quality::SourceQuality;
use crate::schema::{build_arrow_schema, Column, Entity};
use crate::source::{RawSource, RawSources};
use cast::conform_column;
use dedup::{dedup_customers, DedupPolicy};

#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub dedup_policy: DedupPolicy,
    pub max_failure_samples: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            dedup_policy: DedupPolicy::default(),
            max_failure_samples: 20,
        }
    }
}

/// A source narrowed to its declared schema.
#[derive(Debug, Clone)]
pub struct NormalizedSource {
    pub entity: Entity,
    pub data: Dataset,
    pub quality: SourceQuality,
}

#[derive(Debug, Clone)]
pub struct NormalizedSources {
    pub transactions: NormalizedSource,
    pub products: NormalizedSource,
    pub stores: NormalizedSource,
    pub customers: NormalizedSource,
}

/// Find a column by name: exact match first, then ASCII case-insensitive.
pub fn resolve_column(schema: &Schema, name: &str) -> Option<usize> {
    schema.index_of(name).ok().or_else(|| {
        schema
            .fields()
            .iter()
            .position(|f| f.name().eq_ignore_ascii_case(name))
    })
}

/// Narrow one raw partition to the declared columns.
fn narrow_batch(
    entity: Entity,
    batch: &RecordBatch,
    declared: &[Column],
    schema: &SchemaRef,
    row_offset: usize,
    max_samples: usize,
) -> Result<(RecordBatch, SourceQuality)> {
    let raw_schema = batch.schema();
    let mut quality = SourceQuality {
        rows_read: batch.num_rows(),
        rows_out: batch.num_rows(),
        ..Default::default()
    };
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(declared.len());

    for col in declared {
        let idx = resolve_column(&raw_schema, &col.name).ok_or_else(|| {
            PipelineError::MissingColumn {
                dataset: entity.to_string(),
                column: col.name.clone(),
            }
        })?;
        let outcome = conform_column(
            &col.name,
            batch.column(idx),
            col.ty,
            row_offset,
            max_samples,
        )?;
        if outcome.failed > 0 {
            *quality.cast_failures.entry(col.name.clone()).or_default() += outcome.failed;
        }
        quality.samples.extend(outcome.samples);
        columns.push(outcome.array);
    }
    quality.samples.truncate(max_samples);

    let narrowed = RecordBatch::try_new(schema.clone(), columns)
        .with_context(|| format!("building normalized {} batch", entity))?;
    Ok((narrowed, quality))
}

/// Cast a raw source to its declared schema, partition by partition in
/// parallel. Customers are additionally deduplicated on customer_id.
#[instrument(level = "info", skip(raw, options), fields(source = %raw.entity))]
pub fn normalize_source(raw: &RawSource, options: &NormalizeOptions) -> Result<NormalizedSource> {
    let entity = raw.entity;
    let declared = entity.columns();
    let schema = build_arrow_schema(&declared);

    let mut offsets = Vec::with_capacity(raw.batches.len());
    let mut next = 0usize;
    for b in &raw.batches {
        offsets.push(next);
        next += b.num_rows();
    }

    let parts: Vec<(RecordBatch, SourceQuality)> = raw
        .batches
        .par_iter()
        .zip(offsets.par_iter())
        .map(|(batch, &offset)| {
            narrow_batch(
                entity,
                batch,
                &declared,
                &schema,
                offset,
                options.max_failure_samples,
            )
        })
        .collect::<Result<_>>()?;

    let mut quality = SourceQuality::default();
    let mut batches = Vec::with_capacity(parts.len());
    for (batch, q) in parts {
        quality.merge(q, options.max_failure_samples);
        batches.push(batch);
    }
    let mut data = Dataset::new(schema, batches)?;

    if entity == Entity::Customers {
        let (deduped, removed) = dedup_customers(&data.concat()?, options.dedup_policy)?;
        quality.duplicates_removed = removed;
        quality.rows_out = deduped.num_rows();
        data = Dataset::from_batch(deduped);
        if removed > 0 {
            info!(removed, policy = ?options.dedup_policy, "collapsed duplicate customer ids");
        }
    }

    for (column, failed) in &quality.cast_failures {
        warn!(source = %entity, column = %column, failed, "values failed to cast and were set to null");
    }
    info!(
        source = %entity,
        rows_in = quality.rows_read,
        rows_out = quality.rows_out,
        cast_failures = quality.total_cast_failures(),
        "normalized source"
    );

    Ok(NormalizedSource {
        entity,
        data,
        quality,
    })
}

pub fn normalize_all(raw: &RawSources, options: &NormalizeOptions) -> Result<NormalizedSources> {
    Ok(NormalizedSources {
        transactions: normalize_source(&raw.transactions, options)?,
        products: normalize_source(&raw.products, options)?,
        stores: normalize_source(&raw.stores, options)?,
        customers: normalize_source(&raw.customers, options)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{int_col, str_col};
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{DataType, Field, Int32Type};
    use std::collections::HashSet;

    fn raw(entity: Entity, batches: Vec<RecordBatch>) -> RawSource {
        RawSource {
            entity,
            files: Vec::new(),
            batches,
        }
    }

    fn batch(cols: Vec<(&str, ArrayRef)>) -> RecordBatch {
        RecordBatch::try_from_iter(cols).unwrap()
    }

    #[test]
    fn resolve_prefers_exact_then_case_insensitive() {
        let schema = Schema::new(vec![
            Field::new("Store_ID", DataType::Int32, true),
            Field::new("store_id", DataType::Int32, true),
            Field::new("LOCATION", DataType::Utf8, true),
        ]);
        assert_eq!(resolve_column(&schema, "store_id"), Some(1));
        assert_eq!(resolve_column(&schema, "location"), Some(2));
        assert_eq!(resolve_column(&schema, "store_name"), None);
    }

    #[test]
    fn narrows_superset_columns_and_counts_failures_across_partitions() -> Result<()> {
        let p1 = batch(vec![
            ("extra", str_col(&[Some("zzz"), Some("zzz")])),
            ("store_id", str_col(&[Some("1"), Some("two")])),
            ("Store_Name", str_col(&[Some("North"), Some("South")])),
            ("location", str_col(&[Some("Oslo"), None])),
        ]);
        let p2 = batch(vec![
            ("store_id", int_col(&[Some(3)])),
            ("store_name", str_col(&[Some("East")])),
            ("location", str_col(&[Some("Rome")])),
        ]);
        let out = normalize_source(
            &raw(Entity::Stores, vec![p1, p2]),
            &NormalizeOptions::default(),
        )?;
        assert_eq!(out.data.schema().fields().len(), 3);
        assert_eq!(out.data.num_rows(), 3);
        assert_eq!(out.quality.cast_failures["store_id"], 1);
        assert_eq!(out.quality.samples[0].row, 1);
        assert_eq!(out.quality.samples[0].raw_value, "two");

        let ids = out.data.concat()?;
        let ids = ids.column(0).as_primitive::<Int32Type>();
        assert_eq!(ids.value(0), 1);
        assert!(ids.is_null(1));
        assert_eq!(ids.value(2), 3);
        Ok(())
    }

    #[test]
    fn missing_declared_column_is_fatal() {
        let p = batch(vec![
            ("product_id", int_col(&[Some(1)])),
            ("product_name", str_col(&[Some("tea")])),
            ("price", str_col(&[Some("1.0")])),
        ]);
        let err = normalize_source(&raw(Entity::Products, vec![p]), &NormalizeOptions::default())
            .unwrap_err();
        match PipelineError::find(&err) {
            Some(PipelineError::MissingColumn { column, .. }) => assert_eq!(column, "category"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn customers_have_one_row_per_id() -> Result<()> {
        let p = batch(vec![
            ("customer_id", str_col(&[Some("7"), Some("7"), Some("8")])),
            ("first_name", str_col(&[Some("A"), Some("A"), Some("B")])),
            ("last_name", str_col(&[Some("L"), Some("L"), Some("M")])),
            ("email", str_col(&[Some("a@x"), Some("other@x"), Some("b@x")])),
            ("city", str_col(&[Some("Oslo"), Some("Oslo"), Some("Rome")])),
            (
                "registration_date",
                str_col(&[Some("2022-05-01"), Some("2021-01-01"), Some("2020-01-01")]),
            ),
        ]);
        let out = normalize_source(
            &raw(Entity::Customers, vec![p]),
            &NormalizeOptions::default(),
        )?;
        assert_eq!(out.data.num_rows(), 2);
        assert_eq!(out.quality.duplicates_removed, 1);

        let batch = out.data.concat()?;
        let ids: HashSet<i32> = batch
            .column(0)
            .as_primitive::<Int32Type>()
            .iter()
            .flatten()
            .collect();
        assert_eq!(ids, HashSet::from([7, 8]));
        // earliest registration wins
        assert_eq!(batch.column(3).as_string::<i32>().value(0), "other@x");
        Ok(())
    }

    #[test]
    fn empty_source_normalizes_to_empty_dataset() -> Result<()> {
        let out = normalize_source(
            &raw(Entity::Transactions, Vec::new()),
            &NormalizeOptions::default(),
        )?;
        assert_eq!(out.data.num_rows(), 0);
        assert_eq!(out.data.schema().fields().len(), 6);
        Ok(())
    }
}
