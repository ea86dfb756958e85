use anyhow::{Context, Result};
use arrow::record_batch::RecordBatch;
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rayon::prelude::*;
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use crate::config::SourcePaths;
use crate::error::PipelineError;
use crate::schema::Entity;

/// A raw source snapshot as read from storage. Partitions keep the schema
/// of the file they came from; they are narrowed later by the normalizer.
#[derive(Debug, Clone)]
pub struct RawSource {
    pub entity: Entity,
    pub files: Vec<PathBuf>,
    pub batches: Vec<RecordBatch>,
}

impl RawSource {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// The four raw sources of one run.
#[derive(Debug, Clone)]
pub struct RawSources {
    pub transactions: RawSource,
    pub products: RawSource,
    pub stores: RawSource,
    pub customers: RawSource,
}

/// List the parquet files of a source location, in path order. Files and
/// directories starting with `_` or `.` are bookkeeping and are skipped.
/// A directory that cannot be listed fails the whole listing.
pub fn list_parquet_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let pattern = format!("{}/**/*.parquet", path.display());
    let entries = glob(&pattern).with_context(|| format!("invalid glob pattern `{}`", pattern))?;
    collect_data_files(path, entries)
}

fn collect_data_files<E>(
    root: &Path,
    entries: impl Iterator<Item = std::result::Result<PathBuf, E>>,
) -> Result<Vec<PathBuf>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let mut files = Vec::new();
    for entry in entries {
        let p = entry.with_context(|| format!("failed to list source `{}`", root.display()))?;
        let visible = p
            .strip_prefix(root)
            .map(|rel| {
                rel.components().all(|c| {
                    let s = c.as_os_str().to_string_lossy();
                    !s.starts_with('_') && !s.starts_with('.')
                })
            })
            .unwrap_or(false);
        if visible {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

/// Read every parquet file of a raw source into record batches.
///
/// A missing location or one with no parquet files is fatal.
#[instrument(level = "info", skip(path), fields(path = %path.display()))]
pub fn read_source(entity: Entity, path: &Path, batch_size: usize) -> Result<RawSource> {
    if !path.exists() {
        return Err(PipelineError::MissingSource {
            source_name: entity.to_string(),
            path: path.to_path_buf(),
        }
        .into());
    }
    let files = list_parquet_files(path)?;
    if files.is_empty() {
        return Err(PipelineError::MissingSource {
            source_name: entity.to_string(),
            path: path.to_path_buf(),
        }
        .into());
    }

    let per_file: Vec<Vec<RecordBatch>> = files
        .par_iter()
        .map(|p| read_parquet_file(p, batch_size))
        .collect::<Result<_>>()?;
    let batches: Vec<RecordBatch> = per_file.into_iter().flatten().collect();

    let source = RawSource {
        entity,
        files,
        batches,
    };
    info!(
        source = %entity,
        files = source.files.len(),
        rows = source.num_rows(),
        "read raw source"
    );
    Ok(source)
}

/// Read one parquet file fully.
pub fn read_parquet_file(path: &Path, batch_size: usize) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("failed to read parquet metadata of `{}`", path.display()))?
        .with_batch_size(batch_size)
        .build()
        .with_context(|| format!("failed to build reader for `{}`", path.display()))?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("error reading batch from `{}`", path.display()))?;
        if batch.num_rows() > 0 {
            batches.push(batch);
        }
    }
    debug!(file = %path.display(), batches = batches.len(), "read parquet file");
    Ok(batches)
}

/// Read all four sources. Any failure aborts before a single write happens.
pub fn read_all(paths: &SourcePaths, batch_size: usize) -> Result<RawSources> {
    Ok(RawSources {
        transactions: read_source(Entity::Transactions, &paths.transactions, batch_size)?,
        products: read_source(Entity::Products, &paths.products, batch_size)?,
        stores: read_source(Entity::Stores, &paths.stores, batch_size)?,
        customers: read_source(Entity::Customers, &paths.customers, batch_size)?,
    })
}
