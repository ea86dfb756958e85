//! Versioned parquet tables with whole-table overwrite.
//!
//! A table is a directory of parquet data files plus a commit log (see
//! [`log`]). Writers put new data files next to the old ones and then
//! publish a manifest naming them; readers follow the newest manifest.
//! A writer that dies before publishing leaves only unreferenced files,
//! which the next [`TableStore::vacuum`] removes.

pub mod catalog;
pub mod log;

use anyhow::{Context, Result};
use chrono::Utc;
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, info, instrument, warn};

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::schema::{build_arrow_schema, columns_of};
use crate::source::read_parquet_file;
use catalog::TableHandle;
use log::Manifest;

const READ_BATCH_SIZE: usize = 8_192;

/// Result of a successful overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub version: u64,
    /// Version that was current before this commit.
    pub previous: Option<u64>,
    pub num_rows: usize,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VacuumStats {
    pub data_files_removed: usize,
    pub log_entries_removed: usize,
}

fn data_file_name(version: u64, token: &str, n: usize) -> String {
    format!("part-{:05}-{}-{:04}.parquet", version, token, n)
}

/// Version a data file was written for, parsed from its name.
fn data_file_version(name: &str) -> Option<u64> {
    name.strip_suffix(".parquet")?
        .strip_prefix("part-")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

/// A named table at a fixed location.
#[derive(Debug, Clone)]
pub struct TableStore {
    location: PathBuf,
    name: String,
}

impl TableStore {
    pub fn new<P: AsRef<Path>>(location: P, name: &str) -> Self {
        Self {
            location: location.as_ref().to_path_buf(),
            name: name.to_string(),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manifest of the current version, if the table was ever committed.
    pub fn current(&self) -> Result<Option<Manifest>> {
        log::latest_manifest(&self.location)
    }

    /// Replace the table contents with `data`.
    ///
    /// Nothing becomes visible to readers until the manifest is published.
    /// On a commit conflict the files written here are removed again.
    #[instrument(level = "info", skip(self, data), fields(table = %self.name, rows = data.num_rows()))]
    pub fn overwrite(&self, data: &Dataset) -> Result<Commit> {
        let schema = data.schema();
        let columns = columns_of(&schema).with_context(|| {
            format!("table `{}` has a column type that cannot be stored", self.name)
        })?;
        fs::create_dir_all(&self.location)
            .with_context(|| format!("creating table directory `{}`", self.location.display()))?;

        let previous = log::latest_version(&self.location)?;
        let version = previous.map_or(0, |v| v + 1);
        let token = format!(
            "{}{:06}",
            Utc::now().timestamp_micros(),
            std::process::id() % 1_000_000
        );

        // one file per partition; an empty dataset still gets one file so the
        // schema survives the round trip
        let mut files = Vec::new();
        let batches = data.batches();
        let parts = batches.len().max(1);
        for n in 0..parts {
            let file_name = data_file_name(version, &token, n);
            let batch = batches.get(n);
            if let Err(e) = self.write_data_file(&file_name, &schema, batch) {
                self.remove_files(&files);
                return Err(e);
            }
            files.push(file_name);
        }

        let manifest = Manifest {
            version,
            table_name: self.name.clone(),
            committed_at: Utc::now(),
            columns,
            files: files.clone(),
            num_rows: data.num_rows(),
        };
        if let Err(e) = log::publish(&self.location, &manifest) {
            self.remove_files(&files);
            return Err(e);
        }

        info!(
            table = %self.name,
            version,
            files = files.len(),
            rows = manifest.num_rows,
            "committed table version"
        );
        Ok(Commit {
            version,
            previous,
            num_rows: manifest.num_rows,
            files,
        })
    }

    fn write_data_file(
        &self,
        file_name: &str,
        schema: &arrow::datatypes::SchemaRef,
        batch: Option<&arrow::record_batch::RecordBatch>,
    ) -> Result<()> {
        let final_path = self.location.join(file_name);
        let tmp_path = self.location.join(format!("{}.tmp", file_name));

        let tmp_file = File::create(&tmp_path)
            .with_context(|| format!("creating temporary file `{}`", tmp_path.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(BufWriter::new(tmp_file), schema.clone(), Some(props))
            .context("initializing Parquet writer")?;
        if let Some(batch) = batch {
            writer.write(batch).context("writing batch to Parquet")?;
        }
        writer.close().context("closing Parquet writer")?;

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename `{}` to `{}`",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        debug!(file = %final_path.display(), "wrote data file");
        Ok(())
    }

    fn remove_files(&self, files: &[String]) {
        for f in files {
            let path = self.location.join(f);
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "could not remove data file");
            }
        }
    }

    /// Read the current version back, partitions in manifest order.
    #[instrument(level = "info", skip(self), fields(table = %self.name))]
    pub fn read(&self) -> Result<Dataset> {
        let manifest = self
            .current()?
            .ok_or_else(|| PipelineError::TableNotFound(self.location.clone()))?;
        let schema = build_arrow_schema(&manifest.columns);

        let mut batches = Vec::new();
        for file in &manifest.files {
            batches.extend(read_parquet_file(&self.location.join(file), READ_BATCH_SIZE)?);
        }
        let data = Dataset::new(schema, batches).with_context(|| {
            format!(
                "data files of `{}` version {} disagree with its manifest",
                self.name, manifest.version
            )
        })?;
        if data.num_rows() != manifest.num_rows {
            anyhow::bail!(
                "table `{}` version {} has {} rows, manifest says {}",
                self.name,
                manifest.version,
                data.num_rows(),
                manifest.num_rows
            );
        }
        debug!(version = manifest.version, rows = data.num_rows(), "read table");
        Ok(data)
    }

    /// Withdraw `commit`, restoring the version that preceded it.
    ///
    /// Only the current version can be reverted; if another writer has
    /// committed since, the table is left alone.
    pub fn revert(&self, commit: &Commit) -> Result<()> {
        let current = log::latest_version(&self.location)?;
        if current != Some(commit.version) {
            anyhow::bail!(
                "cannot revert `{}` to before version {}: current version is {:?}",
                self.name,
                commit.version,
                current
            );
        }
        log::withdraw(&self.location, commit.version)?;
        self.remove_files(&commit.files);
        warn!(
            table = %self.name,
            reverted = commit.version,
            restored = ?commit.previous,
            "reverted table version"
        );
        Ok(())
    }

    /// Delete log entries and data files superseded by the current version,
    /// plus temp files left by interrupted writers.
    #[instrument(level = "debug", skip(self), fields(table = %self.name))]
    pub fn vacuum(&self) -> Result<VacuumStats> {
        let mut stats = VacuumStats::default();
        let Some(current) = self.current()? else {
            return Ok(stats);
        };

        for v in log::list_versions(&self.location)? {
            if v < current.version {
                let path = log::entry_path(&self.location, v);
                match fs::remove_file(&path) {
                    Ok(()) => stats.log_entries_removed += 1,
                    Err(e) => warn!(entry = %path.display(), error = %e, "vacuum: could not remove log entry"),
                }
            }
        }

        // files of later versions or newer temp files belong to writers that
        // have not published yet
        let live: HashSet<&str> = current.files.iter().map(String::as_str).collect();
        let cutoff = SystemTime::from(current.committed_at);
        let entries = fs::read_dir(&self.location)
            .with_context(|| format!("listing `{}`", self.location.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let stale = if name.ends_with(".tmp") {
                entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|t| t < cutoff)
                    .unwrap_or(false)
            } else {
                !live.contains(name)
                    && data_file_version(name).is_some_and(|v| v <= current.version)
            };
            if stale {
                match fs::remove_file(&path) {
                    Ok(()) => stats.data_files_removed += 1,
                    Err(e) => warn!(file = %path.display(), error = %e, "vacuum: could not remove file"),
                }
            }
        }

        info!(
            table = %self.name,
            version = current.version,
            data_files = stats.data_files_removed,
            log_entries = stats.log_entries_removed,
            "vacuumed table"
        );
        Ok(stats)
    }

    /// Handle for registering the current version.
    pub fn handle(&self) -> Result<TableHandle> {
        let manifest = self
            .current()?
            .ok_or_else(|| PipelineError::TableNotFound(self.location.clone()))?;
        let location = fs::canonicalize(&self.location).unwrap_or_else(|_| self.location.clone());
        Ok(TableHandle {
            name: self.name.clone(),
            location,
            version: manifest.version,
            columns: manifest.columns,
            registered_at: Utc::now(),
        })
    }
}
