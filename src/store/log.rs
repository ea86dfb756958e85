//! Commit log of a table directory.
//!
//! Each committed version is one JSON manifest under `<location>/_log/`,
//! named by its zero-padded version number. The newest manifest is the
//! table; data files not named by it are invisible to readers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::error::PipelineError;
use crate::schema::Column;

pub const LOG_DIR: &str = "_log";

/// One committed version of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub table_name: String,
    pub committed_at: DateTime<Utc>,
    pub columns: Vec<Column>,
    /// Data file names, relative to the table location, in read order.
    pub files: Vec<String>,
    pub num_rows: usize,
}

pub fn log_dir(location: &Path) -> PathBuf {
    location.join(LOG_DIR)
}

pub fn entry_path(location: &Path, version: u64) -> PathBuf {
    log_dir(location).join(format!("{:020}.json", version))
}

/// Where this process stages a log entry before linking it into place.
pub(crate) fn staging_path(location: &Path, version: u64) -> PathBuf {
    log_dir(location).join(format!(".{:020}.json.{}.tmp", version, std::process::id()))
}

fn parse_version(path: &Path) -> Option<u64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// All committed versions, ascending.
pub fn list_versions(location: &Path) -> Result<Vec<u64>> {
    let dir = log_dir(location);
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("listing commit log `{}`", dir.display()))
        }
    };
    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("listing commit log `{}`", dir.display()))?;
        if let Some(v) = parse_version(&entry.path()) {
            versions.push(v);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

pub fn latest_version(location: &Path) -> Result<Option<u64>> {
    Ok(list_versions(location)?.last().copied())
}

pub fn read_manifest(location: &Path, version: u64) -> Result<Manifest> {
    let path = entry_path(location, version);
    let f = fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(io::BufReader::new(f))
        .with_context(|| format!("parsing {}", path.display()))
}

pub fn latest_manifest(location: &Path) -> Result<Option<Manifest>> {
    match latest_version(location)? {
        Some(v) => read_manifest(location, v).map(Some),
        None => Ok(None),
    }
}

/// Publish `manifest` as the next version, failing with
/// [`PipelineError::ConcurrentWrite`] if that version already exists.
///
/// The entry is fully written and synced under a temp name first, then
/// hard-linked into place; the link fails if the target exists, so two
/// writers can never both commit the same version.
pub fn publish(location: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let dir = log_dir(location);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let path = entry_path(location, manifest.version);
    let tmp_path = staging_path(location, manifest.version);
    {
        let mut tmp = fs::File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        serde_json::to_writer_pretty(&mut tmp, manifest).context("serializing manifest")?;
        tmp.write_all(b"\n")?;
        tmp.sync_all()
            .with_context(|| format!("syncing {}", tmp_path.display()))?;
    }

    let linked = fs::hard_link(&tmp_path, &path);
    let _ = fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => {
            debug!(entry = %path.display(), version = manifest.version, "published manifest");
            Ok(path)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(PipelineError::ConcurrentWrite {
                location: location.to_path_buf(),
                version: manifest.version,
            }
            .into())
        }
        Err(e) => Err(e).with_context(|| format!("linking {}", path.display())),
    }
}

/// Remove the log entry of `version`, making the previous version current.
pub fn withdraw(location: &Path, version: u64) -> Result<()> {
    let path = entry_path(location, version);
    fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))
}
