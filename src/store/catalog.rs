use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::info;

use crate::schema::Column;

/// How a committed table is exposed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableHandle {
    pub name: String,
    pub location: PathBuf,
    pub version: u64,
    pub columns: Vec<Column>,
    pub registered_at: DateTime<Utc>,
}

/// Somewhere a table can be registered under a name.
pub trait TableRegistry {
    /// Register `handle`, replacing any entry with the same name.
    fn register(&self, handle: &TableHandle) -> Result<()>;

    fn lookup(&self, name: &str) -> Result<Option<TableHandle>>;
}

/// A registry kept as one JSON document on disk.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// All registered tables, ordered by name.
    pub fn tables(&self) -> Result<Vec<TableHandle>> {
        let f = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("opening {}", self.path.display()))
            }
        };
        serde_json::from_reader(io::BufReader::new(f))
            .with_context(|| format!("parsing {}", self.path.display()))
    }

    fn write_all(&self, tables: &[TableHandle]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("catalog.json");
        let tmp_path = dir.join(format!(".{}.tmp", file_name));

        let mut tmp = fs::File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        serde_json::to_writer_pretty(&mut tmp, tables).context("serializing catalog")?;
        tmp.write_all(b"\n")?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "renaming {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })
    }
}

impl TableRegistry for FileCatalog {
    fn register(&self, handle: &TableHandle) -> Result<()> {
        let mut by_name: BTreeMap<String, TableHandle> = self
            .tables()?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        by_name.insert(handle.name.clone(), handle.clone());
        let merged: Vec<TableHandle> = by_name.into_values().collect();
        self.write_all(&merged)?;
        info!(
            table = %handle.name,
            version = handle.version,
            location = %handle.location.display(),
            "registered table"
        );
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Option<TableHandle>> {
        Ok(self.tables()?.into_iter().find(|t| t.name == name))
    }
}
