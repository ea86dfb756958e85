use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use crate::error::PipelineError;
use crate::normalize::dedup::DedupPolicy;
use crate::schema::default_grain;

pub const SILVER_TABLE: &str = "retail_silver_cleaned";
pub const GOLD_TABLE: &str = "retail_gold_sales_summary";

/// Where the four raw sources live. Each path is a parquet file or a
/// directory of parquet files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePaths {
    pub transactions: PathBuf,
    pub products: PathBuf,
    pub stores: PathBuf,
    pub customers: PathBuf,
}

/// A persisted output table and the name it is registered under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableTarget {
    pub location: PathBuf,
    pub table_name: String,
}

/// Everything a run needs; passed explicitly to each stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sources: SourcePaths,
    pub silver: TableTarget,
    pub gold: TableTarget,
    #[serde(default = "default_grain")]
    pub grain: Vec<String>,
    #[serde(default)]
    pub dedup_policy: DedupPolicy,
    #[serde(default = "default_batch_size")]
    pub read_batch_size: usize,
    #[serde(default = "default_max_failure_samples")]
    pub max_failure_samples: usize,
    /// JSON catalog the output tables are registered in, if any.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

fn default_batch_size() -> usize {
    8_192
}

fn default_max_failure_samples() -> usize {
    20
}

impl PipelineConfig {
    /// The bronze/silver/gold layout under a single root directory.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            sources: SourcePaths {
                transactions: root.join("bronze/transaction"),
                products: root.join("bronze/product"),
                stores: root.join("bronze/store"),
                customers: root.join("bronze/customer"),
            },
            silver: TableTarget {
                location: root.join("silver"),
                table_name: SILVER_TABLE.to_string(),
            },
            gold: TableTarget {
                location: root.join("gold"),
                table_name: GOLD_TABLE.to_string(),
            },
            grain: default_grain(),
            dedup_policy: DedupPolicy::default(),
            read_batch_size: default_batch_size(),
            max_failure_samples: default_max_failure_samples(),
            catalog: Some(root.join("catalog.json")),
        }
    }

    /// Load a YAML config. Relative paths resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: PipelineConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        if let Some(base) = path.parent() {
            cfg.resolve_relative(base);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.sources.transactions);
        fix(&mut self.sources.products);
        fix(&mut self.sources.stores);
        fix(&mut self.sources.customers);
        fix(&mut self.silver.location);
        fix(&mut self.gold.location);
        if let Some(c) = self.catalog.as_mut() {
            fix(c);
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.grain.is_empty() {
            return Err(PipelineError::InvalidConfig("grain must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for col in &self.grain {
            if !seen.insert(col.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "grain column `{}` listed twice",
                    col
                )));
            }
        }
        if self.read_batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "read_batch_size must be positive".into(),
            ));
        }
        if self.silver.location == self.gold.location {
            return Err(PipelineError::InvalidConfig(
                "silver and gold must not share a location".into(),
            ));
        }
        if self.silver.table_name == self.gold.table_name {
            return Err(PipelineError::InvalidConfig(
                "silver and gold must be registered under different names".into(),
            ));
        }
        Ok(())
    }
}
