//! Run driver: raw → conformed (silver) → summary (gold).
//!
//! Stages run strictly in order and each one is a function of the previous
//! stage's output only. Any stage error halts the run. Once silver has been
//! committed, a later failure withdraws that commit again so silver and gold
//! always describe the same run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Instant};
use tracing::{error, info, info_span, warn};

use crate::aggregate::{check_grain, summarize};
use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::enrich::{enrich, silver_schema, Enriched};
use crate::normalize::{normalize_all, NormalizeOptions, NormalizedSources};
use crate::quality::QualityReport;
use crate::schema::Entity;
use crate::source::{read_all, RawSources};
use crate::store::{
    catalog::{FileCatalog, TableRegistry},
    Commit, TableStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ReadRaw,
    Normalize,
    Join,
    WriteSilver,
    ReadSilver,
    Aggregate,
    WriteGold,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ReadRaw => "read_raw",
            Stage::Normalize => "normalize",
            Stage::Join => "join",
            Stage::WriteSilver => "write_silver",
            Stage::ReadSilver => "read_silver",
            Stage::Aggregate => "aggregate",
            Stage::WriteGold => "write_gold",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rows produced and time spent by one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub rows: usize,
    pub elapsed_ms: u128,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageRecord>,
    pub raw_rows: BTreeMap<Entity, usize>,
    pub silver_rows: usize,
    pub gold_rows: usize,
    pub silver_version: u64,
    pub gold_version: u64,
    pub quality: QualityReport,
}

/// Run `f` as `stage`: inside its own span, timed, with the stage name
/// attached to any error.
fn stage<T>(
    records: &mut Vec<StageRecord>,
    stage: Stage,
    rows: impl Fn(&T) -> usize,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let span = info_span!("stage", name = %stage);
    let _enter = span.enter();
    let start = Instant::now();
    let out = f().with_context(|| format!("stage `{}` failed", stage))?;
    let record = StageRecord {
        stage,
        rows: rows(&out),
        elapsed_ms: start.elapsed().as_millis(),
    };
    info!(stage = %stage, rows = record.rows, elapsed_ms = record.elapsed_ms as u64, "stage complete");
    records.push(record);
    Ok(out)
}

pub fn read_raw(cfg: &PipelineConfig) -> Result<RawSources> {
    read_all(&cfg.sources, cfg.read_batch_size)
}

pub fn normalize(cfg: &PipelineConfig, raw: &RawSources) -> Result<NormalizedSources> {
    let options = NormalizeOptions {
        dedup_policy: cfg.dedup_policy,
        max_failure_samples: cfg.max_failure_samples,
    };
    normalize_all(raw, &options)
}

pub fn join(normalized: &NormalizedSources) -> Result<Enriched> {
    enrich(
        &normalized.transactions.data,
        &normalized.customers.data,
        &normalized.products.data,
        &normalized.stores.data,
    )
}

pub fn write_silver(store: &TableStore, silver: &Dataset) -> Result<Commit> {
    store.overwrite(silver)
}

pub fn read_silver(store: &TableStore) -> Result<Dataset> {
    store.read()
}

pub fn aggregate(cfg: &PipelineConfig, silver: &Dataset) -> Result<Dataset> {
    summarize(silver, &cfg.grain)
}

pub fn write_gold(store: &TableStore, gold: &Dataset) -> Result<Commit> {
    store.overwrite(gold)
}

fn raw_counts(raw: &RawSources) -> BTreeMap<Entity, usize> {
    BTreeMap::from([
        (Entity::Transactions, raw.transactions.num_rows()),
        (Entity::Products, raw.products.num_rows()),
        (Entity::Stores, raw.stores.num_rows()),
        (Entity::Customers, raw.customers.num_rows()),
    ])
}

fn quality_of(normalized: &NormalizedSources, enriched: &Enriched) -> QualityReport {
    let sources = [
        &normalized.transactions,
        &normalized.products,
        &normalized.stores,
        &normalized.customers,
    ]
    .into_iter()
    .map(|s| (s.entity, s.quality.clone()))
    .collect();
    QualityReport {
        sources,
        join_drops: enriched.drops,
        duplicate_dimension_keys: enriched.duplicate_keys.clone(),
    }
}

/// Stages after the silver commit; the caller reverts silver if this fails.
fn downstream(
    records: &mut Vec<StageRecord>,
    cfg: &PipelineConfig,
    silver_store: &TableStore,
    gold_store: &TableStore,
) -> Result<(Dataset, Commit)> {
    let silver = stage(records, Stage::ReadSilver, Dataset::num_rows, || {
        read_silver(silver_store)
    })?;
    let gold = stage(records, Stage::Aggregate, Dataset::num_rows, || {
        aggregate(cfg, &silver)
    })?;
    let commit = stage(records, Stage::WriteGold, |c: &Commit| c.num_rows, || {
        write_gold(gold_store, &gold)
    })?;
    Ok((silver, commit))
}

/// Withdraw `commit` after a later stage failed. A failed revert is attached
/// to `err`, since the table is then ahead of its summary.
fn revert_after_failure(store: &TableStore, commit: &Commit, err: anyhow::Error) -> anyhow::Error {
    error!(
        table = store.name(),
        error = %format!("{:#}", err),
        "run failed after commit; reverting"
    );
    match store.revert(commit) {
        Ok(()) => err,
        Err(revert_err) => {
            error!(table = store.name(), error = %format!("{:#}", revert_err), "could not revert");
            err.context(format!(
                "`{}` version {} could not be reverted and is ahead of gold: {:#}",
                store.name(),
                commit.version,
                revert_err
            ))
        }
    }
}

/// Run the whole pipeline, registering both tables in the configured
/// catalog (if any) once they are committed.
pub fn run(cfg: &PipelineConfig) -> Result<RunReport> {
    match &cfg.catalog {
        Some(path) => {
            let catalog = FileCatalog::new(path);
            run_with_registry(cfg, Some(&catalog as &dyn TableRegistry))
        }
        None => run_with_registry(cfg, None),
    }
}

pub fn run_with_registry(
    cfg: &PipelineConfig,
    registry: Option<&dyn TableRegistry>,
) -> Result<RunReport> {
    cfg.validate()?;
    // grain problems surface before any raw data is touched
    check_grain(&silver_schema(), &cfg.grain)?;

    let started_at = Utc::now();
    info!(
        silver = %cfg.silver.location.display(),
        gold = %cfg.gold.location.display(),
        "pipeline run starting"
    );
    let silver_store = TableStore::new(&cfg.silver.location, &cfg.silver.table_name);
    let gold_store = TableStore::new(&cfg.gold.location, &cfg.gold.table_name);
    let mut records = Vec::new();

    let raw = stage(&mut records, Stage::ReadRaw, |r: &RawSources| r.transactions.num_rows(), || {
        read_raw(cfg)
    })?;
    let normalized = stage(
        &mut records,
        Stage::Normalize,
        |n: &NormalizedSources| n.transactions.data.num_rows(),
        || normalize(cfg, &raw),
    )?;
    let enriched = stage(&mut records, Stage::Join, |e: &Enriched| e.data.num_rows(), || {
        join(&normalized)
    })?;
    let quality = quality_of(&normalized, &enriched);
    let raw_rows = raw_counts(&raw);
    drop(raw);
    drop(normalized);

    let silver_commit = stage(&mut records, Stage::WriteSilver, |c: &Commit| c.num_rows, || {
        write_silver(&silver_store, &enriched.data)
    })?;
    drop(enriched);

    let (silver, gold_commit) =
        match downstream(&mut records, cfg, &silver_store, &gold_store) {
            Ok(v) => v,
            Err(e) => return Err(revert_after_failure(&silver_store, &silver_commit, e)),
        };

    for store in [&silver_store, &gold_store] {
        if let Err(e) = store.vacuum() {
            warn!(table = store.name(), error = %format!("{:#}", e), "vacuum failed");
        }
    }

    if let Some(registry) = registry {
        for store in [&silver_store, &gold_store] {
            let registered = store.handle().and_then(|h| registry.register(&h));
            if let Err(e) = registered {
                warn!(table = store.name(), error = %format!("{:#}", e), "table registration failed");
            }
        }
    }

    records.push(StageRecord {
        stage: Stage::Done,
        rows: gold_commit.num_rows,
        elapsed_ms: 0,
    });
    let report = RunReport {
        started_at,
        finished_at: Utc::now(),
        stages: records,
        raw_rows,
        silver_rows: silver.num_rows(),
        gold_rows: gold_commit.num_rows,
        silver_version: silver_commit.version,
        gold_version: gold_commit.version,
        quality,
    };
    info!(
        silver_rows = report.silver_rows,
        gold_rows = report.gold_rows,
        dropped = report.quality.join_drops.total(),
        cast_failures = report.quality.total_cast_failures(),
        "pipeline run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::schema::entities::{
        NUMBER_OF_TRANSACTIONS, TOTAL_AMOUNT, TOTAL_QUANTITY_SOLD, TOTAL_SALES_AMOUNT,
        TRANSACTION_ID,
    };
    use crate::store::log;
    use crate::testutil::{str_col, write_bronze, write_parquet};
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Float64Type, Int32Type, Int64Type};
    use std::fs;
    use tempfile::tempdir;

    fn init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn end_to_end_bronze_to_gold() -> Result<()> {
        init();
        let dir = tempdir()?;
        let cfg = write_bronze(dir.path())?;
        let report = run(&cfg)?;

        assert_eq!(report.raw_rows[&Entity::Transactions], 6);
        assert_eq!(report.silver_rows, 4);
        assert_eq!(report.gold_rows, 2);
        assert_eq!(report.quality.join_drops.missing_store, 1);
        assert_eq!(report.quality.join_drops.missing_customer, 1);
        let tx_quality = &report.quality.sources[&Entity::Transactions];
        assert_eq!(tx_quality.cast_failures["quantity"], 1);
        assert_eq!(tx_quality.samples[0].raw_value, "lots");
        assert_eq!(report.quality.sources[&Entity::Customers].duplicates_removed, 1);
        assert_eq!(report.stages.last().map(|s| s.stage), Some(Stage::Done));

        let silver = TableStore::new(&cfg.silver.location, &cfg.silver.table_name)
            .read()?
            .concat()?;
        let mut ids: Vec<i32> = silver
            .column_by_name(TRANSACTION_ID)
            .unwrap()
            .as_primitive::<Int32Type>()
            .iter()
            .flatten()
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 6]);
        let totals = silver.column_by_name(TOTAL_AMOUNT).unwrap();
        assert_eq!(totals.null_count(), 1);

        let gold = TableStore::new(&cfg.gold.location, &cfg.gold.table_name)
            .read()?
            .concat()?;
        let qty = gold.column_by_name(TOTAL_QUANTITY_SOLD).unwrap().as_primitive::<Int64Type>();
        let amount = gold.column_by_name(TOTAL_SALES_AMOUNT).unwrap().as_primitive::<Float64Type>();
        let n_tx = gold
            .column_by_name(NUMBER_OF_TRANSACTIONS)
            .unwrap()
            .as_primitive::<Int64Type>();
        // 2023-01-01 / Espresso, then 2023-01-02 / Teapot
        assert_eq!(qty.value(0), 5);
        assert!((amount.value(0) - 49.95).abs() < 1e-9);
        assert_eq!(n_tx.value(0), 2);
        assert_eq!(qty.value(1), 1);
        assert!((amount.value(1) - 25.0).abs() < 1e-9);
        assert_eq!(n_tx.value(1), 2);

        let catalog = FileCatalog::new(cfg.catalog.as_ref().unwrap());
        assert_eq!(catalog.tables()?.len(), 2);
        assert_eq!(catalog.lookup(&cfg.gold.table_name)?.unwrap().version, 0);
        Ok(())
    }

    #[test]
    fn rerun_on_same_input_is_idempotent() -> Result<()> {
        init();
        let dir = tempdir()?;
        let cfg = write_bronze(dir.path())?;
        run(&cfg)?;
        let gold_store = TableStore::new(&cfg.gold.location, &cfg.gold.table_name);
        let silver_store = TableStore::new(&cfg.silver.location, &cfg.silver.table_name);
        let first_gold = gold_store.read()?.concat()?;
        let first_silver = silver_store.read()?.concat()?;

        let second = run(&cfg)?;
        assert_eq!(second.gold_version, 1);
        assert_eq!(gold_store.read()?.concat()?, first_gold);
        assert_eq!(silver_store.read()?.concat()?, first_silver);
        // superseded versions were vacuumed
        assert_eq!(log::list_versions(&cfg.gold.location)?, vec![1]);
        Ok(())
    }

    #[test]
    fn missing_source_fails_before_any_write() -> Result<()> {
        init();
        let dir = tempdir()?;
        let cfg = write_bronze(dir.path())?;
        fs::remove_dir_all(&cfg.sources.stores)?;

        let err = run(&cfg).unwrap_err();
        assert!(matches!(
            PipelineError::find(&err),
            Some(PipelineError::MissingSource { .. })
        ));
        assert!(format!("{:#}", err).contains("read_raw"));
        assert!(!cfg.silver.location.exists());
        assert!(!cfg.gold.location.exists());
        Ok(())
    }

    #[test]
    fn invalid_grain_is_rejected_up_front() -> Result<()> {
        let dir = tempdir()?;
        let mut cfg = write_bronze(dir.path())?;
        cfg.grain = vec!["region".into()];
        let err = run(&cfg).unwrap_err();
        assert!(matches!(
            PipelineError::find(&err),
            Some(PipelineError::InvalidGrain(_))
        ));
        assert!(!cfg.silver.location.exists());
        Ok(())
    }

    #[test]
    fn failed_gold_write_keeps_previous_artifacts() -> Result<()> {
        init();
        let dir = tempdir()?;
        let cfg = write_bronze(dir.path())?;
        let first = run(&cfg)?;

        // new data arrives, but gold's next version is already taken
        write_parquet(
            &cfg.sources.transactions.join("part-2.parquet"),
            &[
                ("transaction_id", str_col(&[Some("7")])),
                ("customer_id", str_col(&[Some("10")])),
                ("product_id", str_col(&[Some("6")])),
                ("store_id", str_col(&[Some("2")])),
                ("quantity", str_col(&[Some("8")])),
                ("transaction_date", str_col(&[Some("2023-01-03")])),
            ],
        )?;
        // the gold commit entry cannot be staged
        let gold_store = TableStore::new(&cfg.gold.location, &cfg.gold.table_name);
        let before = gold_store.read()?.concat()?;
        fs::create_dir_all(log::staging_path(&cfg.gold.location, first.gold_version + 1))?;

        let err = run(&cfg).unwrap_err();
        assert!(format!("{:#}", err).contains("write_gold"));

        let silver = TableStore::new(&cfg.silver.location, &cfg.silver.table_name);
        assert_eq!(silver.current()?.unwrap().version, first.silver_version);
        assert_eq!(silver.read()?.num_rows(), first.silver_rows);
        assert_eq!(gold_store.current()?.unwrap().version, first.gold_version);
        assert_eq!(gold_store.read()?.concat()?, before);
        Ok(())
    }

    #[test]
    fn failed_revert_is_reported_with_the_run_error() -> Result<()> {
        init();
        let dir = tempdir()?;
        let cfg = write_bronze(dir.path())?;
        let first = run(&cfg)?;
        let silver = TableStore::new(&cfg.silver.location, &cfg.silver.table_name);
        let commit = silver.overwrite(&silver.read()?)?;
        // someone else already withdrew it
        log::withdraw(&cfg.silver.location, commit.version)?;

        let cause = anyhow::Error::new(PipelineError::MissingColumn {
            dataset: "gold".into(),
            column: "store_id".into(),
        });
        let err = revert_after_failure(&silver, &commit, cause);
        let msg = format!("{:#}", err);
        assert!(msg.contains("could not be reverted"), "{}", msg);
        assert!(msg.contains(&format!("version {}", first.silver_version + 1)), "{}", msg);
        assert!(PipelineError::find(&err).is_some());
        Ok(())
    }

    #[test]
    fn successful_revert_returns_the_run_error_unchanged() -> Result<()> {
        init();
        let dir = tempdir()?;
        let cfg = write_bronze(dir.path())?;
        let first = run(&cfg)?;
        let silver = TableStore::new(&cfg.silver.location, &cfg.silver.table_name);
        let commit = silver.overwrite(&silver.read()?)?;

        let err = revert_after_failure(&silver, &commit, anyhow::anyhow!("aggregate failed"));
        assert_eq!(format!("{:#}", err), "aggregate failed");
        assert_eq!(silver.current()?.unwrap().version, first.silver_version);
        Ok(())
    }
}
