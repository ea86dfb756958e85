//! Data-quality events absorbed by the pipeline.
//!
//! Nothing in here aborts a run: failed casts become nulls and unmatched
//! transactions are dropped, but both are counted so they can be reported.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::Entity;

/// One raw value that could not be cast to its declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastFailure {
    pub column: String,
    /// Row position within the source, in read order.
    pub row: usize,
    pub raw_value: String,
    pub reason: String,
}

/// Normalization outcome for one raw source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceQuality {
    pub rows_read: usize,
    pub rows_out: usize,
    /// Failed casts per column.
    pub cast_failures: BTreeMap<String, u64>,
    /// The first few failures, capped by `max_failure_samples`.
    pub samples: Vec<CastFailure>,
    /// Rows removed by key deduplication.
    pub duplicates_removed: usize,
}

impl SourceQuality {
    pub fn total_cast_failures(&self) -> u64 {
        self.cast_failures.values().sum()
    }

    /// Fold another partition's outcome into this one.
    pub fn merge(&mut self, other: SourceQuality, max_samples: usize) {
        self.rows_read += other.rows_read;
        self.rows_out += other.rows_out;
        self.duplicates_removed += other.duplicates_removed;
        for (col, n) in other.cast_failures {
            *self.cast_failures.entry(col).or_default() += n;
        }
        let room = max_samples.saturating_sub(self.samples.len());
        self.samples.extend(other.samples.into_iter().take(room));
    }
}

/// Transactions removed by the inner joins, attributed to the first join
/// in the chain that found no match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDrops {
    pub missing_customer: usize,
    pub missing_product: usize,
    pub missing_store: usize,
}

impl JoinDrops {
    pub fn total(&self) -> usize {
        self.missing_customer + self.missing_product + self.missing_store
    }

    pub fn merge(&mut self, other: JoinDrops) {
        self.missing_customer += other.missing_customer;
        self.missing_product += other.missing_product;
        self.missing_store += other.missing_store;
    }
}

/// Everything a run absorbed instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub sources: BTreeMap<Entity, SourceQuality>,
    pub join_drops: JoinDrops,
    /// Dimension keys that occur more than once, per dimension. Each extra
    /// occurrence fans matching transactions out into additional rows.
    pub duplicate_dimension_keys: BTreeMap<Entity, usize>,
}

impl QualityReport {
    pub fn total_cast_failures(&self) -> u64 {
        self.sources.values().map(SourceQuality::total_cast_failures).sum()
    }
}
