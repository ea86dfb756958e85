use anyhow::{Context, Result};
use arrow::{
    array::{Array, AsArray, UInt32Array},
    compute::take_record_batch,
    datatypes::{Date32Type, Int32Type},
    record_batch::RecordBatch,
};
use serde::{Deserialize, Serialize};
use std::collections::{hash_map::Entry, HashMap};

use crate::schema::entities::{CUSTOMER_ID, REGISTRATION_DATE};

/// Which row survives when several customer rows share a customer_id.
///
/// The registration policies fall back to read order on ties; a row with a
/// null registration_date never beats one with a date.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    FirstSeen,
    LastSeen,
    #[default]
    EarliestRegistration,
    LatestRegistration,
}

impl DedupPolicy {
    fn prefers(&self, candidate: Option<i32>, current: Option<i32>) -> bool {
        match self {
            DedupPolicy::FirstSeen => false,
            DedupPolicy::LastSeen => true,
            DedupPolicy::EarliestRegistration => match (candidate, current) {
                (Some(a), Some(b)) => a < b,
                (Some(_), None) => true,
                _ => false,
            },
            DedupPolicy::LatestRegistration => match (candidate, current) {
                (Some(a), Some(b)) => a > b,
                (Some(_), None) => true,
                _ => false,
            },
        }
    }
}

/// Keep exactly one row per customer_id. Rows with a null id form a single
/// group. Survivors stay in read order. Returns the deduplicated batch and
/// the number of rows removed.
pub fn dedup_customers(batch: &RecordBatch, policy: DedupPolicy) -> Result<(RecordBatch, usize)> {
    let ids = batch
        .column_by_name(CUSTOMER_ID)
        .context("customers batch has no customer_id column")?
        .as_primitive_opt::<Int32Type>()
        .context("customer_id must be Int32 after normalization")?;
    let registered = batch
        .column_by_name(REGISTRATION_DATE)
        .context("customers batch has no registration_date column")?
        .as_primitive_opt::<Date32Type>()
        .context("registration_date must be Date32 after normalization")?;

    let date_at = |row: usize| registered.is_valid(row).then(|| registered.value(row));

    let mut winners: HashMap<Option<i32>, usize> = HashMap::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let key = ids.is_valid(row).then(|| ids.value(row));
        match winners.entry(key) {
            Entry::Vacant(e) => {
                e.insert(row);
            }
            Entry::Occupied(mut e) => {
                if policy.prefers(date_at(row), date_at(*e.get())) {
                    e.insert(row);
                }
            }
        }
    }

    let mut keep: Vec<u32> = winners.into_values().map(|r| r as u32).collect();
    keep.sort_unstable();
    let removed = batch.num_rows() - keep.len();
    let indices = UInt32Array::from(keep);
    let deduped = take_record_batch(batch, &indices).context("selecting surviving customers")?;
    Ok((deduped, removed))
}
