use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, AsArray, Int32Array, UInt32Array},
    compute::{cast, kernels::numeric::mul, take},
    datatypes::{DataType, Int32Type, SchemaRef},
    record_batch::RecordBatch,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, instrument, warn};

use crate::dataset::Dataset;
use crate::quality::JoinDrops;
use crate::schema::entities::{CUSTOMER_ID, PRICE, PRODUCT_ID, QUANTITY, STORE_ID, TOTAL_AMOUNT};
use crate::schema::{build_arrow_schema, Column, Entity, LogicalType};

/// Join keys in the order the joins are applied.
const JOIN_KEYS: [(Entity, &str); 3] = [
    (Entity::Customers, CUSTOMER_ID),
    (Entity::Products, PRODUCT_ID),
    (Entity::Stores, STORE_ID),
];

/// Output columns of the conformed fact table and the side each one is
/// taken from. Each `USING`-style join moves its key to the front, so the
/// last join key leads.
pub fn silver_plan() -> Vec<(Entity, Column)> {
    let tx_cols = Entity::Transactions.columns();
    let key_col = |name: &str| {
        tx_cols
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .map(|c| (Entity::Transactions, c))
    };
    let mut plan: Vec<(Entity, Column)> = JOIN_KEYS
        .iter()
        .rev()
        .filter_map(|(_, key)| key_col(key))
        .collect();

    let is_join_key = |name: &str| JOIN_KEYS.iter().any(|(_, k)| *k == name);
    for entity in [
        Entity::Transactions,
        Entity::Customers,
        Entity::Products,
        Entity::Stores,
    ] {
        for col in entity.columns() {
            if !is_join_key(&col.name) {
                plan.push((entity, col));
            }
        }
    }
    plan
}

/// Declared columns of the conformed fact table.
pub fn silver_columns() -> Vec<Column> {
    let mut cols: Vec<Column> = silver_plan().into_iter().map(|(_, c)| c).collect();
    cols.push(Column::new(TOTAL_AMOUNT, LogicalType::Float64));
    cols
}

pub fn silver_schema() -> SchemaRef {
    build_arrow_schema(&silver_columns())
}

/// Hash index over one dimension's surrogate key.
struct DimIndex {
    batch: RecordBatch,
    rows: HashMap<i32, Vec<u32>>,
    duplicate_keys: usize,
}

impl DimIndex {
    fn build(entity: Entity, data: &Dataset) -> Result<Self> {
        let batch = data.concat()?;
        let keys = int_column(&batch, entity.key())?;
        let mut rows: HashMap<i32, Vec<u32>> = HashMap::with_capacity(batch.num_rows());
        for (row, key) in keys.iter().enumerate() {
            if let Some(k) = key {
                rows.entry(k).or_default().push(row as u32);
            }
        }
        let duplicate_keys = rows.values().filter(|v| v.len() > 1).count();
        if duplicate_keys > 0 {
            warn!(
                dimension = %entity,
                duplicate_keys,
                "dimension keys are not unique; matching transactions fan out"
            );
        }
        Ok(Self {
            batch,
            rows,
            duplicate_keys,
        })
    }

    fn lookup(&self, keys: &Int32Array, row: usize) -> Option<&[u32]> {
        if keys.is_null(row) {
            return None;
        }
        self.rows.get(&keys.value(row)).map(Vec::as_slice)
    }
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int32Array> {
    batch
        .column_by_name(name)
        .with_context(|| format!("join input has no `{}` column", name))?
        .as_primitive_opt::<Int32Type>()
        .with_context(|| format!("join key `{}` must be Int32", name))
}

/// The conformed fact table plus what the inner joins discarded.
#[derive(Debug, Clone)]
pub struct Enriched {
    pub data: Dataset,
    pub drops: JoinDrops,
    pub duplicate_keys: BTreeMap<Entity, usize>,
}

/// Matched row positions of one transaction partition.
#[derive(Default)]
struct Matches {
    tx: Vec<u32>,
    customer: Vec<u32>,
    product: Vec<u32>,
    store: Vec<u32>,
    drops: JoinDrops,
}

fn match_partition(
    tx: &RecordBatch,
    customers: &DimIndex,
    products: &DimIndex,
    stores: &DimIndex,
) -> Result<Matches> {
    let cust_keys = int_column(tx, CUSTOMER_ID)?;
    let prod_keys = int_column(tx, PRODUCT_ID)?;
    let store_keys = int_column(tx, STORE_ID)?;
    let mut m = Matches::default();

    for row in 0..tx.num_rows() {
        let Some(cs) = customers.lookup(cust_keys, row) else {
            m.drops.missing_customer += 1;
            continue;
        };
        let Some(ps) = products.lookup(prod_keys, row) else {
            m.drops.missing_product += 1;
            continue;
        };
        let Some(ss) = stores.lookup(store_keys, row) else {
            m.drops.missing_store += 1;
            continue;
        };
        for &c in cs {
            for &p in ps {
                for &s in ss {
                    m.tx.push(row as u32);
                    m.customer.push(c);
                    m.product.push(p);
                    m.store.push(s);
                }
            }
        }
    }
    Ok(m)
}

fn assemble(
    schema: &SchemaRef,
    plan: &[(Entity, Column)],
    tx: &RecordBatch,
    dims: [&DimIndex; 3],
    m: &Matches,
) -> Result<RecordBatch> {
    let [customers, products, stores] = dims;
    let tx_idx = UInt32Array::from(m.tx.clone());
    let cust_idx = UInt32Array::from(m.customer.clone());
    let prod_idx = UInt32Array::from(m.product.clone());
    let store_idx = UInt32Array::from(m.store.clone());

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(plan.len() + 1);
    for (entity, col) in plan {
        let (batch, idx) = match entity {
            Entity::Transactions => (tx, &tx_idx),
            Entity::Customers => (&customers.batch, &cust_idx),
            Entity::Products => (&products.batch, &prod_idx),
            Entity::Stores => (&stores.batch, &store_idx),
        };
        let source = batch
            .column_by_name(&col.name)
            .with_context(|| format!("{} has no `{}` column", entity, col.name))?;
        columns.push(take(source, idx, None).with_context(|| format!("gathering `{}`", col.name))?);
    }

    let position = |name: &str| plan.iter().position(|(_, c)| c.name == name);
    let qty = position(QUANTITY).context("plan has no quantity column")?;
    let price = position(PRICE).context("plan has no price column")?;
    let qty = cast(&columns[qty], &DataType::Float64).context("widening quantity")?;
    let total = mul(&qty, &columns[price]).context("computing total_amount")?;
    columns.push(total);

    RecordBatch::try_new(schema.clone(), columns).context("building conformed batch")
}

/// Inner-join transactions with customers, products and stores (in that
/// order) and derive `total_amount = quantity * price`.
///
/// Transactions whose keys do not resolve are dropped and counted against
/// the first dimension that failed to match.
#[instrument(level = "info", skip_all)]
pub fn enrich(
    transactions: &Dataset,
    customers: &Dataset,
    products: &Dataset,
    stores: &Dataset,
) -> Result<Enriched> {
    let cust_idx = DimIndex::build(Entity::Customers, customers)?;
    let prod_idx = DimIndex::build(Entity::Products, products)?;
    let store_idx = DimIndex::build(Entity::Stores, stores)?;

    let plan = silver_plan();
    let schema = silver_schema();

    let parts: Vec<(RecordBatch, JoinDrops)> = transactions
        .batches()
        .par_iter()
        .map(|tx| {
            let m = match_partition(tx, &cust_idx, &prod_idx, &store_idx)?;
            let batch = assemble(&schema, &plan, tx, [&cust_idx, &prod_idx, &store_idx], &m)?;
            Ok((batch, m.drops))
        })
        .collect::<Result<_>>()?;

    let mut drops = JoinDrops::default();
    let mut batches = Vec::with_capacity(parts.len());
    for (batch, d) in parts {
        drops.merge(d);
        if batch.num_rows() > 0 {
            batches.push(batch);
        }
    }

    let duplicate_keys: BTreeMap<Entity, usize> = [
        (Entity::Customers, cust_idx.duplicate_keys),
        (Entity::Products, prod_idx.duplicate_keys),
        (Entity::Stores, store_idx.duplicate_keys),
    ]
    .into_iter()
    .filter(|(_, n)| *n > 0)
    .collect();

    let data = Dataset::new(schema, batches)?;
    if drops.total() > 0 {
        warn!(
            missing_customer = drops.missing_customer,
            missing_product = drops.missing_product,
            missing_store = drops.missing_store,
            "transactions dropped by inner joins"
        );
    }
    info!(
        transactions = transactions.num_rows(),
        conformed = data.num_rows(),
        dropped = drops.total(),
        "joined transactions"
    );

    Ok(Enriched {
        data,
        drops,
        duplicate_keys,
    })
}
