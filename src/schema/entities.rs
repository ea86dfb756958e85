// src/schema/entities.rs

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{Column, LogicalType};

pub const TRANSACTION_ID: &str = "transaction_id";
pub const CUSTOMER_ID: &str = "customer_id";
pub const PRODUCT_ID: &str = "product_id";
pub const STORE_ID: &str = "store_id";
pub const QUANTITY: &str = "quantity";
pub const TRANSACTION_DATE: &str = "transaction_date";
pub const REGISTRATION_DATE: &str = "registration_date";
pub const PRICE: &str = "price";
pub const TOTAL_AMOUNT: &str = "total_amount";

pub const TOTAL_QUANTITY_SOLD: &str = "total_quantity_sold";
pub const TOTAL_SALES_AMOUNT: &str = "total_sales_amount";
pub const NUMBER_OF_TRANSACTIONS: &str = "number_of_transactions";
pub const AVERAGE_TRANSACTION_VALUE: &str = "average_transaction_value";

/// The four raw retail sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Transactions,
    Products,
    Stores,
    Customers,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Transactions => "transactions",
            Entity::Products => "products",
            Entity::Stores => "stores",
            Entity::Customers => "customers",
        }
    }

    /// The declared schema this source is narrowed to.
    pub fn columns(&self) -> Vec<Column> {
        use LogicalType::*;
        let declared: &[(&str, LogicalType)] = match self {
            Entity::Transactions => &[
                (TRANSACTION_ID, Int32),
                (CUSTOMER_ID, Int32),
                (PRODUCT_ID, Int32),
                (STORE_ID, Int32),
                (QUANTITY, Int32),
                (TRANSACTION_DATE, Date),
            ],
            Entity::Products => &[
                (PRODUCT_ID, Int32),
                ("product_name", Text),
                ("category", Text),
                (PRICE, Float64),
            ],
            Entity::Stores => &[(STORE_ID, Int32), ("store_name", Text), ("location", Text)],
            Entity::Customers => &[
                (CUSTOMER_ID, Int32),
                ("first_name", Text),
                ("last_name", Text),
                ("email", Text),
                ("city", Text),
                (REGISTRATION_DATE, Date),
            ],
        };
        declared.iter().map(|(name, ty)| Column::new(name, *ty)).collect()
    }

    /// Name of the surrogate key column.
    pub fn key(&self) -> &'static str {
        match self {
            Entity::Transactions => TRANSACTION_ID,
            Entity::Products => PRODUCT_ID,
            Entity::Stores => STORE_ID,
            Entity::Customers => CUSTOMER_ID,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The default summary grain.
pub fn default_grain() -> Vec<String> {
    [
        TRANSACTION_DATE,
        PRODUCT_ID,
        "product_name",
        "category",
        STORE_ID,
        "store_name",
        "location",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
