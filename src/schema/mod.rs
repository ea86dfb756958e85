pub mod arrow;
pub mod entities;
pub mod types;

pub use self::arrow::{build_arrow_schema, columns_of, map_to_arrow_type};
pub use entities::{default_grain, Entity};
pub use types::{Column, LogicalType};
