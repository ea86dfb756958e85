//! Layered retail pipeline: raw parquet sources are conformed into one
//! enriched transaction table (silver), which is summarized per
//! date/product/store (gold).

pub mod aggregate;
pub mod config;
pub mod dataset;
pub mod enrich;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod pipeline;
pub mod quality;
pub mod schema;
pub mod source;
pub mod store;
pub mod verify;

#[cfg(test)]
mod testutil;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{run, RunReport};
