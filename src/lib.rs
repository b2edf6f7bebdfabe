pub mod batch;
pub mod builder;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod dist;
pub mod encoder;
pub mod error;
pub mod index;
pub mod kmeans;
pub mod logging;
pub mod mask;
pub mod pipeline;
pub mod reconcile;
pub mod shard;
pub mod utils;

pub use config::{Opts, RunConfig};
pub use error::ExtractError;
pub use pipeline::{ExtractionOutcome, run_extraction};
