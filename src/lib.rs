pub mod config;
pub mod dispatch;
mod error;
pub mod fetch;
pub mod harvest;
pub mod journal;
pub mod layouts;
pub mod ledger;
pub mod paths;
pub mod rewrite;
pub mod snapshots;

pub use error::{HarvestError, Result};
