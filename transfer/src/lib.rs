pub mod checkpoint;
pub mod config;
pub mod data;
mod error;
pub mod evaluation;
pub mod metrics_log;
pub mod plot;
pub mod regularization;
pub mod selector;
pub mod session;
pub mod tap;

pub use error::{Result, TransferErr};
