pub mod arch;
pub mod error;
pub mod initialization;
pub mod metrics;
pub mod optimization;

pub use error::{MlErr, Result};
