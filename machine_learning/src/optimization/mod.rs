mod adam;
mod optimizer;

pub use adam::{Adam, AdamScalars};
pub use optimizer::Optimizer;
