mod error;
mod job;
mod model;
mod ports;
pub mod results;
mod status;
pub mod tabular;
mod types;

pub use error::*;
pub use job::*;
pub use model::*;
pub use ports::*;
pub use results::{IngestionOutcome, ResultAccumulator, PROVENANCE_KEYS};
pub use status::*;
pub use types::*;
