mod tracing;

pub use tracing::{init_tracing, init_tracing_with_level, level_from_int};
