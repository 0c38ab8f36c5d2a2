mod config;
mod start;

pub use config::{ConfigArgs, run_config};
pub use start::{StartArgs, run_start};
