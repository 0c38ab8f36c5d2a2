mod command;
mod config;
mod runtime;

pub use config::DockerConfig;
pub use runtime::DockerRuntime;
