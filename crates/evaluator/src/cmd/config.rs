use std::path::PathBuf;

use clap::Args;

use crate::config;
use crate::error::EvaluatorResult;

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to an evaluator.yaml config file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// Print the effective configuration as YAML.
pub async fn run_config(args: ConfigArgs) -> EvaluatorResult<()> {
    let config = config::resolve(args.config.as_deref()).await?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
