use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use sandbox::SandboxRuntime;
use sandbox_docker::{DockerConfig, DockerRuntime};
use tracing::info;

use crate::broker::{AmqpBroker, Broker};
use crate::config::{self, EvaluatorConfig};
use crate::dispatcher::{Dispatcher, ResultPublisher};
use crate::error::{EvaluatorError, EvaluatorResult};
use crate::ingress::Ingress;
use crate::pool::SandboxPool;
use crate::store::{PgStore, TaskStore};

#[derive(Args)]
pub struct StartArgs {
    /// Path to an evaluator.yaml config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// AMQP broker URL (overrides config)
    #[arg(long, env = "EVALUATOR_BROKER_URL")]
    broker_url: Option<String>,
    /// Postgres URL of the task database (overrides config)
    #[arg(long, env = "EVALUATOR_DATABASE_URL")]
    database_url: Option<String>,
}

/// Load config, connect the backends and serve requests until a signal.
pub async fn run_start(args: StartArgs) -> EvaluatorResult<()> {
    let mut config = config::resolve(args.config.as_deref()).await?;
    if let Some(url) = args.broker_url {
        config.broker.url = url;
    }
    if let Some(url) = args.database_url {
        config.store.url = url;
    }
    config.validate()?;

    run(config).await
}

async fn run(config: EvaluatorConfig) -> EvaluatorResult<()> {
    let pool_options = config.pool.pool_options();

    let runtime = DockerRuntime::connect(DockerConfig::default())
        .await
        .map_err(|e| EvaluatorError::Startup(format!("sandbox runtime: {e}")))?;
    info!(image = %pool_options.spec.image, "preparing sandbox image");
    runtime
        .prepare(&pool_options.spec)
        .await
        .map_err(|e| EvaluatorError::Startup(format!("sandbox image: {e}")))?;
    let runtime: Arc<dyn SandboxRuntime> = Arc::new(runtime);

    let store = PgStore::connect(&config.store.url, config.store.max_connections)
        .await
        .map_err(|e| EvaluatorError::Startup(format!("task store: {e}")))?;
    let store: Arc<dyn TaskStore> = Arc::new(store);

    let broker = AmqpBroker::connect(&config.broker.url)
        .await
        .map_err(|e| EvaluatorError::Startup(format!("message broker: {e}")))?;
    let broker: Arc<dyn Broker> = Arc::new(broker);

    let max_active = pool_options.max_active;
    let pool = SandboxPool::start(runtime, pool_options).await;

    let results = config
        .broker
        .result_channel
        .map(|channel| ResultPublisher::new(Arc::clone(&broker), channel));
    let dispatcher = Dispatcher::new(pool.clone(), store, results, config.evaluator.interpreter);

    // -----------------------------------------------------------------------
    // Signal handling
    // -----------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, shutting down");
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, shutting down");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let stats = pool.stats().await;
    info!(
        max_active,
        ready = stats.ready,
        occupied = stats.occupied,
        "evaluator started"
    );
    let served = Ingress::new(broker, max_active)
        .register(Arc::new(dispatcher))
        .run(shutdown_rx)
        .await;

    pool.drain_all().await;
    info!("evaluator stopped");
    served
}

/// Wait for a signal, or pend forever if the handler could not be installed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
