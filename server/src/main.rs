#![recursion_limit = "256"]

use std::{sync::Arc, time::Duration};

use relayer_core::{account::SmartAccountGateway, signer::WalletSigningGateway};
use relayer_executors::{
    nonce::{NonceManager, RedisNonceStore},
    propagator::{ConfigPropagator, ConfigSource, LiveConfig, PropagatorOptions, RedisConfigSource},
    shutdown::ShutdownHandle,
    store::RedisTransactionStore,
    worker::{
        ConfirmationWorker, HistoryPruner, PipelineContext, RetryScheduler, SendWorker,
        SendWorkerOptions, spawn_worker,
    },
};
use relayer_server::{
    ConfigWalletRegistry, RelayerServer, RelayerServerState, RpcChainService, config,
};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config();

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level if RUST_LOG environment variable is not set
            "relayer=debug,relayer_server=debug,relayer_executors=debug,relayer_core=debug,tower_http=debug,axum=debug"
                .into()
        }),
    );

    match config.server.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let chains = Arc::new(RpcChainService::from_config(&config.chains)?);
    tracing::info!(chains = ?chains.chain_ids(), "Chain service initialized");

    let registry = Arc::new(ConfigWalletRegistry::from_config(config.wallets.clone()));
    tracing::info!(wallets = registry.len(), "Wallet registry initialized");
    let signer = Arc::new(SmartAccountGateway::new(WalletSigningGateway::new(registry)));

    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let redis = redis_client.get_connection_manager().await?;
    let namespace = config.queue.namespace.clone();

    let store = Arc::new(RedisTransactionStore::new(redis.clone(), namespace.clone()));
    let nonces = NonceManager::new(Arc::new(RedisNonceStore::new(
        redis.clone(),
        namespace.clone(),
    )));

    let config_source = Arc::new(RedisConfigSource::new(
        redis_client.clone(),
        redis.clone(),
        namespace,
    ));
    let propagator = Arc::new(ConfigPropagator::new(
        config_source.clone(),
        LiveConfig::new(config.relayer.clone()),
        PropagatorOptions::default(),
    ));

    // The configured snapshot only seeds an empty store; a running cluster
    // keeps whatever was last published.
    if config_source.load().await?.is_none() {
        let published = propagator.publish_next(config.relayer.clone()).await?;
        tracing::info!(version = published.version, "Published initial config");
    } else {
        propagator.reload().await?;
    }

    let ctx = PipelineContext {
        store: store.clone(),
        nonces,
        signer,
        chains,
        config: propagator.live().clone(),
    };

    let queue = &config.queue;
    let send_worker = Arc::new(SendWorker::new(
        ctx.clone(),
        SendWorkerOptions {
            claim_lease: Duration::from_secs(queue.claim_lease_secs),
            max_concurrency: queue.max_send_concurrency,
            ..Default::default()
        },
    ));

    tracing::info!("Starting pipeline workers...");
    let workers = ShutdownHandle::new()
        .and_worker(spawn_worker(
            send_worker,
            Duration::from_millis(queue.send_polling_interval_ms),
        ))
        .and_worker(spawn_worker(
            Arc::new(ConfirmationWorker::new(ctx.clone())),
            Duration::from_millis(queue.confirm_polling_interval_ms),
        ))
        .and_worker(spawn_worker(
            Arc::new(RetryScheduler::new(ctx.clone())),
            Duration::from_millis(queue.retry_polling_interval_ms),
        ))
        .and_worker(spawn_worker(
            Arc::new(HistoryPruner::new(ctx)),
            Duration::from_millis(queue.prune_polling_interval_ms),
        ))
        .and_worker(propagator.clone().spawn());

    let mut server = RelayerServer::new(RelayerServerState {
        store,
        propagator,
    });

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    server.start(listener)?;

    tracing::info!(
        workers = workers.worker_count(),
        "Server started, waiting for shutdown signal"
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Shutdown signal received");

    if let Err(e) = server.shutdown().await {
        tracing::error!("Error during HTTP server shutdown: {}", e);
    } else {
        tracing::info!("HTTP server shut down successfully");
    }

    if let Err(e) = workers.shutdown().await {
        tracing::error!("Error during worker shutdown: {}", e);
    } else {
        tracing::info!("All workers shut down successfully");
    }

    Ok(())
}
