use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use relayer_executors::{
    propagator::{ConfigPropagator, ConfigSource},
    store::TransactionStore,
};
use tokio::{sync::watch, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::routes::{
    config::{get_config, update_config},
    transactions::{cancel_transaction, create_transaction, get_transaction},
};

pub struct RelayerServerState<S, C> {
    pub store: Arc<S>,
    pub propagator: Arc<ConfigPropagator<C>>,
}

impl<S, C> Clone for RelayerServerState<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            propagator: self.propagator.clone(),
        }
    }
}

pub struct RelayerServer {
    handle: Option<JoinHandle<Result<(), std::io::Error>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    app: Router,
}

pub fn router<S: TransactionStore, C: ConfigSource>(state: RelayerServerState<S, C>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/v1/transactions", post(create_transaction::<S, C>))
        .route("/v1/transactions/{id}", get(get_transaction::<S, C>))
        .route(
            "/v1/transactions/{id}/cancel",
            post(cancel_transaction::<S, C>),
        )
        .route(
            "/v1/config",
            get(get_config::<S, C>).put(update_config::<S, C>),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl RelayerServer {
    pub fn new<S: TransactionStore, C: ConfigSource>(state: RelayerServerState<S, C>) -> Self {
        Self {
            handle: None,
            shutdown_tx: None,
            app: router(state),
        }
    }

    pub fn start(&mut self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        let app = self.app.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            tracing::info!("HTTP server starting on {}", local_addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut rx = shutdown_rx;
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    tracing::info!("HTTP server shutting down");
                })
                .await
        });

        self.handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(true).is_err() {
                tracing::error!("Failed to send shutdown signal to HTTP server");
            }
        }

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(result) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP server error during shutdown: {}", e);
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to join HTTP server task: {}", e);
                    return Err(std::io::Error::other(format!("Task join error: {}", e)));
                }
            }
        }

        Ok(())
    }
}
