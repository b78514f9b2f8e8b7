use axum::{extract::State, http::StatusCode, response::Json};
use relayer_core::config::ConfigSnapshot;
use relayer_executors::{propagator::ConfigSource, store::TransactionStore};

use crate::http::{
    error::{ApiRelayerError, RelayerResult},
    extractors::RelayerJson,
    server::RelayerServerState,
    types::SuccessResponse,
};

/// The snapshot this process is running with.
pub async fn get_config<S: TransactionStore, C: ConfigSource>(
    State(state): State<RelayerServerState<S, C>>,
) -> Json<SuccessResponse<ConfigSnapshot>> {
    let snapshot = state.propagator.live().load();
    Json(SuccessResponse::new(snapshot.as_ref().clone()))
}

/// Replace the pipeline settings on every process. The submitted version is
/// ignored; the published snapshot carries the next version.
pub async fn update_config<S: TransactionStore, C: ConfigSource>(
    State(state): State<RelayerServerState<S, C>>,
    RelayerJson(snapshot): RelayerJson<ConfigSnapshot>,
) -> Result<(StatusCode, Json<SuccessResponse<ConfigSnapshot>>), ApiRelayerError> {
    let published = state.propagator.publish_next(snapshot).await.api_error()?;

    tracing::info!(
        version = published.version,
        send_concurrency = published.send.concurrency,
        confirm_concurrency = published.confirm.concurrency,
        retry_concurrency = published.retry.concurrency,
        "Config updated"
    );

    Ok((StatusCode::OK, Json(SuccessResponse::new(published))))
}
