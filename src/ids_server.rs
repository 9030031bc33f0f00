//! Router assembly and serving for the image delivery HTTP service.

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::compression::predicate::{NotForContentType, Predicate};
use tower_http::compression::{CompressionLayer, DefaultPredicate};
use tower_http::trace::TraceLayer;

use crate::api::{self, SharedState};

/// Assemble the full router: the delivery API nested under `base_path`, plus
/// the health endpoint at the root.
///
/// PNG bodies are already compressed and excluded from gzip.
pub fn build_router(state: SharedState, base_path: &str) -> Router {
    let api_routes = Router::new()
        .route("/studies/:study_uid/series", get(api::list_series))
        .route("/series/:series_uid/images", get(api::list_images))
        .route("/images/:sop_uid", get(api::get_image))
        .route("/images/:sop_uid/thumbnail", get(api::get_thumbnail))
        .route("/images/:sop_uid/metadata", get(api::get_image_metadata))
        .route("/presets", get(api::list_presets))
        .route("/events", get(api::list_events))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::rate_limit,
        ));

    Router::new()
        .nest(base_path, api_routes)
        .route("/healthz", get(api::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(
            CompressionLayer::new()
                .compress_when(DefaultPredicate::new().and(NotForContentType::new("image/png"))),
        )
        .with_state(state)
}

/// Serve the router until the listener closes.
pub async fn serve(listener: tokio::net::TcpListener, router: Router) -> anyhow::Result<()> {
    tracing::info!(
        event = "ids_listening",
        address = listener.local_addr()?.to_string(),
    );
    axum::serve(listener, router).await?;
    Ok(())
}
