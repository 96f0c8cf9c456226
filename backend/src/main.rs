pub mod api;
pub mod auth;
pub mod config;
pub mod dbio;
pub mod describe;
pub mod distrib;
pub mod error;
pub mod middleware;
pub mod project;
pub mod resolve;
pub mod restore;
pub mod state;
#[cfg(test)]
pub mod test;

use std::sync::Arc;

use axum::routing::{get, IntoMakeService};
use axum::{middleware::from_fn_with_state, Json, Router};
use log::info;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_app(shared_state: Arc<AppState>) -> IntoMakeService<Router> {
    let project_routes = Router::new()
        .route(
            "/{svc}/{conv}/",
            get(api::projects::list_records).post(api::projects::create_record),
        )
        .route(
            "/{svc}/{conv}/{id}",
            get(api::projects::get_record)
                .patch(api::projects::patch_record)
                .put(api::projects::put_record)
                .delete(api::projects::delete_record),
        )
        .route(
            "/{svc}/{conv}/{id}/data",
            get(api::projects::get_data)
                .patch(api::projects::patch_data)
                .put(api::projects::put_data),
        )
        .route(
            "/{svc}/{conv}/{id}/data/{*part}",
            get(api::projects::get_data_part)
                .patch(api::projects::patch_data_part)
                .put(api::projects::put_data_part),
        )
        .route(
            "/{svc}/{conv}/{id}/status",
            get(api::projects::get_status).put(api::projects::put_status),
        )
        .route("/{svc}/{conv}/{id}/name", axum::routing::put(api::projects::put_name))
        .route("/{svc}/{conv}/{id}/owner", axum::routing::put(api::projects::put_owner))
        .layer(from_fn_with_state(shared_state.clone(), middleware::jwt_auth_middleware));

    let extrev_routes = Router::new()
        .route("/nps/leg/", get(api::extrev::list_open_reviews))
        .route(
            "/nps/leg/{id}",
            get(api::extrev::get_review).post(api::extrev::post_feedback),
        )
        .layer(from_fn_with_state(shared_state.clone(), middleware::extrev_auth_middleware));

    let base = shared_state.config.base_endpoint.clone();
    Router::new()
        .nest(&base, project_routes)
        .nest("/extrev", extrev_routes)
        .route("/id/", get(api::resolve::resolve_id_root))
        .route("/id/{*path}", get(api::resolve::resolve_id))
        .route("/aip/", get(api::resolve::resolve_aip_root))
        .route("/aip/{*path}", get(api::resolve::resolve_aip))
        .route("/health", get(health_check))
        .with_state(shared_state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .into_make_service()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::AppConfig::from_env()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting MIDAS services with config:");
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Base endpoint: {}", config.base_endpoint);
    info!("  DBIO factory: {}", config.dbio.factory);
    info!("  Services: {:?}", config.services.keys().collect::<Vec<_>>());

    let bind_address = format!("{}:{}", config.host, config.port);
    let shared_state = Arc::new(AppState::build(config).await?);
    let app = create_app(shared_state);

    let listener = TcpListener::bind(&bind_address).await?;
    info!("Server starting on http://{bind_address}");
    axum::serve(listener, app).await?;

    Ok(())
}

// Utility handlers
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now()
    }))
}
