pub mod api;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::handlers::index;
use crate::websocket::websocket_handler;
use crate::AppState;
pub use api::create_api_routes;

/// Assemble the full application router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`, the WebSocket
/// route reads the peer address from there.
pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws/:client_id", get(websocket_handler))
        // Mount API routes
        .nest("/api", create_api_routes())
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
