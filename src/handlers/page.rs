use axum::response::Html;
use tracing::debug;

const INDEX_HTML: &str = include_str!("../../static/index.html");

/// Chat page that bootstraps a browser client
pub async fn index() -> Html<&'static str> {
    debug!("Chat page requested");
    Html(INDEX_HTML)
}
