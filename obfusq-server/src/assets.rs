//! Embedded front-end

use axum::{http::header, response::Html, response::IntoResponse};

/// Main page.
pub const INDEX_HTML: &str = include_str!("assets/index.html");

/// Front-end controller.
pub const APP_JS: &str = include_str!("assets/app.js");

/// Stylesheet.
pub const STYLES_CSS: &str = include_str!("assets/styles.css");

pub async fn serve_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn serve_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        APP_JS,
    )
}

pub async fn serve_css() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], STYLES_CSS)
}
