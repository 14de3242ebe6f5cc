//! Debug endpoints: `/info` lists the start time and configured tags.

use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

/// What `/info` reports.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub started_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

impl ServerInfo {
    pub fn new(tags: BTreeMap<String, String>) -> Self {
        Self {
            started_at: Utc::now(),
            tags,
        }
    }
}

/// Router serving the debug endpoints.
pub fn debug_router(info: ServerInfo) -> Router {
    Router::new()
        .route("/info", get(info_page))
        .with_state(Arc::new(info))
}

async fn info_page(State(info): State<Arc<ServerInfo>>) -> impl IntoResponse {
    (
        [(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        )],
        Html(render_info(&info)),
    )
}

fn render_info(info: &ServerInfo) -> String {
    let mut page = String::from("<html>\n<head>\n<title>Server Tags</title>\n</head>\n<body>\n");
    let _ = write!(
        page,
        "<h3>Start Time</h3>\n<ul><li>{}</li></ul>\n<h3>Tags</h3>\n<ul>\n",
        info.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    for (key, value) in &info.tags {
        let _ = writeln!(
            page,
            "   <li><strong>{}</strong> = {}</li>",
            escape_html(key),
            escape_html(value)
        );
    }
    page.push_str("</ul>\n</body>\n</html>\n");
    page
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
