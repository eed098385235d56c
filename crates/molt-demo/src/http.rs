//! Demo HTTP server.

use anyhow::Result;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/hello", get(hello))
        .route("/pid", get(pid))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

async fn health() -> Json<Value> {
    Json(json!({ "health": true }))
}

async fn hello() -> &'static str {
    "hello world"
}

/// Which generation answered.
async fn pid() -> String {
    std::process::id().to_string()
}

/// Serve until `stop` fires, then finish in-flight requests and return.
pub async fn serve(listener: TcpListener, stop: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Starting HTTP server");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
            info!(%addr, "HTTP server received shutdown signal, draining connections");
        })
        .await?;

    info!(%addr, "HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_body(uri: &str) -> (StatusCode, String) {
        let response = router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"health":true}"#);
    }

    #[tokio::test]
    async fn test_hello() {
        let (status, body) = get_body("/hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn test_pid() {
        let (_, body) = get_body("/pid").await;
        assert_eq!(body, std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get_body("/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, stop.clone()));

        stop.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
