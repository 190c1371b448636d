//! Shared test utilities: in-process backend servers for exercising jobs.
//!
//! Each helper returns an axum router serving `POST /wh/{key}`; callers
//! spawn it on an ephemeral port with [`spawn_backend`] and hand the
//! returned base URL to a job.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use tokio::sync::Mutex;

use crate::job::HEADER_AUTH;

/// Serves `router` on an ephemeral localhost port and returns the base URL
/// jobs should be pointed at (ending in `/wh`).
pub async fn spawn_backend(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/wh", addr)
}

/// Backend that echoes the request body back.
pub fn echo_router() -> Router {
    Router::new().route("/wh/{key}", post(|body: Bytes| async move { body }))
}

/// Backend that replies `"world (<key>)"` (a JSON string, quotes included).
pub fn greeting_router() -> Router {
    Router::new().route(
        "/wh/{key}",
        post(|Path(key): Path<String>| async move { format!("\"world ({})\"", key) }),
    )
}

/// Backend that echoes only when the auth header carries `secret`, and
/// rejects with 401 otherwise.
pub fn auth_router(secret: &'static str) -> Router {
    Router::new().route(
        "/wh/{key}",
        post(move |headers: HeaderMap, body: Bytes| async move {
            let presented = headers.get(HEADER_AUTH).and_then(|v| v.to_str().ok());
            if presented == Some(secret) {
                body.into_response()
            } else {
                StatusCode::UNAUTHORIZED.into_response()
            }
        }),
    )
}

/// Backend that always replies with `status`, counting every attempt.
pub fn counting_status_router(status: StatusCode) -> (Router, Arc<AtomicU64>) {
    let attempts = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&attempts);
    let router = Router::new().route(
        "/wh/{key}",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                status
            }
        }),
    );
    (router, attempts)
}

/// Backend that fails each key's first `failures_per_key` attempts with 503
/// and echoes afterwards.
pub fn flaky_router(failures_per_key: u64) -> Router {
    let attempts: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    Router::new().route(
        "/wh/{key}",
        post(move |Path(key): Path<String>, body: Bytes| {
            let attempts = Arc::clone(&attempts);
            async move {
                let seen = {
                    let mut map = attempts.lock().await;
                    let seen = map.entry(key).or_insert(0);
                    *seen += 1;
                    *seen
                };
                if seen <= failures_per_key {
                    StatusCode::SERVICE_UNAVAILABLE.into_response()
                } else {
                    body.into_response()
                }
            }
        }),
    )
}

/// Backend that never replies within any reasonable test window.
pub fn stalling_router() -> Router {
    Router::new().route(
        "/wh/{key}",
        post(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            StatusCode::OK
        }),
    )
}
