//! PMmap - main entry point.
//!
//! This binary runs the HTTP server that accepts job submissions and drives
//! the per-job execution engines.

use std::net::SocketAddr;
use std::path::PathBuf;

use pmmap::server::{AppState, build_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fallback secret so the service runs out of the box in development.
const DEV_SECRET: &str = "This is an extremely bad secret";

/// Configuration for the map service.
struct Config {
    /// Address to bind the HTTP server to.
    listen_addr: SocketAddr,

    /// Root directory for per-job result stores.
    /// Structure: `<db_path>/job/<job_id>/`
    db_path: PathBuf,

    /// Shared secret sent to backends in the `PMMAP-auth` header.
    secret: String,
}

impl Config {
    /// Loads configuration from environment variables with defaults.
    fn from_env() -> Self {
        let listen_addr = std::env::var("LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let db_path = std::env::var("PMMAP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./db"));

        let secret = std::env::var("PMMAP_SECRET").unwrap_or_else(|_| {
            tracing::warn!(
                "PMMAP_SECRET not set, using a well-known secret (INSECURE - for development only)"
            );
            DEV_SECRET.to_string()
        });

        Config {
            listen_addr,
            db_path,
            secret,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pmmap=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    tracing::info!(
        db_path = %config.db_path.display(),
        "Starting pmmap"
    );

    let app_state = AppState::new(config.secret, config.db_path);
    let app = build_router(app_state);

    tracing::info!("Listening on {}", config.listen_addr);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
