use std::sync::Arc;

use storefront_cart::config::ServerConfig;
use storefront_cart::logger::init_logger;
use storefront_cart::router::create_app_router;
use storefront_cart::service::AppState;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_logger("info");

    let config = ServerConfig::from_env();

    // Initialize application state
    let state = Arc::new(AppState::new());

    // Build application router with all routes and middleware
    let app = create_app_router(state);

    let listener = match tokio::net::TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %config.addr, "Cart service running");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
