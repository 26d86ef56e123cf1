use anyhow::Context;
use docrelay::{handlers, ConversionEngine, EngineConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docrelay=info,tower_http=info".into()),
        )
        .init();

    let config = EngineConfig::from_env();
    if !config.remote_configured() {
        warn!("DOCRELAY_REMOTE_API_KEY not set; remote conversions are disabled");
    }

    let engine = ConversionEngine::new(config);
    let readiness = engine.readiness().await;
    for status in &readiness.backends {
        info!(
            "Backend {}: {}",
            status.backend,
            if status.available { "available" } else { "unavailable" }
        );
    }

    let app = handlers::app(engine);

    // Start the server
    let addr = std::env::var("DOCRELAY_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("docrelay listening on http://{}", addr);
    info!("API documentation: http://{}/info", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
