use llm_relay::metrics::NoopMetrics;
use llm_relay::{build_router, AppState, ConfigHierarchy, ConfigSource, Gateway, MetricsSink, RequestLedger};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let hierarchy: Arc<dyn ConfigSource> = Arc::new(ConfigHierarchy::from_process());
    let config = hierarchy.load()?;

    let metrics: Arc<dyn MetricsSink> = match &config.server.ledger_file {
        Some(path) => {
            let ledger = RequestLedger::open(path)?;
            info!("  Ledger:    {}", ledger.path().display());
            Arc::new(ledger)
        }
        None => Arc::new(NoopMetrics),
    };

    let gateway = Gateway::new(Arc::clone(&hierarchy), metrics)?;

    info!("llm-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("  Default:   {}", config.default_provider);
    for provider in config.providers.values() {
        info!(
            "  Provider:  {} ({}, {:?}) {}",
            provider.name, provider.dialect, provider.auth_mode, provider.base_url
        );
    }

    let state = Arc::new(AppState {
        gateway: Arc::new(gateway),
    });

    let app = build_router(state);
    let bind_addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  OpenAI clients:    OPENAI_BASE_URL=http://localhost:{}/v1", config.server.port);
    info!("  Anthropic clients: ANTHROPIC_BASE_URL=http://localhost:{}", config.server.port);

    axum::serve(listener, app).await?;

    Ok(())
}
