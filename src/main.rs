//! Hookwise GitHub webhook service.
//!
//! Main entry point. Loads configuration, wires the pipeline to the HTTP
//! server and coordinates graceful startup and shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use hookwise_api::{create_router, shutdown_signal, start_server, AppState, Config};
use hookwise_core::{Clock, EventBus, RealClock, TracingEventBus};
use hookwise_dispatch::{register_default_handlers, HandlerManager, WebhookPipeline};
use hookwise_ingest::{DeliveryCache, InMemoryDeliveryCache};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting hookwise webhook service");

    let config = Config::load()?;
    let addr = config.parse_server_addr()?;
    info!(
        server_addr = %addr,
        workers = config.worker_pool_size,
        queue_capacity = config.queue_capacity,
        delivery_mode = ?config.delivery_mode,
        ingest_mode = ?config.ingest_mode,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock);
    let cache: Arc<dyn DeliveryCache> =
        Arc::new(InMemoryDeliveryCache::new(config.delivery_cache_retention(), clock.clone()));
    let validator = config.build_validator(cache, clock.clone())?;
    if !validator.verifies_signatures() {
        warn!("Webhook signatures are not verified; configure webhook_secret for production");
    }

    let manager = Arc::new(HandlerManager::new(config.handler_timeout()));
    if config.auto_register_default_handlers {
        let bus: Arc<dyn EventBus> = Arc::new(TracingEventBus);
        let registered =
            register_default_handlers(&manager, bus, &config.default_handler_event_types)
                .await
                .context("Failed to register default handlers")?;
        info!(handlers = registered, "Default handlers registered");
    }

    let pipeline = Arc::new(
        WebhookPipeline::builder(config.to_pipeline_config(), Arc::new(validator), manager)
            .clock(clock.clone())
            .build(),
    );
    pipeline.start().await.context("Failed to start webhook pipeline")?;

    let router =
        create_router(AppState::new(pipeline.clone(), &config, clock), config.request_timeout());

    info!(addr = %addr, "hookwise is ready to receive webhooks");

    let served = start_server(router, addr, shutdown_signal()).await;
    if let Err(e) = &served {
        error!(error = %e, "Server failed");
    }

    if let Err(e) = pipeline.shutdown().await {
        warn!(error = %e, "Pipeline did not shut down cleanly");
    }

    info!("hookwise shutdown complete");
    served.context("HTTP server failed")
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookwise=debug,tower_http=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}
