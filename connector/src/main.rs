// Connector binary entry point
// Hosts the connection registry, the idle reclaimer and the configured profiles

use anyhow::{Context, Result};
use common::clock::{Clock, SystemClock};
use common::config::Settings;
use common::connection::{
    ClientRegistry, ConnectionFacade, IdleReclaimer, RedisClientBuilder,
};
use common::models::{ClientContext, RequestContext, SessionMetadata};
use common::profile::InMemoryProfileProvider;
use common::telemetry::{self, MetricsTelemetry};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const SYSTEM_USER: &str = "system";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Initialize tracing/logging
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!("Starting Redis connector");

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        profiles = settings.profiles.len(),
        idle_threshold_seconds = settings.registry.idle_threshold_seconds,
        sweep_interval_seconds = settings.registry.sweep_interval_seconds,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(ClientRegistry::new(
        clock.clone(),
        settings.registry.registry_config(),
    ));
    let builder = Arc::new(RedisClientBuilder::new(
        settings.connection.builder_config(),
        clock,
    ));
    let profiles = Arc::new(InMemoryProfileProvider::new(settings.profiles.clone()));
    let facade = ConnectionFacade::new(
        registry.clone(),
        builder,
        profiles,
        Arc::new(MetricsTelemetry),
    );
    info!("Connection facade initialized");

    let reclaimer = Arc::new(IdleReclaimer::new(
        settings.registry.reclaimer_config(),
        registry.clone(),
    ));
    let reclaimer_task = reclaimer.clone().spawn();

    if settings.connection.warm_up {
        warm_up(&facade, &settings).await;
    }

    // Wait for SIGINT
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    reclaimer.stop();
    if let Err(e) = reclaimer_task.await {
        error!(error = %e, "Idle reclaimer task failed");
    }

    let closed = registry.close_all().await;
    info!(closed = closed, "Closed pooled connections");

    telemetry::shutdown_tracer();
    info!("Redis connector stopped");
    Ok(())
}

/// Open a pooled connection for every configured profile so that
/// misconfigured profiles surface at startup
async fn warm_up(facade: &ConnectionFacade, settings: &Settings) {
    let session = SessionMetadata::new(SYSTEM_USER, Uuid::new_v4().to_string());

    let attempts = settings.profiles.iter().map(|profile| {
        let ctx = RequestContext::new(profile.id.clone(), session.clone())
            .with_context(ClientContext::Common);
        async move { (ctx.database_id.clone(), facade.get_or_create_client(&ctx).await) }
    });

    for (database_id, result) in futures::future::join_all(attempts).await {
        match result {
            Ok(handle) => info!(
                database_id = %database_id,
                topology = %handle.topology(),
                "Warm-up connection established"
            ),
            Err(failure) => warn!(
                database_id = %database_id,
                kind = failure.kind.label(),
                message = %failure.user_message(),
                "Warm-up connection failed"
            ),
        }
    }
}
