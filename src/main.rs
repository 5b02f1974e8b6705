use anyhow::Context;
use axum::http::HeaderValue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use hostops_api::{
    config::{self, AppConfig},
    db, events,
    services::agent::HttpAgentClient,
    services::provisioning,
    AppState,
};

fn build_cors(config: &AppConfig) -> CorsLayer {
    if config.has_cors_allowed_origins() {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .as_deref()
            .unwrap_or("")
            .split(',')
            .filter_map(|origin| origin.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if config.should_allow_permissive_cors() {
        warn!("CORS is permissive; set APP__CORS_ALLOWED_ORIGINS for production");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install shutdown handler: {}", e);
        return;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = config::load_config().context("failed to load configuration")?;
    config::init_tracing(app_config.log_level(), app_config.log_json);
    info!(
        environment = %app_config.environment,
        "starting hostops-api {}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = db::establish_connection_from_app_config(&app_config)
        .await
        .context("failed to connect to database")?;
    if app_config.auto_migrate {
        db::run_migrations(&pool)
            .await
            .context("database migration failed")?;
    }
    let pool = Arc::new(pool);

    let (event_tx, event_rx) = mpsc::channel(app_config.event_channel_capacity);
    tokio::spawn(events::process_events(event_rx));
    let event_sender = Some(Arc::new(events::EventSender::new(event_tx)));

    let agent = Arc::new(
        HttpAgentClient::new(app_config.agent_timeout())
            .context("failed to build agent client")?,
    );

    let app_config = Arc::new(app_config);
    let state = AppState::new(pool, app_config.clone(), event_sender, agent);

    if app_config.worker_enabled {
        provisioning::start_worker(
            state.provisioning.clone(),
            app_config.worker_poll_interval(),
            app_config.worker_batch_size,
        )
        .await;
    } else {
        info!("provisioning worker disabled in this process");
    }

    let app = hostops_api::app_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(&app_config));

    let addr = format!("{}:{}", app_config.host, app_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}
