//! HostOps API Library
//!
//! Order-intake and provisioning-orchestration pipeline for a hosting
//! provider: payment events become orders, subscriptions, and
//! provisioning tasks; a background worker drives the tasks against
//! remote server agents.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::agent::AgentInvoker;
use crate::services::catalog::CatalogService;
use crate::services::customers::CustomerService;
use crate::services::orders::OrderService;
use crate::services::provisioning::ProvisioningService;

/// Shared application state: one pool, one config, one service instance
/// per concern. Everything is cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Option<Arc<EventSender>>,
    pub orders: OrderService,
    pub customers: CustomerService,
    pub catalog: CatalogService,
    pub provisioning: Arc<ProvisioningService>,
}

impl AppState {
    pub fn new(
        db: Arc<DbPool>,
        config: Arc<config::AppConfig>,
        event_sender: Option<Arc<EventSender>>,
        agent: Arc<dyn AgentInvoker>,
    ) -> Self {
        let orders = OrderService::new(db.clone(), event_sender.clone());
        let customers = CustomerService::new(db.clone());
        let catalog = CatalogService::new(db.clone());
        let provisioning = Arc::new(ProvisioningService::new(
            db.clone(),
            event_sender.clone(),
            agent,
            config.task_lease_secs,
        ));

        Self {
            db,
            config,
            event_sender,
            orders,
            customers,
            catalog,
            provisioning,
        }
    }
}

/// Versioned API surface.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/payments/intake",
            post(handlers::payment_webhooks::payment_intake),
        )
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/tasks", get(handlers::tasks::list_tasks))
        .route("/tasks/stats", get(handlers::tasks::task_stats))
        .route(
            "/tasks/failed",
            get(handlers::tasks::list_failed_tasks).delete(handlers::tasks::clear_failed_tasks),
        )
        .route("/tasks/:id", get(handlers::tasks::get_task))
        .route("/tasks/:id/retry", post(handlers::tasks::retry_task))
}

/// Full router: health probes, versioned API, and the OpenAPI explorer.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(handlers::health::live))
        .route("/health/ready", get(handlers::health::ready))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .with_state(state)
}
