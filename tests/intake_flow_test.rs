//! End-to-end intake flow: webhook auth, order materialization,
//! idempotent replay, and provisioning through a mock agent.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, Database, EntityTrait, QueryFilter, Set};
use sea_orm_migration::MigratorTrait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use hostops_api::config::AppConfig;
use hostops_api::entities::{product, provisioning_task, server, subscription};
use hostops_api::migrator::Migrator;
use hostops_api::services::agent::{AgentError, AgentInvoker, AgentResponse};
use hostops_api::AppState;

const WEBHOOK_SECRET: &str = "test-intake-secret";

struct CountingAgent {
    calls: AtomicUsize,
}

#[async_trait]
impl AgentInvoker for CountingAgent {
    async fn invoke(
        &self,
        _target: &server::Model,
        _action: &str,
        _payload: &Value,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentResponse {
            success: true,
            detail: None,
        })
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        host: "127.0.0.1".into(),
        port: 0,
        environment: "development".into(),
        log_level: "info".into(),
        log_json: false,
        auto_migrate: true,
        cors_allowed_origins: None,
        cors_allow_any_origin: false,
        db_max_connections: 4,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_idle_timeout_secs: 60,
        db_acquire_timeout_secs: 5,
        intake_webhook_secret: Some(WEBHOOK_SECRET.into()),
        agent_timeout_secs: 5,
        task_lease_secs: 300,
        worker_enabled: false,
        worker_poll_interval_ms: 100,
        worker_batch_size: 10,
        event_channel_capacity: 64,
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    agent: Arc<CountingAgent>,
}

async fn spawn_app() -> TestApp {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("sqlite connect failed");
    Migrator::up(&db, None).await.expect("migrations failed");

    let now = Utc::now();
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set("starter".into()),
        name: Set("Starter Hosting".into()),
        category: Set("hosting".into()),
        billing_cycle: Set("monthly".into()),
        price_minor: Set(999),
        active: Set(true),
        created_at: Set(now),
        updated_at: Set(Some(now)),
    }
    .insert(&db)
    .await
    .expect("product seed failed");

    let agent = Arc::new(CountingAgent {
        calls: AtomicUsize::new(0),
    });
    let state = AppState::new(
        Arc::new(db),
        Arc::new(test_config()),
        None,
        agent.clone(),
    );
    let router = hostops_api::app_router(state.clone());

    TestApp {
        router,
        state,
        agent,
    }
}

async fn seed_server(app: &TestApp) -> Uuid {
    let server_id = Uuid::new_v4();
    server::ActiveModel {
        id: Set(server_id),
        hostname: Set("web1.example.net".into()),
        agent_url: Set("https://127.0.0.1:8443".into()),
        agent_token: Set("agent-token".into()),
        active: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(&*app.state.db)
    .await
    .expect("server seed failed");
    server_id
}

fn intake_request(token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/payments/intake")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("x-webhook-token", token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    serde_json::from_slice(&bytes).expect("body is not json")
}

fn sample_event(payment_id: &str) -> Value {
    json!({
        "paymentId": payment_id,
        "amount": 999,
        "currency": "USD",
        "status": "paid",
        "email": "A@B.Com",
        "cart": [
            {"productCode": "starter", "price": 999},
            {"productCode": "no-such-plan", "price": 500}
        ],
        "metadata": {"source": "checkout"}
    })
}

#[tokio::test]
async fn intake_requires_the_shared_token() {
    let app = spawn_app().await;

    let missing = app
        .router
        .clone()
        .oneshot(intake_request(None, sample_event("pi_auth_1")))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .router
        .clone()
        .oneshot(intake_request(Some("nope"), sample_event("pi_auth_1")))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_payloads_are_rejected_with_400() {
    let app = spawn_app().await;

    let garbage = Request::builder()
        .method("POST")
        .uri("/api/v1/payments/intake")
        .header("content-type", "application/json")
        .header("x-webhook-token", WEBHOOK_SECRET)
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(garbage).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let empty_cart = app
        .router
        .clone()
        .oneshot(intake_request(
            Some(WEBHOOK_SECRET),
            json!({"paymentId": "pi_x", "status": "paid", "email": "a@b.com", "cart": []}),
        ))
        .await
        .unwrap();
    assert_eq!(empty_cart.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn intake_materializes_order_and_replays_idempotently() {
    let app = spawn_app().await;

    let first = app
        .router
        .clone()
        .oneshot(intake_request(Some(WEBHOOK_SECRET), sample_event("pi_1")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    assert_eq!(first_body["ok"], json!(true));
    // The unknown product is skipped; only the starter plan materializes.
    assert_eq!(first_body["subscriptionsCreated"], json!(1));
    assert!(first_body.get("idempotent").is_none());

    let replay = app
        .router
        .clone()
        .oneshot(intake_request(Some(WEBHOOK_SECRET), sample_event("pi_1")))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    let replay_body = body_json(replay).await;
    assert_eq!(replay_body["idempotent"], json!(true));
    assert_eq!(replay_body["orderId"], first_body["orderId"]);
    assert_eq!(replay_body["subscriptionIds"], first_body["subscriptionIds"]);

    // Order detail shows both snapshot items but a single subscription.
    let order_id = first_body["orderId"].as_str().unwrap();
    let detail = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/orders/{}", order_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(detail.status(), StatusCode::OK);
    let detail_body = body_json(detail).await;
    assert_eq!(detail_body["subscriptions"].as_array().unwrap().len(), 1);
    assert_eq!(detail_body["normalized_cart"].as_array().unwrap().len(), 2);
    assert_eq!(
        detail_body["order"]["customer_email"],
        json!("a@b.com"),
        "email is normalized before storage"
    );
}

#[tokio::test]
async fn provisioning_drains_through_the_agent_and_activates_the_subscription() {
    let app = spawn_app().await;
    let server_id = seed_server(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(intake_request(Some(WEBHOOK_SECRET), sample_event("pi_2")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let subscription_id =
        Uuid::parse_str(body["subscriptionIds"][0].as_str().unwrap()).unwrap();

    // Assign the target server, as an operator would, then drain.
    let task = provisioning_task::Entity::find()
        .filter(provisioning_task::Column::SubscriptionId.eq(subscription_id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("task missing");
    let mut active: provisioning_task::ActiveModel = task.clone().into();
    active.server_id = Set(Some(server_id));
    active.update(&*app.state.db).await.unwrap();

    let dispatched = app.state.provisioning.drain_once(10).await.unwrap();
    assert_eq!(dispatched, 1);
    assert_eq!(app.agent.calls.load(Ordering::SeqCst), 1);

    let sub = subscription::Entity::find_by_id(subscription_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.provisioning_status, "active");

    // The task endpoint reflects the terminal state.
    let task_view = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/tasks/{}", task.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(task_view.status(), StatusCode::OK);
    let task_body = body_json(task_view).await;
    assert_eq!(task_body["status"], json!("succeeded"));

    let stats = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/tasks/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let stats_body = body_json(stats).await;
    assert_eq!(stats_body["succeeded"], json!(1));
    assert_eq!(stats_body["pending"], json!(0));
}

#[tokio::test]
async fn retrying_a_pending_task_is_rejected_over_http() {
    let app = spawn_app().await;

    let response = app
        .router
        .clone()
        .oneshot(intake_request(Some(WEBHOOK_SECRET), sample_event("pi_3")))
        .await
        .unwrap();
    let body = body_json(response).await;
    let subscription_id =
        Uuid::parse_str(body["subscriptionIds"][0].as_str().unwrap()).unwrap();

    let task = provisioning_task::Entity::find()
        .filter(provisioning_task::Column::SubscriptionId.eq(subscription_id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();

    let retry = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/tasks/{}/retry", task.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(retry.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_task_ids_return_404() {
    let app = spawn_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/tasks/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
