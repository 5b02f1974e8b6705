use crate::{
    db::DbPool,
    entities::provisioning_task::{self, Entity as TaskEntity},
    entities::server::Entity as ServerEntity,
    entities::subscription::{self, Entity as SubscriptionEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    services::agent::{AgentError, AgentInvoker},
};
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// First (and for now only) step of every provisioning task.
pub const STEP_CREATE_ACCOUNT: &str = "create_account";

/// Subscription provisioning statuses owned by this state machine.
const PROVISIONING_PENDING: &str = "pending";
const PROVISIONING_ACTIVE: &str = "active";

/// Task lifecycle. `Failed` goes back to `Pending` through an explicit
/// retry; `Succeeded` is the only terminal state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

/// What one task provisions: plan, optional domain, target server hint,
/// and the buyer identity the agent should create resources for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningPayload {
    pub plan: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    pub customer_email: String,
    pub quantity: i32,
}

/// Aggregate backlog view for the operator surface.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct TaskStats {
    pub pending: u64,
    pub in_progress: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// In-progress tasks whose lease has expired: operational anomalies
    /// to investigate, never auto-requeued.
    pub stale_in_progress: u64,
    pub oldest_pending_age_secs: Option<i64>,
}

/// Drives provisioning tasks from `pending` to a terminal state against
/// remote server agents, one bounded call per dispatch.
#[derive(Clone)]
pub struct ProvisioningService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    agent: Arc<dyn AgentInvoker>,
    lease: ChronoDuration,
}

impl ProvisioningService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        agent: Arc<dyn AgentInvoker>,
        lease_secs: i64,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            agent,
            lease: ChronoDuration::seconds(lease_secs),
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send provisioning event");
            }
        }
    }

    /// Creates a task in `pending` on any connection, so intake can call
    /// this inside its order transaction. Rejects when a pending or
    /// in-progress task already exists for the subscription. The read is a
    /// courtesy check for a precise error message; the real guard is the
    /// partial unique index over open tasks, so two concurrent enqueues
    /// that both pass the read still cannot both insert.
    pub async fn enqueue_on<C: sea_orm::ConnectionTrait>(
        conn: &C,
        subscription_id: Uuid,
        server_id: Option<Uuid>,
        payload: &ProvisioningPayload,
    ) -> Result<provisioning_task::Model, ServiceError> {
        let open = TaskEntity::find()
            .filter(provisioning_task::Column::SubscriptionId.eq(subscription_id))
            .filter(
                provisioning_task::Column::Status.is_in([
                    TaskStatus::Pending.as_str(),
                    TaskStatus::InProgress.as_str(),
                ]),
            )
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        if open.is_some() {
            return Err(ServiceError::Conflict(format!(
                "subscription {} already has an open provisioning task",
                subscription_id
            )));
        }

        let payload_json = serde_json::to_value(payload)
            .map_err(|e| ServiceError::SerializationError(e.to_string()))?;

        let active = provisioning_task::ActiveModel {
            id: Set(Uuid::new_v4()),
            subscription_id: Set(subscription_id),
            server_id: Set(server_id),
            status: Set(TaskStatus::Pending.as_str().to_string()),
            step: Set(STEP_CREATE_ACCOUNT.to_string()),
            payload: Set(payload_json),
            attempts: Set(0),
            last_error: Set(None),
            lease_expires_at: Set(None),
            created_at: Set(Utc::now()),
            started_at: Set(None),
            completed_at: Set(None),
        };

        match active.insert(conn).await {
            Ok(task) => Ok(task),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(ServiceError::Conflict(format!(
                    "subscription {} already has an open provisioning task",
                    subscription_id
                )))
            }
            Err(e) => Err(ServiceError::DatabaseError(e)),
        }
    }

    /// Creates a task in `pending` and announces it.
    #[instrument(skip(self, payload), fields(subscription_id = %subscription_id))]
    pub async fn enqueue(
        &self,
        subscription_id: Uuid,
        server_id: Option<Uuid>,
        payload: &ProvisioningPayload,
    ) -> Result<provisioning_task::Model, ServiceError> {
        let task = Self::enqueue_on(&*self.db_pool, subscription_id, server_id, payload).await?;
        counter!("hostops_provisioning.enqueued", 1);
        self.emit(Event::TaskEnqueued(task.id)).await;
        Ok(task)
    }

    /// Conditional claim: `pending -> in_progress` only if the row is
    /// still pending. Exactly one of any number of concurrent dispatchers
    /// wins; losers see zero rows affected.
    async fn claim(&self, task_id: Uuid) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let result = TaskEntity::update_many()
            .col_expr(
                provisioning_task::Column::Status,
                Expr::value(TaskStatus::InProgress.as_str()),
            )
            .col_expr(provisioning_task::Column::StartedAt, Expr::value(now))
            .col_expr(
                provisioning_task::Column::LeaseExpiresAt,
                Expr::value(now + self.lease),
            )
            .filter(provisioning_task::Column::Id.eq(task_id))
            .filter(provisioning_task::Column::Status.eq(TaskStatus::Pending.as_str()))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok(result.rows_affected == 1)
    }

    /// Dispatches one pending task: claims it, performs the remote agent
    /// call, and records the terminal outcome. An agent failure is data,
    /// not an error: the task lands in `failed` and the method still
    /// returns the updated row. Only infrastructure problems (datastore
    /// errors, claim races) surface as `Err`.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn dispatch(&self, task_id: Uuid) -> Result<provisioning_task::Model, ServiceError> {
        if !self.claim(task_id).await? {
            return Err(ServiceError::Conflict(format!(
                "task {} is not pending or was claimed by another worker",
                task_id
            )));
        }

        let task = TaskEntity::find_by_id(task_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("provisioning task {} not found", task_id)))?;

        self.emit(Event::TaskDispatched(task_id)).await;

        let outcome = self.invoke_agent(&task).await;

        match outcome {
            Ok(()) => self.record_success(task).await,
            Err(agent_err) => self.record_failure(task, agent_err).await,
        }
    }

    async fn invoke_agent(&self, task: &provisioning_task::Model) -> Result<(), AgentError> {
        let server_id = task.server_id.ok_or(AgentError::NoServerAssigned)?;

        let server = ServerEntity::find_by_id(server_id)
            .one(&*self.db_pool)
            .await
            .map_err(|e| AgentError::Unreachable(format!("server lookup failed: {}", e)))?
            .ok_or_else(|| AgentError::Unreachable(format!("server {} not found", server_id)))?;

        self.agent
            .invoke(&server, &task.step, &task.payload)
            .await
            .map(|_| ())
    }

    /// Success: task terminal, owning subscription goes `active`. Both
    /// writes share a transaction so the subscription can never show
    /// `active` without its task showing `succeeded`.
    async fn record_success(
        &self,
        task: provisioning_task::Model,
    ) -> Result<provisioning_task::Model, ServiceError> {
        let now = Utc::now();
        let task_id = task.id;
        let subscription_id = task.subscription_id;

        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut active: provisioning_task::ActiveModel = task.into();
        active.status = Set(TaskStatus::Succeeded.as_str().to_string());
        active.completed_at = Set(Some(now));
        active.lease_expires_at = Set(None);
        active.last_error = Set(None);
        let updated = active.update(&txn).await.map_err(ServiceError::DatabaseError)?;

        let subscription = SubscriptionEntity::find_by_id(subscription_id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("subscription {} not found", subscription_id))
            })?;

        let mut sub_active: subscription::ActiveModel = subscription.into();
        sub_active.provisioning_status = Set(PROVISIONING_ACTIVE.to_string());
        sub_active.updated_at = Set(Some(now));
        sub_active.update(&txn).await.map_err(ServiceError::DatabaseError)?;

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        counter!("hostops_provisioning.succeeded", 1);
        info!(task_id = %task_id, subscription_id = %subscription_id, "provisioning task succeeded");
        self.emit(Event::TaskSucceeded {
            task_id,
            subscription_id,
        })
        .await;

        Ok(updated)
    }

    /// Failure: attempts increment, error is stored, the subscription's
    /// provisioning status is left untouched so the commercial record
    /// stays eligible for retry. A provisioning failure never cancels a
    /// paid-for subscription.
    async fn record_failure(
        &self,
        task: provisioning_task::Model,
        agent_err: AgentError,
    ) -> Result<provisioning_task::Model, ServiceError> {
        let task_id = task.id;
        let subscription_id = task.subscription_id;
        let attempts = task.attempts + 1;
        let message = agent_err.to_string();

        let mut active: provisioning_task::ActiveModel = task.into();
        active.status = Set(TaskStatus::Failed.as_str().to_string());
        active.attempts = Set(attempts);
        active.last_error = Set(Some(message.clone()));
        active.lease_expires_at = Set(None);
        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;

        counter!("hostops_provisioning.failed", 1);
        warn!(
            task_id = %task_id,
            subscription_id = %subscription_id,
            attempts = attempts,
            error = %message,
            "provisioning task failed"
        );
        self.emit(Event::TaskFailed {
            task_id,
            subscription_id,
            error: message,
        })
        .await;

        Ok(updated)
    }

    /// Retry is only legal from `failed`: resets to `pending` and clears
    /// the stored error. Attempt count is preserved for observability.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn retry(&self, task_id: Uuid) -> Result<provisioning_task::Model, ServiceError> {
        let task = TaskEntity::find_by_id(task_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("provisioning task {} not found", task_id)))?;

        if task.status != TaskStatus::Failed.as_str() {
            return Err(ServiceError::InvalidStatus(format!(
                "task {} is {}, only failed tasks can be retried",
                task_id, task.status
            )));
        }

        let subscription_id = task.subscription_id;
        let mut active: provisioning_task::ActiveModel = task.into();
        active.status = Set(TaskStatus::Pending.as_str().to_string());
        active.last_error = Set(None);
        active.lease_expires_at = Set(None);
        let updated = match active.update(&*self.db_pool).await {
            Ok(updated) => updated,
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                return Err(ServiceError::Conflict(format!(
                    "subscription {} already has another open provisioning task",
                    subscription_id
                )));
            }
            Err(e) => return Err(ServiceError::DatabaseError(e)),
        };

        info!(task_id = %task_id, "provisioning task reset for retry");
        self.emit(Event::TaskRetried(task_id)).await;

        Ok(updated)
    }

    /// Fetches a single task.
    pub async fn get_task(
        &self,
        task_id: Uuid,
    ) -> Result<Option<provisioning_task::Model>, ServiceError> {
        TaskEntity::find_by_id(task_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Lists tasks with optional status and staleness filters, newest
    /// first, paginated.
    #[instrument(skip(self))]
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        stale_only: bool,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<provisioning_task::Model>, u64), ServiceError> {
        let mut query = TaskEntity::find();

        if let Some(status) = status {
            query = query.filter(provisioning_task::Column::Status.eq(status.as_str()));
        }
        if stale_only {
            query = query
                .filter(provisioning_task::Column::Status.eq(TaskStatus::InProgress.as_str()))
                .filter(provisioning_task::Column::LeaseExpiresAt.lt(Utc::now()));
        }

        let paginator = query
            .order_by_desc(provisioning_task::Column::CreatedAt)
            .paginate(&*self.db_pool, limit.max(1));

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let tasks = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((tasks, total))
    }

    /// Most recent failed tasks, up to `limit`.
    pub async fn list_failed(
        &self,
        limit: u64,
    ) -> Result<Vec<provisioning_task::Model>, ServiceError> {
        TaskEntity::find()
            .filter(provisioning_task::Column::Status.eq(TaskStatus::Failed.as_str()))
            .order_by_desc(provisioning_task::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Deletes all failed tasks; returns how many were removed. An
    /// operator clearing the backlog accepts that those subscriptions
    /// need manual reconciliation.
    #[instrument(skip(self))]
    pub async fn clear_failed(&self) -> Result<u64, ServiceError> {
        let result = TaskEntity::delete_many()
            .filter(provisioning_task::Column::Status.eq(TaskStatus::Failed.as_str()))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;

        info!(removed = result.rows_affected, "cleared failed provisioning tasks");
        Ok(result.rows_affected)
    }

    /// Backlog aggregates for operational visibility.
    pub async fn stats(&self) -> Result<TaskStats, ServiceError> {
        let count_for = |status: TaskStatus| {
            TaskEntity::find()
                .filter(provisioning_task::Column::Status.eq(status.as_str()))
                .count(&*self.db_pool)
        };

        let pending = count_for(TaskStatus::Pending)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let in_progress = count_for(TaskStatus::InProgress)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let succeeded = count_for(TaskStatus::Succeeded)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let failed = count_for(TaskStatus::Failed)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let now = Utc::now();
        let stale_in_progress = TaskEntity::find()
            .filter(provisioning_task::Column::Status.eq(TaskStatus::InProgress.as_str()))
            .filter(provisioning_task::Column::LeaseExpiresAt.lt(now))
            .count(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let oldest_pending = TaskEntity::find()
            .filter(provisioning_task::Column::Status.eq(TaskStatus::Pending.as_str()))
            .order_by_asc(provisioning_task::Column::CreatedAt)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok(TaskStats {
            pending,
            in_progress,
            succeeded,
            failed,
            stale_in_progress,
            oldest_pending_age_secs: oldest_pending
                .map(|t| (now - t.created_at).num_seconds().max(0)),
        })
    }

    /// One worker pass: claim and dispatch up to `batch_size` pending
    /// tasks. Individual dispatch failures are logged and do not stop the
    /// pass; the conditional claim makes it safe to run from several
    /// processes at once.
    pub async fn drain_once(&self, batch_size: u64) -> Result<usize, ServiceError> {
        let pending: Vec<Uuid> = TaskEntity::find()
            .filter(provisioning_task::Column::Status.eq(TaskStatus::Pending.as_str()))
            .order_by_asc(provisioning_task::Column::CreatedAt)
            .limit(batch_size)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .into_iter()
            .map(|t| t.id)
            .collect();

        let mut dispatched = 0;
        for task_id in pending {
            match self.dispatch(task_id).await {
                Ok(_) => dispatched += 1,
                Err(ServiceError::Conflict(_)) => {
                    // Another worker got there first.
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "dispatch failed");
                }
            }
        }

        Ok(dispatched)
    }
}

/// Background worker polling the pending backlog.
pub async fn start_worker(service: Arc<ProvisioningService>, poll_interval: Duration, batch_size: u64) {
    tokio::spawn(async move {
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            batch_size = batch_size,
            "provisioning worker started"
        );
        loop {
            if let Err(e) = service.drain_once(batch_size).await {
                error!("provisioning worker error: {}", e);
            }
            sleep(poll_interval).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{order, server, subscription};
    use crate::services::agent::AgentResponse;
    use async_trait::async_trait;
    use sea_orm::{Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockAgent {
        fail_with: Option<String>,
        calls: AtomicUsize,
    }

    impl MockAgent {
        fn succeeding() -> Self {
            Self {
                fail_with: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentInvoker for MockAgent {
        async fn invoke(
            &self,
            _target: &server::Model,
            action: &str,
            _payload: &serde_json::Value,
        ) -> Result<AgentResponse, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(detail) => Err(AgentError::Rejected {
                    action: action.to_string(),
                    detail: detail.clone(),
                }),
                None => Ok(AgentResponse {
                    success: true,
                    detail: None,
                }),
            }
        }
    }

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("sqlite connect failed");
        crate::migrator::Migrator::up(&db, None)
            .await
            .expect("migrations failed");
        db
    }

    async fn seed_subscription(db: &DatabaseConnection) -> (Uuid, Uuid) {
        use sea_orm::ActiveModelTrait;

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        order::ActiveModel {
            id: Set(order_id),
            payment_id: Set(format!("pi_{}", order_id.simple())),
            amount_minor: Set(999),
            currency: Set("USD".into()),
            status: Set("paid".into()),
            customer_email: Set("a@b.com".into()),
            customer_id: Set(None),
            cart_snapshot: Set(json!([])),
            metadata: Set(json!({})),
            paid_at: Set(Some(now)),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("order insert failed");

        let subscription_id = Uuid::new_v4();
        subscription::ActiveModel {
            id: Set(subscription_id),
            order_id: Set(order_id),
            product_code: Set("starter".into()),
            product_name: Set("Starter Hosting".into()),
            billing_cycle: Set("monthly".into()),
            price_minor: Set(999),
            quantity: Set(1),
            category: Set("hosting".into()),
            status: Set("pending".into()),
            provisioning_status: Set("pending".into()),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(db)
        .await
        .expect("subscription insert failed");

        (order_id, subscription_id)
    }

    async fn seed_server(db: &DatabaseConnection) -> Uuid {
        use sea_orm::ActiveModelTrait;

        let server_id = Uuid::new_v4();
        server::ActiveModel {
            id: Set(server_id),
            hostname: Set(format!("web{}.example.net", server_id.simple())),
            agent_url: Set("https://127.0.0.1:8443".into()),
            agent_token: Set("test-token".into()),
            active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .expect("server insert failed");

        server_id
    }

    fn payload() -> ProvisioningPayload {
        ProvisioningPayload {
            plan: "starter".into(),
            domain: Some("example.com".into()),
            server: None,
            customer_email: "a@b.com".into(),
            quantity: 1,
        }
    }

    fn service(db: DatabaseConnection, agent: Arc<MockAgent>) -> ProvisioningService {
        ProvisioningService::new(Arc::new(db), None, agent, 300)
    }

    #[tokio::test]
    async fn enqueue_rejects_second_open_task_for_same_subscription() {
        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;
        let svc = service(db, Arc::new(MockAgent::succeeding()));

        svc.enqueue(subscription_id, None, &payload())
            .await
            .expect("first enqueue failed");

        let second = svc.enqueue(subscription_id, None, &payload()).await;
        assert!(matches!(second, Err(ServiceError::Conflict(_))));
    }

    #[tokio::test]
    async fn store_rejects_second_open_task_without_the_read_guard() {
        use sea_orm::ActiveModelTrait;

        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;

        // Two raw inserts stand in for two enqueues that both passed the
        // courtesy read before either row existed.
        let raw_task = |status: &str| provisioning_task::ActiveModel {
            id: Set(Uuid::new_v4()),
            subscription_id: Set(subscription_id),
            server_id: Set(None),
            status: Set(status.to_string()),
            step: Set(STEP_CREATE_ACCOUNT.to_string()),
            payload: Set(json!({})),
            attempts: Set(0),
            last_error: Set(None),
            lease_expires_at: Set(None),
            created_at: Set(Utc::now()),
            started_at: Set(None),
            completed_at: Set(None),
        };

        raw_task("pending")
            .insert(&db)
            .await
            .expect("first insert failed");

        let err = raw_task("pending")
            .insert(&db)
            .await
            .expect_err("second open task must be rejected by the index");
        assert!(matches!(
            err.sql_err(),
            Some(SqlErr::UniqueConstraintViolation(_))
        ));
    }

    #[tokio::test]
    async fn finished_tasks_do_not_block_a_new_enqueue() {
        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;
        let server_id = seed_server(&db).await;
        let svc = service(db, Arc::new(MockAgent::succeeding()));

        let task = svc
            .enqueue(subscription_id, Some(server_id), &payload())
            .await
            .expect("enqueue failed");
        svc.dispatch(task.id).await.expect("dispatch failed");

        // Only open tasks count against the one-in-flight rule.
        svc.enqueue(subscription_id, Some(server_id), &payload())
            .await
            .expect("re-enqueue after success failed");
    }

    #[tokio::test]
    async fn successful_dispatch_activates_subscription() {
        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;
        let server_id = seed_server(&db).await;
        let agent = Arc::new(MockAgent::succeeding());
        let svc = service(db.clone(), agent.clone());

        let task = svc
            .enqueue(subscription_id, Some(server_id), &payload())
            .await
            .expect("enqueue failed");

        let done = svc.dispatch(task.id).await.expect("dispatch failed");
        assert_eq!(done.status, TaskStatus::Succeeded.as_str());
        assert!(done.completed_at.is_some());
        assert!(done.last_error.is_none());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        let sub = SubscriptionEntity::find_by_id(subscription_id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.provisioning_status, "active");
    }

    #[tokio::test]
    async fn failed_dispatch_records_error_and_leaves_subscription_pending() {
        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;
        let server_id = seed_server(&db).await;
        let svc = service(db.clone(), Arc::new(MockAgent::failing("disk full")));

        let task = svc
            .enqueue(subscription_id, Some(server_id), &payload())
            .await
            .expect("enqueue failed");

        let done = svc.dispatch(task.id).await.expect("dispatch errored");
        assert_eq!(done.status, TaskStatus::Failed.as_str());
        assert_eq!(done.attempts, 1);
        assert!(done.last_error.as_deref().unwrap_or("").contains("disk full"));

        let sub = SubscriptionEntity::find_by_id(subscription_id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.provisioning_status, "pending");
    }

    #[tokio::test]
    async fn dispatch_without_server_fails_soft() {
        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;
        let agent = Arc::new(MockAgent::succeeding());
        let svc = service(db, agent.clone());

        let task = svc
            .enqueue(subscription_id, None, &payload())
            .await
            .expect("enqueue failed");

        let done = svc.dispatch(task.id).await.expect("dispatch errored");
        assert_eq!(done.status, TaskStatus::Failed.as_str());
        assert!(done
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("no server assigned"));
        // The remote agent was never contacted.
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_dispatch_of_same_task_loses_the_claim() {
        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;
        let server_id = seed_server(&db).await;
        let agent = Arc::new(MockAgent::succeeding());
        let svc = service(db, agent.clone());

        let task = svc
            .enqueue(subscription_id, Some(server_id), &payload())
            .await
            .expect("enqueue failed");

        svc.dispatch(task.id).await.expect("first dispatch failed");
        let second = svc.dispatch(task.id).await;
        assert!(matches!(second, Err(ServiceError::Conflict(_))));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_is_only_legal_from_failed() {
        let db = setup_db().await;
        let (_, subscription_id) = seed_subscription(&db).await;
        let server_id = seed_server(&db).await;
        let svc = service(db, Arc::new(MockAgent::failing("boom")));

        let task = svc
            .enqueue(subscription_id, Some(server_id), &payload())
            .await
            .expect("enqueue failed");

        // Pending tasks cannot be retried.
        assert!(matches!(
            svc.retry(task.id).await,
            Err(ServiceError::InvalidStatus(_))
        ));

        svc.dispatch(task.id).await.expect("dispatch errored");
        let retried = svc.retry(task.id).await.expect("retry failed");
        assert_eq!(retried.status, TaskStatus::Pending.as_str());
        assert!(retried.last_error.is_none());
        // Attempt count is preserved for observability.
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn drain_once_dispatches_pending_backlog() {
        let db = setup_db().await;
        let (_, first) = seed_subscription(&db).await;
        let (_, second) = seed_subscription(&db).await;
        let server_id = seed_server(&db).await;
        let agent = Arc::new(MockAgent::succeeding());
        let svc = service(db, agent.clone());

        svc.enqueue(first, Some(server_id), &payload())
            .await
            .expect("enqueue failed");
        svc.enqueue(second, Some(server_id), &payload())
            .await
            .expect("enqueue failed");

        let dispatched = svc.drain_once(10).await.expect("drain failed");
        assert_eq!(dispatched, 2);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let db = setup_db().await;
        let (_, first) = seed_subscription(&db).await;
        let (_, second) = seed_subscription(&db).await;
        let server_id = seed_server(&db).await;
        let svc = service(db, Arc::new(MockAgent::failing("boom")));

        svc.enqueue(first, Some(server_id), &payload())
            .await
            .expect("enqueue failed");
        let failing = svc
            .enqueue(second, Some(server_id), &payload())
            .await
            .expect("enqueue failed");
        svc.dispatch(failing.id).await.expect("dispatch errored");

        let stats = svc.stats().await.expect("stats failed");
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.succeeded, 0);
        assert!(stats.oldest_pending_age_secs.is_some());
    }
}
