use crate::{
    db::DbPool,
    entities::order::{self, Entity as OrderEntity},
    entities::subscription::{self, Entity as SubscriptionEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog::{self, CatalogService, NormalizedItem},
    services::customers::CustomerService,
    services::provisioning::{ProvisioningPayload, ProvisioningService},
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Payment statuses that mean the buyer has actually paid.
const PAID_STATUSES: [&str; 2] = ["paid", "succeeded"];

fn validate_cart(cart: &[Value]) -> Result<(), validator::ValidationError> {
    if cart.is_empty() {
        return Err(validator::ValidationError::new("cart_empty"));
    }
    Ok(())
}

// Intake stores the trimmed payment id, so the trimmed value is what has
// to be non-empty. A plain length check would let "   " through and every
// all-blank payment id would collide on the unique index as "".
fn validate_payment_id(payment_id: &str) -> Result<(), validator::ValidationError> {
    if payment_id.trim().is_empty() {
        return Err(validator::ValidationError::new("payment_id_blank"));
    }
    Ok(())
}

/// Payment-completion notification as delivered by the processor webhook.
/// The cart is kept loosely typed on purpose; normalization happens per
/// item during intake and the raw shape is snapshotted on the order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct PaymentEvent {
    #[serde(alias = "paymentId")]
    #[validate(custom = "validate_payment_id")]
    pub payment_id: String,

    /// Raw amount as sent by the processor. Integer means minor units,
    /// float means major units, same rule as cart item prices.
    #[serde(default)]
    #[schema(value_type = Option<f64>)]
    pub amount: Option<serde_json::Number>,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub email: String,

    #[serde(alias = "displayName", default)]
    pub display_name: Option<String>,

    #[serde(alias = "processorRef", default)]
    pub processor_ref: Option<String>,

    #[validate(custom = "validate_cart")]
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub cart: Vec<Value>,

    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: Value,

    #[serde(alias = "occurredAt", default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl PaymentEvent {
    fn is_paid(&self) -> bool {
        PAID_STATUSES
            .iter()
            .any(|s| self.status.eq_ignore_ascii_case(s))
    }
}

/// Result of one intake call. `created` is false on an idempotent replay.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IntakeOutcome {
    pub order_id: Uuid,
    pub created: bool,
    pub subscription_ids: Vec<Uuid>,
    pub customer_id: Option<Uuid>,
}

struct IngestedOrder {
    outcome: IntakeOutcome,
    customer_created: bool,
}

/// Append-only ledger of payment events. Each unique payment identifier
/// becomes exactly one order row with its subscriptions and provisioning
/// tasks, no matter how many times the processor delivers the event.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send order event");
            }
        }
    }

    /// Ingests one payment event. Validation happens before any
    /// transaction is opened; everything after runs inside a single
    /// transaction so the order, its subscriptions, and their tasks
    /// commit or roll back together.
    ///
    /// Safe to call any number of times for the same payment identifier:
    /// a replay short-circuits to a read of the existing rows, and a race
    /// between two deliveries is settled by the unique index on
    /// `orders.payment_id` with the loser re-reading the winner's rows.
    #[instrument(skip(self, event), fields(payment_id = %event.payment_id))]
    pub async fn ingest(&self, event: &PaymentEvent) -> Result<IntakeOutcome, ServiceError> {
        event.validate()?;

        match self.ingest_once(event).await {
            Ok(ingested) => {
                if ingested.outcome.created {
                    counter!("hostops_orders.ingested", 1);
                    if ingested.customer_created {
                        if let Some(id) = ingested.outcome.customer_id {
                            self.emit(Event::CustomerCreated(id)).await;
                        }
                    }
                    for id in &ingested.outcome.subscription_ids {
                        self.emit(Event::SubscriptionCreated(*id)).await;
                    }
                    self.emit(Event::OrderIngested {
                        order_id: ingested.outcome.order_id,
                        payment_id: event.payment_id.trim().to_string(),
                        subscriptions_created: ingested.outcome.subscription_ids.len(),
                    })
                    .await;
                } else {
                    counter!("hostops_orders.replayed", 1);
                    self.emit(Event::DuplicatePaymentIgnored {
                        order_id: ingested.outcome.order_id,
                        payment_id: event.payment_id.trim().to_string(),
                    })
                    .await;
                }
                Ok(ingested.outcome)
            }
            Err(ServiceError::DatabaseError(db_err))
                if matches!(db_err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) =>
            {
                self.recover_lost_race(event, db_err).await
            }
            Err(e) => Err(e),
        }
    }

    /// Concurrent delivery of the same event: the other intake won the
    /// unique index on `orders.payment_id` and this attempt's transaction
    /// rolled back. Nothing from it was persisted; answer with the
    /// winner's rows.
    async fn recover_lost_race(
        &self,
        event: &PaymentEvent,
        db_err: sea_orm::DbErr,
    ) -> Result<IntakeOutcome, ServiceError> {
        let existing = self
            .find_by_payment_id(event.payment_id.trim())
            .await?
            .ok_or(ServiceError::DatabaseError(db_err))?;
        counter!("hostops_orders.replayed", 1);
        self.emit(Event::DuplicatePaymentIgnored {
            order_id: existing.order_id,
            payment_id: event.payment_id.trim().to_string(),
        })
        .await;
        Ok(existing)
    }

    async fn ingest_once(&self, event: &PaymentEvent) -> Result<IngestedOrder, ServiceError> {
        let payment_id = event.payment_id.trim().to_string();
        let txn = self
            .db_pool
            .begin()
            .await
            .map_err(ServiceError::DatabaseError)?;

        if let Some(existing) = OrderEntity::find()
            .filter(order::Column::PaymentId.eq(payment_id.clone()))
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
        {
            let subscription_ids = Self::subscription_ids_on(&txn, existing.id).await?;
            txn.rollback().await.map_err(ServiceError::DatabaseError)?;
            info!(order_id = %existing.id, payment_id = %payment_id, "duplicate payment event ignored");
            return Ok(IngestedOrder {
                outcome: IntakeOutcome {
                    order_id: existing.id,
                    created: false,
                    subscription_ids,
                    customer_id: existing.customer_id,
                },
                customer_created: false,
            });
        }

        // A bad buyer email must not lose the paid-for order; the row is
        // simply left unowned for manual reconciliation.
        let (customer_id, customer_created) = match CustomerService::find_or_create_on(
            &txn,
            &event.email,
            event.display_name.as_deref(),
            event.processor_ref.as_deref(),
        )
        .await
        {
            Ok(resolved) => (Some(resolved.customer.id), resolved.created),
            Err(ServiceError::ValidationError(msg)) => {
                warn!(payment_id = %payment_id, error = %msg, "order created without customer");
                (None, false)
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let amount_minor = event
            .amount
            .as_ref()
            .map(|n| catalog::price_to_minor(n, None))
            .unwrap_or(0);

        let order_row = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            payment_id: Set(payment_id.clone()),
            amount_minor: Set(amount_minor),
            currency: Set(event.currency.clone()),
            status: Set(event.status.clone()),
            customer_email: Set(event.email.trim().to_lowercase()),
            customer_id: Set(customer_id),
            cart_snapshot: Set(Value::Array(event.cart.clone())),
            metadata: Set(event.metadata.clone()),
            paid_at: Set(if event.is_paid() {
                Some(event.occurred_at.unwrap_or(now))
            } else {
                None
            }),
            created_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::DatabaseError)?;

        let mut subscription_ids = Vec::new();
        for item in &event.cart {
            let Some((normalized, product)) = CatalogService::resolve_strict_on(&txn, item).await?
            else {
                // Unknown product: skip the line item, keep the order. The
                // full cart stays in the snapshot for later reconciliation.
                warn!(order_id = %order_row.id, "skipping cart item with no catalog match");
                continue;
            };

            let price_minor = if normalized.price_minor > 0 {
                normalized.price_minor
            } else {
                product.price_minor
            };

            let sub = subscription::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_row.id),
                product_code: Set(product.code.clone()),
                product_name: Set(product.name.clone()),
                billing_cycle: Set(normalized.billing_cycle.clone()),
                price_minor: Set(price_minor),
                quantity: Set(normalized.quantity),
                category: Set(normalized.category.to_string()),
                status: Set("pending".to_string()),
                provisioning_status: Set("pending".to_string()),
                created_at: Set(now),
                updated_at: Set(Some(now)),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;

            let payload = Self::task_payload(&normalized, item, &order_row.customer_email);
            ProvisioningService::enqueue_on(&txn, sub.id, None, &payload).await?;

            subscription_ids.push(sub.id);
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        info!(
            order_id = %order_row.id,
            payment_id = %payment_id,
            subscriptions = subscription_ids.len(),
            "payment event ingested"
        );

        Ok(IngestedOrder {
            outcome: IntakeOutcome {
                order_id: order_row.id,
                created: true,
                subscription_ids,
                customer_id,
            },
            customer_created,
        })
    }

    fn task_payload(
        normalized: &NormalizedItem,
        raw_item: &Value,
        customer_email: &str,
    ) -> ProvisioningPayload {
        let as_string = |key: &str| {
            raw_item
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        ProvisioningPayload {
            plan: normalized.code.clone(),
            domain: as_string("domain"),
            server: as_string("server"),
            customer_email: customer_email.to_string(),
            quantity: normalized.quantity,
        }
    }

    async fn subscription_ids_on<C: sea_orm::ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let ids = SubscriptionEntity::find()
            .filter(subscription::Column::OrderId.eq(order_id))
            .order_by_asc(subscription::Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        Ok(ids)
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<IntakeOutcome>, ServiceError> {
        let Some(existing) = OrderEntity::find()
            .filter(order::Column::PaymentId.eq(payment_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
        else {
            return Ok(None);
        };

        let subscription_ids = Self::subscription_ids_on(&*self.db_pool, existing.id).await?;
        Ok(Some(IntakeOutcome {
            order_id: existing.id,
            created: false,
            subscription_ids,
            customer_id: existing.customer_id,
        }))
    }

    /// Fetches one order with its subscriptions.
    #[instrument(skip(self))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(order::Model, Vec<subscription::Model>)>, ServiceError> {
        let Some(found) = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
        else {
            return Ok(None);
        };

        let subscriptions = SubscriptionEntity::find()
            .filter(subscription::Column::OrderId.eq(order_id))
            .order_by_asc(subscription::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok(Some((found, subscriptions)))
    }

    /// Lists orders newest first, paginated.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let paginator = OrderEntity::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db_pool, limit.max(1));

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let orders = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((orders, total))
    }
}
