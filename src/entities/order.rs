use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// One row per unique payment event. `payment_id` is the idempotency key:
/// redelivery of the same event must find this row and short-circuit.
/// Immutable after creation; the cart and processor metadata are preserved
/// verbatim for audit and replay.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    #[validate(length(min = 1, max = 255, message = "Payment id must be 1-255 characters"))]
    pub payment_id: String,

    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub customer_email: String,
    /// Null when email resolution failed; the order is still recorded.
    pub customer_id: Option<Uuid>,
    pub cart_snapshot: Json,
    pub metadata: Json,
    /// Set only when the payment status denotes success.
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id"
    )]
    Customer,
    #[sea_orm(has_many = "super::subscription::Entity")]
    Subscription,
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {}
