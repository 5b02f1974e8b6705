use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit of provisioning work. Lifecycle: pending -> in_progress ->
/// succeeded | failed; failed goes back to pending via explicit retry.
/// Invariant: at most one non-terminal task per subscription, so two
/// workers can never double-provision the same subscription.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "provisioning_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub subscription_id: Uuid,
    /// Null until a target server is assigned; dispatch then fails soft.
    pub server_id: Option<Uuid>,
    pub status: String,
    /// Current step label, e.g. `create_account`.
    pub step: String,
    /// What to provision: domain, plan, target server, buyer identity.
    pub payload: Json,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Lease for stale in-progress detection; stamped on claim.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::subscription::Entity",
        from = "Column::SubscriptionId",
        to = "super::subscription::Column::Id"
    )]
    Subscription,
    #[sea_orm(
        belongs_to = "super::server::Entity",
        from = "Column::ServerId",
        to = "super::server::Column::Id"
    )]
    Server,
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl Related<super::server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Server.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {}
