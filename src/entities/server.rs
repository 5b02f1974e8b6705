use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Physical or virtual host running a local management agent. The gateway
/// talks to `agent_url` over HTTPS authenticated with `agent_token`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "servers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub hostname: String,
    pub agent_url: String,
    #[serde(skip_serializing)]
    pub agent_token: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::provisioning_task::Entity")]
    ProvisioningTask,
}

impl Related<super::provisioning_task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProvisioningTask.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {}
