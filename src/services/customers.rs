use crate::{
    db::DbPool,
    entities::customer::{self, Entity as CustomerEntity},
    entities::user_account::{self, Entity as UserAccountEntity},
    errors::ServiceError,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Role and status given to identities materialized from an order. The
/// account has no credential until the customer completes activation.
const PROVISIONAL_ROLE: &str = "customer";
const PROVISIONAL_STATUS: &str = "active";

/// Lower-cases and trims an email for lookup and storage.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Outcome of a find-or-create resolution.
#[derive(Debug, Clone)]
pub struct ResolvedCustomer {
    pub customer: customer::Model,
    pub created: bool,
}

/// Finds or lazily creates the billing customer (and its underlying login
/// identity) for an email address.
#[derive(Clone)]
pub struct CustomerService {
    db_pool: Arc<DbPool>,
}

impl CustomerService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Resolves against the shared pool. The intake transaction uses
    /// [`CustomerService::find_or_create_on`] instead so customer creation
    /// commits or rolls back with the order.
    #[instrument(skip(self))]
    pub async fn find_or_create(
        &self,
        email: &str,
        display_name_hint: Option<&str>,
        processor_ref: Option<&str>,
    ) -> Result<ResolvedCustomer, ServiceError> {
        Self::find_or_create_on(&*self.db_pool, email, display_name_hint, processor_ref).await
    }

    /// Find-or-create against any connection (pool or open transaction).
    ///
    /// On hit, hint fields are applied idempotently: an existing value is
    /// never overwritten with null, and an absent one is filled in. On
    /// miss, a minimal unverified login identity is created first, then
    /// the billing profile linked to it.
    pub async fn find_or_create_on<C: ConnectionTrait>(
        conn: &C,
        email: &str,
        display_name_hint: Option<&str>,
        processor_ref: Option<&str>,
    ) -> Result<ResolvedCustomer, ServiceError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(ServiceError::ValidationError(
                "customer email is required".to_string(),
            ));
        }

        let existing = CustomerEntity::find()
            .filter(customer::Column::Email.eq(email.clone()))
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        if let Some(found) = existing {
            let needs_name = found.display_name.is_none() && display_name_hint.is_some();
            let needs_ref = found.processor_ref.is_none() && processor_ref.is_some();

            if !needs_name && !needs_ref {
                return Ok(ResolvedCustomer {
                    customer: found,
                    created: false,
                });
            }

            let mut active: customer::ActiveModel = found.into();
            if needs_name {
                active.display_name = Set(display_name_hint.map(|s| s.to_string()));
            }
            if needs_ref {
                active.processor_ref = Set(processor_ref.map(|s| s.to_string()));
            }
            let updated = active.update(conn).await.map_err(ServiceError::DatabaseError)?;

            return Ok(ResolvedCustomer {
                customer: updated,
                created: false,
            });
        }

        // A login identity may predate the billing profile (e.g. a signup
        // that never ordered). Reuse it rather than tripping the unique
        // email constraint.
        let account = UserAccountEntity::find()
            .filter(user_account::Column::Email.eq(email.clone()))
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let account = match account {
            Some(account) => account,
            None => {
                let now = Utc::now();
                let active = user_account::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    email: Set(email.clone()),
                    role: Set(PROVISIONAL_ROLE.to_string()),
                    status: Set(PROVISIONAL_STATUS.to_string()),
                    email_verified: Set(false),
                    password_hash: Set(None),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                };
                active.insert(conn).await.map_err(ServiceError::DatabaseError)?
            }
        };

        let now = Utc::now();
        let active = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(Some(account.id)),
            email: Set(email.clone()),
            display_name: Set(display_name_hint.map(|s| s.to_string())),
            processor_ref: Set(processor_ref.map(|s| s.to_string())),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };
        let created = active.insert(conn).await.map_err(ServiceError::DatabaseError)?;

        info!(customer_id = %created.id, email = %email, "customer created from order intake");

        Ok(ResolvedCustomer {
            customer: created,
            created: true,
        })
    }

    /// Gets a customer by normalized email
    #[instrument(skip(self))]
    pub async fn get_by_email(&self, email: &str) -> Result<Option<customer::Model>, ServiceError> {
        let customer = CustomerEntity::find()
            .filter(customer::Column::Email.eq(normalize_email(email)))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok(customer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalization_lowercases_and_trims() {
        assert_eq!(normalize_email("  A@B.Com "), "a@b.com");
        assert_eq!(normalize_email("a@b.com"), "a@b.com");
        assert_eq!(normalize_email("   "), "");
    }
}
