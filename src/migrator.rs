use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_user_accounts_table::Migration),
            Box::new(m20260101_000002_create_customers_table::Migration),
            Box::new(m20260101_000003_create_products_table::Migration),
            Box::new(m20260101_000004_create_servers_table::Migration),
            Box::new(m20260101_000005_create_orders_table::Migration),
            Box::new(m20260101_000006_create_subscriptions_table::Migration),
            Box::new(m20260101_000007_create_provisioning_tasks_table::Migration),
        ]
    }
}

// Migration implementations

mod m20260101_000001_create_user_accounts_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000001_create_user_accounts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(UserAccounts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(UserAccounts::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UserAccounts::Email)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(UserAccounts::Role).string().not_null())
                        .col(ColumnDef::new(UserAccounts::Status).string().not_null())
                        .col(
                            ColumnDef::new(UserAccounts::EmailVerified)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(UserAccounts::PasswordHash).string().null())
                        .col(
                            ColumnDef::new(UserAccounts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(UserAccounts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(UserAccounts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum UserAccounts {
        Table,
        Id,
        Email,
        Role,
        Status,
        EmailVerified,
        PasswordHash,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260101_000002_create_customers_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000002_create_customers_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Customers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Customers::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Customers::UserId).uuid().null())
                        .col(
                            ColumnDef::new(Customers::Email)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Customers::DisplayName).string().null())
                        .col(ColumnDef::new(Customers::ProcessorRef).string().null())
                        .col(
                            ColumnDef::new(Customers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Customers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Customers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Customers {
        Table,
        Id,
        UserId,
        Email,
        DisplayName,
        ProcessorRef,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260101_000003_create_products_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000003_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Products::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::Code)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Category).string().not_null())
                        .col(ColumnDef::new(Products::BillingCycle).string().not_null())
                        .col(
                            ColumnDef::new(Products::PriceMinor)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Code,
        Name,
        Category,
        BillingCycle,
        PriceMinor,
        Active,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260101_000004_create_servers_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000004_create_servers_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Servers::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Servers::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Servers::Hostname)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Servers::AgentUrl).string().not_null())
                        .col(ColumnDef::new(Servers::AgentToken).string().not_null())
                        .col(
                            ColumnDef::new(Servers::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Servers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Servers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Servers {
        Table,
        Id,
        Hostname,
        AgentUrl,
        AgentToken,
        Active,
        CreatedAt,
    }
}

mod m20260101_000005_create_orders_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000005_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::PaymentId).string().not_null())
                        .col(ColumnDef::new(Orders::AmountMinor).big_integer().not_null())
                        .col(ColumnDef::new(Orders::Currency).string().not_null())
                        .col(ColumnDef::new(Orders::Status).string().not_null())
                        .col(ColumnDef::new(Orders::CustomerEmail).string().not_null())
                        .col(ColumnDef::new(Orders::CustomerId).uuid().null())
                        .col(ColumnDef::new(Orders::CartSnapshot).json().not_null())
                        .col(ColumnDef::new(Orders::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(Orders::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // The idempotency key: a concurrent intake race on the same
            // payment id must produce exactly one committed order.
            manager
                .create_index(
                    Index::create()
                        .name("idx_orders_payment_id")
                        .table(Orders::Table)
                        .col(Orders::PaymentId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        PaymentId,
        AmountMinor,
        Currency,
        Status,
        CustomerEmail,
        CustomerId,
        CartSnapshot,
        Metadata,
        PaidAt,
        CreatedAt,
    }
}

mod m20260101_000006_create_subscriptions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000006_create_subscriptions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Subscriptions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Subscriptions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Subscriptions::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(Subscriptions::ProductCode)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Subscriptions::ProductName)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Subscriptions::BillingCycle)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Subscriptions::PriceMinor)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Subscriptions::Quantity).integer().not_null())
                        .col(ColumnDef::new(Subscriptions::Category).string().not_null())
                        .col(ColumnDef::new(Subscriptions::Status).string().not_null())
                        .col(
                            ColumnDef::new(Subscriptions::ProvisioningStatus)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Subscriptions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Subscriptions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_subscriptions_order_id")
                        .table(Subscriptions::Table)
                        .col(Subscriptions::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Subscriptions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Subscriptions {
        Table,
        Id,
        OrderId,
        ProductCode,
        ProductName,
        BillingCycle,
        PriceMinor,
        Quantity,
        Category,
        Status,
        ProvisioningStatus,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260101_000007_create_provisioning_tasks_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000007_create_provisioning_tasks_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProvisioningTasks::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProvisioningTasks::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProvisioningTasks::SubscriptionId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProvisioningTasks::ServerId).uuid().null())
                        .col(ColumnDef::new(ProvisioningTasks::Status).string().not_null())
                        .col(ColumnDef::new(ProvisioningTasks::Step).string().not_null())
                        .col(ColumnDef::new(ProvisioningTasks::Payload).json().not_null())
                        .col(
                            ColumnDef::new(ProvisioningTasks::Attempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ProvisioningTasks::LastError)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(ProvisioningTasks::LeaseExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(ProvisioningTasks::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProvisioningTasks::StartedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(ProvisioningTasks::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_provisioning_tasks_status")
                        .table(ProvisioningTasks::Table)
                        .col(ProvisioningTasks::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_provisioning_tasks_subscription_id")
                        .table(ProvisioningTasks::Table)
                        .col(ProvisioningTasks::SubscriptionId)
                        .to_owned(),
                )
                .await?;

            // At most one open (pending or in_progress) task per subscription,
            // enforced in the store so concurrent enqueues cannot both land.
            // Retry flips the same failed row back to pending, which keeps a
            // single open row and never violates this index.
            manager
                .create_index(
                    Index::create()
                        .name("idx_provisioning_tasks_open_subscription")
                        .table(ProvisioningTasks::Table)
                        .col(ProvisioningTasks::SubscriptionId)
                        .unique()
                        .and_where(
                            Expr::col(ProvisioningTasks::Status).is_in(["pending", "in_progress"]),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProvisioningTasks::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ProvisioningTasks {
        Table,
        Id,
        SubscriptionId,
        ServerId,
        Status,
        Step,
        Payload,
        Attempts,
        LastError,
        LeaseExpiresAt,
        CreatedAt,
        StartedAt,
        CompletedAt,
    }
}
