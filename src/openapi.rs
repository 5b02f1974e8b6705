use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::errors::ErrorResponse;
use crate::handlers;
use crate::services::orders::PaymentEvent;
use crate::services::provisioning::TaskStats;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "HostOps API",
        description = "Hosting back office: payment intake, subscription materialization, and provisioning orchestration"
    ),
    paths(
        handlers::payment_webhooks::payment_intake,
        handlers::orders::list_orders,
        handlers::orders::get_order,
        handlers::tasks::list_tasks,
        handlers::tasks::task_stats,
        handlers::tasks::list_failed_tasks,
        handlers::tasks::clear_failed_tasks,
        handlers::tasks::get_task,
        handlers::tasks::retry_task,
        handlers::health::live,
        handlers::health::ready,
    ),
    components(schemas(
        ErrorResponse,
        PaymentEvent,
        TaskStats,
        handlers::payment_webhooks::IntakeResponse,
        handlers::tasks::TaskListResponse,
        handlers::tasks::ClearFailedResponse,
        handlers::orders::OrderListResponse,
        handlers::orders::OrderDetailResponse,
        handlers::health::HealthResponse,
    )),
    tags(
        (name = "Payments", description = "Payment-processor intake"),
        (name = "Orders", description = "Order ledger inspection"),
        (name = "Tasks", description = "Provisioning task backlog control"),
        (name = "Health", description = "Liveness and readiness probes")
    )
)]
pub struct ApiDoc;

/// Swagger UI mounted at /swagger-ui, spec at /api-docs/openapi.json.
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}
