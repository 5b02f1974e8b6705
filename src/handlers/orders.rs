use crate::{
    entities::{order, subscription},
    errors::ServiceError,
    services::catalog::{self, NormalizedItem},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 200;

#[derive(Debug, Deserialize, IntoParams)]
pub struct OrderListQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderListResponse {
    #[schema(value_type = Vec<Object>)]
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// One order with its subscriptions and a lenient normalization of the
/// stored cart snapshot. The normalized view covers every snapshot item,
/// including ones that were skipped at intake for lacking a catalog match.
#[derive(Debug, Serialize, ToSchema)]
pub struct OrderDetailResponse {
    #[schema(value_type = Object)]
    pub order: order::Model,
    #[schema(value_type = Vec<Object>)]
    pub subscriptions: Vec<subscription::Model>,
    #[schema(value_type = Vec<Object>)]
    pub normalized_cart: Vec<NormalizedItem>,
}

// GET /api/v1/orders
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "Orders, newest first", body = OrderListResponse)
    ),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<OrderListResponse>, ServiceError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let (orders, total) = state.orders.list_orders(page, limit).await?;

    Ok(Json(OrderListResponse {
        orders,
        total,
        page,
        limit,
    }))
}

// GET /api/v1/orders/:id
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with subscriptions", body = OrderDetailResponse),
        (status = 404, description = "No such order", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetailResponse>, ServiceError> {
    let (order, subscriptions) = state
        .orders
        .get_order(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", id)))?;

    let normalized_cart = order
        .cart_snapshot
        .as_array()
        .map(|items| catalog::normalize_cart(items))
        .unwrap_or_default();

    Ok(Json(OrderDetailResponse {
        order,
        subscriptions,
        normalized_cart,
    }))
}
