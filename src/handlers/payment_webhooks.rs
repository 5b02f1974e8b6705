use crate::{
    errors::ServiceError,
    services::orders::{IntakeOutcome, PaymentEvent},
    AppState,
};
use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, Json};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

/// Header carrying the pre-shared intake token.
pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

/// Intake response. `idempotent` appears only on a replayed delivery.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntakeResponse {
    pub ok: bool,
    pub order_id: Uuid,
    pub subscriptions_created: usize,
    pub subscription_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
}

impl From<IntakeOutcome> for IntakeResponse {
    fn from(outcome: IntakeOutcome) -> Self {
        Self {
            ok: true,
            order_id: outcome.order_id,
            subscriptions_created: outcome.subscription_ids.len(),
            subscription_ids: outcome.subscription_ids,
            idempotent: if outcome.created { None } else { Some(true) },
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// Fail-closed token check: no configured secret means no accepted
/// request, a missing or mismatching header means 401.
fn authorize(headers: &HeaderMap, secret: Option<&str>) -> Result<(), ServiceError> {
    let Some(secret) = secret else {
        warn!("payment intake rejected: no webhook secret configured");
        return Err(ServiceError::Unauthorized(
            "intake webhook is not configured".to_string(),
        ));
    };

    let presented = headers
        .get(WEBHOOK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !constant_time_eq(presented, secret) {
        warn!("payment intake rejected: invalid webhook token");
        return Err(ServiceError::Unauthorized(
            "invalid webhook token".to_string(),
        ));
    }

    Ok(())
}

// POST /api/v1/payments/intake
#[utoipa::path(
    post,
    path = "/api/v1/payments/intake",
    request_body = PaymentEvent,
    responses(
        (status = 200, description = "Payment event ingested (or replayed)", body = IntakeResponse),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing or invalid webhook token", body = crate::errors::ErrorResponse),
        (status = 500, description = "Intake transaction failed, safe to redeliver", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IntakeResponse>), ServiceError> {
    authorize(&headers, state.config.intake_webhook_secret.as_deref())?;

    let event: PaymentEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid intake payload: {}", e)))?;

    let outcome = state.orders.ingest(&event).await?;

    Ok((StatusCode::OK, Json(IntakeResponse::from(outcome))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_fails_closed() {
        let headers = HeaderMap::new();
        assert!(matches!(
            authorize(&headers, None),
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[test]
    fn mismatching_token_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(WEBHOOK_TOKEN_HEADER, "wrong".parse().unwrap());
        assert!(authorize(&headers, Some("right")).is_err());
    }

    #[test]
    fn matching_token_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(WEBHOOK_TOKEN_HEADER, "shared-token".parse().unwrap());
        assert!(authorize(&headers, Some("shared-token")).is_ok());
    }

    #[test]
    fn token_comparison_is_length_safe() {
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn replay_response_carries_the_idempotent_flag() {
        let outcome = IntakeOutcome {
            order_id: Uuid::new_v4(),
            created: false,
            subscription_ids: vec![Uuid::new_v4()],
            customer_id: None,
        };
        let response = IntakeResponse::from(outcome);
        assert_eq!(response.idempotent, Some(true));
        assert_eq!(response.subscriptions_created, 1);

        let fresh = IntakeOutcome {
            order_id: Uuid::new_v4(),
            created: true,
            subscription_ids: vec![],
            customer_id: None,
        };
        assert_eq!(IntakeResponse::from(fresh).idempotent, None);
    }
}
