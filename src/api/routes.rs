//--------------------------------------------------------------------------------------------------
// FUNCTIONS
//--------------------------------------------------------------------------------------------------
// | Name                  | Description                            | Return Type         |
// |-----------------------|----------------------------------------|---------------------|
// | root                  | Liveness text                          | &'static str        |
// | create_payment        | Store a payment and request the charge | ApiResult<Response> |
// | list_payments         | List all payments                      | ApiResult<Response> |
// | get_payment           | Get one payment                        | ApiResult<Response> |
// | update_payment        | Partially update a payment             | ApiResult<Response> |
// | refund_payment        | Request a refund for a payment         | ApiResult<Response> |
// | broker_status         | Report the broker connection           | Response            |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Extension, Path,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use super::{ApiError, ApiResult, AppState, BrokerStatusResponse, RefundBody};
use crate::domain::models::{
    payment::{NewPayment, PaymentUpdate},
    requests::PaymentRequest,
};

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError::BadRequest(rejection.body_text())
}

fn bad_path(rejection: PathRejection) -> ApiError {
    ApiError::BadRequest(rejection.body_text())
}

/// Liveness text
pub async fn root() -> &'static str {
    "Payment service is running"
}

/// Stores a payment and publishes the matching payment request
pub async fn create_payment(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<NewPayment>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(req) = body.map_err(bad_body)?;
    let payment = state.repository.create(req).await?;
    info!("Created payment {} for order {}", payment.id, payment.order_id);

    let request = PaymentRequest {
        order_id: payment.order_id.clone(),
        amount: payment.amount,
        user_id: Some(payment.user_id.clone()),
    };
    if let Err(err) = state.sink.request_payment(&request).await {
        error!("Payment {} stored but its request was not published: {}", payment.id, err);
        return Err(err.into());
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": payment })),
    )
        .into_response())
}

/// Lists every payment in creation order
pub async fn list_payments(Extension(state): Extension<Arc<AppState>>) -> ApiResult<Response> {
    let payments = state.repository.list().await?;
    Ok(Json(json!({
        "success": true,
        "count": payments.len(),
        "data": payments
    }))
    .into_response())
}

pub async fn get_payment(
    Extension(state): Extension<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Response> {
    let Path(id) = id.map_err(bad_path)?;
    let payment = state.repository.get(id).await?;
    Ok(Json(json!({ "success": true, "data": payment })).into_response())
}

pub async fn update_payment(
    Extension(state): Extension<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<PaymentUpdate>, JsonRejection>,
) -> ApiResult<Response> {
    let Path(id) = id.map_err(bad_path)?;
    let Json(update) = body.map_err(bad_body)?;
    let payment = state.repository.update(id, update).await?;
    info!("Updated payment {}", id);
    Ok(Json(json!({ "success": true, "data": payment })).into_response())
}

/// Publishes a refund request for a stored payment; the outcome arrives as events
pub async fn refund_payment(
    Extension(state): Extension<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Option<Json<RefundBody>>,
) -> ApiResult<Response> {
    let Path(id) = id.map_err(bad_path)?;
    let payment = state.repository.get(id).await?;
    let request = body.map(|Json(b)| b).unwrap_or_default().into_request(&payment);

    state.sink.request_refund(&request).await?;
    info!("Requested refund of {} for order {}", request.amount, request.order_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Refund requested",
            "data": request
        })),
    )
        .into_response())
}

/// Reports the broker connection and the declared queues
pub async fn broker_status(Extension(state): Extension<Arc<AppState>>) -> Response {
    let status = BrokerStatusResponse::new(
        state.manager.status(),
        state.manager.topology().queue_names(),
    );
    Json(json!({ "success": true, "status": status })).into_response()
}
