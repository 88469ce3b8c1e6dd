//! Producer HTTP surface.
//!
//! Each write endpoint validates its body, builds one event payload and
//! hands it to the [`Publisher`]. Broker failures surface as 500s; the
//! caller never waits for consumers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::bus::{BusError, Publisher, SessionSupervisor};
use crate::envelope::Envelope;
use crate::events::{
    OrderCreated, OrderShipped, PaymentCompleted, ORDER_CREATED, ORDER_SHIPPED, PAYMENT_COMPLETED,
};


/// Reported by `GET /`.
pub const API_VERSION: &str = "1.0.0";

pub const DEFAULT_PAYMENT_METHOD: &str = "credit_card";
pub const DEFAULT_CARRIER: &str = "DHL";

const REQUIRED_ORDER_FIELDS: &str = "Required fields: userId, productId, quantity, totalAmount";

#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    pub supervisor: Arc<SessionSupervisor>,
    pub service: String,
}

/// Build the router (separated for testing).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/orders", post(create_order))
        .route("/orders/:order_id/payment", post(process_payment))
        .route("/orders/:order_id/shipment", post(ship_order))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Publish(BusError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
            }
            ApiError::Publish(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Internal server error",
                    "message": e.to_string(),
                })),
            )
                .into_response(),
        }
    }
}

/// Parse a JSON body; an empty body reads as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "Rejected malformed request body");
        ApiError::BadRequest(format!("Malformed JSON body: {}", e))
    })
}

/// A request field that was actually given. Missing, null, `false`, empty
/// strings and zero count as absent; any other value is kept as sent.
fn given(value: Option<Value>) -> Option<Value> {
    value.filter(|v| match v {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
        _ => true,
    })
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn publish(state: &AppState, event_type: &str, data: Value) -> Result<Envelope, ApiError> {
    state.publisher.publish(event_type, data).await.map_err(|e| {
        error!(event_type = %event_type, error = %e, "Failed to publish event");
        ApiError::Publish(e)
    })
}

fn to_data<T: serde::Serialize>(payload: &T) -> Result<Value, ApiError> {
    serde_json::to_value(payload).map_err(|e| ApiError::Publish(BusError::Serialization(e)))
}

// ============================================================================
// Handlers
// ============================================================================

async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": state.service,
        "version": API_VERSION,
        "endpoints": {
            "health": "GET /health",
            "createOrder": "POST /orders",
            "processPayment": "POST /orders/:orderId/payment",
            "shipOrder": "POST /orders/:orderId/shipment",
        },
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let broker = if state.supervisor.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(json!({
        "status": "healthy",
        "service": state.service,
        "rabbitmq": broker,
        "timestamp": iso(Utc::now()),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderRequest {
    user_id: Option<Value>,
    product_id: Option<Value>,
    quantity: Option<Value>,
    total_amount: Option<Value>,
}

async fn create_order(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: CreateOrderRequest = parse_body(&body)?;

    let (Some(user_id), Some(product_id), Some(quantity), Some(total_amount)) = (
        given(request.user_id),
        given(request.product_id),
        given(request.quantity),
        given(request.total_amount),
    ) else {
        return Err(ApiError::BadRequest(REQUIRED_ORDER_FIELDS.to_string()));
    };

    let at = Utc::now();
    let order = OrderCreated {
        order_id: format!("ORD-{}", at.timestamp_millis()),
        user_id,
        product_id,
        quantity,
        total_amount,
        status: "created".to_string(),
        created_at: iso(at),
    };
    let data = to_data(&order)?;
    let event = publish(&state, ORDER_CREATED, data.clone()).await?;

    info!(order_id = %order.order_id, event_id = %event.event_id, "Order created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Order created successfully",
            "order": data,
            "event": {
                "eventId": event.event_id,
                "eventType": event.event_type,
                "timestamp": event.timestamp,
            },
        })),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest {
    payment_method: Option<Value>,
    amount: Option<Value>,
}

async fn process_payment(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: PaymentRequest = parse_body(&body)?;

    let at = Utc::now();
    let payment = PaymentCompleted {
        order_id,
        payment_method: given(request.payment_method)
            .unwrap_or_else(|| Value::from(DEFAULT_PAYMENT_METHOD)),
        amount: request.amount.unwrap_or_default(),
        status: "completed".to_string(),
        transaction_id: format!("TXN-{}", at.timestamp_millis()),
        paid_at: iso(at),
    };
    let data = to_data(&payment)?;
    let event = publish(&state, PAYMENT_COMPLETED, data.clone()).await?;

    info!(order_id = %payment.order_id, event_id = %event.event_id, "Payment processed");
    Ok(Json(json!({
        "message": "Payment processed successfully",
        "payment": data,
        "event": {
            "eventId": event.event_id,
            "eventType": event.event_type,
        },
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShipmentRequest {
    address: Option<Value>,
    carrier: Option<Value>,
}

async fn ship_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: ShipmentRequest = parse_body(&body)?;

    let at = Utc::now();
    let shipment = OrderShipped {
        order_id,
        tracking_number: format!("TRK-{}", at.timestamp_millis()),
        carrier: given(request.carrier).unwrap_or_else(|| Value::from(DEFAULT_CARRIER)),
        address: request.address.unwrap_or_default(),
        status: "shipped".to_string(),
        shipped_at: iso(at),
    };
    let data = to_data(&shipment)?;
    let event = publish(&state, ORDER_SHIPPED, data.clone()).await?;

    info!(order_id = %shipment.order_id, event_id = %event.event_id, "Order shipped");
    Ok(Json(json!({
        "message": "Order shipped successfully",
        "shipment": data,
        "event": {
            "eventId": event.event_id,
            "eventType": event.event_type,
        },
    })))
}
