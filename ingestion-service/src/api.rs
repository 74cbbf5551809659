use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::pipeline::{OrderOutcome, OrderPipeline};
use crate::store::CounterStore;

pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub store: CounterStore,
    pub pipeline: OrderPipeline,
    pub waiting_room_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub product_id: String,
    pub quantity: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub product_id: String,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub msg: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl StatusResponse {
    fn new(status: &str, msg: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            msg: msg.into(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/init", post(init_stock))
        .route("/order", post(place_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Administrative seeding of the counter store. Overwrites; safe to retry.
pub async fn init_stock(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> Response {
    if !shared::valid_id(&request.product_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Invalid product id".to_string(),
            }),
        )
            .into_response();
    }

    match state
        .store
        .set_stock(&request.product_id, request.quantity)
        .await
    {
        Ok(()) => {
            info!(
                product_id = %request.product_id,
                quantity = request.quantity,
                "stock initialized"
            );
            (
                StatusCode::OK,
                Json(StatusResponse::new(
                    "ok",
                    format!(
                        "Stock for {} set to {}",
                        request.product_id, request.quantity
                    ),
                )),
            )
                .into_response()
        }
        Err(e) => {
            error!(product_id = %request.product_id, error = %e, "stock init failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StatusResponse::new("error", "Counter store unavailable")),
            )
                .into_response()
        }
    }
}

/// The hot path. The pipeline owns the decision sequence; this handler only
/// extracts the idempotency header and maps the outcome onto the wire.
pub async fn place_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OrderRequest>,
) -> Response {
    let token = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok());

    let result = state
        .pipeline
        .place(&request.product_id, &request.user_id, token)
        .await;
    order_response(result, &state.waiting_room_url)
}

fn order_response(
    result: Result<OrderOutcome, crate::pipeline::OrderError>,
    waiting_room_url: &str,
) -> Response {
    match result {
        Ok(OrderOutcome::Accepted { order_id }) => {
            info!(%order_id, "order accepted");
            (
                StatusCode::OK,
                Json(StatusResponse::new("success", "Order accepted")),
            )
                .into_response()
        }
        Ok(OrderOutcome::Duplicate) => (
            StatusCode::OK,
            Json(StatusResponse::new("ignored", "Duplicate request")),
        )
            .into_response(),
        Ok(OrderOutcome::Throttled) => (
            StatusCode::FOUND,
            [(header::LOCATION, waiting_room_url.to_string())],
        )
            .into_response(),
        Ok(OrderOutcome::Invalid(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: msg.to_string(),
            }),
        )
            .into_response(),
        Ok(OrderOutcome::SoldOut) => (
            StatusCode::CONFLICT,
            Json(StatusResponse::new("sold_out", "Inventory empty")),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "order processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StatusResponse::new("error", "Order processing failed")),
            )
                .into_response()
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::OrderError;
    use anyhow::anyhow;
    use uuid::Uuid;

    const WAITING_ROOM: &str = "http://wait.example.com/room";

    #[test]
    fn accepted_maps_to_200() {
        let response = order_response(
            Ok(OrderOutcome::Accepted {
                order_id: Uuid::new_v4(),
            }),
            WAITING_ROOM,
        );
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn duplicate_maps_to_200() {
        let response = order_response(Ok(OrderOutcome::Duplicate), WAITING_ROOM);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn throttled_redirects_to_waiting_room() {
        let response = order_response(Ok(OrderOutcome::Throttled), WAITING_ROOM);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            WAITING_ROOM
        );
    }

    #[test]
    fn invalid_maps_to_400() {
        let response = order_response(
            Ok(OrderOutcome::Invalid("Missing Idempotency Key")),
            WAITING_ROOM,
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn sold_out_maps_to_409() {
        let response = order_response(Ok(OrderOutcome::SoldOut), WAITING_ROOM);
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn failures_map_to_500() {
        for error in [
            OrderError::CounterStore(anyhow!("down")),
            OrderError::ReservedNotLogged {
                order_id: Uuid::new_v4(),
                product_id: "p".to_string(),
                source: anyhow!("broker down"),
            },
            OrderError::MarkerNotSet {
                order_id: Uuid::new_v4(),
                source: anyhow!("down"),
            },
        ] {
            let response = order_response(Err(error), WAITING_ROOM);
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
}
