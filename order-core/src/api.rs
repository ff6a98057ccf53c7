use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use shared::{CoreError, OrderStatus};

use crate::service::{CreateOrderCommand, OrderService};

const API_ACTOR: &str = "api";

#[derive(Clone)]
pub struct AppState {
    pub service: OrderService,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    pub changed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub reason: String,
    pub changed_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Conflict { .. } => StatusCode::CONFLICT,
            CoreError::Transport(_) | CoreError::Persistence(_) => {
                error!(error = %self.0, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/status", post(update_status))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn create_order(
    State(state): State<AppState>,
    Json(cmd): Json<CreateOrderCommand>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let order_id = state.service.create_order(cmd).await?;
    Ok((StatusCode::CREATED, Json(CreateOrderResponse { order_id })))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state.service.get_order(id).await?;
    Ok(Json(details))
}

async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let actor = req.changed_by.as_deref().unwrap_or(API_ACTOR);
    state.service.update_order_status(id, req.status, actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelOrderRequest>,
) -> Result<StatusCode, ApiError> {
    let actor = req.changed_by.as_deref().unwrap_or(API_ACTOR);
    state.service.cancel_order(id, &req.reason, actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let resp = ApiError(CoreError::not_found("order", Uuid::new_v4())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn validation_maps_to_400() {
        let resp = ApiError(CoreError::Validation("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn conflict_maps_to_409() {
        let resp = ApiError(CoreError::conflict("order", Uuid::new_v4())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn persistence_maps_to_500() {
        let resp = ApiError(CoreError::Persistence("db down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
