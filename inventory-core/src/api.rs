use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use shared::CoreError;

use crate::models::StockLevelRow;
use crate::stock::StockService;

#[derive(Clone)]
pub struct AppState {
    pub stock: StockService,
}

#[derive(Debug, Deserialize)]
pub struct AdjustStockRequest {
    pub delta: i32,
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

/// Stock routes are internal-only; reservations never go through HTTP.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/internal/stock/:sku", get(get_stock))
        .route("/internal/stock/:sku/adjust", post(adjust_stock))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn get_stock(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> Result<Json<StockLevelRow>, ApiError> {
    let row = state.stock.get_stock(&sku).await?;
    Ok(Json(row))
}

async fn adjust_stock(
    State(state): State<AppState>,
    Path(sku): Path<String>,
    Json(req): Json<AdjustStockRequest>,
) -> Result<Json<StockLevelRow>, ApiError> {
    let row = state.stock.adjust_stock(&sku, req.delta).await?;
    Ok(Json(row))
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sku_maps_to_404() {
        let resp = ApiError(CoreError::not_found("stock level", "SKU-X")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn version_conflict_maps_to_409() {
        let resp = ApiError(CoreError::conflict("stock level", "SKU-X")).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn negative_stock_maps_to_400() {
        let resp = ApiError(CoreError::Validation("negative".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
