use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::outbound::webhook::{DeliveryFilter, DeliveryRecord, DispatcherStatus};
use crate::server::AppState;
use crate::server::responses::ApiError;

pub async fn status(State(state): State<AppState>) -> Json<DispatcherStatus> {
    Json(state.dispatcher.status().await)
}

pub async fn list_deliveries(
    State(state): State<AppState>,
    Query(filter): Query<DeliveryFilter>,
) -> Json<Vec<DeliveryRecord>> {
    Json(state.dispatcher.get_deliveries(&filter).await)
}

pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryRecord>, ApiError> {
    state
        .dispatcher
        .get_delivery(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Delivery {id} not found")))
}

pub async fn clear_deliveries(State(state): State<AppState>) -> StatusCode {
    state.dispatcher.clear_history().await;
    StatusCode::NO_CONTENT
}
