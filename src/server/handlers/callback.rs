use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::outbound::webhook::{CallbackRequest, WebhookResponse};
use crate::server::AppState;
use crate::server::responses::ApiError;

/// Accepts a signed callback from the automation endpoint.
///
/// The body is only parsed after its signature and timestamp check out.
pub async fn receive_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    if !state.dispatcher.has_webhook_secret().await {
        error!("Webhook secret not configured, refusing callback");
        return Err(ApiError::NotConfigured("Webhook not configured".to_string()));
    }

    let signer = state.dispatcher.signer().await;
    let tolerance = state.dispatcher.config().signature_tolerance_secs;

    let payload = signer.verify_request(&headers, &body, tolerance).map_err(|e| {
        warn!(error = %e, "Rejected webhook callback");
        ApiError::Unauthorized(e.to_string())
    })?;

    let request: CallbackRequest = serde_json::from_value(payload)
        .map_err(|e| ApiError::BadRequest(format!("Invalid callback request: {e}")))?;

    let processing_id = Uuid::new_v4();
    info!(
        action = ?request.action,
        order_id = %request.order_id,
        processing_id = %processing_id,
        "Webhook callback received"
    );

    Ok(Json(
        WebhookResponse::acknowledged()
            .with_message(format!(
                "Callback {:?} accepted for order {}",
                request.action, request.order_id
            ))
            .with_processing_id(processing_id.to_string()),
    ))
}
