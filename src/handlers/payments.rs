//! Provider-facing callback endpoints.
//!
//! These are called by Safaricom, not by our clients; trust comes from the
//! callback URLs being configured out-of-band. Whatever happens internally,
//! the response is the fixed acknowledgment shape the provider understands:
//! result code 0 stops redelivery, result code 1 asks for a retry and is
//! used only when storage gave out.

use axum::{extract::State, Json};

use crate::mpesa::callback::{CallbackAck, ParsedCallback};
use crate::services::EngineError;
use crate::AppState;

pub async fn stk_callback(State(state): State<AppState>, body: String) -> Json<CallbackAck> {
    let parsed = match ParsedCallback::from_json(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!("discarding malformed callback payload: {err}");
            return Json(CallbackAck::accepted());
        }
    };

    tracing::info!(
        checkout_request_id = %parsed.checkout_request_id,
        result_code = parsed.result_code,
        "provider callback received"
    );

    match state.engine.handle_callback(parsed).await {
        Ok(donation) => {
            tracing::info!(
                donation_id = %donation.id,
                status = %donation.status,
                receipt = donation.receipt_number.as_deref().unwrap_or("-"),
                "callback processed"
            );
            Json(CallbackAck::accepted())
        }
        Err(EngineError::UnknownCorrelation(checkout)) => {
            tracing::warn!(
                checkout_request_id = %checkout,
                "callback references an unknown checkout request id"
            );
            Json(CallbackAck::accepted())
        }
        Err(EngineError::Storage(reason)) => {
            tracing::error!("storage exhausted while processing callback: {reason}");
            Json(CallbackAck::retry())
        }
        Err(err) => {
            tracing::error!("callback processing failed: {err}");
            Json(CallbackAck::accepted())
        }
    }
}

pub async fn stk_timeout(State(state): State<AppState>, body: String) -> Json<CallbackAck> {
    let parsed = match ParsedCallback::from_json(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!("discarding malformed timeout payload: {err}");
            return Json(CallbackAck::accepted());
        }
    };

    tracing::warn!(
        checkout_request_id = %parsed.checkout_request_id,
        "provider timeout notification received"
    );

    match state.engine.handle_timeout(&parsed.checkout_request_id).await {
        Ok(_) => Json(CallbackAck::accepted()),
        Err(EngineError::UnknownCorrelation(checkout)) => {
            tracing::warn!(
                checkout_request_id = %checkout,
                "timeout notification for an unknown checkout request id"
            );
            Json(CallbackAck::accepted())
        }
        Err(EngineError::Storage(reason)) => {
            tracing::error!("storage exhausted while processing timeout: {reason}");
            Json(CallbackAck::retry())
        }
        Err(err) => {
            tracing::error!("timeout processing failed: {err}");
            Json(CallbackAck::accepted())
        }
    }
}
