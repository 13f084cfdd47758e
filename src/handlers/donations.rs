//! Client-facing donation endpoints: initiation and status polling.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Donation;
use crate::error::AppError;
use crate::services::InitiateRequest;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiateDonationRequest {
    pub donor_id: String,
    pub charity_id: String,
    pub amount: i64,
    pub phone_number: String,
}

#[derive(Debug, Serialize)]
pub struct InitiateDonationResponse {
    pub message: String,
    pub donation: Donation,
    pub checkout_request_id: Option<String>,
    pub customer_message: String,
}

/// Poll response: current state plus a human-readable label and the receipt
/// once one exists.
#[derive(Debug, Serialize)]
pub struct DonationStatusResponse {
    pub id: Uuid,
    pub status: String,
    pub status_label: String,
    pub amount: i64,
    pub charity_id: String,
    pub checkout_request_id: Option<String>,
    pub receipt_number: Option<String>,
    pub result_desc: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Donation> for DonationStatusResponse {
    fn from(donation: Donation) -> Self {
        Self {
            id: donation.id,
            status: donation.status.as_str().to_string(),
            status_label: donation.status.label().to_string(),
            amount: donation.amount,
            charity_id: donation.charity_ref,
            checkout_request_id: donation.checkout_request_id,
            receipt_number: donation.receipt_number,
            result_desc: donation.result_desc,
            created_at: donation.created_at,
            updated_at: donation.updated_at,
        }
    }
}

pub async fn initiate_donation(
    State(state): State<AppState>,
    Json(payload): Json<InitiateDonationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .engine
        .initiate(InitiateRequest {
            donor_ref: payload.donor_id,
            charity_ref: payload.charity_id,
            amount: payload.amount,
            phone_number: payload.phone_number,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(InitiateDonationResponse {
            message: "STK push sent. Check your phone to complete payment.".to_string(),
            checkout_request_id: outcome.donation.checkout_request_id.clone(),
            customer_message: outcome.customer_message,
            donation: outcome.donation,
        }),
    ))
}

pub async fn get_donation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let donation = state.engine.get(id).await?;
    Ok(Json(donation))
}

/// Poll endpoint. A donation pending past the staleness threshold triggers
/// an active provider query before the state is returned.
pub async fn get_donation_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let donation = state.engine.poll(id).await?;
    Ok(Json(DonationStatusResponse::from(donation)))
}

/// Same poll keyed by the checkout request id returned at initiation.
pub async fn get_status_by_checkout(
    State(state): State<AppState>,
    Path(checkout_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let donation = state.engine.status_by_checkout(&checkout_id).await?;
    Ok(Json(DonationStatusResponse::from(donation)))
}
