pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod mpesa;
pub mod ports;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::services::DonationEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DonationEngine>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/donations", post(handlers::donations::initiate_donation))
        .route("/donations/:id", get(handlers::donations::get_donation))
        .route(
            "/donations/:id/status",
            get(handlers::donations::get_donation_status),
        )
        .route(
            "/donations/status/:checkout_id",
            get(handlers::donations::get_status_by_checkout),
        )
        .route("/payments/callback", post(handlers::payments::stk_callback))
        .route("/payments/timeout", post(handlers::payments::stk_timeout))
        .with_state(state)
}
