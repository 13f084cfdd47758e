//! The donation engine: owns every lifecycle transition of a donation and
//! reconciles callbacks, polls and the mock path against the same state
//! machine.
//!
//! Mutation is serialized per donation through the repository's
//! compare-and-swap update; the loser of a race reloads the record and its
//! event collapses to the terminal-sink no-op. Nothing here holds a lock
//! across an outbound network call.

use chrono::{Duration as StaleDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::MpesaConfig;
use crate::domain::{Donation, DonationEvent, DonationStatus, Transition};
use crate::mpesa::codes::ResultOutcome;
use crate::mpesa::{self, MpesaClient, MpesaError, ParsedCallback, StkPushResponse, StkResult};
use crate::ports::{DonationRepository, ReceiptNotifier, RepositoryError, UpdateOutcome};
use crate::services::mock;

/// Outbound push attempts before the donation is failed as unreachable.
const PUSH_ATTEMPTS: u32 = 3;
const PUSH_BACKOFF: Duration = Duration::from_millis(500);

/// Transient storage errors are retried this many times per operation.
const STORAGE_ATTEMPTS: u32 = 3;
const STORAGE_BACKOFF: Duration = Duration::from_millis(100);

/// Reload-and-reapply rounds when a compare-and-swap loses a race.
const CAS_ATTEMPTS: u32 = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("donation not found: {0}")]
    NotFound(String),

    #[error("no donation matches checkout request id {0}")]
    UnknownCorrelation(String),

    #[error("payment gateway is not configured")]
    GatewayUnavailable,

    #[error(transparent)]
    Gateway(#[from] MpesaError),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Storage(msg) => EngineError::Storage(msg),
            RepositoryError::DuplicateCheckoutId(id) => {
                EngineError::Storage(format!("checkout request id collision: {id}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mock_mode: bool,
    pub stale_after: StaleDuration,
}

impl EngineSettings {
    pub fn from_config(config: &MpesaConfig) -> Self {
        Self {
            mock_mode: config.mock_mode,
            stale_after: StaleDuration::seconds(config.stale_after_secs as i64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub donor_ref: String,
    pub charity_ref: String,
    pub amount: i64,
    pub phone_number: String,
}

#[derive(Debug, Clone)]
pub struct InitiateOutcome {
    pub donation: Donation,
    pub customer_message: String,
}

pub struct DonationEngine {
    repo: Arc<dyn DonationRepository>,
    notifier: Arc<dyn ReceiptNotifier>,
    gateway: Option<Arc<MpesaClient>>,
    settings: EngineSettings,
}

impl DonationEngine {
    pub fn new(
        repo: Arc<dyn DonationRepository>,
        notifier: Arc<dyn ReceiptNotifier>,
        gateway: Option<Arc<MpesaClient>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repo,
            notifier,
            gateway,
            settings,
        }
    }

    /// Creates a donation and fires the push request. The CREATED record is
    /// persisted before any outbound call, so a crash mid-initiation leaves
    /// an inspectable row rather than a phantom charge.
    pub async fn initiate(&self, request: InitiateRequest) -> Result<InitiateOutcome, EngineError> {
        if request.amount <= 0 {
            return Err(EngineError::Validation(
                "amount must be a positive number of minor currency units".to_string(),
            ));
        }
        if request.donor_ref.trim().is_empty() || request.charity_ref.trim().is_empty() {
            return Err(EngineError::Validation(
                "donor and charity references are required".to_string(),
            ));
        }
        let phone = mpesa::normalize_phone(&request.phone_number).ok_or_else(|| {
            EngineError::Validation(format!(
                "invalid phone number '{}', expected 254XXXXXXXXX or 07XXXXXXXX",
                request.phone_number
            ))
        })?;

        let donation = Donation::create(request.donor_ref, request.charity_ref, request.amount, phone);
        let donation = self.insert_with_retry(&donation).await?;
        tracing::info!(donation_id = %donation.id, amount = donation.amount, "donation created");

        if self.settings.mock_mode {
            return self.complete_mock(donation).await;
        }

        let gateway = self
            .gateway
            .clone()
            .ok_or(EngineError::GatewayUnavailable)?;

        match self.push_with_retry(&gateway, &donation).await {
            Ok(response) => {
                let checkout = response.checkout_request_id.clone();
                let donation = self
                    .submit(
                        donation.id,
                        DonationEvent::ProviderAccepted {
                            checkout_request_id: response.checkout_request_id,
                            merchant_request_id: response.merchant_request_id,
                        },
                    )
                    .await?;
                tracing::info!(
                    donation_id = %donation.id,
                    checkout_request_id = %checkout,
                    "push accepted, donation pending"
                );
                Ok(InitiateOutcome {
                    donation,
                    customer_message: response.customer_message,
                })
            }
            Err(err) => {
                tracing::warn!(donation_id = %donation.id, "push initiation failed: {err}");
                self.submit(
                    donation.id,
                    DonationEvent::InitiationFailed {
                        reason: err.to_string(),
                    },
                )
                .await?;
                Err(EngineError::Gateway(err))
            }
        }
    }

    /// Feeds a normalized provider callback to the state machine. A checkout
    /// id this system never issued is [`EngineError::UnknownCorrelation`]:
    /// the caller acknowledges it, since redelivery cannot help.
    pub async fn handle_callback(&self, parsed: ParsedCallback) -> Result<Donation, EngineError> {
        let donation = self
            .find_by_checkout_with_retry(&parsed.checkout_request_id)
            .await?
            .ok_or_else(|| EngineError::UnknownCorrelation(parsed.checkout_request_id.clone()))?;
        self.submit(donation.id, callback_event(&parsed)?).await
    }

    /// Provider timeout notification for a pending push.
    pub async fn handle_timeout(&self, checkout_request_id: &str) -> Result<Donation, EngineError> {
        let donation = self
            .find_by_checkout_with_retry(checkout_request_id)
            .await?
            .ok_or_else(|| EngineError::UnknownCorrelation(checkout_request_id.to_string()))?;
        self.submit(donation.id, DonationEvent::ProviderTimedOut).await
    }

    /// Plain read, no reconciliation.
    pub async fn get(&self, id: Uuid) -> Result<Donation, EngineError> {
        self.get_with_retry(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Status poll. A donation pending past the staleness threshold triggers
    /// an active status query whose result feeds the same events as a
    /// callback; "still processing" leaves the donation PENDING.
    pub async fn poll(&self, id: Uuid) -> Result<Donation, EngineError> {
        let donation = self.get(id).await?;
        if donation.status == DonationStatus::Pending && self.is_stale(&donation) {
            return self.reconcile(donation).await;
        }
        Ok(donation)
    }

    /// Status poll keyed by the checkout request id the client received at
    /// initiation.
    pub async fn status_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Donation, EngineError> {
        let donation = self
            .find_by_checkout_with_retry(checkout_request_id)
            .await?
            .ok_or_else(|| EngineError::UnknownCorrelation(checkout_request_id.to_string()))?;
        self.poll(donation.id).await
    }

    /// Applies `event` to the donation through load → apply → compare-and-swap.
    /// A lost race reloads and re-applies; once the record is terminal the
    /// event collapses to a no-op and the current record is returned, so
    /// duplicate deliveries succeed without mutating anything. The receipt
    /// notifier fires after the commit of the transition into PAID, exactly
    /// once per donation.
    pub async fn submit(
        &self,
        donation_id: Uuid,
        event: DonationEvent,
    ) -> Result<Donation, EngineError> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self
                .get_with_retry(donation_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(donation_id.to_string()))?;

            let next = match current.apply(&event) {
                Transition::Stale => {
                    tracing::debug!(
                        donation_id = %donation_id,
                        status = %current.status,
                        "stale event ignored"
                    );
                    return Ok(current);
                }
                Transition::Applied(next) => next,
            };

            match self.update_with_retry(&next, current.version).await? {
                UpdateOutcome::Updated(saved) => {
                    tracing::info!(
                        donation_id = %saved.id,
                        from = %current.status,
                        to = %saved.status,
                        version = saved.version,
                        "donation transitioned"
                    );
                    if saved.status == DonationStatus::Paid {
                        self.dispatch_receipt(saved.clone());
                    }
                    return Ok(saved);
                }
                UpdateOutcome::VersionConflict => continue,
            }
        }

        Err(EngineError::Storage(format!(
            "transition for donation {donation_id} kept losing version races after {CAS_ATTEMPTS} attempts"
        )))
    }

    async fn complete_mock(&self, donation: Donation) -> Result<InitiateOutcome, EngineError> {
        let ids = mock::synthesize_ids(Utc::now());
        tracing::info!(
            donation_id = %donation.id,
            checkout_request_id = %ids.checkout_request_id,
            "mock mode: completing donation without provider"
        );

        let donation = self
            .submit(
                donation.id,
                DonationEvent::ProviderAccepted {
                    checkout_request_id: ids.checkout_request_id,
                    merchant_request_id: ids.merchant_request_id,
                },
            )
            .await?;
        let amount = donation.amount;
        let donation = self
            .submit(
                donation.id,
                DonationEvent::PaymentSucceeded {
                    receipt_number: ids.receipt_number,
                    amount_paid: amount,
                    result_desc: "The service request is processed successfully.".to_string(),
                },
            )
            .await?;

        Ok(InitiateOutcome {
            donation,
            customer_message: "Success. Request accepted for processing".to_string(),
        })
    }

    async fn push_with_retry(
        &self,
        gateway: &MpesaClient,
        donation: &Donation,
    ) -> Result<StkPushResponse, MpesaError> {
        let description = format!("Donation to {}", donation.charity_ref);
        let mut attempt = 0;
        loop {
            match gateway
                .initiate_stk_push(
                    donation.amount,
                    &donation.phone_number,
                    &donation.charity_ref,
                    &description,
                )
                .await
            {
                Err(MpesaError::Unreachable(reason)) if attempt + 1 < PUSH_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(
                        donation_id = %donation.id,
                        "push attempt {attempt} failed, retrying: {reason}"
                    );
                    sleep(PUSH_BACKOFF * attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn reconcile(&self, donation: Donation) -> Result<Donation, EngineError> {
        let Some(gateway) = self.gateway.clone() else {
            return Ok(donation);
        };
        let Some(checkout) = donation.checkout_request_id.clone() else {
            return Ok(donation);
        };

        tracing::info!(
            donation_id = %donation.id,
            checkout_request_id = %checkout,
            "donation pending past threshold, querying provider"
        );

        match gateway.query_stk_status(&checkout).await {
            Ok(Some(result)) => self.submit(donation.id, reconciliation_event(&result)).await,
            Ok(None) => Ok(donation),
            Err(err) => {
                // Reconciliation is opportunistic; the callback path stays
                // authoritative when the query fails.
                tracing::warn!(donation_id = %donation.id, "status query failed: {err}");
                Ok(donation)
            }
        }
    }

    fn is_stale(&self, donation: &Donation) -> bool {
        Utc::now() - donation.created_at >= self.settings.stale_after
    }

    fn dispatch_receipt(&self, donation: Donation) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(err) = notifier.notify_paid(&donation).await {
                tracing::error!(
                    donation_id = %donation.id,
                    "receipt notification failed: {err:#}"
                );
            }
        });
    }

    async fn get_with_retry(&self, id: Uuid) -> Result<Option<Donation>, EngineError> {
        let mut attempt = 0;
        loop {
            match self.repo.get(id).await {
                Ok(found) => return Ok(found),
                Err(RepositoryError::Storage(msg)) if attempt + 1 < STORAGE_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!("transient storage error on read, attempt {attempt}: {msg}");
                    sleep(STORAGE_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn find_by_checkout_with_retry(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Donation>, EngineError> {
        let mut attempt = 0;
        loop {
            match self.repo.find_by_checkout(checkout_request_id).await {
                Ok(found) => return Ok(found),
                Err(RepositoryError::Storage(msg)) if attempt + 1 < STORAGE_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!("transient storage error on lookup, attempt {attempt}: {msg}");
                    sleep(STORAGE_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn insert_with_retry(&self, donation: &Donation) -> Result<Donation, EngineError> {
        let mut attempt = 0;
        loop {
            match self.repo.insert(donation).await {
                Ok(inserted) => return Ok(inserted),
                Err(RepositoryError::Storage(msg)) if attempt + 1 < STORAGE_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!("transient storage error on insert, attempt {attempt}: {msg}");
                    sleep(STORAGE_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn update_with_retry(
        &self,
        donation: &Donation,
        expected_version: i32,
    ) -> Result<UpdateOutcome, EngineError> {
        let mut attempt = 0;
        loop {
            match self.repo.update(donation, expected_version).await {
                Ok(outcome) => return Ok(outcome),
                Err(RepositoryError::Storage(msg)) if attempt + 1 < STORAGE_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!("transient storage error on update, attempt {attempt}: {msg}");
                    sleep(STORAGE_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn callback_event(parsed: &ParsedCallback) -> Result<DonationEvent, EngineError> {
    let outcome = ResultOutcome::from_code(parsed.result_code);
    if outcome.is_success() {
        let amount_paid = parsed.amount.ok_or_else(|| {
            EngineError::Validation("success callback without an amount".to_string())
        })?;
        let receipt_number = parsed.receipt_number.clone().ok_or_else(|| {
            EngineError::Validation("success callback without a receipt number".to_string())
        })?;
        Ok(DonationEvent::PaymentSucceeded {
            receipt_number,
            amount_paid,
            result_desc: parsed
                .result_desc
                .clone()
                .unwrap_or_else(|| outcome.default_description()),
        })
    } else {
        Ok(DonationEvent::PaymentFailed {
            result_code: parsed.result_code,
            result_desc: parsed
                .result_desc
                .clone()
                .unwrap_or_else(|| outcome.default_description()),
        })
    }
}

fn reconciliation_event(result: &StkResult) -> DonationEvent {
    if ResultOutcome::from_code(result.result_code).is_success() {
        DonationEvent::ReconciledSucceeded {
            result_desc: result.result_desc.clone(),
        }
    } else {
        DonationEvent::PaymentFailed {
            result_code: result.result_code,
            result_desc: result.result_desc.clone(),
        }
    }
}
