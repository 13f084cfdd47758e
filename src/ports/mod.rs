//! Ports the engine depends on: the donation store and the receipt notifier.
//! Adapters live in `crate::adapters`; tests plug in their own implementations.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::Donation;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("checkout request id already registered: {0}")]
    DuplicateCheckoutId(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Result of a compare-and-swap update.
#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(Donation),
    /// The stored version no longer matches the expected one — a racing
    /// transition won. The caller reloads and re-applies its event.
    VersionConflict,
}

/// Transactional store keyed by donation id and, once assigned, by the
/// provider checkout request id. The checkout index is the correlation
/// registry that joins inbound callbacks to local records.
#[async_trait]
pub trait DonationRepository: Send + Sync {
    async fn insert(&self, donation: &Donation) -> RepositoryResult<Donation>;

    async fn get(&self, id: Uuid) -> RepositoryResult<Option<Donation>>;

    async fn find_by_checkout(&self, checkout_request_id: &str)
        -> RepositoryResult<Option<Donation>>;

    /// Persists `donation` only if the stored version equals
    /// `expected_version`. Lost races surface as
    /// [`UpdateOutcome::VersionConflict`], never as partial writes.
    async fn update(
        &self,
        donation: &Donation,
        expected_version: i32,
    ) -> RepositoryResult<UpdateOutcome>;
}

/// Collaborator invoked exactly once when a donation enters PAID, after the
/// state change is committed. Delivery is fire-and-forget: failures are
/// logged and never propagate to the provider acknowledgment.
#[async_trait]
pub trait ReceiptNotifier: Send + Sync {
    async fn notify_paid(&self, donation: &Donation) -> anyhow::Result<()>;
}

/// Default notifier: records the receipt in the log stream. Outbound email
/// delivery hangs off this seam in the full platform.
pub struct LogNotifier;

#[async_trait]
impl ReceiptNotifier for LogNotifier {
    async fn notify_paid(&self, donation: &Donation) -> anyhow::Result<()> {
        tracing::info!(
            donation_id = %donation.id,
            receipt = donation.receipt_number.as_deref().unwrap_or("-"),
            amount = donation.amount,
            "donation paid, receipt notification dispatched"
        );
        Ok(())
    }
}
