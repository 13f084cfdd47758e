#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use harambee_core::adapters::InMemoryDonationRepository;
use harambee_core::domain::{Donation, DonationEvent};
use harambee_core::mpesa::ParsedCallback;
use harambee_core::ports::{
    DonationRepository, ReceiptNotifier, RepositoryError, RepositoryResult, UpdateOutcome,
};
use harambee_core::services::{DonationEngine, EngineSettings};

/// Notifier that counts invocations instead of sending anything.
pub struct CountingNotifier {
    invocations: AtomicUsize,
}

impl CountingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReceiptNotifier for CountingNotifier {
    async fn notify_paid(&self, _donation: &Donation) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Repository wrapper that injects a fixed number of transient update
/// failures before delegating to the in-memory store.
pub struct FlakyRepository {
    inner: InMemoryDonationRepository,
    update_failures: AtomicUsize,
}

impl FlakyRepository {
    pub fn new(update_failures: usize) -> Self {
        Self {
            inner: InMemoryDonationRepository::new(),
            update_failures: AtomicUsize::new(update_failures),
        }
    }
}

#[async_trait]
impl DonationRepository for FlakyRepository {
    async fn insert(&self, donation: &Donation) -> RepositoryResult<Donation> {
        self.inner.insert(donation).await
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Option<Donation>> {
        self.inner.get(id).await
    }

    async fn find_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> RepositoryResult<Option<Donation>> {
        self.inner.find_by_checkout(checkout_request_id).await
    }

    async fn update(
        &self,
        donation: &Donation,
        expected_version: i32,
    ) -> RepositoryResult<UpdateOutcome> {
        if self.update_failures.load(Ordering::SeqCst) > 0 {
            self.update_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(RepositoryError::Storage(
                "injected transient failure".to_string(),
            ));
        }
        self.inner.update(donation, expected_version).await
    }
}

pub fn test_settings(mock_mode: bool) -> EngineSettings {
    EngineSettings {
        mock_mode,
        stale_after: Duration::seconds(30),
    }
}

pub fn engine_with(
    repo: Arc<dyn DonationRepository>,
    notifier: Arc<CountingNotifier>,
    mock_mode: bool,
) -> DonationEngine {
    DonationEngine::new(repo, notifier, None, test_settings(mock_mode))
}

/// Seeds a PENDING donation with the given checkout id through the same
/// entry points the live initiation path uses.
pub async fn pending_donation(
    engine: &DonationEngine,
    repo: &dyn DonationRepository,
    amount: i64,
    checkout: &str,
) -> Donation {
    let donation = Donation::create(
        "donor-1".to_string(),
        "charity-1".to_string(),
        amount,
        "254700000000".to_string(),
    );
    repo.insert(&donation).await.unwrap();
    engine
        .submit(
            donation.id,
            DonationEvent::ProviderAccepted {
                checkout_request_id: checkout.to_string(),
                merchant_request_id: format!("MR_{checkout}"),
            },
        )
        .await
        .unwrap()
}

pub fn success_callback(checkout: &str, amount: i64, receipt: &str) -> ParsedCallback {
    ParsedCallback {
        checkout_request_id: checkout.to_string(),
        merchant_request_id: Some(format!("MR_{checkout}")),
        result_code: 0,
        result_desc: Some("The service request is processed successfully.".to_string()),
        receipt_number: Some(receipt.to_string()),
        amount: Some(amount),
        phone_number: Some("254700000000".to_string()),
        transaction_date: Some("20260806123456".to_string()),
    }
}

pub fn failure_callback(checkout: &str, result_code: i64, result_desc: &str) -> ParsedCallback {
    ParsedCallback {
        checkout_request_id: checkout.to_string(),
        merchant_request_id: Some(format!("MR_{checkout}")),
        result_code,
        result_desc: Some(result_desc.to_string()),
        receipt_number: None,
        amount: None,
        phone_number: None,
        transaction_date: None,
    }
}

/// Raw wire envelope, as Safaricom posts it.
pub fn success_envelope(checkout: &str, amount: i64, receipt: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": format!("MR_{checkout}"),
                "CheckoutRequestID": checkout,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": amount},
                        {"Name": "MpesaReceiptNumber", "Value": receipt},
                        {"Name": "TransactionDate", "Value": 20260806123456u64},
                        {"Name": "PhoneNumber", "Value": 254700000000u64}
                    ]
                }
            }
        }
    })
}

pub fn failure_envelope(checkout: &str, result_code: i64, result_desc: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": format!("MR_{checkout}"),
                "CheckoutRequestID": checkout,
                "ResultCode": result_code,
                "ResultDesc": result_desc
            }
        }
    })
}
