//! Engine-level tests against the in-memory repository: lifecycle scenarios,
//! idempotency, race resolution and the mock completion path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    engine_with, failure_callback, pending_donation, success_callback, CountingNotifier,
    FlakyRepository,
};
use harambee_core::adapters::InMemoryDonationRepository;
use harambee_core::config::MpesaConfig;
use harambee_core::domain::{Donation, DonationEvent, DonationStatus, AMOUNT_MISMATCH_CODE};
use harambee_core::mpesa::MpesaClient;
use harambee_core::ports::DonationRepository;
use harambee_core::services::{DonationEngine, EngineError, EngineSettings, InitiateRequest};

/// Gives the spawned notifier task a chance to run before counting.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_full_success_flow_with_duplicate_callback() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier.clone(), false);

    let donation = pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K1").await;
    assert_eq!(donation.status, DonationStatus::Pending);
    assert_eq!(donation.version, 1);

    let paid = engine
        .handle_callback(success_callback("ws_CO_K1", 500, "ABC123"))
        .await
        .unwrap();
    assert_eq!(paid.status, DonationStatus::Paid);
    assert_eq!(paid.receipt_number.as_deref(), Some("ABC123"));
    assert_eq!(paid.version, 2);

    // Identical redelivery must succeed without mutating or re-notifying.
    let redelivered = engine
        .handle_callback(success_callback("ws_CO_K1", 500, "ABC123"))
        .await
        .unwrap();
    assert_eq!(redelivered.status, DonationStatus::Paid);
    assert_eq!(redelivered.version, 2);

    settle().await;
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_cancelled_by_user_marks_failed_with_code() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier.clone(), false);

    pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K2").await;

    let failed = engine
        .handle_callback(failure_callback("ws_CO_K2", 1032, "Request cancelled by user"))
        .await
        .unwrap();
    assert_eq!(failed.status, DonationStatus::Failed);
    assert_eq!(failed.result_code, Some(1032));
    assert_eq!(failed.result_desc.as_deref(), Some("Request cancelled by user"));

    settle().await;
    assert_eq!(notifier.count(), 0);
}

#[tokio::test]
async fn test_amount_mismatch_does_not_pay() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier.clone(), false);

    pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K3").await;

    let donation = engine
        .handle_callback(success_callback("ws_CO_K3", 400, "ABC999"))
        .await
        .unwrap();
    assert_eq!(donation.status, DonationStatus::Failed);
    assert_eq!(donation.result_code, Some(AMOUNT_MISMATCH_CODE));
    assert!(donation.receipt_number.is_none());

    settle().await;
    assert_eq!(notifier.count(), 0);
}

#[tokio::test]
async fn test_unknown_correlation_mutates_nothing() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier.clone(), false);

    let pending = pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K4").await;

    let result = engine
        .handle_callback(success_callback("ws_CO_never_issued", 500, "ABC123"))
        .await;
    assert!(matches!(result, Err(EngineError::UnknownCorrelation(_))));

    let untouched = engine.get(pending.id).await.unwrap();
    assert_eq!(untouched.status, DonationStatus::Pending);
    assert_eq!(untouched.version, 1);

    settle().await;
    assert_eq!(notifier.count(), 0);
}

#[tokio::test]
async fn test_provider_timeout_is_terminal() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier.clone(), false);

    pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K5").await;

    let timed_out = engine.handle_timeout("ws_CO_K5").await.unwrap();
    assert_eq!(timed_out.status, DonationStatus::TimedOut);

    // A late success callback must not resurrect the donation.
    let after = engine
        .handle_callback(success_callback("ws_CO_K5", 500, "ABC123"))
        .await
        .unwrap();
    assert_eq!(after.status, DonationStatus::TimedOut);

    settle().await;
    assert_eq!(notifier.count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_racing_terminal_events_commit_once() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = Arc::new(engine_with(repo.clone(), notifier.clone(), false));

    let donation = pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K6").await;

    // A poll-triggered reconciliation success racing the genuine callback.
    let callback_engine = engine.clone();
    let reconcile_engine = engine.clone();
    let donation_id = donation.id;

    let callback = tokio::spawn(async move {
        callback_engine
            .handle_callback(success_callback("ws_CO_K6", 500, "ABC123"))
            .await
    });
    let reconcile = tokio::spawn(async move {
        reconcile_engine
            .submit(
                donation_id,
                DonationEvent::ReconciledSucceeded {
                    result_desc: "The service request is processed successfully.".to_string(),
                },
            )
            .await
    });

    let (callback, reconcile) = tokio::join!(callback, reconcile);
    let callback = callback.unwrap().unwrap();
    let reconcile = reconcile.unwrap().unwrap();
    assert_eq!(callback.status, DonationStatus::Paid);
    assert_eq!(reconcile.status, DonationStatus::Paid);

    // Exactly one terminal transition: version 2 (create, accept, terminal).
    let final_state = engine.get(donation.id).await.unwrap();
    assert_eq!(final_state.status, DonationStatus::Paid);
    assert_eq!(final_state.version, 2);

    settle().await;
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_mock_path_reaches_paid_without_provider() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier.clone(), true);

    let outcome = engine
        .initiate(InitiateRequest {
            donor_ref: "donor-7".to_string(),
            charity_ref: "charity-7".to_string(),
            amount: 100,
            phone_number: "254712345678".to_string(),
        })
        .await
        .unwrap();

    let donation = outcome.donation;
    assert_eq!(donation.status, DonationStatus::Paid);
    assert_eq!(donation.amount, 100);
    assert!(donation
        .checkout_request_id
        .as_deref()
        .unwrap()
        .starts_with("ws_CO_MOCK_"));
    assert!(donation.receipt_number.as_deref().unwrap().starts_with("MOCK"));
    assert_eq!(donation.version, 2);

    settle().await;
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_initiation_rejects_invalid_input_before_creating_state() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo, notifier, true);

    let zero_amount = engine
        .initiate(InitiateRequest {
            donor_ref: "donor-1".to_string(),
            charity_ref: "charity-1".to_string(),
            amount: 0,
            phone_number: "254712345678".to_string(),
        })
        .await;
    assert!(matches!(zero_amount, Err(EngineError::Validation(_))));

    let bad_phone = engine
        .initiate(InitiateRequest {
            donor_ref: "donor-1".to_string(),
            charity_ref: "charity-1".to_string(),
            amount: 100,
            phone_number: "12345".to_string(),
        })
        .await;
    assert!(matches!(bad_phone, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn test_transient_storage_failures_are_retried() {
    let repo = Arc::new(FlakyRepository::new(2));
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier, false);

    let donation = Donation::create(
        "donor-1".to_string(),
        "charity-1".to_string(),
        500,
        "254700000000".to_string(),
    );
    repo.insert(&donation).await.unwrap();

    let pending = engine
        .submit(
            donation.id,
            DonationEvent::ProviderAccepted {
                checkout_request_id: "ws_CO_K7".to_string(),
                merchant_request_id: "MR_K7".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(pending.status, DonationStatus::Pending);
}

#[tokio::test]
async fn test_poll_keeps_pending_when_no_gateway_is_configured() {
    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let engine = engine_with(repo.clone(), notifier, false);

    let mut donation = Donation::create(
        "donor-1".to_string(),
        "charity-1".to_string(),
        500,
        "254700000000".to_string(),
    );
    donation.created_at = Utc::now() - chrono::Duration::seconds(300);
    repo.insert(&donation).await.unwrap();
    let pending = engine
        .submit(
            donation.id,
            DonationEvent::ProviderAccepted {
                checkout_request_id: "ws_CO_K8".to_string(),
                merchant_request_id: "MR_K8".to_string(),
            },
        )
        .await
        .unwrap();

    let polled = engine.poll(pending.id).await.unwrap();
    assert_eq!(polled.status, DonationStatus::Pending);
}

fn gateway_config(base_url: &str) -> MpesaConfig {
    MpesaConfig {
        base_url: base_url.to_string(),
        consumer_key: "key".to_string(),
        consumer_secret: "secret".to_string(),
        shortcode: "174379".to_string(),
        passkey: "passkey".to_string(),
        callback_url: "https://example.test/payments/callback".to_string(),
        timeout_url: "https://example.test/payments/timeout".to_string(),
        mock_mode: false,
        stale_after_secs: 0,
    }
}

#[tokio::test]
async fn test_stale_poll_reconciles_through_provider_query() {
    let mut server = mockito::Server::new_async().await;

    let _token_mock = server
        .mock("GET", "/oauth/v1/generate")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "test-token", "expires_in": "3599"}"#)
        .create_async()
        .await;

    let _query_mock = server
        .mock("POST", "/mpesa/stkpushquery/v1/query")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "ResponseCode": "0",
                "ResponseDescription": "The service request has been accepted successsfully",
                "ResultCode": "0",
                "ResultDesc": "The service request is processed successfully."
            }"#,
        )
        .create_async()
        .await;

    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let gateway = Arc::new(MpesaClient::new(gateway_config(&server.url())));
    let engine = DonationEngine::new(
        repo.clone(),
        notifier.clone(),
        Some(gateway),
        EngineSettings {
            mock_mode: false,
            stale_after: chrono::Duration::seconds(0),
        },
    );

    let pending = pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K9").await;

    let reconciled = engine.poll(pending.id).await.unwrap();
    assert_eq!(reconciled.status, DonationStatus::Paid);

    settle().await;
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn test_still_processing_query_leaves_donation_pending() {
    let mut server = mockito::Server::new_async().await;

    let _token_mock = server
        .mock("GET", "/oauth/v1/generate")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "test-token", "expires_in": "3599"}"#)
        .create_async()
        .await;

    let _query_mock = server
        .mock("POST", "/mpesa/stkpushquery/v1/query")
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "requestId": "ws_CO_K10-req",
                "errorCode": "500.001.1001",
                "errorMessage": "The transaction is being processed"
            }"#,
        )
        .create_async()
        .await;

    let repo = Arc::new(InMemoryDonationRepository::new());
    let notifier = CountingNotifier::new();
    let gateway = Arc::new(MpesaClient::new(gateway_config(&server.url())));
    let engine = DonationEngine::new(
        repo.clone(),
        notifier.clone(),
        Some(gateway),
        EngineSettings {
            mock_mode: false,
            stale_after: chrono::Duration::seconds(0),
        },
    );

    let pending = pending_donation(&engine, repo.as_ref(), 500, "ws_CO_K10").await;

    let polled = engine.poll(pending.id).await.unwrap();
    assert_eq!(polled.status, DonationStatus::Pending);

    settle().await;
    assert_eq!(notifier.count(), 0);
}
