//! HTTP client for the M-Pesa Daraja API: OAuth token management, STK push
//! initiation and transaction status queries.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::MpesaConfig;
use crate::mpesa::codes::ResultOutcome;

/// Refresh the cached token this long before its stated expiry.
const TOKEN_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Daraja error code returned by the query endpoint while the transaction
/// is still in flight on the subscriber's handset.
const STILL_PROCESSING_CODE: &str = "500.001.1001";

#[derive(Error, Debug)]
pub enum MpesaError {
    #[error("provider authentication failed: {0}")]
    AuthFailure(String),

    #[error("gateway rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("invalid response from gateway: {0}")]
    InvalidResponse(String),

    #[error("gateway circuit breaker is open")]
    CircuitOpen,
}

impl From<reqwest::Error> for MpesaError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unreachable(err.to_string())
    }
}

/// Provider acknowledgment of an STK push initiation.
#[derive(Debug, Clone)]
pub struct StkPushResponse {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub customer_message: String,
}

/// Resolved result of a status query, in the same vocabulary as a callback.
#[derive(Debug, Clone)]
pub struct StkResult {
    pub result_code: i64,
    pub result_desc: String,
}

#[derive(Debug, Default)]
struct TokenCache {
    token: Option<String>,
    expires_at: Option<Instant>,
}

/// Client for the Daraja STK push API.
///
/// The token cache is shared across clones; refreshes are single-flight
/// because the cache lock is held for the duration of the refresh call.
/// Push and query calls go through a circuit breaker so a provider outage
/// fails fast instead of stacking up 30s timeouts.
#[derive(Clone)]
pub struct MpesaClient {
    client: Client,
    config: MpesaConfig,
    token_cache: Arc<Mutex<TokenCache>>,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> Self {
        Self::with_circuit_breaker(config, 3, 60)
    }

    /// Creates a client with a custom circuit breaker configuration.
    pub fn with_circuit_breaker(
        config: MpesaConfig,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        MpesaClient {
            client,
            config,
            token_cache: Arc::new(Mutex::new(TokenCache::default())),
            circuit_breaker,
        }
    }

    /// Returns the current state of the circuit breaker.
    pub fn circuit_state(&self) -> &'static str {
        if self.circuit_breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }

    /// Returns a valid bearer token, refreshing it when the cached one is
    /// within [`TOKEN_SAFETY_MARGIN`] of expiry. Concurrent callers wait on
    /// the cache lock rather than issuing redundant token requests.
    pub async fn access_token(&self) -> Result<String, MpesaError> {
        let mut cache = self.token_cache.lock().await;

        if let (Some(token), Some(expires_at)) = (&cache.token, cache.expires_at) {
            if expires_at.saturating_duration_since(Instant::now()) > TOKEN_SAFETY_MARGIN {
                return Ok(token.clone());
            }
        }

        tracing::info!("refreshing M-Pesa access token");
        let (token, expires_in) = self.fetch_token().await?;
        cache.token = Some(token.clone());
        cache.expires_at = Some(Instant::now() + expires_in);
        Ok(token)
    }

    /// Drops the cached token so the next call fetches a fresh one. Called
    /// when the provider rejects a bearer token mid-lifetime.
    pub async fn invalidate_token(&self) {
        let mut cache = self.token_cache.lock().await;
        cache.token = None;
        cache.expires_at = None;
    }

    async fn fetch_token(&self) -> Result<(String, Duration), MpesaError> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(MpesaError::Unreachable(format!("{status}: {text}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MpesaError::AuthFailure(format!("{status}: {text}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| MpesaError::InvalidResponse(e.to_string()))?;

        if body.access_token.is_empty() {
            return Err(MpesaError::InvalidResponse(
                "no access_token in OAuth response".to_string(),
            ));
        }

        let expires = Duration::from_secs(body.expires_in_secs());
        Ok((body.access_token, expires))
    }

    /// Initiates an STK push. Retries once with a fresh token if the cached
    /// one is rejected.
    pub async fn initiate_stk_push(
        &self,
        amount: i64,
        phone: &str,
        account_reference: &str,
        description: &str,
    ) -> Result<StkPushResponse, MpesaError> {
        let token = self.access_token().await?;
        match self
            .send_stk_push(&token, amount, phone, account_reference, description)
            .await
        {
            Err(MpesaError::AuthFailure(reason)) => {
                tracing::warn!("bearer token rejected ({reason}), refreshing and retrying");
                self.invalidate_token().await;
                let token = self.access_token().await?;
                self.send_stk_push(&token, amount, phone, account_reference, description)
                    .await
            }
            other => other,
        }
    }

    async fn send_stk_push(
        &self,
        token: &str,
        amount: i64,
        phone: &str,
        account_reference: &str,
        description: &str,
    ) -> Result<StkPushResponse, MpesaError> {
        let timestamp = daraja_timestamp(Utc::now());
        let payload = StkPushRequest {
            business_short_code: self.config.shortcode.clone(),
            password: self.stk_password(&timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: phone.to_string(),
            party_b: self.config.shortcode.clone(),
            phone_number: phone.to_string(),
            callback_url: self.config.callback_url.clone(),
            account_reference: truncate(account_reference, 12),
            transaction_desc: truncate(description, 13),
        };

        let client = self.client.clone();
        let url = format!(
            "{}/mpesa/stkpush/v1/processrequest",
            self.config.base_url.trim_end_matches('/')
        );
        let token = token.to_string();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client
                    .post(&url)
                    .bearer_auth(&token)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(MpesaError::from)?;

                let status = response.status();
                if status == StatusCode::UNAUTHORIZED {
                    return Err(MpesaError::AuthFailure("bearer token rejected".to_string()));
                }
                if status.is_server_error() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(MpesaError::Unreachable(format!("{status}: {text}")));
                }
                if status.is_client_error() {
                    return Err(rejection_from_error_body(status, response.text().await.ok()));
                }

                let body: StkPushApiResponse = response
                    .json()
                    .await
                    .map_err(|e| MpesaError::InvalidResponse(e.to_string()))?;

                match body.response_code.as_deref() {
                    Some("0") => Ok(StkPushResponse {
                        checkout_request_id: body.checkout_request_id.ok_or_else(|| {
                            MpesaError::InvalidResponse(
                                "accepted push without CheckoutRequestID".to_string(),
                            )
                        })?,
                        merchant_request_id: body.merchant_request_id.ok_or_else(|| {
                            MpesaError::InvalidResponse(
                                "accepted push without MerchantRequestID".to_string(),
                            )
                        })?,
                        customer_message: body.customer_message.unwrap_or_default(),
                    }),
                    code => Err(MpesaError::Rejected {
                        code: code.unwrap_or("unknown").to_string(),
                        message: body
                            .response_description
                            .unwrap_or_else(|| "push request rejected".to_string()),
                    }),
                }
            })
            .await;

        unwrap_circuit(result)
    }

    /// Actively queries the provider for the result of a previously
    /// initiated push. Returns `Ok(None)` while the provider reports the
    /// transaction still processing.
    pub async fn query_stk_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<StkResult>, MpesaError> {
        let token = self.access_token().await?;
        match self.send_stk_query(&token, checkout_request_id).await {
            Err(MpesaError::AuthFailure(reason)) => {
                tracing::warn!("bearer token rejected ({reason}), refreshing and retrying");
                self.invalidate_token().await;
                let token = self.access_token().await?;
                self.send_stk_query(&token, checkout_request_id).await
            }
            other => other,
        }
    }

    async fn send_stk_query(
        &self,
        token: &str,
        checkout_request_id: &str,
    ) -> Result<Option<StkResult>, MpesaError> {
        let timestamp = daraja_timestamp(Utc::now());
        let payload = StkQueryRequest {
            business_short_code: self.config.shortcode.clone(),
            password: self.stk_password(&timestamp),
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let client = self.client.clone();
        let url = format!(
            "{}/mpesa/stkpushquery/v1/query",
            self.config.base_url.trim_end_matches('/')
        );
        let token = token.to_string();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client
                    .post(&url)
                    .bearer_auth(&token)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(MpesaError::from)?;

                let status = response.status();
                if status == StatusCode::UNAUTHORIZED {
                    return Err(MpesaError::AuthFailure("bearer token rejected".to_string()));
                }
                if status.is_server_error() {
                    let text = response.text().await.unwrap_or_default();
                    if let Ok(body) = serde_json::from_str::<DarajaErrorBody>(&text) {
                        // The query endpoint answers HTTP 500 with a dedicated
                        // error code while the push is still on the handset.
                        if body.error_code.as_deref() == Some(STILL_PROCESSING_CODE) {
                            return Ok(None);
                        }
                    }
                    return Err(MpesaError::Unreachable(format!("{status}: {text}")));
                }
                if status.is_client_error() {
                    return Err(rejection_from_error_body(status, response.text().await.ok()));
                }

                let body: StkQueryApiResponse = response
                    .json()
                    .await
                    .map_err(|e| MpesaError::InvalidResponse(e.to_string()))?;

                if body.response_code.as_deref() != Some("0") {
                    return Err(MpesaError::Rejected {
                        code: body.response_code.unwrap_or_else(|| "unknown".to_string()),
                        message: body
                            .response_description
                            .unwrap_or_else(|| "status query rejected".to_string()),
                    });
                }

                let result_code = body
                    .result_code
                    .as_deref()
                    .and_then(|c| c.parse::<i64>().ok())
                    .ok_or_else(|| {
                        MpesaError::InvalidResponse("query response without ResultCode".to_string())
                    })?;

                Ok(Some(StkResult {
                    result_code,
                    result_desc: body.result_desc.unwrap_or_else(|| {
                        ResultOutcome::from_code(result_code).default_description()
                    }),
                }))
            })
            .await;

        unwrap_circuit(result)
    }

    fn stk_password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }
}

fn unwrap_circuit<T>(result: Result<T, FailsafeError<MpesaError>>) -> Result<T, MpesaError> {
    match result {
        Ok(value) => Ok(value),
        Err(FailsafeError::Rejected) => Err(MpesaError::CircuitOpen),
        Err(FailsafeError::Inner(e)) => Err(e),
    }
}

fn rejection_from_error_body(status: StatusCode, text: Option<String>) -> MpesaError {
    let text = text.unwrap_or_default();
    match serde_json::from_str::<DarajaErrorBody>(&text) {
        Ok(body) => MpesaError::Rejected {
            code: body.error_code.unwrap_or_else(|| status.as_u16().to_string()),
            message: body.error_message.unwrap_or(text),
        },
        Err(_) => MpesaError::Rejected {
            code: status.as_u16().to_string(),
            message: text,
        },
    }
}

fn daraja_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Error body Daraja returns on non-2xx responses.
#[derive(Debug, Deserialize)]
struct DarajaErrorBody {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    // Daraja returns this as a JSON string ("3599"); sandbox builds have
    // been seen returning a bare number.
    expires_in: Option<Value>,
}

impl TokenResponse {
    fn expires_in_secs(&self) -> u64 {
        self.expires_in
            .as_ref()
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(3600)
    }
}

#[derive(Debug, Serialize)]
struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: String,
    #[serde(rename = "Amount")]
    amount: i64,
    #[serde(rename = "PartyA")]
    party_a: String,
    #[serde(rename = "PartyB")]
    party_b: String,
    #[serde(rename = "PhoneNumber")]
    phone_number: String,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    #[serde(rename = "AccountReference")]
    account_reference: String,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushApiResponse {
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
struct StkQueryApiResponse {
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "ResultCode")]
    result_code: Option<String>,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
}
