//! Donation domain entity and its lifecycle state machine.
//! Framework-agnostic: transitions are pure functions over the record,
//! so every path is testable without a persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Local result code recorded when a success callback reports an amount
/// that differs from the amount the donation was created with. Provider
/// result codes are non-negative, so this value can never collide.
pub const AMOUNT_MISMATCH_CODE: i64 = -1;

/// Lifecycle state of a donation.
///
/// `Paid`, `Failed` and `TimedOut` are terminal: once reached, no further
/// event mutates the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonationStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PAID")]
    Paid,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "TIMEOUT")]
    TimedOut,
}

impl DonationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMEOUT",
        }
    }

    /// Human-readable label surfaced by the status poll endpoint.
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "Donation created, awaiting provider acknowledgment",
            Self::Pending => "Awaiting payment confirmation",
            Self::Paid => "Payment received",
            Self::Failed => "Payment failed",
            Self::TimedOut => "Payment timed out",
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DonationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "FAILED" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::TimedOut),
            other => Err(format!("unknown donation status: {other}")),
        }
    }
}

/// Donation record.
///
/// Amounts are integer minor currency units, never floating point.
/// `version` increments on every applied transition and is the
/// compare-and-swap token repositories use to serialize racing updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    pub id: Uuid,
    pub amount: i64,
    pub donor_ref: String,
    pub charity_ref: String,
    pub phone_number: String,
    pub status: DonationStatus,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub receipt_number: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Events fed to [`Donation::apply`]. Each carries only the data the
/// transition needs; the correlation lookup happens before an event is
/// constructed.
#[derive(Debug, Clone)]
pub enum DonationEvent {
    /// The provider acknowledged the push request and issued correlation ids.
    ProviderAccepted {
        checkout_request_id: String,
        merchant_request_id: String,
    },
    /// The outbound push request failed before the provider accepted it.
    InitiationFailed { reason: String },
    /// Success callback from the provider, carrying the paid amount and receipt.
    PaymentSucceeded {
        receipt_number: String,
        amount_paid: i64,
        result_desc: String,
    },
    /// Failure or cancellation callback from the provider.
    PaymentFailed { result_code: i64, result_desc: String },
    /// An active status query found the transaction already successful.
    /// The query response carries no receipt or amount metadata.
    ReconciledSucceeded { result_desc: String },
    /// Timeout notification from the provider's own timeout path.
    ProviderTimedOut,
}

/// Outcome of applying an event to a donation.
#[derive(Debug, Clone)]
pub enum Transition {
    /// The event was accepted; the new record carries a bumped version.
    Applied(Donation),
    /// The event arrived for a terminal record or does not match the
    /// current state. Duplicate and out-of-order deliveries land here and
    /// must be acknowledged to the caller without mutating anything.
    Stale,
}

impl Donation {
    /// Creates a new donation in `CREATED` at version 0. The local id is
    /// assigned here, before any outbound provider call, so a crash between
    /// creation and the push request still leaves an inspectable record.
    pub fn create(donor_ref: String, charity_ref: String, amount: i64, phone_number: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            amount,
            donor_ref,
            charity_ref,
            phone_number,
            status: DonationStatus::Created,
            checkout_request_id: None,
            merchant_request_id: None,
            receipt_number: None,
            result_code: None,
            result_desc: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies an event, returning the next record or [`Transition::Stale`].
    ///
    /// Terminal states are a sink: every event applied to them is stale.
    /// Amount, donor and charity references are never touched.
    pub fn apply(&self, event: &DonationEvent) -> Transition {
        if self.status.is_terminal() {
            return Transition::Stale;
        }

        match (self.status, event) {
            (
                DonationStatus::Created,
                DonationEvent::ProviderAccepted {
                    checkout_request_id,
                    merchant_request_id,
                },
            ) => self.advance(|d| {
                d.status = DonationStatus::Pending;
                d.checkout_request_id = Some(checkout_request_id.clone());
                d.merchant_request_id = Some(merchant_request_id.clone());
            }),
            (DonationStatus::Created, DonationEvent::InitiationFailed { reason }) => {
                self.advance(|d| {
                    d.status = DonationStatus::Failed;
                    d.result_desc = Some(reason.clone());
                })
            }
            (
                DonationStatus::Pending,
                DonationEvent::PaymentSucceeded {
                    receipt_number,
                    amount_paid,
                    result_desc,
                },
            ) => {
                if *amount_paid == self.amount {
                    self.advance(|d| {
                        d.status = DonationStatus::Paid;
                        d.receipt_number = Some(receipt_number.clone());
                        d.result_code = Some(0);
                        d.result_desc = Some(result_desc.clone());
                    })
                } else {
                    let expected = self.amount;
                    let paid = *amount_paid;
                    self.advance(|d| {
                        d.status = DonationStatus::Failed;
                        d.result_code = Some(AMOUNT_MISMATCH_CODE);
                        d.result_desc = Some(format!(
                            "reported paid amount {paid} does not match expected amount {expected}"
                        ));
                    })
                }
            }
            (
                DonationStatus::Pending,
                DonationEvent::PaymentFailed {
                    result_code,
                    result_desc,
                },
            ) => self.advance(|d| {
                d.status = DonationStatus::Failed;
                d.result_code = Some(*result_code);
                d.result_desc = Some(result_desc.clone());
            }),
            (DonationStatus::Pending, DonationEvent::ReconciledSucceeded { result_desc }) => {
                self.advance(|d| {
                    d.status = DonationStatus::Paid;
                    d.result_code = Some(0);
                    d.result_desc = Some(result_desc.clone());
                })
            }
            (DonationStatus::Pending, DonationEvent::ProviderTimedOut) => self.advance(|d| {
                d.status = DonationStatus::TimedOut;
                d.result_desc = Some("provider timeout notification".to_string());
            }),
            // Everything else (duplicate acceptance, a callback for a record
            // that never reached PENDING, ...) does not match the table.
            _ => Transition::Stale,
        }
    }

    fn advance(&self, mutate: impl FnOnce(&mut Donation)) -> Transition {
        let mut next = self.clone();
        mutate(&mut next);
        next.version = self.version + 1;
        next.updated_at = Utc::now();
        Transition::Applied(next)
    }
}
