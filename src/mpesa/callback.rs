//! Daraja STK callback payloads: wire shapes, normalization and the fixed
//! acknowledgment the provider expects back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallbackParseError {
    #[error("invalid callback envelope: {0}")]
    InvalidEnvelope(String),

    #[error("callback is missing required field {0}")]
    MissingField(&'static str),
}

/// Outer envelope Safaricom posts to the callback and timeout URLs:
/// `{"Body": {"stkCallback": {...}}}`.
#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub item: Vec<MetadataItem>,
}

/// Metadata entries are name/value pairs with heterogeneous values
/// (amounts and phone numbers arrive as JSON numbers, receipts as strings).
#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<Value>,
}

/// Normalized callback, validated for structural shape: success payloads
/// must carry an amount and a receipt number.
#[derive(Debug, Clone)]
pub struct ParsedCallback {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub result_code: i64,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub amount: Option<i64>,
    pub phone_number: Option<String>,
    pub transaction_date: Option<String>,
}

impl ParsedCallback {
    /// Parses a raw request body. Any shape violation is an error the
    /// ingestion endpoint logs and acknowledges — redelivery cannot fix a
    /// malformed payload.
    pub fn from_json(raw: &str) -> Result<Self, CallbackParseError> {
        let envelope: CallbackEnvelope = serde_json::from_str(raw)
            .map_err(|e| CallbackParseError::InvalidEnvelope(e.to_string()))?;
        Self::from_callback(envelope.body.stk_callback)
    }

    pub fn from_callback(callback: StkCallback) -> Result<Self, CallbackParseError> {
        if callback.checkout_request_id.is_empty() {
            return Err(CallbackParseError::MissingField("CheckoutRequestID"));
        }

        let mut parsed = ParsedCallback {
            checkout_request_id: callback.checkout_request_id,
            merchant_request_id: callback.merchant_request_id,
            result_code: callback.result_code,
            result_desc: callback.result_desc,
            receipt_number: None,
            amount: None,
            phone_number: None,
            transaction_date: None,
        };

        if let Some(metadata) = callback.callback_metadata {
            for item in metadata.item {
                let Some(value) = item.value else { continue };
                match item.name.as_str() {
                    "Amount" => parsed.amount = as_minor_amount(&value),
                    "MpesaReceiptNumber" => parsed.receipt_number = as_string(&value),
                    "PhoneNumber" => parsed.phone_number = as_string(&value),
                    "TransactionDate" => parsed.transaction_date = as_string(&value),
                    _ => {}
                }
            }
        }

        if parsed.result_code == super::codes::SUCCESS_CODE {
            if parsed.amount.is_none() {
                return Err(CallbackParseError::MissingField("CallbackMetadata.Amount"));
            }
            if parsed.receipt_number.is_none() {
                return Err(CallbackParseError::MissingField(
                    "CallbackMetadata.MpesaReceiptNumber",
                ));
            }
        }

        Ok(parsed)
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_minor_amount(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

/// Fixed-shape acknowledgment object. Safaricom stops redelivering once it
/// sees result code 0; code 1 asks it to retry later.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }

    pub fn retry() -> Self {
        Self {
            result_code: 1,
            result_desc: "Service temporarily unavailable, retry later".to_string(),
        }
    }
}
