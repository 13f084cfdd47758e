//! Closed mapping of Daraja STK result codes to internal outcomes.
//! Codes outside the known set fall into the unrecognized bucket with the
//! raw value preserved for diagnostics.

/// Result code the provider uses for a successful transaction.
pub const SUCCESS_CODE: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Success,
    InsufficientBalance,
    TransactionExpired,
    SystemInternalError,
    CancelledByUser,
    SubscriberUnreachable,
    InvalidPin,
    UnrecognizedFailure(i64),
}

impl ResultOutcome {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::InsufficientBalance,
            1019 => Self::TransactionExpired,
            1025 => Self::SystemInternalError,
            1032 => Self::CancelledByUser,
            1037 => Self::SubscriberUnreachable,
            2001 => Self::InvalidPin,
            other => Self::UnrecognizedFailure(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Fallback description used when the provider omits `ResultDesc`.
    pub fn default_description(self) -> String {
        match self {
            Self::Success => "The service request is processed successfully.".to_string(),
            Self::InsufficientBalance => "The balance is insufficient for the transaction.".to_string(),
            Self::TransactionExpired => "Transaction expired before completion.".to_string(),
            Self::SystemInternalError => "The provider reported an internal error.".to_string(),
            Self::CancelledByUser => "Request cancelled by user.".to_string(),
            Self::SubscriberUnreachable => "The subscriber could not be reached.".to_string(),
            Self::InvalidPin => "The initiator information is invalid.".to_string(),
            Self::UnrecognizedFailure(code) => {
                format!("Payment failed with unrecognized result code {code}.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_map_to_named_outcomes() {
        assert_eq!(ResultOutcome::from_code(0), ResultOutcome::Success);
        assert_eq!(ResultOutcome::from_code(1), ResultOutcome::InsufficientBalance);
        assert_eq!(ResultOutcome::from_code(1032), ResultOutcome::CancelledByUser);
        assert_eq!(ResultOutcome::from_code(1037), ResultOutcome::SubscriberUnreachable);
    }

    #[test]
    fn test_unknown_code_preserves_raw_value() {
        let outcome = ResultOutcome::from_code(9999);
        assert_eq!(outcome, ResultOutcome::UnrecognizedFailure(9999));
        assert!(outcome.default_description().contains("9999"));
    }

    #[test]
    fn test_only_zero_is_success() {
        assert!(ResultOutcome::from_code(0).is_success());
        assert!(!ResultOutcome::from_code(1).is_success());
        assert!(!ResultOutcome::from_code(9999).is_success());
    }
}
