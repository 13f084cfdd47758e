//! Synthesized identifiers for the mock completion path.
//!
//! The values are derived from the initiation timestamp plus a process-wide
//! sequence number, and carry a `MOCK` tag so they can never be mistaken
//! for identifiers issued by the live provider.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

static MOCK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct MockIds {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub receipt_number: String,
}

pub fn synthesize_ids(now: DateTime<Utc>) -> MockIds {
    let seq = MOCK_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let stamp = now.format("%Y%m%d%H%M%S");
    MockIds {
        checkout_request_id: format!("ws_CO_MOCK_{stamp}_{seq:04}"),
        merchant_request_id: format!("MR_MOCK_{stamp}_{seq:04}"),
        receipt_number: format!("MOCK{stamp}{seq:04}"),
    }
}
