pub mod donation;

pub use donation::{Donation, DonationEvent, DonationStatus, Transition, AMOUNT_MISMATCH_CODE};
