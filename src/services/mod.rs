pub mod engine;
pub mod mock;

pub use engine::{DonationEngine, EngineError, EngineSettings, InitiateOutcome, InitiateRequest};
