use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub mpesa: MpesaConfig,
}

/// Provider configuration surface: endpoints, credentials, callback URLs,
/// the mock-mode switch and the staleness threshold for active
/// reconciliation.
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    pub timeout_url: String,
    pub mock_mode: bool,
    pub stale_after_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            mpesa: MpesaConfig::from_env()?,
        })
    }
}

impl MpesaConfig {
    pub fn from_env() -> Result<Self> {
        let mock_mode = env::var("MPESA_MOCK_MODE")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let base_url = match env::var("MPESA_BASE_URL") {
            Ok(explicit) => explicit,
            Err(_) => match env::var("MPESA_ENV").as_deref() {
                Err(_) | Ok("sandbox") => SANDBOX_BASE_URL.to_string(),
                Ok("production") => PRODUCTION_BASE_URL.to_string(),
                Ok(other) => {
                    anyhow::bail!("MPESA_ENV must be 'sandbox' or 'production', got '{other}'")
                }
            },
        };
        url::Url::parse(&base_url).context("M-Pesa base URL is not a valid URL")?;

        // Credentials are only required when the live gateway is in play.
        let required = |key: &str| -> Result<String> {
            match env::var(key) {
                Ok(value) if !value.is_empty() => Ok(value),
                _ if mock_mode => Ok(String::new()),
                _ => anyhow::bail!("missing M-Pesa configuration: {key}"),
            }
        };

        Ok(MpesaConfig {
            base_url,
            consumer_key: required("MPESA_CONSUMER_KEY")?,
            consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            shortcode: required("MPESA_SHORTCODE")?,
            passkey: required("MPESA_PASSKEY")?,
            callback_url: required("MPESA_STK_CALLBACK_URL")?,
            timeout_url: required("MPESA_STK_TIMEOUT_URL")?,
            mock_mode,
            stale_after_secs: env::var("MPESA_STALE_AFTER_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("MPESA_STALE_AFTER_SECS must be a number of seconds")?,
        })
    }
}
