//! Postgres implementation of the donation repository.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{Donation, DonationStatus};
use crate::ports::{DonationRepository, RepositoryError, RepositoryResult, UpdateOutcome};

const DONATION_COLUMNS: &str = "id, amount, donor_ref, charity_ref, phone_number, status, \
     checkout_request_id, merchant_request_id, receipt_number, result_code, result_desc, \
     version, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresDonationRepository {
    pool: PgPool,
}

impl PostgresDonationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DonationRepository for PostgresDonationRepository {
    async fn insert(&self, donation: &Donation) -> RepositoryResult<Donation> {
        let row = sqlx::query_as::<_, DonationRow>(&format!(
            r#"
            INSERT INTO donations (
                id, amount, donor_ref, charity_ref, phone_number, status,
                checkout_request_id, merchant_request_id, receipt_number,
                result_code, result_desc, version, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {DONATION_COLUMNS}
            "#
        ))
        .bind(donation.id)
        .bind(donation.amount)
        .bind(&donation.donor_ref)
        .bind(&donation.charity_ref)
        .bind(&donation.phone_number)
        .bind(donation.status.as_str())
        .bind(&donation.checkout_request_id)
        .bind(&donation.merchant_request_id)
        .bind(&donation.receipt_number)
        .bind(donation.result_code)
        .bind(&donation.result_desc)
        .bind(donation.version)
        .bind(donation.created_at)
        .bind(donation.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, donation))?;

        row.into_domain()
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Option<Donation>> {
        let row = sqlx::query_as::<_, DonationRow>(&format!(
            "SELECT {DONATION_COLUMNS} FROM donations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(DonationRow::into_domain).transpose()
    }

    async fn find_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> RepositoryResult<Option<Donation>> {
        let row = sqlx::query_as::<_, DonationRow>(&format!(
            "SELECT {DONATION_COLUMNS} FROM donations WHERE checkout_request_id = $1"
        ))
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(DonationRow::into_domain).transpose()
    }

    async fn update(
        &self,
        donation: &Donation,
        expected_version: i32,
    ) -> RepositoryResult<UpdateOutcome> {
        // Compare-and-swap on the version column: the row is written only if
        // no other transition committed since this one was computed.
        let row = sqlx::query_as::<_, DonationRow>(&format!(
            r#"
            UPDATE donations SET
                status = $3,
                checkout_request_id = $4,
                merchant_request_id = $5,
                receipt_number = $6,
                result_code = $7,
                result_desc = $8,
                version = $9,
                updated_at = $10
            WHERE id = $1 AND version = $2
            RETURNING {DONATION_COLUMNS}
            "#
        ))
        .bind(donation.id)
        .bind(expected_version)
        .bind(donation.status.as_str())
        .bind(&donation.checkout_request_id)
        .bind(&donation.merchant_request_id)
        .bind(&donation.receipt_number)
        .bind(donation.result_code)
        .bind(&donation.result_desc)
        .bind(donation.version)
        .bind(donation.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, donation))?;

        match row {
            Some(row) => Ok(UpdateOutcome::Updated(row.into_domain()?)),
            None => Ok(UpdateOutcome::VersionConflict),
        }
    }
}

fn storage_error(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(err.to_string())
}

fn map_sqlx_error(err: sqlx::Error, donation: &Donation) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            if let Some(checkout) = &donation.checkout_request_id {
                return RepositoryError::DuplicateCheckoutId(checkout.clone());
            }
        }
    }
    storage_error(err)
}

/// Internal row type for sqlx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct DonationRow {
    id: Uuid,
    amount: i64,
    donor_ref: String,
    charity_ref: String,
    phone_number: String,
    status: String,
    checkout_request_id: Option<String>,
    merchant_request_id: Option<String>,
    receipt_number: Option<String>,
    result_code: Option<i64>,
    result_desc: Option<String>,
    version: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl DonationRow {
    fn into_domain(self) -> RepositoryResult<Donation> {
        let status: DonationStatus = self
            .status
            .parse()
            .map_err(RepositoryError::Storage)?;

        Ok(Donation {
            id: self.id,
            amount: self.amount,
            donor_ref: self.donor_ref,
            charity_ref: self.charity_ref,
            phone_number: self.phone_number,
            status,
            checkout_request_id: self.checkout_request_id,
            merchant_request_id: self.merchant_request_id,
            receipt_number: self.receipt_number,
            result_code: self.result_code,
            result_desc: self.result_desc,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
