//! In-memory implementation of the donation repository.
//!
//! Backs tests and local experimentation. The checkout-id index doubles as
//! the correlation registry, mirroring the unique index the Postgres
//! adapter relies on. Critical sections only cover map access, so racing
//! transitions for unrelated donations never block each other on I/O.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::Donation;
use crate::ports::{DonationRepository, RepositoryError, RepositoryResult, UpdateOutcome};

#[derive(Default)]
struct Store {
    donations: HashMap<Uuid, Donation>,
    by_checkout: HashMap<String, Uuid>,
}

#[derive(Default, Clone)]
pub struct InMemoryDonationRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemoryDonationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DonationRepository for InMemoryDonationRepository {
    async fn insert(&self, donation: &Donation) -> RepositoryResult<Donation> {
        let mut store = self.store.write().await;
        if store.donations.contains_key(&donation.id) {
            return Err(RepositoryError::Storage(format!(
                "donation {} already exists",
                donation.id
            )));
        }
        if let Some(checkout) = &donation.checkout_request_id {
            if store.by_checkout.contains_key(checkout) {
                return Err(RepositoryError::DuplicateCheckoutId(checkout.clone()));
            }
            store.by_checkout.insert(checkout.clone(), donation.id);
        }
        store.donations.insert(donation.id, donation.clone());
        Ok(donation.clone())
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Option<Donation>> {
        let store = self.store.read().await;
        Ok(store.donations.get(&id).cloned())
    }

    async fn find_by_checkout(
        &self,
        checkout_request_id: &str,
    ) -> RepositoryResult<Option<Donation>> {
        let store = self.store.read().await;
        let id = store.by_checkout.get(checkout_request_id);
        Ok(id.and_then(|id| store.donations.get(id)).cloned())
    }

    async fn update(
        &self,
        donation: &Donation,
        expected_version: i32,
    ) -> RepositoryResult<UpdateOutcome> {
        let mut store = self.store.write().await;

        let Some(stored) = store.donations.get(&donation.id) else {
            return Err(RepositoryError::Storage(format!(
                "donation {} does not exist",
                donation.id
            )));
        };
        if stored.version != expected_version {
            return Ok(UpdateOutcome::VersionConflict);
        }

        if let Some(checkout) = &donation.checkout_request_id {
            match store.by_checkout.get(checkout) {
                Some(owner) if *owner != donation.id => {
                    return Err(RepositoryError::DuplicateCheckoutId(checkout.clone()));
                }
                Some(_) => {}
                None => {
                    store.by_checkout.insert(checkout.clone(), donation.id);
                }
            }
        }

        store.donations.insert(donation.id, donation.clone());
        Ok(UpdateOutcome::Updated(donation.clone()))
    }
}
