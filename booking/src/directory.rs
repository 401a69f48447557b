//! External collaborators: who a user is and what a service costs.
//!
//! Identity and the service catalog live outside this crate. The engine only
//! sees them through [`IdentityProvider`] and [`ServiceCatalog`]; the static
//! implementations here back the demo binary and the tests.

use crate::types::{Money, ServiceId, UserId};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Marketplace role of a user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Books services
    Customer,
    /// Offers services and owns a calendar
    Vendor,
}

/// A resolved user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// User identifier
    pub id: UserId,
    /// Marketplace role
    pub role: Role,
    /// Name shown in notifications
    pub display_name: String,
}

impl Party {
    /// Creates a new `Party`
    #[must_use]
    pub fn new(id: UserId, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id,
            role,
            display_name: display_name.into(),
        }
    }
}

/// A bookable offering from the catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceListing {
    /// Service identifier
    pub id: ServiceId,
    /// Vendor offering the service
    pub vendor_id: UserId,
    /// Human-readable name
    pub name: String,
    /// Price used when a booking request names no amount
    pub base_price: Money,
}

/// A collaborator could not answer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// The service is down or timed out; the call may succeed later.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        /// Collaborator name
        service: &'static str,
        /// What went wrong
        reason: String,
    },
}

/// Resolves users to parties.
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` means the user does not exist (or was deleted).
    fn resolve(&self, user: &UserId) -> BoxFuture<'_, Result<Option<Party>, DependencyError>>;
}

/// Looks up bookable services.
pub trait ServiceCatalog: Send + Sync {
    /// `Ok(None)` means no such service.
    fn lookup(
        &self,
        service: &ServiceId,
    ) -> BoxFuture<'_, Result<Option<ServiceListing>, DependencyError>>;
}

/// In-process identity directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    parties: RwLock<HashMap<UserId, Party>>,
}

impl StaticDirectory {
    /// Empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a party
    pub fn insert(&self, party: Party) {
        self.parties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(party.id, party);
    }

    /// Forget a user, as an account deletion would
    pub fn remove(&self, user: &UserId) -> Option<Party> {
        self.parties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user)
    }
}

impl IdentityProvider for StaticDirectory {
    fn resolve(&self, user: &UserId) -> BoxFuture<'_, Result<Option<Party>, DependencyError>> {
        let found = self
            .parties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned();
        Box::pin(async move { Ok(found) })
    }
}

/// In-process service catalog.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    listings: RwLock<HashMap<ServiceId, ServiceListing>>,
}

impl StaticCatalog {
    /// Empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a listing
    pub fn insert(&self, listing: ServiceListing) {
        self.listings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(listing.id, listing);
    }
}

impl ServiceCatalog for StaticCatalog {
    fn lookup(
        &self,
        service: &ServiceId,
    ) -> BoxFuture<'_, Result<Option<ServiceListing>, DependencyError>> {
        let found = self
            .listings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned();
        Box::pin(async move { Ok(found) })
    }
}
