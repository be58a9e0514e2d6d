//! Provider Binding Table
//!
//! Maps every live provider to the collection holding its entries. Rebinding
//! computes a diff against the current table: new providers get a fresh
//! collection, removed providers have their collection parked on a
//! pending-removal list until every entry in it has been driven out.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::collection::ResourceCollection;
use super::entry::{CollectionKind, ResourceType};
use crate::domain::ports::DataProvider;
use crate::error::{Error, Result};

/// Caller-assigned provider identity, stable across rebinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(u64);

impl ProviderId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider-{}", self.0)
    }
}

/// A provider as presented in the desired provider set.
#[derive(Clone)]
pub struct ProviderRegistration {
    pub id: ProviderId,
    pub provider: Arc<dyn DataProvider>,
}

impl ProviderRegistration {
    pub fn new(id: ProviderId, provider: Arc<dyn DataProvider>) -> Self {
        Self { id, provider }
    }
}

impl fmt::Debug for ProviderRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("id", &self.id)
            .field("resource_type", &self.provider.resource_type())
            .finish()
    }
}

/// A live provider and its collection.
pub struct ProviderBinding {
    id: ProviderId,
    provider: Arc<dyn DataProvider>,
    collection: Arc<ResourceCollection>,
}

impl ProviderBinding {
    #[inline]
    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn provider(&self) -> &Arc<dyn DataProvider> {
        &self.provider
    }

    pub fn collection(&self) -> &Arc<ResourceCollection> {
        &self.collection
    }
}

/// What a rebind changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingsDiff {
    pub added: Vec<ProviderId>,
    pub removed: Vec<ProviderId>,
}

impl BindingsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Provider ↔ collection table.
#[derive(Default)]
pub struct ProviderBindingTable {
    bindings: DashMap<ProviderId, Arc<ProviderBinding>>,
    pending_removal: Mutex<Vec<Arc<ResourceCollection>>>,
}

impl ProviderBindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the bound provider set with `desired`.
    ///
    /// A provider id already bound keeps its collection. Re-registering an id
    /// with a different resource type is rejected and leaves the table as is.
    #[instrument(skip(self, desired), fields(desired = desired.len()))]
    pub fn update_bindings(&self, desired: Vec<ProviderRegistration>) -> Result<BindingsDiff> {
        for registration in &desired {
            if let Some(existing) = self.bindings.get(&registration.id) {
                let expected = existing.collection.resource_type();
                let actual = registration.provider.resource_type();
                if expected != actual {
                    return Err(Error::ProviderKindMismatch {
                        provider: registration.id.to_string(),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
        }

        let mut diff = BindingsDiff::default();

        let stale: Vec<ProviderId> = self
            .bindings
            .iter()
            .map(|binding| *binding.key())
            .filter(|id| !desired.iter().any(|r| r.id == *id))
            .collect();
        for id in stale {
            if let Some((_, binding)) = self.bindings.remove(&id) {
                info!(provider = %id, resource_type = %binding.collection.resource_type(), entries = binding.collection.len(), "provider unbound");
                self.pending_removal.lock().push(binding.collection.clone());
                diff.removed.push(id);
            }
        }

        for registration in desired {
            if self.bindings.contains_key(&registration.id) {
                continue;
            }
            let resource_type = registration.provider.resource_type();
            let kind = registration.provider.collection_kind();
            let collection = ResourceCollection::new(registration.id, resource_type, kind);
            info!(provider = %registration.id, %resource_type, %kind, "provider bound");
            diff.added.push(registration.id);
            self.bindings.insert(
                registration.id,
                Arc::new(ProviderBinding {
                    id: registration.id,
                    provider: registration.provider,
                    collection,
                }),
            );
        }

        diff.added.sort();
        diff.removed.sort();
        Ok(diff)
    }

    /// Live bindings, ordered by provider id
    pub fn bindings(&self) -> Vec<Arc<ProviderBinding>> {
        let mut bindings: Vec<_> = self.bindings.iter().map(|b| b.value().clone()).collect();
        bindings.sort_by_key(|b| b.id);
        bindings
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<ProviderBinding>> {
        self.bindings.get(&id).map(|b| b.value().clone())
    }

    /// Live bindings of one resource type
    pub fn bindings_of_type(&self, resource_type: ResourceType) -> Vec<Arc<ProviderBinding>> {
        self.bindings()
            .into_iter()
            .filter(|b| b.collection.resource_type() == resource_type)
            .collect()
    }

    /// Provider currently bound to `collection`, if the binding is still live
    pub fn provider_for(&self, collection: &ResourceCollection) -> Option<Arc<dyn DataProvider>> {
        let binding = self.bindings.get(&collection.provider_id())?;
        if std::ptr::eq(Arc::as_ptr(&binding.collection), collection) {
            Some(binding.provider.clone())
        } else {
            None
        }
    }

    /// Whether `collection` belongs to a live binding
    pub fn is_bound(&self, collection: &ResourceCollection) -> bool {
        self.provider_for(collection).is_some()
    }

    /// Collections of unbound providers still being drained
    pub fn pending_removal(&self) -> Vec<Arc<ResourceCollection>> {
        self.pending_removal.lock().clone()
    }

    /// Live and pending collections
    pub fn all_collections(&self) -> Vec<Arc<ResourceCollection>> {
        let mut collections: Vec<_> = self.bindings().iter().map(|b| b.collection.clone()).collect();
        collections.extend(self.pending_removal());
        collections
    }

    /// Drop pending collections that have no entries left. Returns how many were dropped.
    pub fn drop_drained(&self) -> usize {
        let mut pending = self.pending_removal.lock();
        let before = pending.len();
        pending.retain(|collection| !collection.is_empty());
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(dropped, remaining = pending.len(), "drained collections dropped");
        }
        dropped
    }

    /// Unbind every provider. Their collections move to the pending list.
    pub fn unbind_all(&self) -> Vec<ProviderId> {
        // Validation is trivially satisfied for an empty set
        self.update_bindings(Vec::new())
            .map(|diff| diff.removed)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Count of collections by kind, live bindings only
    pub fn kind_counts(&self) -> (usize, usize) {
        self.bindings
            .iter()
            .fold((0, 0), |(tiled, keyed), b| match b.collection.kind() {
                CollectionKind::Tiled => (tiled + 1, keyed),
                CollectionKind::Keyed => (tiled, keyed + 1),
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
