//! Stub Resources
//!
//! Placeholder imagery drawn while a tile loads or when it is unavailable.
//! The bitmaps come from the embedded [`ResourceBundle`], are decoded once and
//! live in an internal keyed collection that viewport changes never evict.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::bindings::ProviderId;
use super::collection::ResourceCollection;
use super::entry::{CollectionKind, ResourceEntry, ResourceId, ResourceType};
use crate::domain::data::ResourceData;
use crate::domain::ports::{DataProvider, DataRequest, ResourceBundle};
use crate::error::Result;

/// Provider id of the internal stub collection
pub const STUB_PROVIDER_ID: ProviderId = ProviderId::new(u64::MAX);

/// Kinds of placeholder imagery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubKind {
    /// Shown while a tile is being fetched
    Processing,
    /// Shown where a provider has no data
    Unavailable,
}

impl StubKind {
    pub const ALL: [StubKind; 2] = [StubKind::Processing, StubKind::Unavailable];

    /// Name of the bitmap in the resource bundle
    pub fn resource_name(self) -> &'static str {
        match self {
            StubKind::Processing => "processing_tile",
            StubKind::Unavailable => "unavailable_tile",
        }
    }
}

impl fmt::Display for StubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_name())
    }
}

/// Serves stub bitmaps out of a resource bundle.
pub struct StubProvider {
    bundle: Arc<dyn ResourceBundle>,
    density_factor: f32,
}

impl StubProvider {
    pub fn new(bundle: Arc<dyn ResourceBundle>, density_factor: f32) -> Self {
        Self {
            bundle,
            density_factor,
        }
    }
}

impl DataProvider for StubProvider {
    fn resource_type(&self) -> ResourceType {
        ResourceType::MapLayer
    }

    fn collection_kind(&self) -> CollectionKind {
        CollectionKind::Keyed
    }

    fn obtain_data(
        &self,
        request: &DataRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<ResourceData>> {
        let Some(name) = request.id.key() else {
            return Ok(None);
        };
        if is_cancelled() {
            return Ok(None);
        }
        let Some(encoded) = self.bundle.get_resource(name, self.density_factor) else {
            warn!(stub = name, density = self.density_factor, "stub missing from resource bundle");
            return Ok(None);
        };
        let Some(bitmap) = self.bundle.decode_bitmap(&encoded) else {
            warn!(stub = name, "stub bitmap could not be decoded");
            return Ok(None);
        };
        debug!(stub = name, width = bitmap.width, height = bitmap.height, "stub decoded");
        Ok(Some(ResourceData::Raster(bitmap.with_density(self.density_factor))))
    }

    fn provided_data_keys(&self) -> Vec<String> {
        StubKind::ALL
            .iter()
            .map(|kind| kind.resource_name().to_string())
            .collect()
    }
}

/// The internal stub collection and its provider.
pub struct StubResources {
    collection: Arc<ResourceCollection>,
    provider: Arc<dyn DataProvider>,
}

impl StubResources {
    pub fn new(bundle: Arc<dyn ResourceBundle>, density_factor: f32) -> Self {
        let provider = StubProvider::new(bundle, density_factor);
        let collection = ResourceCollection::new(
            STUB_PROVIDER_ID,
            provider.resource_type(),
            provider.collection_kind(),
        );
        Self {
            collection,
            provider: Arc::new(provider),
        }
    }

    pub fn collection(&self) -> &Arc<ResourceCollection> {
        &self.collection
    }

    pub fn provider(&self) -> &Arc<dyn DataProvider> {
        &self.provider
    }

    /// The stub entry, once it has been uploaded and while it is not junk
    pub fn get(&self, kind: StubKind) -> Option<Arc<ResourceEntry>> {
        self.collection
            .get(&ResourceId::Key(kind.resource_name().to_string()))
            .filter(|entry| !entry.is_junk() && entry.state().is_usable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::EmbeddedBundle;
    use crate::resources::state::ResourceState;

    fn request(name: &str) -> DataRequest {
        DataRequest {
            resource_type: ResourceType::MapLayer,
            id: ResourceId::Key(name.into()),
        }
    }

    #[test]
    fn test_stub_provider_decodes_bundle_bitmaps() {
        let provider = StubProvider::new(Arc::new(EmbeddedBundle::with_default_stubs()), 2.0);
        let data = provider
            .obtain_data(&request("processing_tile"), &|| false)
            .unwrap();
        match data {
            Some(ResourceData::Raster(tile)) => assert_eq!(tile.density_factor, 2.0),
            other => panic!("unexpected stub payload {:?}", other.map(|d| d.kind_name())),
        }
        assert_eq!(provider.provided_data_keys().len(), 2);
        assert_eq!(provider.collection_kind(), CollectionKind::Keyed);
    }

    #[test]
    fn test_missing_stub_is_no_data() {
        let provider = StubProvider::new(Arc::new(EmbeddedBundle::new()), 1.0);
        assert!(provider
            .obtain_data(&request("unavailable_tile"), &|| false)
            .unwrap()
            .is_none());
        assert!(provider
            .obtain_data(&request("processing_tile"), &|| true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stub_only_returned_when_usable() {
        let stubs = StubResources::new(Arc::new(EmbeddedBundle::with_default_stubs()), 1.0);
        let (entry, _) = stubs
            .collection()
            .obtain_or_allocate(ResourceId::Key("unavailable_tile".into()));
        assert!(stubs.get(StubKind::Unavailable).is_none());

        use ResourceState::*;
        for (from, to) in [
            (Unknown, Requesting),
            (Requesting, Requested),
            (Requested, ProcessingRequest),
            (ProcessingRequest, Ready),
            (Ready, Uploading),
            (Uploading, Uploaded),
        ] {
            entry.transition(from, to).unwrap();
        }
        assert!(stubs.get(StubKind::Unavailable).is_some());
        assert!(stubs.get(StubKind::Processing).is_none());
        assert_eq!(stubs.collection().provider_id(), STUB_PROVIDER_ID);

        entry.mark_junk();
        assert!(stubs.get(StubKind::Unavailable).is_none());
    }
}
