//! Reference data seam.
//!
//! Items and locations are master data owned elsewhere; the ledger only asks
//! whether an identifier is known before it touches any state.

use std::collections::HashSet;
use std::sync::RwLock;

use lonerp_core::{ItemId, LedgerError, LedgerResult, LocationId};

pub trait ReferenceCatalog: Send + Sync {
    fn item_exists(&self, item_id: ItemId) -> bool;

    fn location_exists(&self, location_id: LocationId) -> bool;

    fn require_item(&self, item_id: ItemId) -> LedgerResult<()> {
        if self.item_exists(item_id) {
            Ok(())
        } else {
            Err(LedgerError::not_found("item", item_id))
        }
    }

    fn require_location(&self, location_id: LocationId) -> LedgerResult<()> {
        if self.location_exists(location_id) {
            Ok(())
        } else {
            Err(LedgerError::not_found("location", location_id))
        }
    }
}

/// Accepts every identifier (master data validated upstream).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCatalog;

impl ReferenceCatalog for OpenCatalog {
    fn item_exists(&self, _item_id: ItemId) -> bool {
        true
    }

    fn location_exists(&self, _location_id: LocationId) -> bool {
        true
    }
}

/// Catalog of explicitly registered identifiers.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    items: RwLock<HashSet<ItemId>>,
    locations: RwLock<HashSet<LocationId>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_item(&self, item_id: ItemId) {
        if let Ok(mut items) = self.items.write() {
            items.insert(item_id);
        }
    }

    pub fn register_location(&self, location_id: LocationId) {
        if let Ok(mut locations) = self.locations.write() {
            locations.insert(location_id);
        }
    }
}

impl ReferenceCatalog for InMemoryCatalog {
    fn item_exists(&self, item_id: ItemId) -> bool {
        self.items
            .read()
            .map(|items| items.contains(&item_id))
            .unwrap_or(false)
    }

    fn location_exists(&self, location_id: LocationId) -> bool {
        self.locations
            .read()
            .map(|locations| locations.contains(&location_id))
            .unwrap_or(false)
    }
}
