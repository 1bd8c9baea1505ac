//! TerritoryWindow - a client-side view of the territories near the user.
//!
//! Seeded from a store query and kept current by applying the
//! `TerritoryChange` feed the runtime broadcasts after each commit. Upserts
//! outside the window's focus are ignored, and an upsert older than the
//! record already held never overwrites it.

use crate::polygon::BoundingBox;
use crate::territory::Territory;
use crate::territory_store::CommitReceipt;
use conquest_env::TerritoryId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One realtime change to the territory set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TerritoryChange {
    Upserted(Territory),
    Removed(TerritoryId),
}

impl TerritoryChange {
    /// Changes produced by a commit: removals first, then the new territory.
    pub fn from_receipt(receipt: &CommitReceipt) -> Vec<TerritoryChange> {
        receipt
            .removed
            .iter()
            .cloned()
            .map(TerritoryChange::Removed)
            .chain(std::iter::once(TerritoryChange::Upserted(receipt.territory.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TerritoryWindow {
    /// None means unbounded
    focus: Option<BoundingBox>,
    territories: BTreeMap<TerritoryId, Territory>,
}

impl TerritoryWindow {
    pub fn new(focus: Option<BoundingBox>) -> Self {
        Self {
            focus,
            territories: BTreeMap::new(),
        }
    }

    pub fn focus(&self) -> Option<&BoundingBox> {
        self.focus.as_ref()
    }

    /// Replaces the window contents, e.g. after the user moved far enough
    /// to need a fresh store query.
    pub fn replace_all(&mut self, focus: Option<BoundingBox>, territories: Vec<Territory>) {
        self.focus = focus;
        self.territories = territories
            .into_iter()
            .filter(|t| self.in_focus(t))
            .map(|t| (t.id.clone(), t))
            .collect();
    }

    /// Applies one change. Returns whether the window changed.
    pub fn apply(&mut self, change: TerritoryChange) -> bool {
        match change {
            TerritoryChange::Removed(id) => self.territories.remove(&id).is_some(),
            TerritoryChange::Upserted(territory) => {
                if !self.in_focus(&territory) {
                    // moved out of focus
                    return self.territories.remove(&territory.id).is_some();
                }
                if let Some(held) = self.territories.get(&territory.id) {
                    if held.updated_at_ms > territory.updated_at_ms {
                        return false;
                    }
                }
                self.territories.insert(territory.id.clone(), territory);
                true
            }
        }
    }

    /// Territories whose bounds intersect `bounds`, ascending by id.
    pub fn territories_in(&self, bounds: &BoundingBox) -> Vec<Territory> {
        self.territories
            .values()
            .filter(|t| t.polygon.bounds().intersects(bounds))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &TerritoryId) -> Option<&Territory> {
        self.territories.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Territory> {
        self.territories.values()
    }

    pub fn len(&self) -> usize {
        self.territories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.territories.is_empty()
    }

    fn in_focus(&self, territory: &Territory) -> bool {
        self.focus
            .map_or(true, |focus| territory.polygon.bounds().intersects(&focus))
    }
}
