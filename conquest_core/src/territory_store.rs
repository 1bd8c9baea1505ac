//! Territory persistence.
//!
//! `TerritoryStore` is the contract the runtime commits claims through.
//! Commits are optimistic: a `CommitRequest` carries the `basis` the claim
//! was resolved against, and the store refuses it with
//! `StoreError::Conflict` if any territory touching the claim changed in the
//! meantime. The caller then re-resolves on fresh data and retries.
//!
//! `SledTerritoryStore` is the reference implementation on an embedded
//! sled database, with an H3 cell index for bounding-box lookups.

use crate::conquest_state::EvaluationTicket;
use crate::error::ConquestError;
use crate::geo_math;
use crate::polygon::BoundingBox;
use crate::territory::{CandidateTerritory, Territory};
use crate::territory_resolver::{OverlapResolution, TerritoryVersion};
use conquest_env::{Coordinate, TerritoryId, UserId};
use h3o::{CellIndex, LatLng, Resolution};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// A territory touching the claim changed since the resolution basis
    #[error("Commit conflict: {0}")]
    Conflict(String),

    #[error("Territory not found: {0}")]
    NotFound(TerritoryId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for ConquestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ConquestError::StoreConflict(msg),
            other => ConquestError::Store(other.to_string()),
        }
    }
}

/// A claim to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub territory: CandidateTerritory,
    pub displaced_territory_ids: BTreeSet<TerritoryId>,
    pub basis: Vec<TerritoryVersion>,
    pub now_ms: i64,
}

impl CommitRequest {
    /// Request for a claimed resolution of `ticket`; None when the
    /// resolution was rejected.
    pub fn for_resolution(ticket: &EvaluationTicket, resolution: &OverlapResolution, now_ms: i64) -> Option<Self> {
        if !resolution.is_claimed() {
            return None;
        }
        let polygon = resolution.final_polygon.clone()?;
        Some(Self {
            territory: CandidateTerritory::new(ticket.claimant.clone(), polygon),
            displaced_territory_ids: resolution.displaced_territory_ids.clone(),
            basis: resolution.basis.clone(),
            now_ms,
        })
    }
}

/// What a successful commit changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// The newly stored territory
    pub territory: Territory,

    /// Displaced territories that were deleted
    pub removed: Vec<TerritoryId>,
}

/// Trait for territory persistence.
///
/// Implementations must be thread-safe and serialize commits.
pub trait TerritoryStore: Send + Sync {
    /// Every territory whose bounds intersect `bounds`, ascending by id.
    fn territories_in(&self, bounds: &BoundingBox) -> Result<Vec<Territory>, StoreError>;

    fn get(&self, id: &TerritoryId) -> Result<Territory, StoreError>;

    /// Atomically removes the displaced territories and stores the claim.
    fn commit(&self, request: CommitRequest) -> Result<CommitReceipt, StoreError>;

    /// Territories held by one user, ascending by id.
    fn territories_of(&self, owner: &UserId) -> Result<Vec<Territory>, StoreError>;
}

/// Verifies that the store still looks the way `request` was resolved against.
fn check_basis<S: TerritoryStore + ?Sized>(store: &S, request: &CommitRequest) -> Result<(), StoreError> {
    let versions: HashMap<&TerritoryId, i64> = request
        .basis
        .iter()
        .map(|v| (&v.id, v.updated_at_ms))
        .collect();

    for id in &request.displaced_territory_ids {
        let current = match store.get(id) {
            Ok(t) => t,
            Err(StoreError::NotFound(_)) => {
                return Err(StoreError::Conflict(format!("displaced territory {} is gone", id)));
            }
            Err(e) => return Err(e),
        };
        if versions.get(id) != Some(&current.updated_at_ms) {
            return Err(StoreError::Conflict(format!("displaced territory {} changed", id)));
        }
    }

    for current in store.territories_in(&request.territory.polygon.bounds())? {
        match versions.get(&current.id) {
            Some(v) if *v == current.updated_at_ms => {}
            Some(_) => {
                return Err(StoreError::Conflict(format!("territory {} changed", current.id)));
            }
            None => {
                return Err(StoreError::Conflict(format!("territory {} appeared", current.id)));
            }
        }
    }
    Ok(())
}

// ============================================================================
// SLED STORE
// ============================================================================

/// H3 resolution for the cell index (~174 m edge)
pub const INDEX_RESOLUTION: Resolution = Resolution::Nine;

const TERRITORIES_TREE: &str = "territories";
const CELLS_TREE: &str = "cells";

/// Sled-based persistent territory store.
///
/// Layout: `territories` maps id → JSON record; `cells` holds one empty
/// entry per (cell, id) pair, keyed `cell (8 bytes BE) ++ id`.
pub struct SledTerritoryStore {
    db: sled::Db,
    territories: sled::Tree,
    cells: sled::Tree,

    /// Serializes the check-then-write sequence of `commit`
    commit_lock: Mutex<()>,
}

impl SledTerritoryStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Self::from_db(db)
    }

    /// Create a temporary store, deleted on drop
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let territories = db
            .open_tree(TERRITORIES_TREE)
            .map_err(|e| StoreError::Storage(format!("Failed to open tree: {}", e)))?;
        let cells = db
            .open_tree(CELLS_TREE)
            .map_err(|e| StoreError::Storage(format!("Failed to open tree: {}", e)))?;
        Ok(Self {
            db,
            territories,
            cells,
            commit_lock: Mutex::new(()),
        })
    }

    /// Number of stored territories.
    pub fn len(&self) -> usize {
        self.territories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.territories.is_empty()
    }

    /// Cells covering `bounds`: a disk around its centre wide enough to
    /// contain the box's circumscribed circle.
    fn covering_cells(bounds: &BoundingBox) -> Result<Vec<CellIndex>, StoreError> {
        let (lat, lon) = bounds.center();
        let centre = LatLng::new(lat, lon)
            .map_err(|e| StoreError::Storage(format!("invalid index centre: {:?}", e)))?
            .to_cell(INDEX_RESOLUTION);

        let point = |lat: f64, lon: f64| {
            Coordinate::new(lat, lon).map_err(|e| StoreError::Storage(e.to_string()))
        };
        let middle = point(lat, lon)?;
        let corner = geo_math::distance_meters(&middle, &point(bounds.max_latitude, bounds.max_longitude)?)
            .max(geo_math::distance_meters(&middle, &point(bounds.max_latitude, bounds.min_longitude)?));
        // a k-disk reaches at least k * edge * sqrt(3)/2 from its centre cell
        let reach = INDEX_RESOLUTION.edge_length_m() * 3f64.sqrt() / 2.0;
        let k = (corner / reach).ceil() as u32 + 1;

        Ok(centre.grid_disk_safe(k).collect())
    }

    fn cell_key(cell: CellIndex, id: &TerritoryId) -> Vec<u8> {
        let mut key = u64::from(cell).to_be_bytes().to_vec();
        key.extend_from_slice(id.as_str().as_bytes());
        key
    }

    fn decode(bytes: &[u8]) -> Result<Territory, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn all(&self) -> Result<Vec<Territory>, StoreError> {
        self.territories
            .iter()
            .values()
            .map(|value| {
                let value = value
                    .map_err(|e| StoreError::Storage(format!("Iteration failed: {}", e)))?;
                Self::decode(&value)
            })
            .collect()
    }
}

impl TerritoryStore for SledTerritoryStore {
    fn territories_in(&self, bounds: &BoundingBox) -> Result<Vec<Territory>, StoreError> {
        let mut ids = HashSet::new();
        for cell in Self::covering_cells(bounds)? {
            for entry in self.cells.scan_prefix(u64::from(cell).to_be_bytes()).keys() {
                let key = entry.map_err(|e| StoreError::Storage(format!("Scan failed: {}", e)))?;
                let id = String::from_utf8_lossy(&key[8..]).into_owned();
                ids.insert(TerritoryId::new(id));
            }
        }

        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let territory = self.get(&id)?;
            if territory.polygon.bounds().intersects(bounds) {
                found.push(territory);
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    fn get(&self, id: &TerritoryId) -> Result<Territory, StoreError> {
        let value = self
            .territories
            .get(id.as_str())
            .map_err(|e| StoreError::Storage(format!("Get failed: {}", e)))?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Self::decode(&value)
    }

    fn commit(&self, request: CommitRequest) -> Result<CommitReceipt, StoreError> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::Storage("commit lock poisoned".to_string()))?;

        if let Err(err) = check_basis(self, &request) {
            warn!(%err, "commit refused");
            return Err(err);
        }

        let mut territory_batch = sled::Batch::default();
        let mut cell_batch = sled::Batch::default();

        let mut removed = Vec::with_capacity(request.displaced_territory_ids.len());
        for id in &request.displaced_territory_ids {
            let old = self.get(id)?;
            for cell in Self::covering_cells(&old.polygon.bounds())? {
                cell_batch.remove(Self::cell_key(cell, id));
            }
            territory_batch.remove(id.as_str());
            removed.push(id.clone());
        }

        let territory = request.territory.into_territory(TerritoryId::generate(), request.now_ms);
        let encoded = serde_json::to_vec(&territory)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        territory_batch.insert(territory.id.as_str(), encoded);
        for cell in Self::covering_cells(&territory.polygon.bounds())? {
            cell_batch.insert(Self::cell_key(cell, &territory.id), &[] as &[u8]);
        }

        // records and index change together or not at all
        (&self.territories, &self.cells)
            .transaction(|(territories, cells)| -> ConflictableTransactionResult<(), ()> {
                territories.apply_batch(&territory_batch)?;
                cells.apply_batch(&cell_batch)?;
                Ok(())
            })
            .map_err(|e: TransactionError<()>| StoreError::Storage(format!("Commit failed: {:?}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Storage(format!("Flush failed: {}", e)))?;

        debug!(
            territory = %territory.id,
            owner = %territory.owner_user_id,
            removed = removed.len(),
            "claim committed"
        );
        Ok(CommitReceipt { territory, removed })
    }

    fn territories_of(&self, owner: &UserId) -> Result<Vec<Territory>, StoreError> {
        let mut owned: Vec<Territory> = self
            .all()?
            .into_iter()
            .filter(|t| t.owner_user_id == *owner)
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_math::offset_meters;
    use crate::polygon::Polygon;

    fn origin() -> Coordinate {
        Coordinate::new(40.4168, -3.7038).unwrap() // Madrid
    }

    fn square(e0: f64, n0: f64, side: f64) -> Polygon {
        let corners = [(e0, n0), (e0 + side, n0), (e0 + side, n0 + side), (e0, n0 + side)];
        Polygon::new(
            corners
                .iter()
                .map(|&(e, n)| offset_meters(&origin(), e, n).unwrap())
                .collect(),
        )
        .unwrap()
    }

    fn request(owner: &str, polygon: Polygon, basis: Vec<TerritoryVersion>, now_ms: i64) -> CommitRequest {
        CommitRequest {
            territory: CandidateTerritory {
                owner_user_id: UserId::from(owner),
                area_square_meters: geo_math::polygon_area(&polygon),
                polygon,
            },
            displaced_territory_ids: BTreeSet::new(),
            basis,
            now_ms,
        }
    }

    fn version(t: &Territory) -> TerritoryVersion {
        TerritoryVersion {
            id: t.id.clone(),
            updated_at_ms: t.updated_at_ms,
        }
    }

    #[test]
    fn test_commit_and_query() {
        let store = SledTerritoryStore::open_temp().unwrap();
        let receipt = store.commit(request("alice", square(0.0, 0.0, 100.0), vec![], 1000)).unwrap();

        assert_eq!(receipt.territory.created_at_ms, 1000);
        assert!(receipt.removed.is_empty());
        assert_eq!(store.len(), 1);

        let near = store.territories_in(&square(50.0, 50.0, 200.0).bounds()).unwrap();
        assert_eq!(near, vec![receipt.territory.clone()]);

        let far = store.territories_in(&square(5_000.0, 5_000.0, 100.0).bounds()).unwrap();
        assert!(far.is_empty());

        assert_eq!(store.get(&receipt.territory.id).unwrap(), receipt.territory);
        assert_eq!(
            store.territories_of(&UserId::from("alice")).unwrap(),
            vec![receipt.territory]
        );
    }

    #[test]
    fn test_large_query_finds_small_territory() {
        let store = SledTerritoryStore::open_temp().unwrap();
        let small = store.commit(request("bob", square(1_500.0, -900.0, 30.0), vec![], 1)).unwrap();
        let city = square(-2_000.0, -2_000.0, 4_000.0).bounds();
        assert_eq!(store.territories_in(&city).unwrap(), vec![small.territory]);
    }

    #[test]
    fn test_stale_basis_is_conflict() {
        let store = SledTerritoryStore::open_temp().unwrap();
        store.commit(request("bob", square(50.0, 0.0, 100.0), vec![], 1)).unwrap();

        // resolved against an empty window, but bob's territory overlaps
        let err = store.commit(request("alice", square(0.0, 0.0, 100.0), vec![], 2)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(matches!(ConquestError::from(err), ConquestError::StoreConflict(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_current_basis_commits() {
        let store = SledTerritoryStore::open_temp().unwrap();
        let bob = store.commit(request("bob", square(50.0, 0.0, 100.0), vec![], 1)).unwrap();
        let basis = vec![version(&bob.territory)];
        assert!(store.commit(request("alice", square(0.0, 0.0, 100.0), basis, 2)).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_displacement_removes_and_unindexes() {
        let store = SledTerritoryStore::open_temp().unwrap();
        let inner = store.commit(request("bob", square(40.0, 40.0, 20.0), vec![], 1)).unwrap();

        let mut claim = request("alice", square(0.0, 0.0, 100.0), vec![version(&inner.territory)], 2);
        claim.displaced_territory_ids.insert(inner.territory.id.clone());
        let receipt = store.commit(claim).unwrap();

        assert_eq!(receipt.removed, vec![inner.territory.id.clone()]);
        assert_eq!(store.get(&inner.territory.id), Err(StoreError::NotFound(inner.territory.id.clone())));
        let remaining = store.territories_in(&square(0.0, 0.0, 100.0).bounds()).unwrap();
        assert_eq!(remaining, vec![receipt.territory]);
    }

    #[test]
    fn test_displacement_leaves_no_orphan_cells() {
        let store = SledTerritoryStore::open_temp().unwrap();
        let inner = store.commit(request("bob", square(40.0, 40.0, 20.0), vec![], 1)).unwrap();

        let mut claim = request("alice", square(0.0, 0.0, 100.0), vec![version(&inner.territory)], 2);
        claim.displaced_territory_ids.insert(inner.territory.id.clone());
        let receipt = store.commit(claim).unwrap();

        let mut indexed = 0;
        for entry in store.cells.iter() {
            let (key, _) = entry.unwrap();
            let id = std::str::from_utf8(&key[8..]).unwrap();
            assert_eq!(id, receipt.territory.id.as_str());
            indexed += 1;
        }
        assert!(indexed > 0);
        assert_eq!(store.territories.len(), 1);
    }

    #[test]
    fn test_missing_displaced_territory_is_conflict() {
        let store = SledTerritoryStore::open_temp().unwrap();
        let mut claim = request("alice", square(0.0, 0.0, 100.0), vec![], 2);
        claim.displaced_territory_ids.insert(TerritoryId::from("ghost"));
        assert!(matches!(store.commit(claim), Err(StoreError::Conflict(_))));
    }
}
