//! Territory records.

use crate::geo_math;
use crate::polygon::Polygon;
use conquest_env::{TerritoryId, UserId};
use serde::{Deserialize, Serialize};

/// A committed territory, as held by the territory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Territory {
    pub id: TerritoryId,
    pub owner_user_id: UserId,
    pub polygon: Polygon,
    pub area_square_meters: f64,

    /// Unix milliseconds
    pub created_at_ms: i64,

    /// Unix milliseconds; doubles as the optimistic-concurrency version
    pub updated_at_ms: i64,
}

/// A claim the engine produced, not yet committed (no id, no timestamps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTerritory {
    pub owner_user_id: UserId,
    pub polygon: Polygon,
    pub area_square_meters: f64,
}

impl CandidateTerritory {
    /// Candidate for `owner` with its area measured on the ground.
    pub fn new(owner_user_id: UserId, polygon: Polygon) -> Self {
        Self {
            area_square_meters: geo_math::polygon_area(&polygon),
            owner_user_id,
            polygon,
        }
    }

    /// Turns the candidate into a stored record.
    pub fn into_territory(self, id: TerritoryId, now_ms: i64) -> Territory {
        Territory {
            id,
            owner_user_id: self.owner_user_id,
            polygon: self.polygon,
            area_square_meters: self.area_square_meters,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}
