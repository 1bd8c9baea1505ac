//! TerritoryResolver - conflict resolution for a closed candidate loop.
//!
//! Given a candidate polygon, the claimant and the spatially relevant window
//! of existing territories, decides what (if anything) the claimant gets:
//!
//! 1. **Validation**: the candidate must be simple and large enough
//! 2. **Self overlap**: the claimant's own territories are cut out (only
//!    net-new ground counts)
//! 3. **Foreign overlap**: ground held by others is cut out, unless the
//!    other territory lies entirely inside the candidate with claimable
//!    ground around it, in which case it is displaced and its ground joins
//!    the claim
//! 4. **Re-validation**: the largest remaining piece must still be simple
//!    and large enough
//!
//! Territories are processed in ascending id order so the result does not
//! depend on how the caller fetched them. The resolver holds no state
//! beyond its configuration; the same inputs always give the same output.

use crate::error::ConquestError;
use crate::geo_math::{self, LocalFrame, AREA_TOLERANCE_M2};
use crate::polygon::Polygon;
use crate::territory::Territory;
use conquest_env::{TerritoryId, UserId};
use geo::{Area, BooleanOps, MultiPolygon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Configuration for the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Smallest claimable area (default: 100 m²)
    pub min_claim_area_m2: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_claim_area_m2: 100.0,
        }
    }
}

/// Why an attempt produced no territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionReason {
    TooSmallOrDegenerate,
    FullyContested,
    AttemptTimedOut,
}

impl From<RejectionReason> for ConquestError {
    fn from(reason: RejectionReason) -> Self {
        match reason {
            RejectionReason::TooSmallOrDegenerate => ConquestError::TooSmallOrDegenerate,
            RejectionReason::FullyContested => ConquestError::FullyContested,
            RejectionReason::AttemptTimedOut => ConquestError::AttemptTimedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    Claimed,
    Rejected(RejectionReason),
}

/// Version of one territory a resolution was computed against.
///
/// The store compares these on commit to detect that the world moved on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TerritoryVersion {
    pub id: TerritoryId,
    pub updated_at_ms: i64,
}

/// Result of resolving one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapResolution {
    pub final_polygon: Option<Polygon>,
    pub displaced_territory_ids: BTreeSet<TerritoryId>,
    pub outcome: ResolutionOutcome,

    /// Every territory supplied to the resolve call, ascending by id
    pub basis: Vec<TerritoryVersion>,
}

impl OverlapResolution {
    fn claimed(polygon: Polygon, displaced: BTreeSet<TerritoryId>, basis: Vec<TerritoryVersion>) -> Self {
        Self {
            final_polygon: Some(polygon),
            displaced_territory_ids: displaced,
            outcome: ResolutionOutcome::Claimed,
            basis,
        }
    }

    fn rejected(reason: RejectionReason, basis: Vec<TerritoryVersion>) -> Self {
        Self {
            final_polygon: None,
            displaced_territory_ids: BTreeSet::new(),
            outcome: ResolutionOutcome::Rejected(reason),
            basis,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.outcome == ResolutionOutcome::Claimed
    }
}

/// Resolves candidate loops against existing territories.
#[derive(Debug, Clone, Default)]
pub struct TerritoryResolver {
    config: ResolverConfig,
}

impl TerritoryResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Decides the claim for `candidate` by `claimant`.
    pub fn resolve(
        &self,
        candidate: &Polygon,
        claimant: &UserId,
        existing: &[Territory],
    ) -> OverlapResolution {
        let mut ordered: Vec<&Territory> = existing.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        ordered.dedup_by(|a, b| a.id == b.id);

        let basis: Vec<TerritoryVersion> = ordered
            .iter()
            .map(|t| TerritoryVersion {
                id: t.id.clone(),
                updated_at_ms: t.updated_at_ms,
            })
            .collect();

        // Stage 1: the candidate itself
        if let Err(err) = geo_math::validate_polygon(candidate) {
            debug!(%err, "candidate rejected before overlap checks");
            return OverlapResolution::rejected(RejectionReason::TooSmallOrDegenerate, basis);
        }
        if geo_math::polygon_area(candidate) < self.config.min_claim_area_m2 {
            return OverlapResolution::rejected(RejectionReason::TooSmallOrDegenerate, basis);
        }

        // Stages 2 & 3: subtract overlaps in id order
        let frame = LocalFrame::new(candidate.anchor());
        let footprint = frame.to_planar(candidate);
        let candidate_bounds = candidate.bounds();

        let mut remaining = MultiPolygon::new(vec![footprint.clone()]);
        let mut displaced = BTreeSet::new();
        let mut self_clipped = false;
        let mut contested = false;

        for territory in ordered {
            if !territory.polygon.bounds().intersects(&candidate_bounds) {
                continue;
            }
            let other = frame.to_planar(&territory.polygon);
            if footprint.intersection(&other).unsigned_area() <= AREA_TOLERANCE_M2 {
                continue;
            }

            if territory.owner_user_id == *claimant {
                remaining = remaining.difference(&MultiPolygon::new(vec![other]));
                self_clipped = true;
            } else if self.encloses(&footprint, &other) {
                debug!(territory = %territory.id, "territory fully enclosed, displaced");
                displaced.insert(territory.id.clone());
            } else {
                remaining = remaining.difference(&MultiPolygon::new(vec![other]));
                contested = true;
            }
        }

        if !self_clipped && !contested {
            return OverlapResolution::claimed(candidate.clone(), displaced, basis);
        }

        // Stage 4: re-validate what is left
        let shortfall = if contested {
            RejectionReason::FullyContested
        } else {
            RejectionReason::TooSmallOrDegenerate
        };
        let Some(piece) = geo_math::largest_part(remaining) else {
            return OverlapResolution::rejected(shortfall, basis);
        };
        if piece.unsigned_area() < self.config.min_claim_area_m2 {
            return OverlapResolution::rejected(shortfall, basis);
        }
        match frame.from_planar(&piece) {
            Ok(polygon) if geo_math::is_simple_polygon(&polygon) => {
                OverlapResolution::claimed(polygon, displaced, basis)
            }
            _ => OverlapResolution::rejected(RejectionReason::TooSmallOrDegenerate, basis),
        }
    }

    /// True when `other` lies wholly inside `footprint` and the footprint
    /// still claims new ground around it. A candidate equal to or inside a
    /// foreign territory never displaces it.
    fn encloses(&self, footprint: &geo::Polygon<f64>, other: &geo::Polygon<f64>) -> bool {
        other.difference(footprint).unsigned_area() <= AREA_TOLERANCE_M2
            && footprint.difference(other).unsigned_area() >= self.config.min_claim_area_m2
    }
}
