//! PathTracker - turns a live stream of GPS fixes into a candidate loop.
//!
//! Each accepted fix is appended to the current path. Noisy fixes (poor
//! accuracy), fixes that barely moved, and fixes that arrive out of order
//! are discarded. Once the path has enough points, every accepted fix is
//! tested for loop closure; on closure the enclosed sub-path becomes the
//! candidate polygon and the tracker goes inactive.

use crate::error::ConquestError;
use crate::geo_math::{self, LoopClosure};
use crate::polygon::Polygon;
use conquest_env::{Coordinate, PathPoint};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for fix filtering and loop detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Fixes reporting a worse accuracy radius are noise (default: 25 m)
    pub max_accuracy_m: f64,

    /// Fixes closer than this to the previous accepted fix are dropped (default: 3 m)
    pub min_movement_m: f64,

    /// Loop-closure parameters (default: 20 m radius, 60 m perimeter)
    pub closure: LoopClosure,

    /// Accepted points required before closure testing starts (default: 3)
    pub min_points_for_closure: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 25.0,
            min_movement_m: 3.0,
            closure: LoopClosure::default(),
            min_points_for_closure: 3,
        }
    }
}

/// Why a fix was not appended to the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixRejection {
    /// Accuracy radius above the configured threshold
    LowAccuracy,
    /// Within the minimum movement distance of the previous accepted fix
    InsufficientMovement,
    /// Timestamp not strictly after the previous accepted fix
    OutOfOrder,
    /// Non-finite or negative accuracy
    MalformedFix,
    /// The path is closed and under evaluation
    Evaluating,
}

/// Outcome of offering one fix to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum PathTrackerEvent {
    Continuing,
    LoopClosed(Polygon),
    Rejected(FixRejection),
}

/// Accumulates the candidate path of one conquest attempt.
#[derive(Debug, Clone)]
pub struct PathTracker {
    config: TrackerConfig,
    path: Vec<PathPoint>,
    active: bool,
}

impl PathTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            path: Vec::new(),
            active: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TrackerConfig::default())
    }

    /// Begins a fresh path.
    pub fn start(&mut self) -> Result<(), ConquestError> {
        if self.active {
            return Err(ConquestError::AlreadyTracking);
        }
        self.path.clear();
        self.active = true;
        Ok(())
    }

    /// Discards the current path. Always succeeds; calling it twice is harmless.
    pub fn cancel(&mut self) {
        self.path.clear();
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Accepted fixes of the current (or just closed) path.
    pub fn path(&self) -> &[PathPoint] {
        &self.path
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Offers one fix to the path.
    pub fn add_fix(&mut self, point: PathPoint) -> Result<PathTrackerEvent, ConquestError> {
        if !self.active {
            return Err(ConquestError::NotTracking);
        }

        if let Some(reason) = self.screen(&point) {
            debug!(?reason, timestamp_ms = point.timestamp_ms, "fix rejected");
            return Ok(PathTrackerEvent::Rejected(reason));
        }

        self.path.push(point);

        if self.path.len() < self.config.min_points_for_closure {
            return Ok(PathTrackerEvent::Continuing);
        }

        let coords: Vec<Coordinate> = self.path.iter().map(|p| p.coordinate).collect();
        let Some(start) = geo_math::closed_loop_index(&coords, &self.config.closure) else {
            return Ok(PathTrackerEvent::Continuing);
        };

        // The closing fix duplicates the loop's first vertex
        match Polygon::new(coords[start..coords.len() - 1].to_vec()) {
            Ok(candidate) => {
                debug!(
                    start,
                    vertices = candidate.vertex_count(),
                    "path closed into a loop"
                );
                self.active = false;
                Ok(PathTrackerEvent::LoopClosed(candidate))
            }
            Err(err) => {
                debug!(%err, "closure ignored, loop has too few distinct vertices");
                Ok(PathTrackerEvent::Continuing)
            }
        }
    }

    fn screen(&self, point: &PathPoint) -> Option<FixRejection> {
        if !point.accuracy_m.is_finite() || point.accuracy_m < 0.0 {
            return Some(FixRejection::MalformedFix);
        }
        let last = self.path.last();
        if let Some(last) = last {
            if point.timestamp_ms <= last.timestamp_ms {
                return Some(FixRejection::OutOfOrder);
            }
        }
        if point.accuracy_m > self.config.max_accuracy_m {
            return Some(FixRejection::LowAccuracy);
        }
        if let Some(last) = last {
            let moved = geo_math::distance_meters(&last.coordinate, &point.coordinate);
            if moved < self.config.min_movement_m {
                return Some(FixRejection::InsufficientMovement);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_math::offset_meters;

    fn origin() -> Coordinate {
        Coordinate::new(48.8566, 2.3522).unwrap() // Paris
    }

    fn fix(e: f64, n: f64, t: i64) -> PathPoint {
        PathPoint::new(offset_meters(&origin(), e, n).unwrap(), t, 5.0)
    }

    fn started() -> PathTracker {
        let mut tracker = PathTracker::with_defaults();
        tracker.start().unwrap();
        tracker
    }

    #[test]
    fn test_start_twice_is_already_tracking() {
        let mut tracker = started();
        assert_eq!(tracker.start(), Err(ConquestError::AlreadyTracking));
    }

    #[test]
    fn test_add_fix_requires_start() {
        let mut tracker = PathTracker::with_defaults();
        assert_eq!(tracker.add_fix(fix(0.0, 0.0, 1)), Err(ConquestError::NotTracking));
    }

    #[test]
    fn test_square_walk_closes_loop() {
        let mut tracker = started();
        let walk = [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)];
        for (i, &(e, n)) in walk.iter().enumerate() {
            assert_eq!(
                tracker.add_fix(fix(e, n, i as i64 * 1000)).unwrap(),
                PathTrackerEvent::Continuing
            );
        }

        match tracker.add_fix(fix(2.0, 1.0, 5000)).unwrap() {
            PathTrackerEvent::LoopClosed(polygon) => {
                assert_eq!(polygon.vertex_count(), 4);
                assert_eq!(polygon.exterior()[0], fix(0.0, 0.0, 0).coordinate);
            }
            other => panic!("expected loop closure, got {:?}", other),
        }
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_loop_starts_at_closure_point() {
        let mut tracker = started();
        // a lead-in segment before the actual loop
        let walk = [(-200.0, 0.0), (-100.0, 0.0), (0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)];
        for (i, &(e, n)) in walk.iter().enumerate() {
            tracker.add_fix(fix(e, n, i as i64 * 1000)).unwrap();
        }
        match tracker.add_fix(fix(1.0, 1.0, 10_000)).unwrap() {
            PathTrackerEvent::LoopClosed(polygon) => assert_eq!(polygon.vertex_count(), 4),
            other => panic!("expected loop closure, got {:?}", other),
        }
    }

    #[test]
    fn test_low_accuracy_fix_is_discarded() {
        let mut tracker = started();
        tracker.add_fix(fix(0.0, 0.0, 0)).unwrap();

        let mut noisy = fix(50.0, 0.0, 1000);
        noisy.accuracy_m = 80.0;
        assert_eq!(
            tracker.add_fix(noisy).unwrap(),
            PathTrackerEvent::Rejected(FixRejection::LowAccuracy)
        );
        assert_eq!(tracker.path().len(), 1);
    }

    #[test]
    fn test_out_of_order_fix_is_rejected() {
        let mut tracker = started();
        tracker.add_fix(fix(0.0, 0.0, 2000)).unwrap();
        assert_eq!(
            tracker.add_fix(fix(50.0, 0.0, 1000)).unwrap(),
            PathTrackerEvent::Rejected(FixRejection::OutOfOrder)
        );
        assert_eq!(
            tracker.add_fix(fix(50.0, 0.0, 2000)).unwrap(),
            PathTrackerEvent::Rejected(FixRejection::OutOfOrder)
        );
    }

    #[test]
    fn test_stationary_fix_is_dropped() {
        let mut tracker = started();
        tracker.add_fix(fix(0.0, 0.0, 0)).unwrap();
        assert_eq!(
            tracker.add_fix(fix(1.0, 0.5, 1000)).unwrap(),
            PathTrackerEvent::Rejected(FixRejection::InsufficientMovement)
        );
    }

    #[test]
    fn test_malformed_accuracy() {
        let mut tracker = started();
        let mut bad = fix(0.0, 0.0, 0);
        bad.accuracy_m = f64::NAN;
        assert_eq!(
            tracker.add_fix(bad).unwrap(),
            PathTrackerEvent::Rejected(FixRejection::MalformedFix)
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut tracker = started();
        tracker.add_fix(fix(0.0, 0.0, 0)).unwrap();
        tracker.cancel();
        tracker.cancel();
        assert!(!tracker.is_active());
        assert!(tracker.path().is_empty());
        assert!(tracker.start().is_ok());
    }
}
