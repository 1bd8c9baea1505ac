//! Ground truth walker for simulation.
//!
//! The Walker knows where the simulated user really is and turns a planned
//! route into the GPS fixes a phone would report:
//! - Positions sampled along the route at walking pace
//! - Gaussian position noise
//! - Occasional outliers with a poor accuracy estimate

use conquest_core::geo_math::offset_meters;
use conquest_env::{Coordinate, PathPoint};
use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// A planned walk: waypoints in meters east/north of an origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    waypoints: Vec<Vector2<f64>>,
}

impl Route {
    pub fn new(waypoints: Vec<Vector2<f64>>) -> Self {
        Self { waypoints }
    }

    /// Axis-aligned rectangle walked counter-clockwise, back to the start.
    pub fn rectangle(east: f64, north: f64, width: f64, height: f64) -> Self {
        Self::new(vec![
            Vector2::new(east, north),
            Vector2::new(east + width, north),
            Vector2::new(east + width, north + height),
            Vector2::new(east, north + height),
            Vector2::new(east, north),
        ])
    }

    pub fn square(east: f64, north: f64, side: f64) -> Self {
        Self::rectangle(east, north, side, side)
    }

    /// A figure eight whose two lobes meet in the middle.
    pub fn bowtie(east: f64, north: f64, size: f64) -> Self {
        Self::new(vec![
            Vector2::new(east, north),
            Vector2::new(east + size, north + size),
            Vector2::new(east + size, north),
            Vector2::new(east, north + size),
            Vector2::new(east, north),
        ])
    }

    pub fn waypoints(&self) -> &[Vector2<f64>] {
        &self.waypoints
    }

    /// Total route length (m).
    pub fn length(&self) -> f64 {
        self.waypoints.windows(2).map(|w| (w[1] - w[0]).norm()).sum()
    }

    /// The route cut off after `fraction` of its length.
    pub fn truncated(&self, fraction: f64) -> Self {
        let target = self.length() * fraction.clamp(0.0, 1.0);
        self.clone().with_end_at(target)
    }

    /// Points every `step` meters along the route, always including its end.
    fn sample(&self, step: f64) -> Vec<Vector2<f64>> {
        let mut points = Vec::new();
        let Some(first) = self.waypoints.first() else {
            return points;
        };
        points.push(*first);

        let mut carried = 0.0;
        for w in self.waypoints.windows(2) {
            let segment = w[1] - w[0];
            let length = segment.norm();
            let mut along = step - carried;
            while along < length {
                points.push(w[0] + segment * (along / length));
                along += step;
            }
            carried = length - (along - step);
        }

        if let Some(last) = self.waypoints.last() {
            if points.last().map_or(true, |p| (p - last).norm() > 1e-9) {
                points.push(*last);
            }
        }
        points
    }

    fn with_end_at(self, target: f64) -> Self {
        let mut kept = Vec::new();
        let mut walked = 0.0;
        for w in self.waypoints.windows(2) {
            if kept.is_empty() {
                kept.push(w[0]);
            }
            let length = (w[1] - w[0]).norm();
            if walked + length >= target {
                let t = if length > 0.0 { (target - walked) / length } else { 0.0 };
                kept.push(w[0] + (w[1] - w[0]) * t);
                return Self::new(kept);
            }
            walked += length;
            kept.push(w[1]);
        }
        Self::new(kept)
    }
}

/// How the simulated phone reports positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    /// Walking speed (default: 1.4 m/s)
    pub speed_mps: f64,

    /// Time between fixes (default: 7 s, ~10 m at walking pace)
    pub fix_interval_ms: i64,

    /// Standard deviation of position noise (default: 1.5 m)
    pub noise_sigma_m: f64,

    /// Accuracy radius reported with normal fixes (default: 5 m)
    pub reported_accuracy_m: f64,

    /// Probability that a fix is an outlier (default: 0)
    pub outlier_rate: f64,

    /// Position error of an outlier (default: 80 m)
    pub outlier_error_m: f64,

    /// Accuracy radius reported with an outlier (default: 60 m)
    pub outlier_accuracy_m: f64,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            speed_mps: 1.4,
            fix_interval_ms: 7_000,
            noise_sigma_m: 1.5,
            reported_accuracy_m: 5.0,
            outlier_rate: 0.0,
            outlier_error_m: 80.0,
            outlier_accuracy_m: 60.0,
        }
    }
}

/// Produces noisy fixes for routes, from a seeded RNG.
pub struct Walker {
    origin: Coordinate,
    config: WalkerConfig,
    rng: ChaCha8Rng,
}

impl Walker {
    pub fn new(origin: Coordinate, config: WalkerConfig, seed: u64) -> Self {
        Self {
            origin,
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &WalkerConfig {
        &self.config
    }

    /// Continuous walk: one fix per interval along the route.
    pub fn walk(&mut self, route: &Route, start_ms: i64) -> Vec<PathPoint> {
        let step = self.config.speed_mps * self.config.fix_interval_ms as f64 / 1000.0;
        let positions = route.sample(step.max(1.0));
        self.report(&positions, start_ms)
    }

    /// Sparse walk: one fix at each waypoint only.
    pub fn corners(&mut self, route: &Route, start_ms: i64) -> Vec<PathPoint> {
        self.report(route.waypoints(), start_ms)
    }

    fn report(&mut self, positions: &[Vector2<f64>], start_ms: i64) -> Vec<PathPoint> {
        positions
            .iter()
            .enumerate()
            .filter_map(|(i, truth)| {
                let timestamp_ms = start_ms + self.config.fix_interval_ms * (i as i64 + 1);
                let (measured, accuracy) = self.measure(truth);
                offset_meters(&self.origin, measured.x, measured.y)
                    .ok()
                    .map(|coordinate| PathPoint::new(coordinate, timestamp_ms, accuracy))
            })
            .collect()
    }

    fn measure(&mut self, truth: &Vector2<f64>) -> (Vector2<f64>, f64) {
        if self.config.outlier_rate > 0.0 && self.rng.gen_bool(self.config.outlier_rate.min(1.0)) {
            let heading = self.rng.gen_range(0.0..std::f64::consts::TAU);
            let error = Vector2::new(heading.cos(), heading.sin()) * self.config.outlier_error_m;
            return (truth + error, self.config.outlier_accuracy_m);
        }

        let ex: f64 = self.rng.sample(StandardNormal);
        let ny: f64 = self.rng.sample(StandardNormal);
        let noise = Vector2::new(ex, ny) * self.config.noise_sigma_m;
        (truth + noise, self.config.reported_accuracy_m)
    }
}
