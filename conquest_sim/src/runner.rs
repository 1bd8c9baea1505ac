//! Scenario runner - executes conquest scenarios on a virtual clock.
//!
//! Every scenario runs its players' `ConquestRuntime`s against one shared
//! temporary sled store. An observer `TerritoryWindow` follows the change
//! feeds of all players and must agree with the store at the end.

use crate::context::SimContext;
use crate::location::{ScriptStep, ScriptedLocationSource};
use crate::scenarios::ScenarioId;
use crate::walker::{Route, Walker, WalkerConfig};

use conquest_core::{
    CommitReceipt, ConquestError, ConquestEvent, ConquestRuntime, ConquestState, ConquestUpdate,
    FixRejection, RejectionReason, RuntimeConfig, RuntimeEvent, SledTerritoryStore, TerritoryChange,
    TerritoryStore, TerritoryWindow,
};
use conquest_env::{ConquestContext, Coordinate, LocationSignal, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Conquest attempts started
    pub attempts: usize,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Territories in the store at the end
    pub final_territory_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioMetrics {
    /// Fixes handed to the runtimes
    pub fixes_sent: u64,

    /// Fixes the path tracker discarded
    pub fixes_rejected: u64,

    /// Successful claims
    pub claims: u64,

    /// Attempts that ended Failed
    pub rejections: u64,

    /// Territories removed by displacement
    pub displaced: u64,

    /// Sum of claimed areas (m²)
    pub area_claimed_m2: f64,
}

type SimRuntime = ConquestRuntime<SimContext, ScriptedLocationSource, SledTerritoryStore>;

/// Everything one attempt reported.
#[derive(Debug, Default)]
struct Attempt {
    updates: Vec<ConquestUpdate>,
    receipts: Vec<CommitReceipt>,
}

impl Attempt {
    /// The Succeeded/Failed/Cancelled update that ended the attempt.
    fn terminal(&self) -> Option<&ConquestUpdate> {
        self.updates.iter().rev().find(|u| {
            matches!(
                u.state,
                ConquestState::Succeeded | ConquestState::Failed | ConquestState::Cancelled
            )
        })
    }

    fn claimed_area(&self) -> Option<f64> {
        match self.terminal().map(|u| &u.event) {
            Some(ConquestEvent::Claimed(claim)) => Some(claim.territory.area_square_meters),
            _ => None,
        }
    }

    fn rejection(&self) -> Option<RejectionReason> {
        match self.terminal().map(|u| &u.event) {
            Some(ConquestEvent::Failed(reason)) => Some(*reason),
            _ => None,
        }
    }

    fn fixes_rejected(&self) -> u64 {
        self.updates
            .iter()
            .filter(|u| {
                matches!(u.event, ConquestEvent::FixRejected(r) if r != FixRejection::Evaluating)
            })
            .count() as u64
    }
}

/// One simulated user.
struct Player {
    runtime: SimRuntime,
    source: Arc<ScriptedLocationSource>,
    events: broadcast::Receiver<RuntimeEvent>,
    changes: broadcast::Receiver<TerritoryChange>,
}

impl Player {
    fn new(name: &str, context: &Arc<SimContext>, store: &Arc<SledTerritoryStore>, config: RuntimeConfig) -> Self {
        let source = Arc::new(ScriptedLocationSource::new(Arc::clone(context)));
        let runtime = ConquestRuntime::new(
            Arc::clone(context),
            Arc::clone(&source),
            Arc::clone(store),
            UserId::from(name),
            config,
        );
        let events = runtime.subscribe_events();
        let changes = runtime.subscribe_changes();
        Self {
            runtime,
            source,
            events,
            changes,
        }
    }

    /// Starts an attempt and plays the script to its end.
    async fn attempt(&mut self, steps: Vec<ScriptStep>) -> Result<Attempt, ConquestError> {
        self.runtime.begin()?;
        for step in steps {
            self.source.push(step);
        }
        self.runtime.run().await?;
        Ok(self.drain())
    }

    fn cancel(&mut self) -> Result<Attempt, ConquestError> {
        self.runtime.cancel()?;
        Ok(self.drain())
    }

    fn drain(&mut self) -> Attempt {
        let mut attempt = Attempt::default();
        loop {
            match self.events.try_recv() {
                Ok(RuntimeEvent::Update(update)) => attempt.updates.push(update),
                Ok(RuntimeEvent::Committed(receipt)) => attempt.receipts.push(receipt),
                Ok(other) => debug!(user = %self.runtime.user_id, ?other, "provider status"),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "event receiver lagged");
                }
                Err(_) => break,
            }
        }
        attempt
    }
}

/// Shared state of one scenario run.
struct Sim {
    context: Arc<SimContext>,
    store: Arc<SledTerritoryStore>,
    walker: Walker,
    config: RuntimeConfig,
    window: TerritoryWindow,
    metrics: ScenarioMetrics,
    attempts: usize,
}

impl Sim {
    fn player(&self, name: &str) -> Player {
        Player::new(name, &self.context, &self.store, self.config)
    }

    /// Continuous noisy walk starting now.
    fn walk(&mut self, route: &Route) -> Vec<ScriptStep> {
        let start = self.context.unix_millis();
        fixes(self.walker.walk(route, start))
    }

    /// One noisy fix per waypoint, starting now.
    fn corners(&mut self, route: &Route) -> Vec<ScriptStep> {
        let start = self.context.unix_millis();
        fixes(self.walker.corners(route, start))
    }

    async fn attempt(&mut self, player: &mut Player, steps: Vec<ScriptStep>) -> Result<Attempt, String> {
        self.attempts += 1;
        self.metrics.fixes_sent += steps
            .iter()
            .filter(|s| matches!(s, ScriptStep::Signal(LocationSignal::Fix(_))))
            .count() as u64;

        let attempt = player.attempt(steps).await.map_err(|e| e.to_string())?;
        self.record(player, &attempt);
        Ok(attempt)
    }

    fn cancel(&mut self, player: &mut Player) -> Result<Attempt, String> {
        let attempt = player.cancel().map_err(|e| e.to_string())?;
        self.record(player, &attempt);
        Ok(attempt)
    }

    fn record(&mut self, player: &mut Player, attempt: &Attempt) {
        self.metrics.fixes_rejected += attempt.fixes_rejected();
        if let Some(area) = attempt.claimed_area() {
            self.metrics.claims += 1;
            self.metrics.area_claimed_m2 += area;
        }
        if attempt.rejection().is_some() {
            self.metrics.rejections += 1;
        }
        self.metrics.displaced += attempt.receipts.iter().map(|r| r.removed.len() as u64).sum::<u64>();

        while let Ok(change) = player.changes.try_recv() {
            self.window.apply(change);
        }
    }
}

fn fixes(points: Vec<conquest_env::PathPoint>) -> Vec<ScriptStep> {
    points
        .into_iter()
        .map(|p| ScriptStep::Signal(LocationSignal::Fix(p)))
        .collect()
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message())
    }
}

fn expect_claim(attempt: &Attempt, expected_m2: f64, tolerance: f64) -> Result<f64, String> {
    let area = attempt.claimed_area().ok_or_else(|| {
        format!("expected a claim, attempt ended with {:?}", attempt.terminal().map(|u| &u.event))
    })?;
    check((area - expected_m2).abs() <= expected_m2 * tolerance, || {
        format!("claimed {:.0} m², expected {:.0} m² ± {:.0}%", area, expected_m2, tolerance * 100.0)
    })?;
    Ok(area)
}

fn expect_rejection(attempt: &Attempt, reason: RejectionReason) -> Result<(), String> {
    check(attempt.rejection() == Some(reason), || {
        format!("expected {:?}, attempt ended with {:?}", reason, attempt.terminal().map(|u| &u.event))
    })
}

/// Runs conquest scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Origin of every scenario's local frame (latitude, longitude)
    origin: (f64, f64),

    walker: WalkerConfig,
    config: RuntimeConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            origin: (47.3769, 8.5417), // Zurich
            walker: WalkerConfig::default(),
            config: RuntimeConfig::default(),
        }
    }

    /// Sets the walker noise model.
    pub fn with_walker(mut self, walker: WalkerConfig) -> Self {
        self.walker = walker;
        self
    }

    /// Sets the runtime configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the walk origin.
    pub fn with_origin(mut self, latitude: f64, longitude: f64) -> Self {
        self.origin = (latitude, longitude);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let tokio_rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => return self.failed(scenario, format!("tokio runtime: {}", e)),
        };
        let origin = match Coordinate::new(self.origin.0, self.origin.1) {
            Ok(origin) => origin,
            Err(e) => return self.failed(scenario, e.to_string()),
        };
        let store = match SledTerritoryStore::open_temp() {
            Ok(store) => Arc::new(store),
            Err(e) => return self.failed(scenario, e.to_string()),
        };

        let mut sim = Sim {
            context: SimContext::shared(self.seed),
            store,
            walker: Walker::new(origin, self.scenario_walker(scenario), self.seed),
            config: self.config,
            window: TerritoryWindow::default(),
            metrics: ScenarioMetrics::default(),
            attempts: 0,
        };

        let outcome = tokio_rt.block_on(async {
            match scenario {
                ScenarioId::SquareClaim => run_square_claim(&mut sim).await,
                ScenarioId::RepeatClaim => run_repeat_claim(&mut sim).await,
                ScenarioId::FigureEight => run_figure_eight(&mut sim).await,
                ScenarioId::Timeout => run_timeout(&mut sim).await,
                ScenarioId::Contested => run_contested(&mut sim).await,
                ScenarioId::Encircle => run_encircle(&mut sim).await,
                ScenarioId::NoisyWalk => run_noisy_walk(&mut sim).await,
                ScenarioId::Cancellation => run_cancellation(&mut sim).await,
            }
        });
        let outcome = outcome.and_then(|_| {
            check(sim.window.len() == sim.store.len(), || {
                format!("window holds {} territories, store {}", sim.window.len(), sim.store.len())
            })
        });

        if let Err(reason) = &outcome {
            warn!(scenario = scenario.name(), %reason, "scenario failed");
        }
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            attempts: sim.attempts,
            final_time_secs: sim.context.elapsed_ms() as f64 / 1000.0,
            final_territory_count: sim.store.len(),
            failure_reason: outcome.err(),
            metrics: sim.metrics,
        }
    }

    fn scenario_walker(&self, scenario: ScenarioId) -> WalkerConfig {
        match scenario {
            ScenarioId::NoisyWalk => WalkerConfig {
                noise_sigma_m: self.walker.noise_sigma_m.max(2.0),
                outlier_rate: 0.2,
                ..self.walker
            },
            _ => self.walker,
        }
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            attempts: 0,
            final_time_secs: 0.0,
            final_territory_count: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// SIM-001: one square on empty ground.
async fn run_square_claim(sim: &mut Sim) -> Result<(), String> {
    let mut alice = sim.player("alice");
    let steps = sim.walk(&Route::square(0.0, 0.0, 100.0));
    let attempt = sim.attempt(&mut alice, steps).await?;

    expect_claim(&attempt, 10_000.0, 0.1)?;
    check(sim.store.len() == 1, || format!("store holds {} territories", sim.store.len()))
}

/// SIM-002: the owner replays the exact same trace.
async fn run_repeat_claim(sim: &mut Sim) -> Result<(), String> {
    let mut alice = sim.player("alice");
    let route = Route::square(0.0, 0.0, 100.0);
    let first_steps = sim.walk(&route);
    let first = sim.attempt(&mut alice, first_steps.clone()).await?;
    expect_claim(&first, 10_000.0, 0.1)?;

    sim.context.advance_time(Duration::from_secs(600));
    let shift = sim.context.unix_millis() - first_timestamp(&first_steps).unwrap_or(0) + 1;
    let replay = first_steps
        .into_iter()
        .map(|step| match step {
            ScriptStep::Signal(LocationSignal::Fix(mut fix)) => {
                fix.timestamp_ms += shift;
                ScriptStep::Signal(LocationSignal::Fix(fix))
            }
            other => other,
        })
        .collect();

    let second = sim.attempt(&mut alice, replay).await?;
    expect_rejection(&second, RejectionReason::TooSmallOrDegenerate)?;
    check(sim.store.len() == 1, || format!("store holds {} territories", sim.store.len()))
}

fn first_timestamp(steps: &[ScriptStep]) -> Option<i64> {
    steps.iter().find_map(|s| match s {
        ScriptStep::Signal(LocationSignal::Fix(fix)) => Some(fix.timestamp_ms),
        _ => None,
    })
}

/// SIM-003: a sparse bowtie closes into a self-crossing loop.
async fn run_figure_eight(sim: &mut Sim) -> Result<(), String> {
    let mut alice = sim.player("alice");
    let steps = sim.corners(&Route::bowtie(0.0, 0.0, 100.0));
    let attempt = sim.attempt(&mut alice, steps).await?;

    expect_rejection(&attempt, RejectionReason::TooSmallOrDegenerate)?;
    check(sim.store.is_empty(), || "a self-crossing loop was stored".to_string())
}

/// SIM-004: silence outlasts the attempt deadline.
async fn run_timeout(sim: &mut Sim) -> Result<(), String> {
    let mut alice = sim.player("alice");
    let mut steps = sim.walk(&Route::square(0.0, 0.0, 100.0).truncated(0.5));
    let deadline = sim.config.engine.max_attempt_duration_ms.max(0) as u64;
    steps.push(ScriptStep::Silence(Duration::from_millis(deadline + 60_000)));

    let attempt = sim.attempt(&mut alice, steps).await?;
    expect_rejection(&attempt, RejectionReason::AttemptTimedOut)?;
    check(alice.runtime.state() == ConquestState::Idle, || {
        format!("runtime left in {:?}", alice.runtime.state())
    })?;
    check(alice.runtime.begin().is_ok(), || "could not start again after timeout".to_string())
}

/// SIM-005: a rival already holds the east half.
async fn run_contested(sim: &mut Sim) -> Result<(), String> {
    let mut bob = sim.player("bob");
    let bob_steps = sim.walk(&Route::rectangle(50.0, -20.0, 100.0, 140.0));
    let bob_attempt = sim.attempt(&mut bob, bob_steps).await?;
    expect_claim(&bob_attempt, 14_000.0, 0.1)?;

    let mut alice = sim.player("alice");
    let steps = sim.walk(&Route::square(0.0, 0.0, 100.0));
    let attempt = sim.attempt(&mut alice, steps).await?;

    expect_claim(&attempt, 5_000.0, 0.15)?;
    let bobs = sim
        .store
        .territories_of(&UserId::from("bob"))
        .map_err(|e| e.to_string())?;
    check(bobs.len() == 1, || format!("bob holds {} territories", bobs.len()))
}

/// SIM-006: a rival's small square ends up inside the walk.
async fn run_encircle(sim: &mut Sim) -> Result<(), String> {
    let mut bob = sim.player("bob");
    let bob_steps = sim.walk(&Route::square(35.0, 35.0, 30.0));
    let bob_attempt = sim.attempt(&mut bob, bob_steps).await?;
    expect_claim(&bob_attempt, 900.0, 0.25)?;

    let mut alice = sim.player("alice");
    let steps = sim.walk(&Route::square(0.0, 0.0, 100.0));
    let attempt = sim.attempt(&mut alice, steps).await?;

    expect_claim(&attempt, 10_000.0, 0.1)?;
    check(attempt.receipts.iter().any(|r| r.removed.len() == 1), || {
        "bob's territory was not displaced".to_string()
    })?;
    let bobs = sim
        .store
        .territories_of(&UserId::from("bob"))
        .map_err(|e| e.to_string())?;
    check(bobs.is_empty(), || format!("bob still holds {} territories", bobs.len()))
}

/// SIM-007: outliers are filtered, the square still closes.
async fn run_noisy_walk(sim: &mut Sim) -> Result<(), String> {
    let mut alice = sim.player("alice");
    let steps = sim.walk(&Route::square(0.0, 0.0, 100.0));
    let attempt = sim.attempt(&mut alice, steps).await?;

    expect_claim(&attempt, 10_000.0, 0.15)?;
    check(sim.metrics.fixes_rejected > 0, || "no outlier was rejected".to_string())
}

/// SIM-008: half a walk, cancel, then the full square.
async fn run_cancellation(sim: &mut Sim) -> Result<(), String> {
    let mut alice = sim.player("alice");
    let route = Route::square(0.0, 0.0, 100.0);

    let half = sim.walk(&route.truncated(0.5));
    let partial = sim.attempt(&mut alice, half).await?;
    check(partial.terminal().is_none(), || "half walk ended the attempt".to_string())?;

    let cancelled = sim.cancel(&mut alice)?;
    check(
        cancelled.terminal().map(|u| u.state) == Some(ConquestState::Cancelled),
        || "cancel did not report Cancelled".to_string(),
    )?;
    check(sim.store.is_empty(), || "cancelled attempt left a territory".to_string())?;

    let full = sim.walk(&route);
    let attempt = sim.attempt(&mut alice, full).await?;
    expect_claim(&attempt, 10_000.0, 0.1)?;
    check(sim.store.len() == 1, || format!("store holds {} territories", sim.store.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_pass_default_seed() {
        let runner = ScenarioRunner::new(42);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(
                result.passed,
                "{} failed: {:?}",
                scenario.name(),
                result.failure_reason
            );
        }
    }

    #[test]
    fn test_same_seed_same_metrics() {
        let a = ScenarioRunner::new(7).run(ScenarioId::NoisyWalk);
        let b = ScenarioRunner::new(7).run(ScenarioId::NoisyWalk);
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.final_time_secs, b.final_time_secs);
    }

    #[test]
    fn test_encircle_displaces() {
        let result = ScenarioRunner::new(3).run(ScenarioId::Encircle);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.displaced, 1);
        assert_eq!(result.final_territory_count, 1);
    }

    #[test]
    fn test_square_claim_in_southern_hemisphere() {
        let result = ScenarioRunner::new(11)
            .with_origin(-33.8688, 151.2093) // Sydney
            .run(ScenarioId::SquareClaim);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_territory_count, 1);
    }

    #[test]
    fn test_noise_free_timeout() {
        let runner = ScenarioRunner::new(1).with_walker(WalkerConfig {
            noise_sigma_m: 0.0,
            ..Default::default()
        });
        let result = runner.run(ScenarioId::Timeout);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.rejections, 1);
        assert!(result.final_time_secs > 30.0 * 60.0);
    }
}
