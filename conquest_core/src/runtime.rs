//! Conquest Runtime - drives one user's engine from live collaborators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ConquestRuntime                         │
//! │                                                              │
//! │  LocationSource ──signal──▶ ConquestEngine ──ticket──┐       │
//! │                                 ▲                    │       │
//! │                                 │ deliver            ▼       │
//! │                                 │            resolve (worker)│
//! │                                 │                    │       │
//! │                                 └──── commit ◀───────┘       │
//! │                                          │                   │
//! │                                   TerritoryStore             │
//! │                                          │                   │
//! │            broadcast: RuntimeEvent, TerritoryChange          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Signals are handled strictly in arrival order. A closed loop is resolved
//! against the store's current window on a blocking worker, committed, and
//! only then delivered back to the engine, so the user never sees a claim
//! the store refused. On a commit conflict the window is re-fetched and the
//! candidate re-resolved, up to `max_commit_retries` times.
//!
//! # Usage
//!
//! ```ignore
//! let ctx = TokioContext::shared();
//! let (tx, source) = ChannelLocationSource::channel(64);
//! let store = Arc::new(SledTerritoryStore::open("territories.db")?);
//! let mut runtime = ConquestRuntime::new(ctx, Arc::new(source), store, user, Default::default());
//!
//! runtime.begin()?;
//! runtime.run().await?;
//! ```

use crate::conquest_state::{ConquestEvent, ConquestState, EvaluationTicket};
use crate::engine::{ConquestEngine, ConquestUpdate, EngineConfig};
use crate::error::ConquestError;
use crate::territory_resolver::OverlapResolution;
use crate::territory_store::{CommitReceipt, CommitRequest, StoreError, TerritoryStore};
use crate::window::TerritoryChange;
use conquest_env::{ConquestContext, LocationSignal, LocationSource, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Broadcast channel depth for runtime events and territory changes
const CHANNEL_CAPACITY: usize = 256;

/// Configuration for the conquest runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,

    /// Timeout polling period while no signal arrives (default: 1000)
    pub tick_interval_ms: u64,

    /// Re-resolve attempts after a store conflict (default: 3)
    pub max_commit_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            tick_interval_ms: 1000,
            max_commit_retries: 3,
        }
    }
}

/// Everything the runtime reports to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Update(ConquestUpdate),
    Committed(CommitReceipt),
    PermissionDenied,
    LocationUnavailable(String),

    /// The claim could not be settled; the attempt was cancelled
    AttemptAbandoned(ConquestError),
}

/// Runtime for a single user, generic over its environment.
pub struct ConquestRuntime<Ctx, Src, Store>
where
    Ctx: ConquestContext,
    Src: LocationSource,
    Store: TerritoryStore + 'static,
{
    pub user_id: UserId,
    context: Arc<Ctx>,
    source: Arc<Src>,
    store: Arc<Store>,
    config: RuntimeConfig,
    engine: ConquestEngine,
    events: broadcast::Sender<RuntimeEvent>,
    changes: broadcast::Sender<TerritoryChange>,
}

impl<Ctx, Src, Store> ConquestRuntime<Ctx, Src, Store>
where
    Ctx: ConquestContext,
    Src: LocationSource,
    Store: TerritoryStore + 'static,
{
    pub fn new(
        context: Arc<Ctx>,
        source: Arc<Src>,
        store: Arc<Store>,
        user_id: UserId,
        config: RuntimeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            user_id,
            context,
            source,
            store,
            engine: ConquestEngine::new(config.engine),
            config,
            events,
            changes,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Realtime territory feed, for `TerritoryWindow`s of nearby users.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<TerritoryChange> {
        self.changes.subscribe()
    }

    pub fn engine(&self) -> &ConquestEngine {
        &self.engine
    }

    pub fn state(&self) -> ConquestState {
        self.engine.state(&self.user_id)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Starts an attempt at the context's current time.
    pub fn begin(&mut self) -> Result<ConquestUpdate, ConquestError> {
        let update = self.engine.begin_conquest(&self.user_id, self.context.unix_millis())?;
        self.publish(&update);
        Ok(update)
    }

    pub fn cancel(&mut self) -> Result<ConquestUpdate, ConquestError> {
        let update = self.engine.cancel_conquest(&self.user_id)?;
        self.publish(&update);
        Ok(update)
    }

    /// Fails the attempt if it outlived its deadline.
    pub fn tick(&mut self) -> Vec<ConquestUpdate> {
        let updates = self.engine.poll_timeouts(self.context.unix_millis());
        for update in &updates {
            self.publish(update);
        }
        updates
    }

    /// Handles one location signal; returns the updates it caused.
    pub async fn handle_signal(&mut self, signal: LocationSignal) -> Result<Vec<ConquestUpdate>, ConquestError> {
        let fix = match signal {
            LocationSignal::Fix(fix) => fix,
            LocationSignal::PermissionDenied => {
                warn!(user = %self.user_id, "location permission denied");
                let _ = self.events.send(RuntimeEvent::PermissionDenied);
                return Ok(Vec::new());
            }
            LocationSignal::Unavailable(reason) => {
                warn!(user = %self.user_id, %reason, "location unavailable");
                let _ = self.events.send(RuntimeEvent::LocationUnavailable(reason));
                return Ok(Vec::new());
            }
        };

        let update = match self.engine.report_location(&self.user_id, fix) {
            Ok(update) => update,
            Err(ConquestError::NotTracking) => {
                debug!(user = %self.user_id, "fix while idle ignored");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        self.publish(&update);

        let ConquestEvent::EvaluationRequested(ticket) = &update.event else {
            return Ok(vec![update]);
        };
        let ticket = ticket.clone();
        let outcome = self.evaluate(ticket).await?;
        Ok(vec![update, outcome])
    }

    /// Drains the location source until it closes, polling timeouts
    /// whenever it stays silent for a tick.
    pub async fn run(&mut self) -> Result<(), ConquestError> {
        let source = Arc::clone(&self.source);
        let context = Arc::clone(&self.context);
        let tick = Duration::from_millis(self.config.tick_interval_ms);

        info!(user = %self.user_id, seed = context.seed(), "conquest runtime started");
        loop {
            tokio::select! {
                biased;
                signal = source.next_signal() => match signal {
                    Some(signal) => {
                        // failures are attempt-scoped and already published
                        if let Err(err) = self.handle_signal(signal).await {
                            debug!(user = %self.user_id, %err, "signal ended the attempt");
                        }
                        self.tick();
                    }
                    None => break,
                },
                _ = context.sleep(tick) => {
                    self.tick();
                }
            }
        }
        info!(user = %self.user_id, "location feed closed, runtime stopped");
        Ok(())
    }

    /// Resolve, commit, then deliver. Any failure cancels the attempt so
    /// the engine never stays in Evaluating.
    async fn evaluate(&mut self, ticket: EvaluationTicket) -> Result<ConquestUpdate, ConquestError> {
        match self.settle(&ticket).await {
            Ok((resolution, receipt)) => {
                if let Some(receipt) = receipt {
                    for change in TerritoryChange::from_receipt(&receipt) {
                        let _ = self.changes.send(change);
                    }
                    let _ = self.events.send(RuntimeEvent::Committed(receipt));
                }
                Ok(self.deliver(&ticket, resolution))
            }
            Err(err) => {
                warn!(user = %self.user_id, %err, "claim could not be settled, abandoning attempt");
                if let Err(cancel_err) = self.cancel() {
                    debug!(user = %self.user_id, %cancel_err, "attempt already gone");
                }
                let _ = self.events.send(RuntimeEvent::AttemptAbandoned(err.clone()));
                Err(err)
            }
        }
    }

    /// Resolves and, for a claim, commits. Re-resolves on commit conflicts.
    async fn settle(
        &self,
        ticket: &EvaluationTicket,
    ) -> Result<(OverlapResolution, Option<CommitReceipt>), ConquestError> {
        let mut retries = 0;
        loop {
            let resolution = self.resolve(ticket).await?;
            let now_ms = self.context.unix_millis();

            let Some(request) = CommitRequest::for_resolution(ticket, &resolution, now_ms) else {
                return Ok((resolution, None));
            };

            let store = Arc::clone(&self.store);
            match off_thread(move || store.commit(request)).await? {
                Ok(receipt) => return Ok((resolution, Some(receipt))),
                Err(StoreError::Conflict(reason)) if retries < self.config.max_commit_retries => {
                    retries += 1;
                    warn!(user = %self.user_id, %reason, retries, "commit conflict, re-resolving");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Fetches a fresh window and runs the resolver, both on a blocking worker.
    async fn resolve(&self, ticket: &EvaluationTicket) -> Result<OverlapResolution, ConquestError> {
        let store = Arc::clone(&self.store);
        let bounds = ticket.bounds;
        let territories = off_thread(move || store.territories_in(&bounds)).await??;

        let resolver = self.engine.resolver().clone();
        let candidate = ticket.candidate.clone();
        let claimant = ticket.claimant.clone();
        off_thread(move || resolver.resolve(&candidate, &claimant, &territories)).await
    }

    fn deliver(&mut self, ticket: &EvaluationTicket, resolution: OverlapResolution) -> ConquestUpdate {
        let update = self
            .engine
            .deliver_resolution(&ticket.claimant, ticket.attempt_id, resolution);
        self.publish(&update);
        update
    }

    fn publish(&self, update: &ConquestUpdate) {
        let _ = self.events.send(RuntimeEvent::Update(update.clone()));
    }
}

/// Runs blocking work (sled I/O, polygon clipping) off the async task.
async fn off_thread<T, F>(work: F) -> Result<T, ConquestError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ConquestError::Worker(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_math::{offset_meters, polygon_area};
    use crate::polygon::{BoundingBox, Polygon};
    use crate::territory::{CandidateTerritory, Territory};
    use crate::territory_resolver::RejectionReason;
    use crate::territory_store::SledTerritoryStore;
    use crate::window::TerritoryWindow;
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use conquest_env::{ChannelLocationSource, Coordinate, PathPoint, TerritoryId};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    const T0: i64 = 1_700_000_000_000;

    /// Context with a hand-set wall clock.
    struct ManualClock {
        millis: AtomicI64,
    }

    impl ManualClock {
        fn at(millis: i64) -> Arc<Self> {
            Arc::new(Self {
                millis: AtomicI64::new(millis),
            })
        }

        fn set(&self, millis: i64) {
            self.millis.store(millis, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConquestContext for ManualClock {
        fn now(&self) -> Duration {
            Duration::from_millis((self.millis.load(Ordering::SeqCst) - T0).max(0) as u64)
        }

        fn system_time(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_millis(self.millis.load(Ordering::SeqCst) as u64)
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        fn seed(&self) -> u64 {
            0
        }
    }

    /// Store that lets a rival claim land just before the first commit.
    struct RacingStore {
        inner: SledTerritoryStore,
        rival: Polygon,
        raced: AtomicBool,
    }

    impl TerritoryStore for RacingStore {
        fn territories_in(&self, bounds: &BoundingBox) -> Result<Vec<Territory>, StoreError> {
            self.inner.territories_in(bounds)
        }

        fn get(&self, id: &TerritoryId) -> Result<Territory, StoreError> {
            self.inner.get(id)
        }

        fn commit(&self, request: CommitRequest) -> Result<CommitReceipt, StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.commit(CommitRequest {
                    territory: CandidateTerritory::new(UserId::from("bob"), self.rival.clone()),
                    displaced_territory_ids: BTreeSet::new(),
                    basis: Vec::new(),
                    now_ms: request.now_ms,
                })?;
            }
            self.inner.commit(request)
        }

        fn territories_of(&self, owner: &UserId) -> Result<Vec<Territory>, StoreError> {
            self.inner.territories_of(owner)
        }
    }

    /// Store whose reads fail while `failing` is set.
    struct FlakyStore {
        inner: SledTerritoryStore,
        failing: AtomicBool,
    }

    impl TerritoryStore for FlakyStore {
        fn territories_in(&self, bounds: &BoundingBox) -> Result<Vec<Territory>, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Storage("disk hiccup".to_string()));
            }
            self.inner.territories_in(bounds)
        }

        fn get(&self, id: &TerritoryId) -> Result<Territory, StoreError> {
            self.inner.get(id)
        }

        fn commit(&self, request: CommitRequest) -> Result<CommitReceipt, StoreError> {
            self.inner.commit(request)
        }

        fn territories_of(&self, owner: &UserId) -> Result<Vec<Territory>, StoreError> {
            self.inner.territories_of(owner)
        }
    }

    fn origin() -> Coordinate {
        Coordinate::new(45.4642, 9.19).unwrap() // Milan
    }

    fn point(e: f64, n: f64) -> Coordinate {
        offset_meters(&origin(), e, n).unwrap()
    }

    fn square_walk() -> Vec<LocationSignal> {
        [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0), (1.0, 2.0)]
            .iter()
            .enumerate()
            .map(|(i, &(e, n))| {
                LocationSignal::Fix(PathPoint::new(point(e, n), T0 + 1000 * (i as i64 + 1), 5.0))
            })
            .collect()
    }

    async fn feed(signals: Vec<LocationSignal>) -> Arc<ChannelLocationSource> {
        let (tx, source) = ChannelLocationSource::channel(signals.len() + 1);
        for signal in signals {
            tx.send(signal).await.unwrap();
        }
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_square_claim_is_committed_and_broadcast() {
        let store = Arc::new(SledTerritoryStore::open_temp().unwrap());
        let source = feed(square_walk()).await;
        let mut runtime = ConquestRuntime::new(
            ManualClock::at(T0),
            source,
            Arc::clone(&store),
            UserId::from("alice"),
            RuntimeConfig::default(),
        );
        let mut changes = runtime.subscribe_changes();
        let mut events = runtime.subscribe_events();

        runtime.begin().unwrap();
        runtime.run().await.unwrap();

        assert_eq!(runtime.state(), ConquestState::Idle);
        assert_eq!(store.len(), 1);

        let mut window = TerritoryWindow::default();
        while let Ok(change) = changes.try_recv() {
            window.apply(change);
        }
        assert_eq!(window.len(), 1);
        let claimed = window.iter().next().unwrap();
        assert_relative_eq!(claimed.area_square_meters, 10_000.0, max_relative = 1e-3);

        let mut saw_success = false;
        let mut saw_commit = false;
        while let Ok(event) = events.try_recv() {
            match event {
                RuntimeEvent::Update(u) if u.state == ConquestState::Succeeded => saw_success = true,
                RuntimeEvent::Committed(_) => saw_commit = true,
                _ => {}
            }
        }
        assert!(saw_success && saw_commit);
    }

    #[tokio::test]
    async fn test_commit_conflict_re_resolves() {
        // bob's rival square overlaps the east half of alice's walk
        let rival = Polygon::new(vec![point(50.0, -20.0), point(150.0, -20.0), point(150.0, 120.0), point(50.0, 120.0)])
            .unwrap();
        let store = Arc::new(RacingStore {
            inner: SledTerritoryStore::open_temp().unwrap(),
            rival,
            raced: AtomicBool::new(false),
        });
        let mut runtime = ConquestRuntime::new(
            ManualClock::at(T0),
            feed(Vec::new()).await,
            Arc::clone(&store),
            UserId::from("alice"),
            RuntimeConfig::default(),
        );

        runtime.begin().unwrap();
        let mut last = Vec::new();
        for signal in square_walk() {
            last = runtime.handle_signal(signal).await.unwrap();
        }

        let outcome = last.last().unwrap();
        assert_eq!(outcome.state, ConquestState::Succeeded);
        let ConquestEvent::Claimed(claim) = &outcome.event else {
            panic!("expected claim, got {:?}", outcome.event);
        };
        // only the west half survives the re-resolve
        assert_relative_eq!(claim.territory.area_square_meters, 5_000.0, max_relative = 1e-2);
        assert_eq!(claim.basis.len(), 1);

        let alice = store.territories_of(&UserId::from("alice")).unwrap();
        assert_eq!(alice.len(), 1);
        assert_relative_eq!(polygon_area(&alice[0].polygon), 5_000.0, max_relative = 1e-2);
    }

    #[tokio::test]
    async fn test_store_failure_abandons_attempt() {
        let store = Arc::new(FlakyStore {
            inner: SledTerritoryStore::open_temp().unwrap(),
            failing: AtomicBool::new(true),
        });
        let clock = ManualClock::at(T0);
        let mut runtime = ConquestRuntime::new(
            Arc::clone(&clock),
            feed(Vec::new()).await,
            Arc::clone(&store),
            UserId::from("alice"),
            RuntimeConfig::default(),
        );
        let mut events = runtime.subscribe_events();

        runtime.begin().unwrap();
        let mut result = Ok(Vec::new());
        for signal in square_walk() {
            result = runtime.handle_signal(signal).await;
        }
        assert!(matches!(result, Err(ConquestError::Store(_))));
        assert_eq!(runtime.state(), ConquestState::Idle);

        let mut abandoned = false;
        while let Ok(event) = events.try_recv() {
            abandoned |= matches!(event, RuntimeEvent::AttemptAbandoned(ConquestError::Store(_)));
        }
        assert!(abandoned);

        // the next attempt starts cleanly once the store recovers
        store.failing.store(false, Ordering::SeqCst);
        clock.set(T0 + 60_000);
        runtime.begin().unwrap();
        let mut last = Vec::new();
        for signal in square_walk() {
            let LocationSignal::Fix(mut fix) = signal else { continue };
            fix.timestamp_ms += 60_000;
            last = runtime.handle_signal(LocationSignal::Fix(fix)).await.unwrap();
        }
        assert_eq!(last.last().map(|u| u.state), Some(ConquestState::Succeeded));
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_run_survives_store_failure() {
        let store = Arc::new(FlakyStore {
            inner: SledTerritoryStore::open_temp().unwrap(),
            failing: AtomicBool::new(true),
        });
        let mut runtime = ConquestRuntime::new(
            ManualClock::at(T0),
            feed(square_walk()).await,
            store,
            UserId::from("alice"),
            RuntimeConfig::default(),
        );

        runtime.begin().unwrap();
        runtime.run().await.unwrap();
        assert_eq!(runtime.state(), ConquestState::Idle);
    }

    #[tokio::test]
    async fn test_silence_times_out_on_tick() {
        let clock = ManualClock::at(T0);
        let mut runtime = ConquestRuntime::new(
            Arc::clone(&clock),
            feed(Vec::new()).await,
            Arc::new(SledTerritoryStore::open_temp().unwrap()),
            UserId::from("alice"),
            RuntimeConfig::default(),
        );

        runtime.begin().unwrap();
        clock.set(T0 + 29 * 60 * 1000);
        assert!(runtime.tick().is_empty());

        clock.set(T0 + 30 * 60 * 1000);
        let updates = runtime.tick();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].event, ConquestEvent::Failed(RejectionReason::AttemptTimedOut));
        assert_eq!(runtime.state(), ConquestState::Idle);
    }

    #[tokio::test]
    async fn test_provider_status_is_surfaced() {
        let mut runtime = ConquestRuntime::new(
            ManualClock::at(T0),
            feed(Vec::new()).await,
            Arc::new(SledTerritoryStore::open_temp().unwrap()),
            UserId::from("alice"),
            RuntimeConfig::default(),
        );
        let mut events = runtime.subscribe_events();

        // a fix with no live attempt is dropped quietly
        let idle = runtime
            .handle_signal(LocationSignal::Fix(PathPoint::new(point(0.0, 0.0), T0, 5.0)))
            .await
            .unwrap();
        assert!(idle.is_empty());

        runtime.handle_signal(LocationSignal::PermissionDenied).await.unwrap();
        runtime
            .handle_signal(LocationSignal::Unavailable("no satellites".to_string()))
            .await
            .unwrap();

        assert_eq!(events.try_recv().unwrap(), RuntimeEvent::PermissionDenied);
        assert_eq!(
            events.try_recv().unwrap(),
            RuntimeEvent::LocationUnavailable("no satellites".to_string())
        );
    }

    #[test]
    fn test_runtime_config_from_json() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"max_commit_retries": 7, "engine": {"tracker": {"max_accuracy_m": 15.0}}}"#)
                .unwrap();
        assert_eq!(config.max_commit_retries, 7);
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.engine.tracker.max_accuracy_m, 15.0);
        assert_eq!(config.engine.tracker.min_movement_m, 3.0);
    }
}
