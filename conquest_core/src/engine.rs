//! ConquestEngine - the façade consumed by the UI and persistence layers.
//!
//! Holds one `ConquestStateMachine` per user with a live attempt and a
//! shared `TerritoryResolver`. Every operation returns a `ConquestUpdate`
//! describing the user's new state and what happened; the engine performs
//! no I/O. Persisting a claim and broadcasting it are the caller's job,
//! triggered by a `ConquestEvent::Claimed` update.

use crate::conquest_state::{ConquestEvent, ConquestState, ConquestStateMachine, EvaluationTicket};
use crate::error::ConquestError;
use crate::path_tracker::TrackerConfig;
use crate::territory::Territory;
use crate::territory_resolver::{OverlapResolution, ResolverConfig, TerritoryResolver};
use conquest_env::{PathPoint, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the ConquestEngine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub resolver: ResolverConfig,

    /// Longest a Tracking phase may last before failing (default: 30 min)
    pub max_attempt_duration_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            resolver: ResolverConfig::default(),
            max_attempt_duration_ms: 30 * 60 * 1000,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConquestError> {
        serde_json::from_str(json)
            .map_err(|e| ConquestError::InvalidInput(format!("engine config: {}", e)))
    }
}

// ============================================================================
// UPDATES (Output)
// ============================================================================

/// Status emitted after every engine operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConquestUpdate {
    pub user_id: UserId,

    /// The state the UI should display
    pub state: ConquestState,

    pub event: ConquestEvent,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ConquestEngine {
    config: EngineConfig,
    resolver: TerritoryResolver,

    /// Live attempts; users without an entry are Idle
    attempts: HashMap<UserId, ConquestStateMachine>,
}

impl ConquestEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            resolver: TerritoryResolver::new(config.resolver),
            config,
            attempts: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The resolver, cloneable onto a worker thread.
    pub fn resolver(&self) -> &TerritoryResolver {
        &self.resolver
    }

    /// Current state of a user.
    pub fn state(&self, user_id: &UserId) -> ConquestState {
        self.attempts
            .get(user_id)
            .map(ConquestStateMachine::state)
            .unwrap_or(ConquestState::Idle)
    }

    /// Number of users with a live attempt.
    pub fn active_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Starts tracking for `user_id`.
    pub fn begin_conquest(&mut self, user_id: &UserId, now_ms: i64) -> Result<ConquestUpdate, ConquestError> {
        let config = self.config;
        let machine = self.attempts.entry(user_id.clone()).or_insert_with(|| {
            ConquestStateMachine::new(config.tracker, config.max_attempt_duration_ms)
        });
        let step = machine.start(user_id.clone(), now_ms)?;
        Ok(self.update(user_id, step.state, step.event))
    }

    /// Feeds one fix into the user's live attempt.
    pub fn report_location(&mut self, user_id: &UserId, fix: PathPoint) -> Result<ConquestUpdate, ConquestError> {
        let machine = self.attempts.get_mut(user_id).ok_or(ConquestError::NotTracking)?;
        let step = machine.on_fix(fix)?;
        Ok(self.update(user_id, step.state, step.event))
    }

    /// Aborts the user's live attempt.
    pub fn cancel_conquest(&mut self, user_id: &UserId) -> Result<ConquestUpdate, ConquestError> {
        let machine = self.attempts.get_mut(user_id).ok_or(ConquestError::NotTracking)?;
        let step = machine.cancel();
        if step.event == ConquestEvent::Unchanged {
            return Err(ConquestError::NotTracking);
        }
        Ok(self.update(user_id, step.state, step.event))
    }

    /// Runs the resolver for a ticket. Pure; safe to call from any thread
    /// via a cloned `resolver()`.
    pub fn resolve(&self, ticket: &EvaluationTicket, territories: &[Territory]) -> OverlapResolution {
        self.resolver.resolve(&ticket.candidate, &ticket.claimant, territories)
    }

    /// Hands a resolver result back to the attempt it belongs to.
    ///
    /// Results for cancelled or superseded attempts are discarded.
    pub fn deliver_resolution(
        &mut self,
        user_id: &UserId,
        attempt_id: Uuid,
        resolution: OverlapResolution,
    ) -> ConquestUpdate {
        let Some(machine) = self.attempts.get_mut(user_id) else {
            tracing::warn!(user = %user_id, attempt = %attempt_id, "resolution for idle user discarded");
            return self.update(user_id, ConquestState::Idle, ConquestEvent::StaleResolution);
        };
        let step = machine.on_resolution(attempt_id, resolution);
        self.update(user_id, step.state, step.event)
    }

    /// Synchronous resolve-and-deliver for callers without a worker.
    pub fn evaluate(&mut self, ticket: &EvaluationTicket, territories: &[Territory]) -> ConquestUpdate {
        let resolution = self.resolve(ticket, territories);
        self.deliver_resolution(&ticket.claimant, ticket.attempt_id, resolution)
    }

    /// Fails every Tracking attempt past its deadline. Ordered by user id.
    pub fn poll_timeouts(&mut self, now_ms: i64) -> Vec<ConquestUpdate> {
        let mut expired: Vec<(UserId, ConquestState, ConquestEvent)> = self
            .attempts
            .iter_mut()
            .filter_map(|(user, machine)| {
                machine
                    .poll_timeout(now_ms)
                    .map(|step| (user.clone(), step.state, step.event))
            })
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));

        expired
            .into_iter()
            .map(|(user, state, event)| self.update(&user, state, event))
            .collect()
    }

    /// Builds the update and drops machines that are back to Idle.
    fn update(&mut self, user_id: &UserId, state: ConquestState, event: ConquestEvent) -> ConquestUpdate {
        if self.state(user_id) == ConquestState::Idle {
            self.attempts.remove(user_id);
        }
        ConquestUpdate {
            user_id: user_id.clone(),
            state,
            event,
        }
    }
}
