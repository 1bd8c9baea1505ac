//! ConquestStateMachine - lifecycle of one user's conquest attempt.
//!
//! ```text
//!            start                loop closed               claimed
//!   Idle ───────────▶ Tracking ───────────────▶ Evaluating ─────────▶ Succeeded ─┐
//!    ▲                  │  ▲ fix                    │ rejected                    │
//!    │                  │  └──┘                     └───────────────▶ Failed ─────┤
//!    │                  │ timeout ──────────────────────────────────▶ Failed ─────┤
//!    │                  │ cancel (any active state) ────────────────▶ Cancelled ──┤
//!    └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Terminal states are reported in the returned `Step` and the machine is
//! back in `Idle` immediately afterwards. The machine is presentation
//! agnostic: the UI maps `ConquestState` to icons and colours itself.

use crate::error::ConquestError;
use crate::path_tracker::{FixRejection, PathTracker, PathTrackerEvent, TrackerConfig};
use crate::polygon::{BoundingBox, Polygon};
use crate::territory::CandidateTerritory;
use crate::territory_resolver::{
    OverlapResolution, RejectionReason, ResolutionOutcome, TerritoryVersion,
};
use conquest_env::{PathPoint, TerritoryId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConquestState {
    Idle,
    Tracking,
    Evaluating,
    Succeeded,
    Failed,
    Cancelled,
}

/// Work order for the resolver, emitted when a loop closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTicket {
    pub attempt_id: Uuid,
    pub claimant: UserId,
    pub candidate: Polygon,

    /// Region to fetch relevant territories for
    pub bounds: BoundingBox,
}

/// A successful claim, ready for the caller to persist and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimReady {
    pub attempt_id: Uuid,
    pub territory: CandidateTerritory,
    pub displaced_territory_ids: BTreeSet<TerritoryId>,
    pub basis: Vec<TerritoryVersion>,
}

/// What happened as the result of one input.
#[derive(Debug, Clone, PartialEq)]
pub enum ConquestEvent {
    Started { attempt_id: Uuid },
    Continuing,
    FixRejected(FixRejection),
    EvaluationRequested(EvaluationTicket),
    Claimed(ClaimReady),
    Failed(RejectionReason),
    Cancelled,
    /// A resolver result arrived for an attempt that is no longer evaluating
    StaleResolution,
    /// Nothing to do
    Unchanged,
}

/// The state to report plus the event that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: ConquestState,
    pub event: ConquestEvent,
}

impl Step {
    fn new(state: ConquestState, event: ConquestEvent) -> Self {
        Self { state, event }
    }
}

#[derive(Debug, Clone)]
struct ActiveAttempt {
    id: Uuid,
    user_id: UserId,
    started_at_ms: i64,
}

/// One user's conquest lifecycle.
#[derive(Debug, Clone)]
pub struct ConquestStateMachine {
    state: ConquestState,
    tracker: PathTracker,
    attempt: Option<ActiveAttempt>,
    max_attempt_duration_ms: i64,
}

impl ConquestStateMachine {
    pub fn new(tracker: TrackerConfig, max_attempt_duration_ms: i64) -> Self {
        Self {
            state: ConquestState::Idle,
            tracker: PathTracker::new(tracker),
            attempt: None,
            max_attempt_duration_ms,
        }
    }

    pub fn state(&self) -> ConquestState {
        self.state
    }

    pub fn attempt_id(&self) -> Option<Uuid> {
        self.attempt.as_ref().map(|a| a.id)
    }

    pub fn started_at_ms(&self) -> Option<i64> {
        self.attempt.as_ref().map(|a| a.started_at_ms)
    }

    /// Accepted fixes of the live attempt.
    pub fn path(&self) -> &[PathPoint] {
        self.tracker.path()
    }

    /// Idle → Tracking.
    pub fn start(&mut self, user_id: UserId, now_ms: i64) -> Result<Step, ConquestError> {
        if self.state != ConquestState::Idle {
            return Err(ConquestError::AlreadyTracking);
        }
        self.tracker.start()?;

        let id = Uuid::new_v4();
        info!(user = %user_id, attempt = %id, "conquest attempt started");
        self.attempt = Some(ActiveAttempt {
            id,
            user_id,
            started_at_ms: now_ms,
        });
        self.state = ConquestState::Tracking;
        Ok(Step::new(ConquestState::Tracking, ConquestEvent::Started { attempt_id: id }))
    }

    /// Feeds one fix to the live attempt.
    pub fn on_fix(&mut self, point: PathPoint) -> Result<Step, ConquestError> {
        match self.state {
            ConquestState::Tracking => {}
            ConquestState::Evaluating => {
                // the evaluated path is closed; later fixes never join it
                return Ok(Step::new(
                    ConquestState::Evaluating,
                    ConquestEvent::FixRejected(FixRejection::Evaluating),
                ));
            }
            _ => return Err(ConquestError::NotTracking),
        }

        let started_at_ms = self.attempt.as_ref().map_or(i64::MIN, |a| a.started_at_ms);
        if point.timestamp_ms < started_at_ms {
            debug!(timestamp_ms = point.timestamp_ms, started_at_ms, "fix predates the attempt");
            return Ok(Step::new(
                ConquestState::Tracking,
                ConquestEvent::FixRejected(FixRejection::OutOfOrder),
            ));
        }
        if let Some(step) = self.poll_timeout(point.timestamp_ms) {
            return Ok(step);
        }

        match self.tracker.add_fix(point)? {
            PathTrackerEvent::Continuing => {
                Ok(Step::new(ConquestState::Tracking, ConquestEvent::Continuing))
            }
            PathTrackerEvent::Rejected(reason) => {
                Ok(Step::new(ConquestState::Tracking, ConquestEvent::FixRejected(reason)))
            }
            PathTrackerEvent::LoopClosed(candidate) => {
                let Some(attempt) = self.attempt.as_ref() else {
                    return Err(ConquestError::NotTracking);
                };
                info!(
                    user = %attempt.user_id,
                    attempt = %attempt.id,
                    vertices = candidate.vertex_count(),
                    "loop closed, evaluating claim"
                );
                let ticket = EvaluationTicket {
                    attempt_id: attempt.id,
                    claimant: attempt.user_id.clone(),
                    bounds: candidate.bounds(),
                    candidate,
                };
                self.state = ConquestState::Evaluating;
                Ok(Step::new(
                    ConquestState::Evaluating,
                    ConquestEvent::EvaluationRequested(ticket),
                ))
            }
        }
    }

    /// Applies a resolver result to the attempt it was computed for.
    pub fn on_resolution(&mut self, attempt_id: Uuid, resolution: OverlapResolution) -> Step {
        let current = self.attempt.as_ref().filter(|a| a.id == attempt_id);
        let Some(attempt) = current.filter(|_| self.state == ConquestState::Evaluating) else {
            warn!(attempt = %attempt_id, state = ?self.state, "discarding stale resolution");
            return Step::new(self.state, ConquestEvent::StaleResolution);
        };

        let step = match (resolution.outcome, resolution.final_polygon) {
            (ResolutionOutcome::Claimed, Some(polygon)) => {
                let territory = CandidateTerritory::new(attempt.user_id.clone(), polygon);
                info!(
                    user = %attempt.user_id,
                    area_m2 = territory.area_square_meters,
                    "territory claimed"
                );
                Step::new(
                    ConquestState::Succeeded,
                    ConquestEvent::Claimed(ClaimReady {
                        attempt_id,
                        territory,
                        displaced_territory_ids: resolution.displaced_territory_ids,
                        basis: resolution.basis,
                    }),
                )
            }
            (ResolutionOutcome::Rejected(reason), _) => {
                info!(user = %attempt.user_id, ?reason, "claim rejected");
                Step::new(ConquestState::Failed, ConquestEvent::Failed(reason))
            }
            (ResolutionOutcome::Claimed, None) => Step::new(
                ConquestState::Failed,
                ConquestEvent::Failed(RejectionReason::TooSmallOrDegenerate),
            ),
        };
        self.reset();
        step
    }

    /// Aborts the live attempt. In `Idle` there is nothing to cancel.
    pub fn cancel(&mut self) -> Step {
        if self.state == ConquestState::Idle {
            return Step::new(ConquestState::Idle, ConquestEvent::Unchanged);
        }
        if let Some(attempt) = &self.attempt {
            info!(user = %attempt.user_id, attempt = %attempt.id, "conquest attempt cancelled");
        }
        self.reset();
        Step::new(ConquestState::Cancelled, ConquestEvent::Cancelled)
    }

    /// Fails a Tracking attempt that outlived its maximum duration.
    pub fn poll_timeout(&mut self, now_ms: i64) -> Option<Step> {
        if self.state != ConquestState::Tracking {
            return None;
        }
        let attempt = self.attempt.as_ref()?;
        if now_ms.saturating_sub(attempt.started_at_ms) < self.max_attempt_duration_ms {
            return None;
        }
        warn!(
            user = %attempt.user_id,
            attempt = %attempt.id,
            points = self.tracker.path().len(),
            "conquest attempt timed out"
        );
        self.reset();
        Some(Step::new(
            ConquestState::Failed,
            ConquestEvent::Failed(RejectionReason::AttemptTimedOut),
        ))
    }

    fn reset(&mut self) {
        self.tracker.cancel();
        self.attempt = None;
        self.state = ConquestState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_math::offset_meters;
    use crate::territory_resolver::TerritoryResolver;
    use conquest_env::Coordinate;

    const T0: i64 = 1_700_000_000_000;

    fn fix(e: f64, n: f64, t: i64) -> PathPoint {
        let origin = Coordinate::new(35.6762, 139.6503).unwrap(); // Tokyo
        PathPoint::new(offset_meters(&origin, e, n).unwrap(), t, 4.0)
    }

    fn machine() -> ConquestStateMachine {
        ConquestStateMachine::new(TrackerConfig::default(), 60_000)
    }

    /// Drives a 100 m square walk until the loop closes.
    fn close_square(m: &mut ConquestStateMachine) -> EvaluationTicket {
        let walk = [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0), (1.0, 2.0)];
        let mut ticket = None;
        for (i, &(e, n)) in walk.iter().enumerate() {
            let step = m.on_fix(fix(e, n, T0 + 1000 * (i as i64 + 1))).unwrap();
            if let ConquestEvent::EvaluationRequested(t) = step.event {
                ticket = Some(t);
            }
        }
        ticket.expect("square walk should close")
    }

    #[test]
    fn test_second_start_is_already_tracking() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();
        assert_eq!(m.start(UserId::from("u1"), T0), Err(ConquestError::AlreadyTracking));
    }

    #[test]
    fn test_fix_while_idle_is_not_tracking() {
        let mut m = machine();
        assert_eq!(m.on_fix(fix(0.0, 0.0, T0)), Err(ConquestError::NotTracking));
    }

    #[test]
    fn test_full_claim_cycle() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();
        let ticket = close_square(&mut m);
        assert_eq!(m.state(), ConquestState::Evaluating);

        let resolution = TerritoryResolver::default().resolve(&ticket.candidate, &ticket.claimant, &[]);
        let step = m.on_resolution(ticket.attempt_id, resolution);

        assert_eq!(step.state, ConquestState::Succeeded);
        match step.event {
            ConquestEvent::Claimed(claim) => {
                assert_eq!(claim.territory.owner_user_id, UserId::from("u1"));
                assert!((claim.territory.area_square_meters - 10_000.0).abs() < 50.0);
            }
            other => panic!("expected claim, got {:?}", other),
        }
        assert_eq!(m.state(), ConquestState::Idle);
    }

    #[test]
    fn test_fixes_during_evaluation_are_discarded() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();
        close_square(&mut m);
        let path_len = m.path().len();

        let step = m.on_fix(fix(300.0, 300.0, T0 + 10_000)).unwrap();
        assert_eq!(step.event, ConquestEvent::FixRejected(FixRejection::Evaluating));
        assert_eq!(m.path().len(), path_len);
    }

    #[test]
    fn test_resolution_after_cancel_is_stale() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();
        let ticket = close_square(&mut m);

        assert_eq!(m.cancel().state, ConquestState::Cancelled);
        assert_eq!(m.state(), ConquestState::Idle);

        let resolution = TerritoryResolver::default().resolve(&ticket.candidate, &ticket.claimant, &[]);
        let step = m.on_resolution(ticket.attempt_id, resolution);
        assert_eq!(step.event, ConquestEvent::StaleResolution);
        assert_eq!(m.state(), ConquestState::Idle);
    }

    #[test]
    fn test_resolution_for_previous_attempt_is_stale() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();
        let old = close_square(&mut m);
        m.cancel();

        m.start(UserId::from("u1"), T0 + 20_000).unwrap();
        let resolution = TerritoryResolver::default().resolve(&old.candidate, &old.claimant, &[]);
        let step = m.on_resolution(old.attempt_id, resolution);
        assert_eq!(step.event, ConquestEvent::StaleResolution);
        assert_eq!(m.state(), ConquestState::Tracking);
    }

    #[test]
    fn test_tracking_timeout() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();
        m.on_fix(fix(0.0, 0.0, T0 + 1000)).unwrap();

        assert!(m.poll_timeout(T0 + 59_999).is_none());
        let step = m.poll_timeout(T0 + 60_000).unwrap();
        assert_eq!(step.state, ConquestState::Failed);
        assert_eq!(step.event, ConquestEvent::Failed(RejectionReason::AttemptTimedOut));
        assert_eq!(m.state(), ConquestState::Idle);
    }

    #[test]
    fn test_late_fix_times_out() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();
        let step = m.on_fix(fix(0.0, 0.0, T0 + 120_000)).unwrap();
        assert_eq!(step.event, ConquestEvent::Failed(RejectionReason::AttemptTimedOut));
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut m = machine();
        m.start(UserId::from("u1"), T0).unwrap();

        let step = m.on_fix(fix(0.0, 0.0, i64::MIN)).unwrap();
        assert_eq!(step.event, ConquestEvent::FixRejected(FixRejection::OutOfOrder));
        assert_eq!(m.state(), ConquestState::Tracking);
        assert!(m.poll_timeout(i64::MIN).is_none());

        let step = m.on_fix(fix(0.0, 0.0, i64::MAX)).unwrap();
        assert_eq!(step.event, ConquestEvent::Failed(RejectionReason::AttemptTimedOut));
        assert_eq!(m.state(), ConquestState::Idle);
    }

    #[test]
    fn test_cancel_in_idle_is_unchanged() {
        let mut m = machine();
        assert_eq!(m.cancel().event, ConquestEvent::Unchanged);
    }
}
