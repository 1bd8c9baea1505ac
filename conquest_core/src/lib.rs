//! Conquest Core - GPS territory capture
//!
//! Turns a live stream of GPS fixes into claimed territories:
//! 1. **Path tracking**: noisy fixes are filtered and the path is watched for
//!    a closed loop
//! 2. **Geometry**: candidate loops are checked for simplicity and measured
//!    on a local tangent plane
//! 3. **Conflict resolution**: the claimant's own ground is excluded, foreign
//!    ground is subtracted or, when fully enclosed, displaced
//! 4. **Lifecycle**: one state machine per attempt, with timeouts and
//!    stale-result rejection
//!
//! The engine performs no I/O. `runtime` wires it to a `LocationSource`, a
//! `TerritoryStore` and a realtime change feed.

pub mod error;
pub mod polygon;
pub mod geo_math;
pub mod path_tracker;
pub mod territory;
pub mod territory_resolver;
pub mod conquest_state;
pub mod engine;
pub mod territory_store;
pub mod window;
pub mod runtime;

// Re-export key types for convenience
pub use conquest_state::{ClaimReady, ConquestEvent, ConquestState, ConquestStateMachine, EvaluationTicket};
pub use engine::{ConquestEngine, ConquestUpdate, EngineConfig};
pub use error::ConquestError;
pub use path_tracker::{FixRejection, PathTracker, PathTrackerEvent, TrackerConfig};
pub use polygon::{BoundingBox, Polygon};
pub use runtime::{ConquestRuntime, RuntimeConfig, RuntimeEvent};
pub use territory::{CandidateTerritory, Territory};
pub use territory_resolver::{OverlapResolution, RejectionReason, ResolutionOutcome, ResolverConfig, TerritoryResolver};
pub use territory_store::{CommitReceipt, CommitRequest, SledTerritoryStore, StoreError, TerritoryStore};
pub use window::{TerritoryChange, TerritoryWindow};
