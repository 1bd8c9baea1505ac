//! Conquest Deterministic Simulation Harness
//!
//! Runs the real `ConquestRuntime` against simulated walkers on a virtual
//! clock, so whole conquest sessions replay identically from one seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: `SimContext` only moves when a fix arrives or a scenario
//!   advances it
//! - **Location**: `ScriptedLocationSource` replays fixes the `Walker`
//!   generated from a seeded RNG
//! - **Storage**: every run gets a fresh temporary sled store
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                        │
//! │                                                          │
//! │   Walker ──fixes──▶ ScriptedLocationSource               │
//! │  (ground truth          │                                │
//! │   + GPS noise)          ▼                                │
//! │                  ConquestRuntime ──commit──▶ SledStore   │
//! │                         │                                │
//! │                         └──changes──▶ TerritoryWindow    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use conquest_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Contested);
//! assert!(result.passed);
//! ```

mod context;
mod location;
mod runner;
mod walker;
pub mod scenarios;

pub use context::{SimContext, SIM_EPOCH_MS};
pub use location::{ScriptStep, ScriptedLocationSource};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use walker::{Route, Walker, WalkerConfig};
