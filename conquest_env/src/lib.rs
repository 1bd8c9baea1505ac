//! Conquest Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary that lets the conquest engine
//! run both on a device (tokio) and inside the deterministic simulator.
//!
//! # Core Concept
//!
//! Everything the engine cannot control is intercepted here:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - The live GPS feed (`LocationSource`)
//! - Raw inputs (`Coordinate`, `PathPoint`), validated at the boundary
//!
//! # Example
//!
//! ```ignore
//! use conquest_env::{ConquestContext, LocationSource, LocationSignal};
//!
//! async fn pump<Ctx: ConquestContext, Src: LocationSource>(ctx: &Ctx, src: &Src) {
//!     while let Some(signal) = src.next_signal().await {
//!         if let LocationSignal::Fix(fix) = signal {
//!             handle_fix(fix, ctx.unix_millis());
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod location;
mod tokio_impl;
mod types;

pub use context::ConquestContext;
pub use error::EnvError;
pub use location::{LocationSignal, LocationSource};
pub use tokio_impl::{ChannelLocationSource, TokioContext};
pub use types::{Coordinate, PathPoint, TerritoryId, UserId};
