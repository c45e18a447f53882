//! halide-engine: coordination core for grading images embedded in a
//! live document.
//!
//! The pixel work lives in `halide-pipeline`. This crate decides *which*
//! surfaces to grade, *when*, and *how* the result stays on screen:
//!
//! - [`discovery`] finds candidate surfaces near the viewport and tiers
//!   them by size.
//! - [`scheduler`] admits jobs under a concurrency ceiling and a memory
//!   budget, paces visible work in batches and off-screen work in idle
//!   slices, and bounds every job with a timeout.
//! - [`cache`] remembers published results by [`Fingerprint`] so a
//!   settings round-trip never re-runs a pixel pass.
//! - [`resilience`] commits results either by rewriting the surface's
//!   reference behind a write guard or by covering it with a supervised
//!   overlay, and undoes either on revert.
//! - [`context`] owns all of the above in one [`Pipeline`] handle and
//!   reacts to settings changes and host notifications.
//!
//! The engine never touches a document or a clock directly; it talks to
//! its environment through the [`Host`] and [`Runtime`] traits. The
//! browser implementation lives in `halide-web`.
//!
//! Everything runs on one cooperative thread. State sits behind
//! `Rc<RefCell<_>>` and is never borrowed across an `.await`; the only
//! per-candidate mutual exclusion is the in-flight marker set before a
//! job starts.
//!
//! [`Fingerprint`]: halide_pipeline::Fingerprint

pub mod cache;
pub mod candidate;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod host;
pub mod message;
pub mod resilience;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use cache::ResultCache;
pub use candidate::{Candidate, Lifecycle, Tier};
pub use config::{CacheLimits, DiscoveryLimits, EngineConfig, ResilienceConfig, SchedulerLimits};
pub use context::{Pipeline, Stats};
pub use error::EngineError;
pub use host::{
    AssetUrl, Host, HostEvent, Rect, Runtime, SurfaceContext, SurfaceId, SurfaceInfo,
    SurfaceKind, SurfaceReference,
};
pub use message::{ControlMessage, ControlResponse, ProxyRequest, ProxyResponse};
pub use resilience::{RuleSelector, Strategy, StrategySelector};
pub use scheduler::ProcessingSummary;
