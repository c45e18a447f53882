//! Committing transformed assets and keeping them on screen.
//!
//! Two strategies:
//!
//! - **Direct** rewrites the surface's own reference and guards it. Host
//!   writes observed afterwards are replayed through
//!   [`GuardedReference::set`] as unauthorized; a rejected write is
//!   undone by re-asserting the committed asset.
//! - **Overlay** leaves the surface's reference alone, hides the surface
//!   (without detaching it), and shows the asset in a presentation node
//!   placed exactly over it. A supervisor task re-inserts the overlay
//!   on a fixed interval for a bounded window and stops as soon as the
//!   surface leaves the document. The supervisor is cancelled through
//!   the [`AbortHandle`] stored in the commit record.
//!
//! Which strategy a candidate gets is a [`StrategySelector`] decision.
//! [`RuleSelector`] is the configurable default.

use std::rc::Rc;

use futures::FutureExt;
use futures::future::{AbortHandle, abortable};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::candidate::{Candidate, Lifecycle};
use crate::config::ResilienceConfig;
use crate::error::EngineError;
use crate::host::{AssetUrl, Host, SurfaceId, SurfaceKind, SurfaceReference};

/// How a committed asset is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Rewrite the surface's reference.
    Direct,
    /// Cover the surface with a presentation node.
    Overlay,
}

/// Capability-gated wrapper around a surface reference.
///
/// Unlocked, every write is accepted. Locked, only authorized writes
/// are; unauthorized ones are rejected and the held value is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedReference {
    value: SurfaceReference,
    locked: bool,
}

/// An unauthorized write hit a locked [`GuardedReference`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("write rejected: reference is locked")]
pub struct WriteRejected;

impl GuardedReference {
    /// An unlocked guard holding `value`.
    #[must_use]
    pub const fn new(value: SurfaceReference) -> Self {
        Self {
            value,
            locked: false,
        }
    }

    /// The held value.
    #[must_use]
    pub const fn get(&self) -> &SurfaceReference {
        &self.value
    }

    /// Write `value`.
    ///
    /// # Errors
    ///
    /// Returns [`WriteRejected`] if the guard is locked and the write is
    /// not authorized.
    pub fn set(&mut self, value: SurfaceReference, authorized: bool) -> Result<(), WriteRejected> {
        if self.locked && !authorized {
            return Err(WriteRejected);
        }
        self.value = value;
        Ok(())
    }

    /// Reject unauthorized writes from now on.
    pub const fn lock(&mut self) {
        self.locked = true;
    }

    /// Accept every write again.
    pub const fn unlock(&mut self) {
        self.locked = false;
    }

    /// Returns `true` while locked.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }
}

/// Everything needed to keep or undo a commit.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    /// Strategy used.
    pub strategy: Strategy,
    /// Asset on display.
    pub asset: AssetUrl,
    /// Reference the surface had before the first commit.
    pub original: SurfaceReference,
    /// Write guard (direct strategy).
    pub guard: Option<GuardedReference>,
    /// Overlay supervisor (overlay strategy).
    pub supervisor: Option<AbortHandle>,
}

/// Picks a strategy for a candidate.
pub trait StrategySelector {
    /// Strategy for `candidate`.
    fn select(&self, candidate: &Candidate) -> Strategy;
}

/// Rule-based strategy selection, configured from data.
///
/// Overlay is chosen for image surfaces inside `<picture>` or carrying
/// `srcset` (when the matching flag is set), for surfaces whose role is
/// listed, and for documents whose host matches a listed domain (exact
/// or subdomain). Everything else is direct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleSelector {
    /// Overlay surfaces inside `<picture>`.
    pub overlay_in_picture: bool,
    /// Overlay surfaces carrying `srcset`.
    pub overlay_with_srcset: bool,
    /// ARIA roles that get an overlay.
    pub overlay_roles: Vec<String>,
    /// Host names (and their subdomains) that get an overlay.
    pub overlay_hosts: Vec<String>,
}

impl Default for RuleSelector {
    fn default() -> Self {
        Self {
            overlay_in_picture: true,
            overlay_with_srcset: true,
            overlay_roles: Vec::new(),
            overlay_hosts: Vec::new(),
        }
    }
}

impl RuleSelector {
    fn host_matches(&self, host: &str) -> bool {
        self.overlay_hosts.iter().any(|pattern| {
            let pattern = pattern.trim_start_matches('.');
            host == pattern
                || host
                    .strip_suffix(pattern)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl StrategySelector for RuleSelector {
    fn select(&self, candidate: &Candidate) -> Strategy {
        let context = &candidate.context;
        let wrapped = candidate.kind == SurfaceKind::Image
            && ((self.overlay_in_picture && context.in_picture)
                || (self.overlay_with_srcset && context.has_srcset));
        let role = context
            .role
            .as_deref()
            .is_some_and(|role| self.overlay_roles.iter().any(|r| r == role));
        if wrapped || role || self.host_matches(&context.host) {
            Strategy::Overlay
        } else {
            Strategy::Direct
        }
    }
}

/// Display `asset` on `candidate`'s surface and store the commit record.
///
/// A candidate that is already committed keeps its original reference,
/// so revert still restores the page's own content. If the strategy
/// changed, the previous commit is undone first. Returns the asset that
/// was displayed before, for the caller to release.
///
/// # Errors
///
/// Returns [`EngineError::Surface`] if the surface cannot be read or
/// written. The candidate keeps whatever it displayed before.
pub fn commit<H: Host>(
    host: &Rc<H>,
    candidate: &mut Candidate,
    asset: AssetUrl,
    strategy: Strategy,
    config: &ResilienceConfig,
) -> Result<Option<AssetUrl>, EngineError> {
    let id = candidate.id;
    let mut replaced = None;
    if candidate
        .commit
        .as_ref()
        .is_some_and(|record| record.strategy != strategy)
        && let Some(record) = candidate.commit.take()
    {
        replaced = Some(undo(host.as_ref(), id, record));
    }
    let original = match &candidate.commit {
        Some(record) => record.original.clone(),
        None => host.read_reference(id).ok_or_else(|| {
            EngineError::Surface(format!("surface {id} has no readable reference"))
        })?,
    };

    let record = match strategy {
        Strategy::Direct => {
            let target = SurfaceReference::pointing_at(candidate.kind, asset.as_str());
            host.write_reference(id, &target)?;
            let mut guard = GuardedReference::new(target);
            guard.lock();
            CommitRecord {
                strategy,
                asset,
                original,
                guard: Some(guard),
                supervisor: None,
            }
        }
        Strategy::Overlay => {
            host.insert_overlay(id, &asset)?;
            host.set_hidden(id, true);
            let supervisor = supervise_overlay(host, id, asset.clone(), config);
            CommitRecord {
                strategy,
                asset,
                original,
                guard: None,
                supervisor: Some(supervisor),
            }
        }
    };
    debug!(surface = id, asset = %record.asset, ?strategy, "committed");

    if let Some(previous) = candidate.commit.replace(record) {
        if let Some(handle) = previous.supervisor {
            handle.abort();
        }
        replaced = Some(previous.asset);
    }
    candidate.state = Lifecycle::Committed;
    Ok(replaced)
}

/// Undo `candidate`'s commit, if any: restore the original reference, or
/// remove the overlay and un-hide the surface. Clears the commit record
/// and returns the asset that was displayed.
pub fn revert<H: Host + ?Sized>(host: &H, candidate: &mut Candidate) -> Option<AssetUrl> {
    let record = candidate.commit.take()?;
    candidate.state = Lifecycle::Reverted;
    candidate.fingerprint = None;
    Some(undo(host, candidate.id, record))
}

fn undo<H: Host + ?Sized>(host: &H, id: SurfaceId, record: CommitRecord) -> AssetUrl {
    match record.strategy {
        Strategy::Direct => {
            let mut guard = record
                .guard
                .unwrap_or_else(|| GuardedReference::new(record.original.clone()));
            if guard.set(record.original, true).is_ok() {
                guard.unlock();
            }
            if host.is_attached(id)
                && let Err(e) = host.write_reference(id, guard.get())
            {
                warn!(surface = id, error = %e, "failed to restore original reference");
            }
        }
        Strategy::Overlay => {
            if let Some(handle) = record.supervisor {
                handle.abort();
            }
            host.remove_overlay(id);
            host.set_hidden(id, false);
        }
    }
    debug!(surface = id, "reverted");
    record.asset
}

/// Drop a record whose surface has left the document: stop its
/// supervisor and take down any overlay left behind.
pub fn forget<H: Host + ?Sized>(host: &H, id: SurfaceId, record: CommitRecord) -> AssetUrl {
    if let Some(handle) = record.supervisor {
        handle.abort();
    }
    if record.strategy == Strategy::Overlay {
        host.remove_overlay(id);
    }
    record.asset
}

/// Outcome of replaying a host-observed write through a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheck {
    /// The write matched what the commit expects: our own write echoed
    /// back, or an untouched reference under an overlay.
    Echo,
    /// The write was rejected and the committed asset re-asserted.
    Rejected,
    /// No guard applies and the reference really changed.
    Unguarded,
}

/// Replay a host-observed write to `record`'s surface as unauthorized.
pub fn check_write<H: Host>(
    host: &H,
    id: SurfaceId,
    record: &mut CommitRecord,
    value: SurfaceReference,
) -> WriteCheck {
    let Some(guard) = record.guard.as_mut() else {
        // Overlay commits leave the surface's own reference alone.
        return if record.original == value {
            WriteCheck::Echo
        } else {
            WriteCheck::Unguarded
        };
    };
    if guard.get() == &value {
        return WriteCheck::Echo;
    }
    match guard.set(value, false) {
        Ok(()) => WriteCheck::Unguarded,
        Err(WriteRejected) => {
            trace!(surface = id, "external write rejected");
            if let Err(e) = host.write_reference(id, guard.get()) {
                warn!(surface = id, error = %e, "failed to re-assert committed asset");
            }
            WriteCheck::Rejected
        }
    }
}

/// Spawn the overlay supervisor for `id` and return its handle.
fn supervise_overlay<H: Host>(
    host: &Rc<H>,
    id: SurfaceId,
    asset: AssetUrl,
    config: &ResilienceConfig,
) -> AbortHandle {
    let interval = config.overlay_check_interval;
    let deadline = host.now() + config.overlay_supervision;
    let task_host = Rc::clone(host);
    let task = async move {
        loop {
            task_host.sleep(interval).await;
            if !task_host.is_attached(id) {
                trace!(surface = id, "overlay supervisor: surface detached");
                break;
            }
            if !task_host.overlay_attached(id) {
                debug!(surface = id, "overlay supervisor: re-inserting overlay");
                if let Err(e) = task_host.insert_overlay(id, &asset) {
                    warn!(surface = id, error = %e, "overlay re-insert failed");
                }
            }
            task_host.set_hidden(id, true);
            if task_host.now() >= deadline {
                break;
            }
        }
    };
    let (task, handle) = abortable(task);
    host.spawn(task.map(|_| ()).boxed_local());
    handle
}
