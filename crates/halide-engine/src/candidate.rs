//! Candidates and the registry that owns them.
//!
//! A [`Candidate`] is one surface the engine may transform. Discovery
//! produces fresh candidates on every scan; [`Registry::merge`] folds
//! them into the long-lived records that carry lifecycle state, the
//! last successful fingerprint, the in-flight marker, and the commit
//! record needed to undo a transform.
//!
//! The in-flight marker ([`JobToken`]) is the only mutual exclusion in
//! the engine: it is set before a job starts and cleared after it ends,
//! so at most one job ever runs per candidate.

use std::collections::BTreeMap;

use halide_pipeline::Fingerprint;
use serde::Serialize;
use tracing::debug;

use crate::error::EngineError;
use crate::host::{AssetUrl, Rect, SurfaceContext, SurfaceId, SurfaceKind};
use crate::resilience::CommitRecord;

/// Scheduling tier. All regular candidates of a run are dispatched
/// before any large one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    /// Below the large threshold on both axes.
    Regular,
    /// At or above the large threshold on either axis.
    Large,
}

/// Where a candidate is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Lifecycle {
    /// Seen by a scan, not yet considered by the scheduler.
    Discovered,
    /// Accepted by the scheduler, waiting for admission.
    Queued,
    /// A job holds the in-flight marker.
    Processing,
    /// The transformed asset is displayed and guarded.
    Committed,
    /// The original reference was restored.
    Reverted,
    /// The last job failed; the surface is untouched.
    Failed {
        /// Retried on the next scan with unchanged settings.
        retryable: bool,
    },
    /// Nothing to do under the current settings.
    Skipped,
}

/// Identity of one job, compared before commit to discard stale results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobToken(u64);

/// One transformable surface.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Host identity.
    pub id: SurfaceId,
    /// Image node or background.
    pub kind: SurfaceKind,
    /// Layout box at the last scan.
    pub rect: Rect,
    /// Original content locator. Never a produced asset.
    pub source: String,
    /// Scheduling tier.
    pub tier: Tier,
    /// Intersects the viewport itself (not just the expanded window).
    pub visible: bool,
    /// Gap to the viewport at the last scan (0 when visible).
    pub distance: f64,
    /// Wrapper/role/host context for strategy selection.
    pub context: SurfaceContext,
    /// Lifecycle state.
    pub state: Lifecycle,
    /// Fingerprint of the last successful commit.
    pub fingerprint: Option<Fingerprint>,
    /// In-flight marker.
    pub in_flight: Option<JobToken>,
    /// How to undo the current transform.
    pub commit: Option<CommitRecord>,
    /// Most recent failure.
    pub last_error: Option<EngineError>,
}

impl Candidate {
    /// A freshly discovered candidate.
    #[must_use]
    pub fn discovered(
        id: SurfaceId,
        kind: SurfaceKind,
        rect: Rect,
        source: String,
        tier: Tier,
        distance: f64,
        context: SurfaceContext,
    ) -> Self {
        Self {
            id,
            kind,
            rect,
            source,
            tier,
            visible: distance <= 0.0,
            distance,
            context,
            state: Lifecycle::Discovered,
            fingerprint: None,
            in_flight: None,
            commit: None,
            last_error: None,
        }
    }

    /// The asset currently displayed for this candidate, if committed.
    #[must_use]
    pub fn committed_asset(&self) -> Option<&AssetUrl> {
        self.commit.as_ref().map(|record| &record.asset)
    }
}

/// Long-lived candidate records keyed by surface id.
#[derive(Debug, Default)]
pub struct Registry {
    candidates: BTreeMap<SurfaceId, Candidate>,
    next_token: u64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a scanned candidate into its record and return its id.
    ///
    /// Layout, tier and context are refreshed. The source is kept when
    /// the scan sees our own committed asset; any other new locator is
    /// treated as new content.
    pub fn merge(&mut self, scanned: Candidate) -> SurfaceId {
        let id = scanned.id;
        match self.candidates.get_mut(&id) {
            Some(existing) => {
                existing.kind = scanned.kind;
                existing.rect = scanned.rect;
                existing.tier = scanned.tier;
                existing.visible = scanned.visible;
                existing.distance = scanned.distance;
                existing.context = scanned.context;
                let ours = existing
                    .committed_asset()
                    .is_some_and(|asset| asset.as_str() == scanned.source);
                if !ours && existing.source != scanned.source {
                    debug!(surface = id, source = %scanned.source, "surface content changed");
                    existing.source = scanned.source;
                }
            }
            None => {
                self.candidates.insert(id, scanned);
            }
        }
        id
    }

    /// Candidate record for `id`.
    #[must_use]
    pub fn get(&self, id: SurfaceId) -> Option<&Candidate> {
        self.candidates.get(&id)
    }

    /// Mutable candidate record for `id`.
    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Candidate> {
        self.candidates.get_mut(&id)
    }

    /// Stop tracking `id`.
    pub fn remove(&mut self, id: SurfaceId) -> Option<Candidate> {
        self.candidates.remove(&id)
    }

    /// Remove every record whose surface fails `attached`.
    pub fn prune(&mut self, mut attached: impl FnMut(SurfaceId) -> bool) -> Vec<Candidate> {
        let gone: Vec<SurfaceId> = self
            .candidates
            .keys()
            .copied()
            .filter(|id| !attached(*id))
            .collect();
        gone.into_iter()
            .filter_map(|id| self.candidates.remove(&id))
            .collect()
    }

    /// Set the in-flight marker for `id` and move it to `Processing`.
    ///
    /// Returns `None` if the candidate is unknown or already in flight.
    pub fn begin(&mut self, id: SurfaceId) -> Option<JobToken> {
        let candidate = self.candidates.get_mut(&id)?;
        if candidate.in_flight.is_some() {
            return None;
        }
        let token = JobToken(self.next_token);
        self.next_token += 1;
        candidate.in_flight = Some(token);
        candidate.state = Lifecycle::Processing;
        Some(token)
    }

    /// Returns `true` if `token` still holds the marker for `id`.
    #[must_use]
    pub fn holds(&self, id: SurfaceId, token: JobToken) -> bool {
        self.candidates
            .get(&id)
            .is_some_and(|c| c.in_flight == Some(token))
    }

    /// Clear the marker for `id` if `token` holds it.
    pub fn release(&mut self, id: SurfaceId, token: JobToken) {
        if let Some(candidate) = self.candidates.get_mut(&id)
            && candidate.in_flight == Some(token)
        {
            candidate.in_flight = None;
        }
    }

    /// Number of candidates currently in `Processing`.
    #[must_use]
    pub fn processing(&self) -> usize {
        self.candidates
            .values()
            .filter(|c| c.state == Lifecycle::Processing)
            .count()
    }

    /// Returns `true` if any commit record displays `asset`.
    #[must_use]
    pub fn displays(&self, asset: &AssetUrl) -> bool {
        self.candidates
            .values()
            .any(|c| c.committed_asset() == Some(asset))
    }

    /// Ids of candidates carrying a commit record.
    #[must_use]
    pub fn committed(&self) -> Vec<SurfaceId> {
        self.candidates
            .values()
            .filter(|c| c.commit.is_some())
            .map(|c| c.id)
            .collect()
    }

    /// Every record, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    /// Number of tracked candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Drop every record, returning them.
    pub fn drain(&mut self) -> Vec<Candidate> {
        std::mem::take(&mut self.candidates).into_values().collect()
    }
}
