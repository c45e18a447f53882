//! Job admission, tiered dispatch, and the per-candidate job.
//!
//! A run walks the regular tier, then the large tier. Within a tier,
//! visible candidates go out in batches of `batch_size` (each batch is
//! awaited, then the scheduler pauses so the host can render) and
//! off-screen candidates go out one per idle slice.
//!
//! Before dispatch every candidate is triaged:
//!
//! - in flight: skipped;
//! - committed under the current fingerprint (and not forced): skipped;
//! - cached under the current fingerprint (and not forced): the cached
//!   asset is committed directly, with no pixel pass;
//! - otherwise a job is spawned.
//!
//! Admission is global across concurrent runs: at most `max_concurrent`
//! jobs are in `Processing`, and a job whose estimated decoded size would
//! push the in-flight total past `memory_budget` waits `memory_pause`
//! and tries again instead of being rejected.
//!
//! Each job races its work against `job_timeout`. On expiry the work is
//! dropped and the in-flight marker is cleared at once; otherwise the
//! marker is cleared `release_delay` after the job ends. Before
//! committing, a job checks that it still holds the marker and that the
//! settings epoch has not moved, and discards its result if not.

use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{Either, select};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use halide_pipeline::{Fingerprint, Grade, RgbaImage, Settings, render};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::candidate::{JobToken, Lifecycle};
use crate::context::{Shared, State};
use crate::error::EngineError;
use crate::host::{AssetUrl, Host, SurfaceId};
use crate::message::{ProxyRequest, ProxyResponse};
use crate::resilience;

/// What one scheduling run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSummary {
    /// Candidates handed to the scheduler.
    pub considered: usize,
    /// Jobs spawned.
    pub dispatched: usize,
    /// Candidates committed straight from the cache.
    pub cached: usize,
    /// Candidates with nothing to do.
    pub skipped: usize,
    /// Jobs that committed.
    pub committed: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Jobs that hit the time bound.
    pub timed_out: usize,
    /// Jobs whose result arrived after their marker or epoch moved on.
    pub discarded: usize,
    /// Pauses inserted by the memory budget.
    pub memory_pauses: usize,
}

impl ProcessingSummary {
    fn record(&mut self, outcome: Result<JobOutcome, oneshot::Canceled>) {
        match outcome {
            Ok(JobOutcome::Committed) => self.committed += 1,
            Ok(JobOutcome::Failed(_)) => self.failed += 1,
            Ok(JobOutcome::TimedOut) => self.timed_out += 1,
            Ok(JobOutcome::Discarded) | Err(oneshot::Canceled) => self.discarded += 1,
        }
    }
}

/// Inputs shared by every job of one run.
#[derive(Debug, Clone)]
pub(crate) struct JobContext {
    pub settings: Rc<Settings>,
    pub grade: Rc<Grade>,
    pub epoch: u64,
    pub force: bool,
}

#[derive(Debug)]
enum JobOutcome {
    Committed,
    Failed(EngineError),
    TimedOut,
    Discarded,
}

enum Triage {
    Skip,
    FromCache(Fingerprint, AssetUrl),
    Dispatch(Fingerprint, u64),
}

type Pending = FuturesUnordered<oneshot::Receiver<JobOutcome>>;

/// Run the scheduler over `regular` then `large`.
#[allow(clippy::future_not_send)] // single-threaded; Rc state is !Send
pub(crate) async fn run<H: Host>(
    shared: &Rc<Shared<H>>,
    regular: Vec<SurfaceId>,
    large: Vec<SurfaceId>,
    ctx: &JobContext,
) -> ProcessingSummary {
    let limits = &shared.config.scheduler;
    let mut summary = ProcessingSummary {
        considered: regular.len() + large.len(),
        ..ProcessingSummary::default()
    };
    let mut pending = Pending::new();

    for tier in [regular, large] {
        let (visible, offscreen): (Vec<SurfaceId>, Vec<SurfaceId>) = {
            let state = shared.state.borrow();
            tier.into_iter()
                .partition(|id| state.registry.get(*id).is_some_and(|c| c.visible))
        };

        for (index, batch) in visible.chunks(limits.batch_size.max(1)).enumerate() {
            if index > 0 {
                shared.host.sleep(limits.batch_pause).await;
            }
            for &id in batch {
                dispatch(shared, id, ctx, &mut pending, &mut summary).await;
            }
            drain(&mut pending, &mut summary).await;
        }

        for id in offscreen {
            shared.host.idle().await;
            dispatch(shared, id, ctx, &mut pending, &mut summary).await;
        }
        drain(&mut pending, &mut summary).await;
    }
    summary
}

#[allow(clippy::future_not_send)]
async fn drain(pending: &mut Pending, summary: &mut ProcessingSummary) {
    while let Some(outcome) = pending.next().await {
        summary.record(outcome);
    }
}

#[allow(clippy::future_not_send)]
async fn dispatch<H: Host>(
    shared: &Rc<Shared<H>>,
    id: SurfaceId,
    ctx: &JobContext,
    pending: &mut Pending,
    summary: &mut ProcessingSummary,
) {
    if !shared.is_current_epoch(ctx.epoch) {
        summary.skipped += 1;
        return;
    }
    let triage = triage(&mut shared.state.borrow_mut(), id, ctx);
    match triage {
        Triage::Skip => summary.skipped += 1,
        Triage::FromCache(fingerprint, asset) => {
            if commit_cached(shared, id, fingerprint, asset) {
                summary.cached += 1;
            } else {
                summary.failed += 1;
            }
        }
        Triage::Dispatch(fingerprint, bytes) => {
            admit(shared, bytes, pending, summary).await;
            if !shared.is_current_epoch(ctx.epoch) {
                summary.skipped += 1;
                return;
            }
            match start_job(shared, id, fingerprint, bytes, ctx) {
                Some(job) => {
                    pending.push(job);
                    summary.dispatched += 1;
                }
                None => summary.skipped += 1,
            }
        }
    }
}

fn triage(state: &mut State, id: SurfaceId, ctx: &JobContext) -> Triage {
    let Some(candidate) = state.registry.get_mut(id) else {
        return Triage::Skip;
    };
    if candidate.in_flight.is_some() {
        trace!(surface = id, "skip: in flight");
        return Triage::Skip;
    }
    let fingerprint = Fingerprint::new(candidate.source.as_str(), &ctx.settings);
    if !ctx.force && candidate.commit.is_some() && candidate.fingerprint.as_ref() == Some(&fingerprint)
    {
        trace!(surface = id, "skip: committed and unchanged");
        return Triage::Skip;
    }
    let bytes = candidate.rect.rgba_bytes();
    candidate.state = Lifecycle::Queued;
    if !ctx.force
        && let Some(entry) = state.cache.get(&fingerprint)
    {
        return Triage::FromCache(fingerprint, entry.asset.clone());
    }
    Triage::Dispatch(fingerprint, bytes)
}

/// Commit a cached asset without a pixel pass. Returns `false` if the
/// surface refused it.
fn commit_cached<H: Host>(
    shared: &Rc<Shared<H>>,
    id: SurfaceId,
    fingerprint: Fingerprint,
    asset: AssetUrl,
) -> bool {
    let mut guard = shared.state.borrow_mut();
    let state = &mut *guard;
    let Some(candidate) = state.registry.get_mut(id) else {
        return false;
    };
    let strategy = shared.selector.select(candidate);
    match resilience::commit(
        &shared.host,
        candidate,
        asset,
        strategy,
        &shared.config.resilience,
    ) {
        Ok(replaced) => {
            debug!(surface = id, %fingerprint, "committed from cache");
            candidate.fingerprint = Some(fingerprint);
            candidate.last_error = None;
            state.stats.cache_hits += 1;
            state.stats.commits += 1;
            state.release_unreferenced(shared.host.as_ref(), replaced);
            true
        }
        Err(e) => {
            warn!(surface = id, error = %e, "cached commit failed");
            candidate.state = Lifecycle::Failed { retryable: true };
            candidate.last_error = Some(e);
            state.stats.failures += 1;
            false
        }
    }
}

/// Wait until a job of `bytes` fits under the concurrency ceiling and
/// the memory budget.
#[allow(clippy::future_not_send)]
async fn admit<H: Host>(
    shared: &Rc<Shared<H>>,
    bytes: u64,
    pending: &mut Pending,
    summary: &mut ProcessingSummary,
) {
    let limits = &shared.config.scheduler;
    loop {
        let (active, in_flight_bytes) = {
            let state = shared.state.borrow();
            (state.active_jobs, state.active_bytes)
        };
        if active < limits.max_concurrent.max(1) {
            if active == 0 || in_flight_bytes.saturating_add(bytes) <= limits.memory_budget {
                return;
            }
            summary.memory_pauses += 1;
            debug!(in_flight_bytes, bytes, "memory budget reached; pausing");
            shared.host.sleep(limits.memory_pause).await;
            continue;
        }
        match pending.next().await {
            Some(outcome) => summary.record(outcome),
            // The ceiling is held by another run's jobs.
            None => shared.host.sleep(limits.batch_pause).await,
        }
    }
}

/// Take the marker for `id` and spawn its job.
fn start_job<H: Host>(
    shared: &Rc<Shared<H>>,
    id: SurfaceId,
    fingerprint: Fingerprint,
    bytes: u64,
    ctx: &JobContext,
) -> Option<oneshot::Receiver<JobOutcome>> {
    let (token, source) = {
        let mut guard = shared.state.borrow_mut();
        let state = &mut *guard;
        let token = state.registry.begin(id)?;
        let source = state.registry.get(id)?.source.clone();
        state.active_jobs += 1;
        state.active_bytes += bytes;
        state.stats.peak_processing = state.stats.peak_processing.max(state.registry.processing());
        (token, source)
    };
    debug!(surface = id, %fingerprint, "dispatching");

    let (tx, rx) = oneshot::channel();
    let task_shared = Rc::clone(shared);
    let ctx = ctx.clone();
    let task = async move {
        let limits = &task_shared.config.scheduler;
        let work = process(Rc::clone(&task_shared), id, token, source, fingerprint, ctx).boxed_local();
        let outcome = match select(work, task_shared.host.sleep(limits.job_timeout)).await {
            Either::Left((outcome, _)) => outcome,
            Either::Right(((), _)) => JobOutcome::TimedOut,
        };
        let timed_out = matches!(outcome, JobOutcome::TimedOut);
        finish(&task_shared, id, token, bytes, &outcome);
        if tx.send(outcome).is_err() {
            trace!(surface = id, "run no longer waiting for job");
        }
        if !timed_out {
            task_shared.host.sleep(limits.release_delay).await;
            task_shared.state.borrow_mut().registry.release(id, token);
        }
    };
    shared.host.spawn(task.boxed_local());
    Some(rx)
}

/// Settle bookkeeping for a finished job.
fn finish<H: Host>(
    shared: &Shared<H>,
    id: SurfaceId,
    token: JobToken,
    bytes: u64,
    outcome: &JobOutcome,
) {
    let mut guard = shared.state.borrow_mut();
    let state = &mut *guard;
    state.active_jobs = state.active_jobs.saturating_sub(1);
    state.active_bytes = state.active_bytes.saturating_sub(bytes);

    let timeout = shared.config.scheduler.job_timeout;
    let Some(candidate) = state.registry.get_mut(id) else {
        return;
    };
    match outcome {
        JobOutcome::Committed => {}
        JobOutcome::Failed(error) => {
            warn!(surface = id, %error, "job failed");
            if candidate.in_flight == Some(token) {
                candidate.state = Lifecycle::Failed { retryable: true };
            }
            candidate.last_error = Some(error.clone());
            state.stats.failures += 1;
        }
        JobOutcome::TimedOut => {
            warn!(surface = id, ?timeout, "job timed out");
            if candidate.in_flight == Some(token) {
                candidate.in_flight = None;
                candidate.state = Lifecycle::Failed { retryable: true };
            }
            candidate.last_error = Some(EngineError::Timeout(timeout));
            state.stats.timeouts += 1;
        }
        JobOutcome::Discarded => {
            if candidate.state == Lifecycle::Processing {
                candidate.state = Lifecycle::Skipped;
            }
        }
    }
}

/// Load, render, publish, commit.
#[allow(clippy::future_not_send)]
async fn process<H: Host>(
    shared: Rc<Shared<H>>,
    id: SurfaceId,
    token: JobToken,
    source: String,
    fingerprint: Fingerprint,
    ctx: JobContext,
) -> JobOutcome {
    let mut image = match load(&shared, &source).await {
        Ok(image) => image,
        Err(e) => return JobOutcome::Failed(e),
    };
    if !shared.holds(id, token, ctx.epoch, &source) {
        return JobOutcome::Discarded;
    }

    let rendered = render(&mut image, &ctx.grade, fingerprint.digest());
    trace!(surface = id, ?rendered, "rendered");
    let asset = match shared.host.publish(&image) {
        Ok(asset) => asset,
        Err(e) => return JobOutcome::Failed(e),
    };

    let mut guard = shared.state.borrow_mut();
    let state = &mut *guard;
    if rendered.lut_applied {
        state.stats.lut_passes += 1;
    }
    if !state.holds(id, token, ctx.epoch, &source) {
        debug!(surface = id, "discarding stale result");
        shared.host.release(&asset);
        return JobOutcome::Discarded;
    }

    let evicted = state
        .cache
        .put(fingerprint.clone(), asset.clone(), shared.host.now());
    let Some(candidate) = state.registry.get_mut(id) else {
        return JobOutcome::Discarded;
    };
    let strategy = shared.selector.select(candidate);
    let outcome = match resilience::commit(
        &shared.host,
        candidate,
        asset,
        strategy,
        &shared.config.resilience,
    ) {
        Ok(replaced) => {
            candidate.fingerprint = Some(fingerprint);
            candidate.last_error = None;
            state.stats.commits += 1;
            state.release_unreferenced(shared.host.as_ref(), replaced);
            JobOutcome::Committed
        }
        Err(e) => JobOutcome::Failed(e),
    };
    state.release_unreferenced(shared.host.as_ref(), evicted);
    outcome
}

/// Load pixels, falling back to the proxy once on an access failure.
#[allow(clippy::future_not_send)]
async fn load<H: Host>(shared: &Shared<H>, source: &str) -> Result<RgbaImage, EngineError> {
    let error = match shared.host.load_pixels(source).await {
        Ok(image) => return Ok(image),
        Err(e) if e.is_access_failure() => e,
        Err(e) => return Err(e),
    };

    debug!(source, %error, "direct load failed; trying proxy");
    shared.state.borrow_mut().stats.proxy_attempts += 1;
    let request = ProxyRequest {
        image_url: source.to_owned(),
    };
    match shared.host.proxy_fetch(request).await {
        ProxyResponse {
            success: true,
            data_url: Some(data_url),
            ..
        } => shared.host.load_pixels(&data_url).await,
        response => {
            debug!(source, proxy_error = ?response.error, "proxy failed");
            Err(error)
        }
    }
}
