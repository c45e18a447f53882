//! The pipeline context: one explicit object owning all engine state.
//!
//! [`Pipeline`] is a cheap handle (`Rc` inside) over the settings
//! snapshot, LUT library, discovery memo, candidate registry, result
//! cache, strategy selector, statistics, and the handles of background
//! tasks. Nothing lives in globals; every operation goes through a
//! handle.
//!
//! # State machine
//!
//! - **Settings change.** Disabled or preset `none`: every committed
//!   candidate is reverted and the cache is cleared. Enabled with a
//!   preset: discovery and the scheduler run immediately. Jobs started
//!   under older settings discard their results (the settings epoch moved).
//! - **Surfaces changed.** Notifications are coalesced for `debounce`
//!   (a generation counter drops all but the last) before a run.
//! - **Reference changed.** Replayed through the candidate's write guard.
//! - **Overlay removed.** The overlay is re-inserted at once.
//! - **Surface detached.** The candidate is forgotten and its supervisor
//!   cancelled.
//!
//! After each run a full-sweep rescan is scheduled `sweep_delay` later,
//! and the periodic new-content check is started if enabled.

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::{AbortHandle, abortable};
use halide_pipeline::{Grade, LutLibrary, Settings};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::candidate::{Lifecycle, Registry};
use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::error::EngineError;
use crate::host::{AssetUrl, Host, HostEvent, SurfaceId};
use crate::message::{ControlMessage, ControlResponse};
use crate::resilience::{self, StrategySelector, WriteCheck};
use crate::scheduler::{self, JobContext, ProcessingSummary};

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Discovery walks (memo hits included).
    pub scans: u64,
    /// LUT passes over pixel buffers.
    pub lut_passes: u64,
    /// Commits served from the result cache.
    pub cache_hits: u64,
    /// Successful commits (cached or rendered).
    pub commits: u64,
    /// Candidates reverted to their original reference.
    pub reverts: u64,
    /// Failed jobs and commits.
    pub failures: u64,
    /// Jobs that hit the time bound.
    pub timeouts: u64,
    /// External writes rejected by a write guard.
    pub rejected_writes: u64,
    /// Overlays re-inserted after removal.
    pub overlay_reinserts: u64,
    /// Cross-origin proxy attempts.
    pub proxy_attempts: u64,
    /// Highest number of candidates ever in `Processing` at once.
    pub peak_processing: usize,
}

/// Mutable engine state. Never borrowed across an `.await`.
#[derive(Debug)]
pub(crate) struct State {
    pub settings: Rc<Settings>,
    pub epoch: u64,
    pub generation: u64,
    pub torn_down: bool,
    pub library: LutLibrary,
    pub discovery: Discovery,
    pub registry: Registry,
    pub cache: ResultCache,
    pub stats: Stats,
    pub active_jobs: usize,
    pub active_bytes: u64,
    pub periodic: Option<AbortHandle>,
    pub sweep: Option<AbortHandle>,
}

impl State {
    /// Returns `true` if `token` still owns `id`, the epoch is unchanged,
    /// and the candidate still shows `source`.
    pub fn holds(
        &self,
        id: SurfaceId,
        token: crate::candidate::JobToken,
        epoch: u64,
        source: &str,
    ) -> bool {
        !self.torn_down
            && self.epoch == epoch
            && self.registry.holds(id, token)
            && self.registry.get(id).is_some_and(|c| c.source == source)
    }

    /// Release each asset that neither the cache nor a commit references.
    pub fn release_unreferenced<H: Host + ?Sized>(
        &self,
        host: &H,
        assets: impl IntoIterator<Item = AssetUrl>,
    ) {
        for asset in assets {
            if !self.cache.holds(&asset) && !self.registry.displays(&asset) {
                host.release(&asset);
            }
        }
    }
}

/// Everything a pipeline handle shares.
pub(crate) struct Shared<H: Host> {
    pub host: Rc<H>,
    pub config: EngineConfig,
    pub selector: Box<dyn StrategySelector>,
    pub state: RefCell<State>,
}

impl<H: Host> Shared<H> {
    pub fn is_current_epoch(&self, epoch: u64) -> bool {
        let state = self.state.borrow();
        !state.torn_down && state.epoch == epoch
    }

    pub fn holds(
        &self,
        id: SurfaceId,
        token: crate::candidate::JobToken,
        epoch: u64,
        source: &str,
    ) -> bool {
        self.state.borrow().holds(id, token, epoch, source)
    }
}

/// Handle to one pipeline instance.
pub struct Pipeline<H: Host> {
    shared: Rc<Shared<H>>,
}

impl<H: Host> Clone for Pipeline<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<H: Host> Pipeline<H> {
    /// Create a pipeline using the configured [`RuleSelector`](crate::RuleSelector).
    #[must_use]
    pub fn new(host: H, config: EngineConfig) -> Self {
        let selector = Box::new(config.strategy.clone());
        Self::with_selector(host, config, selector)
    }

    /// Create a pipeline with a custom strategy selector.
    #[must_use]
    pub fn with_selector(
        host: H,
        config: EngineConfig,
        selector: Box<dyn StrategySelector>,
    ) -> Self {
        let state = State {
            settings: Rc::new(Settings::default()),
            epoch: 0,
            generation: 0,
            torn_down: false,
            library: LutLibrary::new(),
            discovery: Discovery::new(config.discovery.clone()),
            registry: Registry::new(),
            cache: ResultCache::new(config.cache.clone()),
            stats: Stats::default(),
            active_jobs: 0,
            active_bytes: 0,
            periodic: None,
            sweep: None,
        };
        Self {
            shared: Rc::new(Shared {
                host: Rc::new(host),
                config,
                selector,
                state: RefCell::new(state),
            }),
        }
    }

    /// The host this pipeline drives.
    #[must_use]
    pub fn host(&self) -> &H {
        &self.shared.host
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The active settings snapshot.
    #[must_use]
    pub fn settings(&self) -> Rc<Settings> {
        Rc::clone(&self.shared.state.borrow().settings)
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.shared.state.borrow().stats
    }

    /// Number of cached renders.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.shared.state.borrow().cache.len()
    }

    /// Number of tracked candidates.
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.shared.state.borrow().registry.len()
    }

    /// Lifecycle state of the candidate for `id`.
    #[must_use]
    pub fn lifecycle(&self, id: SurfaceId) -> Option<Lifecycle> {
        self.shared.state.borrow().registry.get(id).map(|c| c.state)
    }

    /// Asset currently committed on `id`.
    #[must_use]
    pub fn committed_asset(&self, id: SurfaceId) -> Option<AssetUrl> {
        self.shared
            .state
            .borrow()
            .registry
            .get(id)
            .and_then(|c| c.committed_asset().cloned())
    }

    /// Replace the settings snapshot and act on it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Load`] if the preset cannot be fetched and
    /// [`EngineError::Parse`] if it cannot be parsed. Surfaces are left
    /// untouched in both cases.
    #[allow(clippy::future_not_send)] // single-threaded; Rc state is !Send
    pub async fn apply_settings(&self, settings: Settings) -> Result<ProcessingSummary, EngineError> {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.torn_down {
                return Ok(ProcessingSummary::default());
            }
            if *state.settings != settings {
                state.epoch += 1;
                info!(preset = %settings.preset_id, grain = settings.grain_enabled,
                    vignette = settings.vignette_enabled, enabled = settings.pipeline_enabled,
                    "settings changed");
            }
            state.settings = Rc::new(settings);
        }
        if !self.settings().is_active() {
            self.revert_all();
            return Ok(ProcessingSummary::default());
        }
        run_pass(&self.shared, false, false).await
    }

    /// Forced full rescan: reprocess every candidate, cached or not.
    ///
    /// # Errors
    ///
    /// Same as [`apply_settings`](Self::apply_settings).
    #[allow(clippy::future_not_send)]
    pub async fn refresh(&self) -> Result<ProcessingSummary, EngineError> {
        self.shared.state.borrow_mut().discovery.invalidate();
        run_pass(&self.shared, true, true).await
    }

    /// Handle a control message.
    #[allow(clippy::future_not_send)]
    pub async fn handle_message(&self, message: ControlMessage) -> ControlResponse {
        let result = match message.settings() {
            Some(settings) => self.apply_settings(settings).await,
            None if message == ControlMessage::Refresh => self.refresh().await,
            None => return ControlResponse::ok(),
        };
        match result {
            Ok(_) => ControlResponse::ok(),
            Err(e) => ControlResponse::failed(e),
        }
    }

    /// React to a host notification.
    pub fn notify(&self, event: HostEvent) {
        match event {
            HostEvent::SurfacesChanged => self.debounce(),
            HostEvent::SurfaceDetached(id) => {
                let mut state = self.shared.state.borrow_mut();
                if let Some(candidate) = state.registry.remove(id) {
                    debug!(surface = id, "surface detached");
                    if let Some(record) = candidate.commit {
                        let asset = resilience::forget(self.shared.host.as_ref(), id, record);
                        state.release_unreferenced(self.shared.host.as_ref(), [asset]);
                    }
                }
            }
            HostEvent::ReferenceChanged { id, value } => {
                let check = {
                    let mut guard = self.shared.state.borrow_mut();
                    let state = &mut *guard;
                    let check = state
                        .registry
                        .get_mut(id)
                        .and_then(|c| c.commit.as_mut())
                        .map(|record| {
                            resilience::check_write(self.shared.host.as_ref(), id, record, value)
                        });
                    if check == Some(WriteCheck::Rejected) {
                        state.stats.rejected_writes += 1;
                    }
                    check
                };
                if matches!(check, None | Some(WriteCheck::Unguarded)) {
                    self.debounce();
                }
            }
            HostEvent::OverlayRemoved(id) => {
                let mut guard = self.shared.state.borrow_mut();
                let state = &mut *guard;
                let host = self.shared.host.as_ref();
                let Some(record) = state.registry.get(id).and_then(|c| c.commit.as_ref()) else {
                    return;
                };
                if record.strategy != resilience::Strategy::Overlay
                    || !host.is_attached(id)
                    || host.overlay_attached(id)
                {
                    return;
                }
                debug!(surface = id, "overlay removed; re-inserting");
                match host.insert_overlay(id, &record.asset) {
                    Ok(()) => {
                        host.set_hidden(id, true);
                        state.stats.overlay_reinserts += 1;
                    }
                    Err(e) => warn!(surface = id, error = %e, "overlay re-insert failed"),
                }
            }
        }
    }

    /// Run an initial pass in the background and start the periodic
    /// new-content check.
    pub fn start(&self) {
        let shared = Rc::clone(&self.shared);
        self.shared.host.spawn(
            async move {
                if let Err(e) = run_pass(&shared, false, false).await {
                    warn!(error = %e, "initial pass failed");
                }
            }
            .boxed_local(),
        );
        ensure_periodic(&self.shared);
    }

    /// Stop background work, revert every surface, and release every asset.
    /// The pipeline is inert afterwards.
    pub fn teardown(&self) {
        self.revert_all();
        let mut state = self.shared.state.borrow_mut();
        state.torn_down = true;
        state.epoch += 1;
        state.generation += 1;
        if let Some(handle) = state.periodic.take() {
            handle.abort();
        }
        if let Some(handle) = state.sweep.take() {
            handle.abort();
        }
        for candidate in state.registry.drain() {
            if let Some(record) = candidate.commit {
                let host = self.shared.host.as_ref();
                host.release(&resilience::forget(host, candidate.id, record));
            }
        }
        info!("pipeline torn down");
    }

    /// Revert every committed candidate and clear the cache.
    fn revert_all(&self) {
        let mut guard = self.shared.state.borrow_mut();
        let state = &mut *guard;
        let host = self.shared.host.as_ref();
        let mut released = Vec::new();
        for id in state.registry.committed() {
            if let Some(candidate) = state.registry.get_mut(id)
                && let Some(asset) = resilience::revert(host, candidate)
            {
                state.stats.reverts += 1;
                released.push(asset);
            }
        }
        released.extend(state.cache.clear());
        released.sort_by(|a, b| a.0.cmp(&b.0));
        released.dedup();
        let count = released.len();
        state.release_unreferenced(host, released);
        if count > 0 {
            info!(released = count, "reverted all surfaces");
        }
    }

    fn debounce(&self) {
        let generation = {
            let mut state = self.shared.state.borrow_mut();
            state.generation += 1;
            state.generation
        };
        let shared = Rc::clone(&self.shared);
        let delay = self.shared.config.debounce;
        self.shared.host.spawn(
            async move {
                shared.host.sleep(delay).await;
                {
                    let mut state = shared.state.borrow_mut();
                    if state.generation != generation {
                        return;
                    }
                    // The document changed; a memoized scan would hide it.
                    state.discovery.invalidate();
                }
                if let Err(e) = run_pass(&shared, false, false).await {
                    warn!(error = %e, "debounced pass failed");
                }
            }
            .boxed_local(),
        );
    }
}

/// Discovery plus one scheduler run under the current settings.
#[allow(clippy::future_not_send)]
async fn run_pass<H: Host>(
    shared: &Rc<Shared<H>>,
    force: bool,
    full_sweep: bool,
) -> Result<ProcessingSummary, EngineError> {
    let (settings, epoch) = {
        let state = shared.state.borrow();
        if state.torn_down {
            return Ok(ProcessingSummary::default());
        }
        (Rc::clone(&state.settings), state.epoch)
    };
    if !settings.is_active() {
        return Ok(ProcessingSummary::default());
    }

    let grade = resolve_grade(shared, &settings).await?;
    if !shared.is_current_epoch(epoch) {
        return Ok(ProcessingSummary::default());
    }

    let (regular, large) = {
        let mut guard = shared.state.borrow_mut();
        let state = &mut *guard;
        let host = shared.host.as_ref();

        let detached = state.registry.prune(|id| host.is_attached(id));
        let forgotten: Vec<AssetUrl> = detached
            .into_iter()
            .filter_map(|c| {
                let id = c.id;
                c.commit.map(|record| resilience::forget(host, id, record))
            })
            .collect();
        state.release_unreferenced(host, forgotten);

        let scan = state
            .discovery
            .scan(|| host.surfaces(), host.viewport(), host.now(), full_sweep);
        state.stats.scans += 1;
        let regular: Vec<SurfaceId> = scan
            .regular
            .into_iter()
            .filter(|c| host.is_attached(c.id))
            .map(|c| state.registry.merge(c))
            .collect();
        let large: Vec<SurfaceId> = scan
            .large
            .into_iter()
            .filter(|c| host.is_attached(c.id))
            .map(|c| state.registry.merge(c))
            .collect();
        (regular, large)
    };

    let ctx = JobContext {
        settings,
        grade: Rc::new(grade),
        epoch,
        force,
    };
    let summary = scheduler::run(shared, regular, large, &ctx).await;
    info!(
        preset = %ctx.settings.preset_id,
        full_sweep,
        considered = summary.considered,
        dispatched = summary.dispatched,
        cached = summary.cached,
        committed = summary.committed,
        failed = summary.failed,
        timed_out = summary.timed_out,
        "run complete"
    );

    if !full_sweep {
        schedule_sweep(shared);
    }
    ensure_periodic(shared);
    Ok(summary)
}

/// Grade for `settings`, fetching and parsing the preset on first use.
/// Fetch failures are not remembered; parse failures are.
#[allow(clippy::future_not_send)]
async fn resolve_grade<H: Host>(
    shared: &Rc<Shared<H>>,
    settings: &Settings,
) -> Result<Grade, EngineError> {
    let preset = settings.preset_id.as_str();
    let cached = shared.state.borrow().library.get(preset);
    let outcome = match cached {
        Some(outcome) => outcome,
        None => {
            let text = shared.host.fetch_lut(preset).await.inspect_err(|e| {
                warn!(preset, error = %e, "LUT fetch failed");
            })?;
            shared.state.borrow_mut().library.insert_text(preset, &text)
        }
    };
    let table = outcome.map_err(|source| EngineError::Parse {
        preset: preset.to_owned(),
        source,
    })?;
    Ok(Grade::new(settings, Some(table), &shared.config.effects))
}

/// Schedule the full-sweep rescan that follows a run. A newer sweep
/// replaces a pending one.
fn schedule_sweep<H: Host>(shared: &Rc<Shared<H>>) {
    let delay = shared.config.scheduler.sweep_delay;
    let task_shared = Rc::clone(shared);
    let (task, handle) = abortable(async move {
        task_shared.host.sleep(delay).await;
        task_shared.state.borrow_mut().sweep = None;
        if let Err(e) = run_pass(&task_shared, false, true).await {
            debug!(error = %e, "full sweep failed");
        }
    });
    if let Some(previous) = shared.state.borrow_mut().sweep.replace(handle) {
        previous.abort();
    }
    shared.host.spawn(task.map(drop).boxed_local());
}

/// Start the periodic new-content check if enabled and not running.
fn ensure_periodic<H: Host>(shared: &Rc<Shared<H>>) {
    if !shared.config.new_content_check {
        return;
    }
    let mut state = shared.state.borrow_mut();
    if state.periodic.is_some() || state.torn_down {
        return;
    }
    let interval = shared.config.rescan_interval;
    let task_shared = Rc::clone(shared);
    let (task, handle) = abortable(async move {
        loop {
            task_shared.host.sleep(interval).await;
            if let Err(e) = run_pass(&task_shared, false, false).await {
                debug!(error = %e, "periodic check failed");
            }
        }
    });
    state.periodic = Some(handle);
    drop(state);
    shared.host.spawn(task.map(drop).boxed_local());
}
