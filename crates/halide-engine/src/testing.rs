//! In-memory host and virtual clock for engine tests.
//!
//! [`Harness`] drives a [`LocalPool`] and advances virtual time only when
//! every task is stalled, so timer-driven behavior (debounce, timeouts,
//! supervision) is deterministic and instant.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use futures::FutureExt;
use halide_pipeline::RgbaImage;

use crate::error::EngineError;
use crate::host::{
    AssetUrl, Host, Rect, Runtime, SurfaceContext, SurfaceId, SurfaceInfo, SurfaceKind,
    SurfaceReference,
};
use crate::message::{ProxyRequest, ProxyResponse};

/// Two-point preset that inverts every channel.
pub const INVERT_CUBE: &str = "TITLE \"invert\"\nLUT_3D_SIZE 2\n\
1 1 1\n1 1 0\n1 0 1\n1 0 0\n0 1 1\n0 1 0\n0 0 1\n0 0 0\n";

/// Virtual monotonic clock with one-shot timers.
#[derive(Default)]
pub struct Clock {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    deadlines: RefCell<BinaryHeap<Reverse<(Duration, u64)>>>,
    wakers: RefCell<HashMap<u64, oneshot::Sender<()>>>,
}

impl Clock {
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    pub fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let (tx, rx) = oneshot::channel();
        self.deadlines
            .borrow_mut()
            .push(Reverse((self.now.get() + duration, id)));
        self.wakers.borrow_mut().insert(id, tx);
        async move {
            // A dropped clock wakes the sleeper too.
            let _ = rx.await;
        }
        .boxed_local()
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.deadlines.borrow().peek().map(|Reverse((at, _))| *at)
    }

    /// Jump to `at` and fire every timer due by then.
    fn advance_to(&self, at: Duration) {
        if at > self.now.get() {
            self.now.set(at);
        }
        loop {
            let due = {
                let mut deadlines = self.deadlines.borrow_mut();
                match deadlines.peek() {
                    Some(Reverse((deadline, _))) if *deadline <= at => deadlines.pop(),
                    _ => None,
                }
            };
            let Some(Reverse((_, id))) = due else { break };
            if let Some(tx) = self.wakers.borrow_mut().remove(&id) {
                let _ = tx.send(());
            }
        }
    }
}

/// Executor plus virtual clock.
pub struct Harness {
    pool: LocalPool,
    clock: Rc<Clock>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            pool: LocalPool::new(),
            clock: Rc::new(Clock::default()),
        }
    }

    pub fn host(&self) -> FakeHost {
        FakeHost::new(Rc::clone(&self.clock), self.pool.spawner())
    }

    /// Run tasks and timers until `duration` of virtual time has passed.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.clock.now() + duration;
        loop {
            self.pool.run_until_stalled();
            match self.clock.next_deadline() {
                Some(at) if at <= until => self.clock.advance_to(at),
                _ => break,
            }
        }
        self.clock.advance_to(until);
        self.pool.run_until_stalled();
    }

    /// Drive `future` to completion, failing if it needs more than one
    /// minute of virtual time.
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let limit = self.clock.now() + Duration::from_secs(60);
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        self.pool
            .spawner()
            .spawn_local(async move {
                *out.borrow_mut() = Some(future.await);
            })
            .unwrap();
        loop {
            self.pool.run_until_stalled();
            if let Some(output) = slot.borrow_mut().take() {
                return output;
            }
            let at = self
                .clock
                .next_deadline()
                .expect("future stalled with no pending timer");
            assert!(at <= limit, "future did not finish within the time limit");
            self.clock.advance_to(at);
        }
    }
}

/// Solid-color test image.
pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
    let pixels = (0..width * height).flat_map(|_| rgba).collect();
    RgbaImage::from_raw(width, height, pixels).unwrap()
}

struct FakeSurface {
    info: SurfaceInfo,
    reference: SurfaceReference,
    hidden: bool,
}

#[derive(Default)]
struct World {
    surfaces: BTreeMap<SurfaceId, FakeSurface>,
    overlays: HashMap<SurfaceId, AssetUrl>,
    viewport: Rect,
    luts: HashMap<String, String>,
    images: HashMap<String, RgbaImage>,
    blocked: HashSet<String>,
    proxied: HashMap<String, String>,
    slow: HashMap<String, Duration>,
    load_delay: Duration,
    live: BTreeMap<AssetUrl, RgbaImage>,
    released: Vec<AssetUrl>,
    load_log: Vec<String>,
    next_asset: u64,
    next_surface: SurfaceId,
}

/// Counters observed by tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub loads: usize,
    pub lut_fetches: usize,
    pub proxy_requests: usize,
    pub published: usize,
    pub loading: usize,
    pub peak_loading: usize,
}

struct Inner {
    clock: Rc<Clock>,
    spawner: LocalSpawner,
    world: RefCell<World>,
    counters: Cell<Counters>,
}

impl Inner {
    fn count(&self, f: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.get();
        f(&mut counters);
        self.counters.set(counters);
    }
}

/// Tracks in-flight loads for `peak_loading`.
struct Loading(Rc<Inner>);

impl Loading {
    fn start(inner: Rc<Inner>) -> Self {
        inner.count(|c| {
            c.loads += 1;
            c.loading += 1;
            c.peak_loading = c.peak_loading.max(c.loading);
        });
        Self(inner)
    }
}

impl Drop for Loading {
    fn drop(&mut self) {
        self.0.count(|c| c.loading -= 1);
    }
}

/// In-memory document with image and background surfaces.
#[derive(Clone)]
pub struct FakeHost {
    inner: Rc<Inner>,
}

impl FakeHost {
    fn new(clock: Rc<Clock>, spawner: LocalSpawner) -> Self {
        let world = World {
            viewport: Rect::new(0.0, 0.0, 1200.0, 800.0),
            next_surface: 1,
            ..World::default()
        };
        let host = Self {
            inner: Rc::new(Inner {
                clock,
                spawner,
                world: RefCell::new(world),
                counters: Cell::new(Counters::default()),
            }),
        };
        host.add_lut("warm", INVERT_CUBE);
        host.add_lut("broken", "LUT_3D_SIZE 2\n0 0 x\n");
        host
    }

    fn world(&self) -> std::cell::RefMut<'_, World> {
        self.inner.world.borrow_mut()
    }

    pub fn add_lut(&self, preset: &str, text: &str) {
        self.world().luts.insert(preset.to_owned(), text.to_owned());
    }

    fn add_surface(&self, kind: SurfaceKind, rect: Rect, locator: &str, context: SurfaceContext) -> SurfaceId {
        let mut world = self.world();
        let id = world.next_surface;
        world.next_surface += 1;
        world
            .images
            .entry(locator.to_owned())
            .or_insert_with(|| solid(8, 8, [200, 120, 60, 255]));
        let info = SurfaceInfo {
            id,
            kind,
            rect,
            locator: Some(locator.to_owned()),
            in_vector_subtree: false,
            context,
        };
        world.surfaces.insert(
            id,
            FakeSurface {
                info,
                reference: SurfaceReference::pointing_at(kind, locator),
                hidden: false,
            },
        );
        id
    }

    /// Visible 100x100 image at `y`.
    pub fn add_image_at(&self, y: f64, locator: &str) -> SurfaceId {
        self.add_surface(
            SurfaceKind::Image,
            Rect::new(0.0, y, 100.0, 100.0),
            locator,
            SurfaceContext::default(),
        )
    }

    pub fn add_image(&self, locator: &str) -> SurfaceId {
        self.add_image_at(0.0, locator)
    }

    pub fn add_picture(&self, locator: &str) -> SurfaceId {
        let context = SurfaceContext {
            in_picture: true,
            ..SurfaceContext::default()
        };
        self.add_surface(SurfaceKind::Image, Rect::new(0.0, 0.0, 100.0, 100.0), locator, context)
    }

    pub fn add_background(&self, rect: Rect, locator: &str) -> SurfaceId {
        self.add_surface(SurfaceKind::Background, rect, locator, SurfaceContext::default())
    }

    /// Make direct pixel access fail for `locator`.
    pub fn block(&self, locator: &str) {
        self.world().blocked.insert(locator.to_owned());
    }

    /// Let the proxy serve `locator`.
    pub fn allow_proxy(&self, locator: &str) {
        let mut world = self.world();
        let data_url = format!("data:image/png;proxied,{locator}");
        if let Some(image) = world.images.get(locator).cloned() {
            world.images.insert(data_url.clone(), image);
        }
        world.proxied.insert(locator.to_owned(), data_url);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.world().load_delay = delay;
    }

    pub fn set_slow(&self, locator: &str, delay: Duration) {
        self.world().slow.insert(locator.to_owned(), delay);
    }

    pub fn detach(&self, id: SurfaceId) {
        let mut world = self.world();
        world.surfaces.remove(&id);
        world.overlays.remove(&id);
    }

    /// Page script writes a surface reference.
    pub fn external_write(&self, id: SurfaceId, value: SurfaceReference) {
        if let Some(surface) = self.world().surfaces.get_mut(&id) {
            surface.reference = value;
        }
    }

    pub fn remove_overlay_externally(&self, id: SurfaceId) {
        self.world().overlays.remove(&id);
    }

    pub fn reference(&self, id: SurfaceId) -> Option<SurfaceReference> {
        self.inner
            .world
            .borrow()
            .surfaces
            .get(&id)
            .map(|s| s.reference.clone())
    }

    pub fn overlay(&self, id: SurfaceId) -> Option<AssetUrl> {
        self.inner.world.borrow().overlays.get(&id).cloned()
    }

    pub fn is_hidden(&self, id: SurfaceId) -> bool {
        self.inner
            .world
            .borrow()
            .surfaces
            .get(&id)
            .is_some_and(|s| s.hidden)
    }

    /// Published and not yet released.
    pub fn live_assets(&self) -> Vec<AssetUrl> {
        self.inner.world.borrow().live.keys().cloned().collect()
    }

    pub fn asset_pixels(&self, asset: &AssetUrl) -> Option<RgbaImage> {
        self.inner.world.borrow().live.get(asset).cloned()
    }

    pub fn released(&self) -> Vec<AssetUrl> {
        self.inner.world.borrow().released.clone()
    }

    /// Locators in the order their loads started.
    pub fn load_log(&self) -> Vec<String> {
        self.inner.world.borrow().load_log.clone()
    }

    pub fn counters(&self) -> Counters {
        self.inner.counters.get()
    }
}

impl Runtime for FakeHost {
    fn now(&self) -> Duration {
        self.inner.clock.now()
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        self.inner.clock.sleep(duration)
    }

    fn idle(&self) -> LocalBoxFuture<'static, ()> {
        self.inner.clock.sleep(Duration::from_millis(1))
    }

    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        self.inner.spawner.spawn_local(task).unwrap();
    }
}

impl Host for FakeHost {
    fn surfaces(&self) -> Vec<SurfaceInfo> {
        self.inner
            .world
            .borrow()
            .surfaces
            .values()
            .map(|s| SurfaceInfo {
                locator: Some(s.reference.locator().to_owned()),
                ..s.info.clone()
            })
            .collect()
    }

    fn viewport(&self) -> Rect {
        self.inner.world.borrow().viewport
    }

    fn is_attached(&self, id: SurfaceId) -> bool {
        self.inner.world.borrow().surfaces.contains_key(&id)
    }

    fn read_reference(&self, id: SurfaceId) -> Option<SurfaceReference> {
        self.reference(id)
    }

    fn write_reference(&self, id: SurfaceId, value: &SurfaceReference) -> Result<(), EngineError> {
        let mut world = self.world();
        let surface = world
            .surfaces
            .get_mut(&id)
            .ok_or_else(|| EngineError::Surface(format!("surface {id} detached")))?;
        surface.reference = value.clone();
        Ok(())
    }

    fn insert_overlay(&self, id: SurfaceId, asset: &AssetUrl) -> Result<(), EngineError> {
        let mut world = self.world();
        if !world.surfaces.contains_key(&id) {
            return Err(EngineError::Surface(format!("surface {id} detached")));
        }
        world.overlays.insert(id, asset.clone());
        Ok(())
    }

    fn overlay_attached(&self, id: SurfaceId) -> bool {
        self.inner.world.borrow().overlays.contains_key(&id)
    }

    fn remove_overlay(&self, id: SurfaceId) {
        self.world().overlays.remove(&id);
    }

    fn set_hidden(&self, id: SurfaceId, hidden: bool) {
        if let Some(surface) = self.world().surfaces.get_mut(&id) {
            surface.hidden = hidden;
        }
    }

    fn fetch_lut(&self, preset: &str) -> LocalBoxFuture<'static, Result<String, EngineError>> {
        self.inner.count(|c| c.lut_fetches += 1);
        let result = self
            .inner
            .world
            .borrow()
            .luts
            .get(preset)
            .cloned()
            .ok_or_else(|| EngineError::load(preset, "not found"));
        async move { result }.boxed_local()
    }

    fn load_pixels(&self, locator: &str) -> LocalBoxFuture<'static, Result<RgbaImage, EngineError>> {
        let inner = Rc::clone(&self.inner);
        let locator = locator.to_owned();
        let delay = {
            let mut world = inner.world.borrow_mut();
            world.load_log.push(locator.clone());
            world.slow.get(&locator).copied().unwrap_or(world.load_delay)
        };
        let sleep = inner.clock.sleep(delay);
        async move {
            let _loading = Loading::start(Rc::clone(&inner));
            sleep.await;
            let world = inner.world.borrow();
            if world.blocked.contains(&locator) {
                return Err(EngineError::Surface(format!("canvas tainted by {locator}")));
            }
            world
                .images
                .get(&locator)
                .cloned()
                .ok_or_else(|| EngineError::load(&locator, "not found"))
        }
        .boxed_local()
    }

    fn proxy_fetch(&self, request: ProxyRequest) -> LocalBoxFuture<'static, ProxyResponse> {
        self.inner.count(|c| c.proxy_requests += 1);
        let response = match self.inner.world.borrow().proxied.get(&request.image_url) {
            Some(data_url) => ProxyResponse {
                success: true,
                data_url: Some(data_url.clone()),
                error: None,
            },
            None => ProxyResponse {
                success: false,
                data_url: None,
                error: Some("proxy refused".to_owned()),
            },
        };
        async move { response }.boxed_local()
    }

    fn publish(&self, image: &RgbaImage) -> Result<AssetUrl, EngineError> {
        self.inner.count(|c| c.published += 1);
        let mut world = self.world();
        let asset = AssetUrl(format!("blob:halide/{}", world.next_asset));
        world.next_asset += 1;
        world.live.insert(asset.clone(), image.clone());
        Ok(asset)
    }

    fn release(&self, asset: &AssetUrl) {
        let mut world = self.world();
        world.live.remove(asset);
        world.released.push(asset.clone());
    }
}
