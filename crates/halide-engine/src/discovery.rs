//! Candidate discovery: which surfaces to consider, and in what order.
//!
//! A scan keeps surfaces that
//!
//! - have a resolved content locator (not empty, not `none`),
//! - are not inside a vector/icon subtree,
//! - are at least `min_size` on both axes, and
//! - intersect the viewport grown by `viewport_margin` (unless this is a
//!   full sweep),
//!
//! sorts them by distance from the viewport (visible ones first, then
//! document order), caps the list at `max_candidates`, and splits it into
//! the regular and large tiers.
//!
//! [`Discovery`] memoizes the last non-sweep scan for `memo_ttl` so a
//! burst of triggers does not re-walk the document each time.

use std::time::Duration;

use tracing::trace;

use crate::candidate::{Candidate, Tier};
use crate::config::DiscoveryLimits;
use crate::host::{Rect, SurfaceInfo};

/// Result of one scan, tiers in scheduling order.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    /// Candidates below the large threshold.
    pub regular: Vec<Candidate>,
    /// Candidates at or above the large threshold.
    pub large: Vec<Candidate>,
}

impl Scan {
    /// Total candidates in both tiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regular.len() + self.large.len()
    }

    /// Returns `true` if the scan found nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.large.is_empty()
    }
}

/// Filter, prioritize and tier `surfaces`.
#[must_use]
pub fn scan(
    surfaces: Vec<SurfaceInfo>,
    viewport: Rect,
    limits: &DiscoveryLimits,
    full_sweep: bool,
) -> Scan {
    let window = viewport.expand(limits.viewport_margin);

    let mut eligible: Vec<(f64, usize, SurfaceInfo)> = surfaces
        .into_iter()
        .enumerate()
        .filter(|(_, s)| is_eligible(s, limits))
        .filter(|(_, s)| full_sweep || s.rect.intersects(&window))
        .map(|(order, s)| (viewport.distance_to(&s.rect), order, s))
        .collect();
    eligible.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    eligible.truncate(limits.max_candidates);

    let mut result = Scan::default();
    for (distance, _, surface) in eligible {
        let Some(source) = surface.locator else {
            continue;
        };
        let tier = if surface.rect.width >= limits.large_threshold
            || surface.rect.height >= limits.large_threshold
        {
            Tier::Large
        } else {
            Tier::Regular
        };
        let candidate = Candidate::discovered(
            surface.id,
            surface.kind,
            surface.rect,
            source,
            tier,
            distance,
            surface.context,
        );
        match tier {
            Tier::Regular => result.regular.push(candidate),
            Tier::Large => result.large.push(candidate),
        }
    }
    result
}

fn is_eligible(surface: &SurfaceInfo, limits: &DiscoveryLimits) -> bool {
    let has_content = surface
        .locator
        .as_deref()
        .map(str::trim)
        .is_some_and(|l| !l.is_empty() && l != "none");
    has_content
        && !surface.in_vector_subtree
        && surface.rect.width >= limits.min_size
        && surface.rect.height >= limits.min_size
}

#[derive(Debug)]
struct Memo {
    viewport: Rect,
    taken_at: Duration,
    scan: Scan,
}

/// Scanner with a short-lived memo.
#[derive(Debug)]
pub struct Discovery {
    limits: DiscoveryLimits,
    memo: Option<Memo>,
}

impl Discovery {
    /// Create a scanner.
    #[must_use]
    pub const fn new(limits: DiscoveryLimits) -> Self {
        Self { limits, memo: None }
    }

    /// Scan, reusing the memo when the viewport is unchanged and the
    /// memo is younger than `memo_ttl`. `surfaces` is only called on a
    /// miss. Full sweeps always walk and never refresh the memo.
    pub fn scan(
        &mut self,
        surfaces: impl FnOnce() -> Vec<SurfaceInfo>,
        viewport: Rect,
        now: Duration,
        full_sweep: bool,
    ) -> Scan {
        if !full_sweep
            && let Some(memo) = &self.memo
            && memo.viewport == viewport
            && now.saturating_sub(memo.taken_at) < self.limits.memo_ttl
        {
            trace!("discovery memo hit");
            return memo.scan.clone();
        }

        let result = scan(surfaces(), viewport, &self.limits, full_sweep);
        if !full_sweep {
            self.memo = Some(Memo {
                viewport,
                taken_at: now,
                scan: result.clone(),
            });
        }
        result
    }

    /// Forget the memo.
    pub fn invalidate(&mut self) {
        self.memo = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::host::{SurfaceContext, SurfaceKind};

    fn surface(id: u64, y: f64, size: f64) -> SurfaceInfo {
        SurfaceInfo {
            id,
            kind: SurfaceKind::Image,
            rect: Rect::new(0.0, y, size, size),
            locator: Some(format!("https://img.test/{id}.jpg")),
            in_vector_subtree: false,
            context: SurfaceContext::default(),
        }
    }

    fn viewport() -> Rect {
        Rect::new(0.0, 0.0, 1000.0, 800.0)
    }

    fn ids(candidates: &[Candidate]) -> Vec<u64> {
        candidates.iter().map(|c| c.id).collect()
    }

    #[test]
    fn small_vector_and_empty_surfaces_are_excluded() {
        let mut icon = surface(2, 0.0, 100.0);
        icon.in_vector_subtree = true;
        let mut bare = surface(3, 0.0, 100.0);
        bare.locator = Some("none".into());
        let mut empty = surface(4, 0.0, 100.0);
        empty.locator = None;
        let tiny = surface(5, 0.0, 16.0);

        let result = scan(
            vec![surface(1, 0.0, 100.0), icon, bare, empty, tiny],
            viewport(),
            &DiscoveryLimits::default(),
            false,
        );
        assert_eq!(ids(&result.regular), vec![1]);
        assert!(result.large.is_empty());
    }

    #[test]
    fn tiers_split_on_threshold() {
        let result = scan(
            vec![surface(1, 0.0, 100.0), surface(2, 0.0, 180.0), surface(3, 0.0, 600.0)],
            viewport(),
            &DiscoveryLimits::default(),
            false,
        );
        assert_eq!(ids(&result.regular), vec![1]);
        assert_eq!(ids(&result.large), vec![2, 3]);
    }

    #[test]
    fn far_surfaces_need_a_full_sweep() {
        let limits = DiscoveryLimits::default();
        let surfaces = vec![surface(1, 0.0, 64.0), surface(2, 2500.0, 64.0), surface(3, 9000.0, 64.0)];

        let near = scan(surfaces.clone(), viewport(), &limits, false);
        assert_eq!(ids(&near.regular), vec![1, 2]);
        assert!(near.regular[0].visible);
        assert!(!near.regular[1].visible);

        let sweep = scan(surfaces, viewport(), &limits, true);
        assert_eq!(ids(&sweep.regular), vec![1, 2, 3]);
    }

    #[test]
    fn sorted_by_distance_and_capped() {
        let limits = DiscoveryLimits {
            max_candidates: 2,
            ..DiscoveryLimits::default()
        };
        let result = scan(
            vec![surface(1, 1500.0, 64.0), surface(2, 900.0, 64.0), surface(3, 10.0, 64.0)],
            viewport(),
            &limits,
            false,
        );
        assert_eq!(ids(&result.regular), vec![3, 2]);
    }

    #[test]
    fn memo_absorbs_repeat_scans_within_ttl() {
        let mut discovery = Discovery::new(DiscoveryLimits::default());
        let walks = Cell::new(0);
        let walk = || {
            walks.set(walks.get() + 1);
            vec![surface(1, 0.0, 64.0)]
        };

        discovery.scan(walk, viewport(), Duration::ZERO, false);
        discovery.scan(walk, viewport(), Duration::from_millis(500), false);
        assert_eq!(walks.get(), 1);

        discovery.scan(walk, viewport(), Duration::from_millis(1500), false);
        assert_eq!(walks.get(), 2);

        let scrolled = Rect::new(0.0, 400.0, 1000.0, 800.0);
        discovery.scan(walk, scrolled, Duration::from_millis(1600), false);
        assert_eq!(walks.get(), 3);

        discovery.scan(walk, scrolled, Duration::from_millis(1700), true);
        assert_eq!(walks.get(), 4);
    }
}
