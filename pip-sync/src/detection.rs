//! Candidate detection.
//!
//! A detection pass collects every `<video>` reachable through three query
//! strategies, keeps the ones that are visible and ready, and ranks them:
//! playing before paused, then larger before smaller, ties in encounter order.
//! Each element is inspected in isolation; a fault on one element drops that
//! element and never aborts the pass.

use crate::config::ReportPolicy;
use crate::dom::{MediaState, Page};
use crate::types::{ElementId, VideoCandidate, Viewport};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Run one detection pass and return the full ranking
pub fn detect(page: &dyn Page) -> Vec<VideoCandidate> {
    let viewport = page.viewport();
    let mut candidates: Vec<VideoCandidate> = collect_media_elements(page)
        .into_iter()
        .filter_map(|element| match page.inspect(element) {
            Ok(state) => evaluate(element, &state, &viewport),
            Err(e) => {
                trace!("Skipping element {}: {}", element, e);
                None
            }
        })
        .collect();

    // sort_by is stable, so equal keys keep encounter order
    candidates.sort_by(|a, b| {
        b.is_playing
            .cmp(&a.is_playing)
            .then_with(|| b.area.cmp(&a.area))
    });

    debug!("Detection pass found {} candidates", candidates.len());
    candidates
}

/// Gather `<video>` elements from every strategy, first occurrence wins
pub fn collect_media_elements(page: &dyn Page) -> Vec<ElementId> {
    let mut seen = HashSet::new();
    let mut elements = Vec::new();
    let mut push = |id: ElementId| {
        if seen.insert(id) {
            elements.push(id);
        }
    };

    // Direct query
    match page.query_videos() {
        Ok(videos) => videos.into_iter().for_each(&mut push),
        Err(e) => debug!("Video query failed: {}", e),
    }

    // Players nested in known containers
    match page.query_media_containers() {
        Ok(containers) => {
            for container in containers {
                match page.query_videos_within(container) {
                    Ok(videos) => videos.into_iter().for_each(&mut push),
                    Err(e) => trace!("Container {} query failed: {}", container, e),
                }
            }
        }
        Err(e) => debug!("Container query failed: {}", e),
    }

    // Media file references, only if the element itself is a video
    match page.query_media_sources() {
        Ok(sources) => {
            for element in sources {
                if matches!(page.is_video(element), Ok(true)) {
                    push(element);
                }
            }
        }
        Err(e) => debug!("Source query failed: {}", e),
    }

    elements
}

/// Non-zero size, inside the viewport, and not hidden by style
pub fn is_visible(state: &MediaState, viewport: &Viewport) -> bool {
    !state.rect.is_empty() && state.rect.intersects(viewport) && !state.style.is_hidden()
}

/// Has a resolved source or at least the current frame buffered
pub fn is_ready(state: &MediaState) -> bool {
    state.has_source() || state.ready_state >= crate::dom::ReadyState::HaveCurrentData
}

fn evaluate(element: ElementId, state: &MediaState, viewport: &Viewport) -> Option<VideoCandidate> {
    if !is_visible(state, viewport) {
        trace!("Element {} not visible", element);
        return None;
    }
    if !is_ready(state) {
        trace!("Element {} not ready", element);
        return None;
    }
    Some(VideoCandidate {
        element,
        area: state.area(),
        is_playing: state.is_playing(),
    })
}

impl ReportPolicy {
    /// Reduce a full ranking to what gets reported
    pub fn apply(&self, mut ranked: Vec<VideoCandidate>) -> Vec<VideoCandidate> {
        match self {
            ReportPolicy::BestOnly => {
                ranked.truncate(1);
                ranked
            }
            ReportPolicy::All => ranked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{ComputedStyle, ReadyState, SnapshotPage};
    use crate::types::Rect;

    #[test]
    fn test_playing_ranks_before_larger_paused() {
        let page = SnapshotPage::default();
        let big_paused = page.add_video(None, MediaState::sized(1920, 1080));
        let small_playing = page.add_video(None, MediaState::sized(800, 450).playing());

        let ranked = detect(&page);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].element, small_playing);
        assert!(ranked[0].is_playing);
        assert_eq!(ranked[0].area, 800 * 450);
        assert_eq!(ranked[1].element, big_paused);
    }

    #[test]
    fn test_area_then_encounter_order() {
        let page = SnapshotPage::default();
        let first = page.add_video(None, MediaState::sized(300, 200));
        let large = page.add_video(None, MediaState::sized(640, 360));
        let second = page.add_video(None, MediaState::sized(200, 300));

        let order: Vec<_> = detect(&page).iter().map(|c| c.element).collect();
        assert_eq!(order, vec![large, first, second]);
    }

    #[test]
    fn test_detect_is_deterministic() {
        let page = SnapshotPage::default();
        for i in 0..6 {
            let media = MediaState::sized(100 + (i % 3) * 50, 100);
            let media = if i % 2 == 0 { media.playing() } else { media };
            page.add_video(None, media);
        }
        let first = detect(&page);
        for _ in 0..5 {
            assert_eq!(detect(&page), first);
        }
    }

    #[test]
    fn test_dedup_across_strategies() {
        let page = SnapshotPage::default();
        let container = page.add_element(None, "div");
        page.set_class(container, "video-container");
        let video = page.add_video(Some(container), MediaState::sized(640, 360));
        page.set_attribute(video, "src", "https://cdn.example.com/a.mp4");

        assert_eq!(collect_media_elements(&page), vec![video]);
        assert_eq!(detect(&page).len(), 1);
    }

    #[test]
    fn test_source_strategy_ignores_non_video() {
        let page = SnapshotPage::default();
        let img = page.add_element(None, "img");
        page.set_attribute(img, "src", "poster.mp4.jpg");
        assert!(collect_media_elements(&page).is_empty());
    }

    #[test]
    fn test_visibility_filter() {
        let page = SnapshotPage::default();

        let mut zero = MediaState::sized(0, 0);
        zero.rect = Rect::new(0.0, 0.0, 0.0, 0.0);
        page.add_video(None, zero);

        let mut offscreen = MediaState::sized(640, 360);
        offscreen.rect = Rect::new(0.0, 5000.0, 640.0, 360.0);
        page.add_video(None, offscreen);

        let mut hidden = MediaState::sized(640, 360);
        hidden.style = ComputedStyle {
            visibility: "hidden".to_string(),
            ..ComputedStyle::default()
        };
        page.add_video(None, hidden);

        let visible = page.add_video(None, MediaState::sized(320, 180));

        let ranked = detect(&page);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].element, visible);
    }

    #[test]
    fn test_readiness_filter() {
        let mut no_source = MediaState::sized(640, 360);
        no_source.src.clear();
        no_source.current_src.clear();
        assert!(!is_ready(&no_source));

        let mut with_child = no_source.clone();
        with_child.has_source_child = true;
        assert!(is_ready(&with_child));

        let mut buffered = no_source.clone();
        buffered.ready_state = ReadyState::HaveCurrentData;
        assert!(is_ready(&buffered));
    }

    #[test]
    fn test_faulty_element_is_skipped() {
        let page = SnapshotPage::default();
        let broken = page.add_video(None, MediaState::sized(1920, 1080).playing());
        page.set_faulty(broken, true);
        let fine = page.add_video(None, MediaState::sized(320, 180));

        let ranked = detect(&page);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].element, fine);
    }

    #[test]
    fn test_empty_page() {
        let page = SnapshotPage::default();
        page.add_element(None, "div");
        assert!(detect(&page).is_empty());
    }

    #[test]
    fn test_report_policy() {
        let page = SnapshotPage::default();
        page.add_video(None, MediaState::sized(100, 100));
        let top = page.add_video(None, MediaState::sized(100, 100).playing());

        let best = ReportPolicy::BestOnly.apply(detect(&page));
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].element, top);

        assert_eq!(ReportPolicy::All.apply(detect(&page)).len(), 2);
        assert!(ReportPolicy::BestOnly.apply(Vec::new()).is_empty());
    }
}
