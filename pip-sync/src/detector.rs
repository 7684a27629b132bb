//! Per-tab Detector.
//!
//! Runs detection passes when the page changes, reports the summary to the
//! Store, and answers rescan and toggle requests. A report that cannot be
//! delivered is dropped; the next pass tries again.

use crate::bus::DetectorCall;
use crate::config::{ObservationConfig, ReportingConfig};
use crate::detection::detect;
use crate::dom::Page;
use crate::observer::{Signals, Watcher};
use crate::protocol::{DetectorRequest, DetectorResponse, StoreLink};
use crate::types::{ScanTrigger, TabId, TabStatus, VideoCandidate};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Detector {
    tab_id: TabId,
    page: Arc<dyn Page>,
    store: Arc<dyn StoreLink>,
    reporting: ReportingConfig,
    last_reported: Option<TabStatus>,
}

impl Detector {
    pub fn new(
        tab_id: TabId,
        page: Arc<dyn Page>,
        store: Arc<dyn StoreLink>,
        reporting: ReportingConfig,
    ) -> Self {
        Self {
            tab_id,
            page,
            store,
            reporting,
            last_reported: None,
        }
    }

    /// Last status the Store acknowledged receiving
    pub fn last_reported(&self) -> Option<TabStatus> {
        self.last_reported
    }

    /// Full ranking for the current page. A panic inside the pass is
    /// contained and reads as an empty page.
    pub fn ranked(&self) -> Vec<VideoCandidate> {
        match panic::catch_unwind(AssertUnwindSafe(|| detect(self.page.as_ref()))) {
            Ok(ranked) => ranked,
            Err(_) => {
                error!("Detection pass panicked on tab {}", self.tab_id);
                Vec::new()
            }
        }
    }

    /// Run one pass and report it.
    ///
    /// Rescan requests always report; other triggers report only on change
    /// unless `report_unchanged` is set.
    pub async fn evaluate(&mut self, trigger: ScanTrigger) -> TabStatus {
        let reported = self.reporting.policy.apply(self.ranked());
        let status = TabStatus::from_count(reported.len());
        debug!(
            "Tab {} {} pass: has_video={} count={}",
            self.tab_id,
            trigger.as_str(),
            status.has_video,
            status.count
        );

        let changed = self.last_reported != Some(status);
        if changed || self.reporting.report_unchanged || trigger == ScanTrigger::RescanRequested {
            self.report(status).await;
        }
        status
    }

    async fn report(&mut self, status: TabStatus) {
        let delivery = self.store.report(self.tab_id, status).await;
        if delivery.is_delivered() {
            self.last_reported = Some(status);
        } else {
            debug!("Report from tab {} dropped: {}", self.tab_id, delivery.as_str());
        }
    }

    pub async fn handle(&mut self, request: DetectorRequest) -> DetectorResponse {
        match request {
            DetectorRequest::Rescan => {
                self.evaluate(ScanTrigger::RescanRequested).await;
                DetectorResponse::RescanAck { success: true }
            }
            DetectorRequest::TogglePlayback => DetectorResponse::Toggle {
                ok: self.toggle().await,
            },
        }
    }

    async fn toggle(&mut self) -> bool {
        if self.page.picture_in_picture_element().is_some() {
            return match self.page.exit_picture_in_picture().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Leaving picture-in-picture on tab {} failed: {}", self.tab_id, e);
                    false
                }
            };
        }

        let Some(best) = self.ranked().first().copied() else {
            debug!("Toggle on tab {} found no video", self.tab_id);
            self.report(TabStatus::NONE).await;
            return false;
        };

        match self.page.request_picture_in_picture(best.element).await {
            Ok(()) => {
                info!("Tab {} entered picture-in-picture", self.tab_id);
                true
            }
            Err(e) => {
                warn!("Tab {}: {}", self.tab_id, e);
                false
            }
        }
    }

    /// Serve the page until the Store side detaches.
    ///
    /// Page signals drive the watcher; calls are answered in arrival order.
    /// If the signal stream ends the Detector keeps answering calls.
    pub async fn run(
        mut self,
        mut signals: Signals,
        mut calls: mpsc::Receiver<DetectorCall>,
        observation: ObservationConfig,
    ) {
        let mut watcher = Watcher::new(observation, Instant::now(), self.page.is_hidden());
        let mut signals_open = true;
        info!("Detector started for tab {}", self.tab_id);

        loop {
            let deadline = watcher.next_deadline();
            tokio::select! {
                signal = signals.next(), if signals_open => match signal {
                    Some(signal) => watcher.on_signal(signal, Instant::now()),
                    None => {
                        debug!("Signal stream for tab {} ended", self.tab_id);
                        signals_open = false;
                    }
                },
                call = calls.recv() => match call {
                    Some(DetectorCall { request, reply }) => {
                        let response = self.handle(request).await;
                        if reply.send(response).is_err() {
                            debug!("Caller for tab {} stopped waiting", self.tab_id);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = Instant::now();
                    while let Some(trigger) = watcher.poll(now) {
                        self.evaluate(trigger).await;
                    }
                }
            }
        }

        info!("Detector stopped for tab {}", self.tab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReportPolicy;
    use crate::dom::{MediaState, SnapshotPage};
    use crate::observer::{MutationRecord, NodeSummary, PageSignal};
    use crate::protocol::Delivery;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStore {
        offline: AtomicBool,
        reports: Mutex<Vec<(TabId, TabStatus)>>,
    }

    impl RecordingStore {
        fn reports(&self) -> Vec<(TabId, TabStatus)> {
            self.reports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StoreLink for RecordingStore {
        async fn report(&self, tab: TabId, status: TabStatus) -> Delivery<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Delivery::NoReceiver;
            }
            self.reports.lock().unwrap().push((tab, status));
            Delivery::Delivered(())
        }
    }

    fn detector(page: &Arc<SnapshotPage>, store: &Arc<RecordingStore>) -> Detector {
        Detector::new(
            7,
            page.clone() as Arc<dyn Page>,
            store.clone() as Arc<dyn StoreLink>,
            ReportingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_best_only_reports_single_candidate() {
        let page = Arc::new(SnapshotPage::default());
        page.add_video(None, MediaState::sized(640, 360));
        page.add_video(None, MediaState::sized(320, 180).playing());
        let store = Arc::new(RecordingStore::default());
        let mut detector = detector(&page, &store);

        let status = detector.evaluate(ScanTrigger::Startup).await;
        assert_eq!(status, TabStatus::from_count(1));
        assert_eq!(store.reports(), vec![(7, TabStatus::from_count(1))]);
    }

    #[tokio::test]
    async fn test_all_policy_reports_full_count() {
        let page = Arc::new(SnapshotPage::default());
        page.add_video(None, MediaState::sized(640, 360));
        page.add_video(None, MediaState::sized(320, 180));
        let store = Arc::new(RecordingStore::default());
        let mut detector = detector(&page, &store);
        detector.reporting.policy = ReportPolicy::All;

        assert_eq!(
            detector.evaluate(ScanTrigger::Mutation).await,
            TabStatus::from_count(2)
        );
    }

    #[tokio::test]
    async fn test_unchanged_status_is_suppressed_unless_forced() {
        let page = Arc::new(SnapshotPage::default());
        page.add_video(None, MediaState::sized(640, 360));
        let store = Arc::new(RecordingStore::default());
        let mut detector = detector(&page, &store);
        detector.reporting.report_unchanged = false;

        detector.evaluate(ScanTrigger::Startup).await;
        detector.evaluate(ScanTrigger::Mutation).await;
        assert_eq!(store.reports().len(), 1);

        detector.handle(DetectorRequest::Rescan).await;
        assert_eq!(store.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_undeliverable_report_is_dropped_not_queued() {
        let page = Arc::new(SnapshotPage::default());
        page.add_video(None, MediaState::sized(640, 360));
        let store = Arc::new(RecordingStore::default());
        store.offline.store(true, Ordering::SeqCst);
        let mut detector = detector(&page, &store);
        detector.reporting.report_unchanged = false;

        detector.evaluate(ScanTrigger::Startup).await;
        assert_eq!(detector.last_reported(), None);

        store.offline.store(false, Ordering::SeqCst);
        detector.evaluate(ScanTrigger::Mutation).await;
        assert_eq!(store.reports(), vec![(7, TabStatus::from_count(1))]);
    }

    #[tokio::test]
    async fn test_toggle_enters_and_exits() {
        let page = Arc::new(SnapshotPage::default());
        page.add_video(None, MediaState::sized(1920, 1080));
        let playing = page.add_video(None, MediaState::sized(800, 450).playing());
        let store = Arc::new(RecordingStore::default());
        let mut detector = detector(&page, &store);

        let entered = detector.handle(DetectorRequest::TogglePlayback).await;
        assert_eq!(entered, DetectorResponse::Toggle { ok: true });
        assert_eq!(page.picture_in_picture_element(), Some(playing));

        let exited = detector.handle(DetectorRequest::TogglePlayback).await;
        assert_eq!(exited, DetectorResponse::Toggle { ok: true });
        assert_eq!(page.picture_in_picture_element(), None);
    }

    #[tokio::test]
    async fn test_toggle_without_video_reports_none() {
        let page = Arc::new(SnapshotPage::default());
        let store = Arc::new(RecordingStore::default());
        let mut detector = detector(&page, &store);

        let response = detector.handle(DetectorRequest::TogglePlayback).await;
        assert!(!response.succeeded());
        assert_eq!(store.reports(), vec![(7, TabStatus::NONE)]);
    }

    #[tokio::test]
    async fn test_toggle_rejected_without_gesture() {
        let page = Arc::new(SnapshotPage::default());
        page.add_video(None, MediaState::sized(640, 360));
        page.set_user_activation(false);
        let store = Arc::new(RecordingStore::default());
        let mut detector = detector(&page, &store);

        let response = detector.handle(DetectorRequest::TogglePlayback).await;
        assert_eq!(response, DetectorResponse::Toggle { ok: false });
        assert!(store.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_scans_and_answers() {
        let page = Arc::new(SnapshotPage::default());
        let store = Arc::new(RecordingStore::default());
        let (signal_tx, signals) = Signals::subscribe(8);
        let (call_tx, calls) = mpsc::channel(4);
        let task = tokio::spawn(detector(&page, &store).run(
            signals,
            calls,
            ObservationConfig::default(),
        ));

        // Startup scan on an empty page
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.reports(), vec![(7, TabStatus::NONE)]);

        // A player shows up
        page.add_video(None, MediaState::sized(640, 360));
        signal_tx
            .send(PageSignal::Mutations(vec![MutationRecord::ChildList {
                added: vec![NodeSummary::element("video")],
                removed: vec![],
            }]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.reports().last(), Some(&(7, TabStatus::from_count(1))));

        let (reply, answer) = tokio::sync::oneshot::channel();
        call_tx
            .send(DetectorCall {
                request: DetectorRequest::Rescan,
                reply,
            })
            .await
            .unwrap();
        assert_eq!(answer.await.unwrap(), DetectorResponse::RescanAck { success: true });

        drop(call_tx);
        task.await.unwrap();
    }
}
