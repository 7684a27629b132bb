//! Playback toggle orchestration.
//!
//! Ties the Store's cached status to the tab's Detector for the toggle action.
//! Failures end up as user-facing notices through a `Notifier`; nothing here
//! changes the Store's status table.

use crate::protocol::{Delivery, DetectorRequest, DetectorResponse};
use crate::store::StatusService;
use crate::types::TabId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// User-facing notices raised by the toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    /// No video on this page
    NoVideo,
    /// No Detector could be reached or injected
    CannotInject,
    /// The page refused, usually for lack of a user gesture
    PlaybackRejected,
}

/// Sink for notices (system notifications, popup, ...)
pub trait Notifier: Send + Sync {
    fn notify(&self, tab: TabId, notice: Notice);
}

/// Loads a Detector into a tab that has none
#[async_trait]
pub trait ScriptInjector: Send + Sync {
    /// Returns `true` once a Detector is ready to take requests
    async fn inject(&self, tab: TabId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Toggled,
    NoVideo,
    Unreachable,
    Rejected,
}

pub struct PlaybackToggle {
    service: StatusService,
    injector: Arc<dyn ScriptInjector>,
    notifier: Arc<dyn Notifier>,
}

impl PlaybackToggle {
    pub fn new(
        service: StatusService,
        injector: Arc<dyn ScriptInjector>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            service,
            injector,
            notifier,
        }
    }

    /// Toggle from the toolbar action: trust the cached status, and try one
    /// injection if the tab has no Detector.
    pub async fn toggle(&self, tab: TabId) -> ToggleOutcome {
        if !self.service.on_query(tab).await.has_video {
            debug!("Tab {} has no known video", tab);
            return self.finish(tab, ToggleOutcome::NoVideo);
        }

        let outcome = match self.service.send(tab, DetectorRequest::TogglePlayback).await {
            Delivery::NoReceiver => {
                debug!("No Detector in tab {}, injecting", tab);
                if self.injector.inject(tab).await {
                    let retry = self.service.send(tab, DetectorRequest::TogglePlayback).await;
                    answer_outcome(retry)
                } else {
                    ToggleOutcome::Unreachable
                }
            }
            other => answer_outcome(other),
        };
        self.finish(tab, outcome)
    }

    /// Toggle from the keyboard shortcut: refresh the tab first, then always
    /// ask the Detector regardless of cached status.
    pub async fn toggle_from_shortcut(&self, tab: TabId) -> ToggleOutcome {
        self.service.nudge_rescan(tab).await;
        let delivery = self.service.send(tab, DetectorRequest::TogglePlayback).await;
        self.finish(tab, answer_outcome(delivery))
    }

    fn finish(&self, tab: TabId, outcome: ToggleOutcome) -> ToggleOutcome {
        let notice = match outcome {
            ToggleOutcome::Toggled => {
                info!("Toggled picture-in-picture in tab {}", tab);
                return outcome;
            }
            ToggleOutcome::NoVideo => Notice::NoVideo,
            ToggleOutcome::Unreachable => Notice::CannotInject,
            ToggleOutcome::Rejected => Notice::PlaybackRejected,
        };
        warn!("Toggle in tab {} failed: {:?}", tab, outcome);
        self.notifier.notify(tab, notice);
        outcome
    }
}

fn answer_outcome(delivery: Delivery<DetectorResponse>) -> ToggleOutcome {
    match delivery.map(|response| response.succeeded()) {
        Delivery::Delivered(true) => ToggleOutcome::Toggled,
        Delivery::Delivered(false) => ToggleOutcome::Rejected,
        Delivery::NoReceiver | Delivery::TimedOut => ToggleOutcome::Unreachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::protocol::DetectorLink;
    use crate::types::TabStatus;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Detector stand-in: absent until injected, then answers with `ok`
    struct FakeTab {
        present: AtomicBool,
        injectable: bool,
        ok: bool,
        requests: Mutex<Vec<DetectorRequest>>,
    }

    impl FakeTab {
        fn new(present: bool, injectable: bool, ok: bool) -> Arc<Self> {
            Arc::new(Self {
                present: AtomicBool::new(present),
                injectable,
                ok,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<DetectorRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DetectorLink for FakeTab {
        async fn send(&self, _tab: TabId, request: DetectorRequest) -> Delivery<DetectorResponse> {
            if !self.present.load(Ordering::SeqCst) {
                return Delivery::NoReceiver;
            }
            self.requests.lock().unwrap().push(request);
            Delivery::Delivered(match request {
                DetectorRequest::Rescan => DetectorResponse::RescanAck { success: true },
                DetectorRequest::TogglePlayback => DetectorResponse::Toggle { ok: self.ok },
            })
        }
    }

    #[async_trait]
    impl ScriptInjector for FakeTab {
        async fn inject(&self, _tab: TabId) -> bool {
            if self.injectable {
                self.present.store(true, Ordering::SeqCst);
            }
            self.injectable
        }
    }

    #[derive(Default)]
    struct Notices(Mutex<Vec<(TabId, Notice)>>);

    impl Notifier for Notices {
        fn notify(&self, tab: TabId, notice: Notice) {
            self.0.lock().unwrap().push((tab, notice));
        }
    }

    async fn setup(tab: &Arc<FakeTab>, cached: TabStatus) -> (PlaybackToggle, StatusService, Arc<Notices>) {
        let service = StatusService::new(&StoreConfig::default(), tab.clone() as Arc<dyn DetectorLink>);
        service.on_status_report(1, cached).await;
        let notices = Arc::new(Notices::default());
        let toggle = PlaybackToggle::new(
            service.clone(),
            tab.clone() as Arc<dyn ScriptInjector>,
            notices.clone() as Arc<dyn Notifier>,
        );
        (toggle, service, notices)
    }

    #[tokio::test]
    async fn test_no_video_skips_detector() {
        let tab = FakeTab::new(true, false, true);
        let (toggle, _, notices) = setup(&tab, TabStatus::NONE).await;

        assert_eq!(toggle.toggle(1).await, ToggleOutcome::NoVideo);
        assert!(tab.requests().is_empty());
        assert_eq!(*notices.0.lock().unwrap(), vec![(1, Notice::NoVideo)]);
    }

    #[tokio::test]
    async fn test_toggle_reaches_detector() {
        let tab = FakeTab::new(true, false, true);
        let (toggle, service, notices) = setup(&tab, TabStatus::from_count(1)).await;

        assert_eq!(toggle.toggle(1).await, ToggleOutcome::Toggled);
        assert_eq!(tab.requests(), vec![DetectorRequest::TogglePlayback]);
        assert!(notices.0.lock().unwrap().is_empty());
        assert_eq!(service.on_query(1).await, TabStatus::from_count(1));
    }

    #[tokio::test]
    async fn test_injects_once_then_retries() {
        let tab = FakeTab::new(false, true, true);
        let (toggle, _, _) = setup(&tab, TabStatus::from_count(1)).await;

        assert_eq!(toggle.toggle(1).await, ToggleOutcome::Toggled);
        assert_eq!(tab.requests(), vec![DetectorRequest::TogglePlayback]);
    }

    #[tokio::test]
    async fn test_injection_failure_notifies() {
        let tab = FakeTab::new(false, false, true);
        let (toggle, service, notices) = setup(&tab, TabStatus::from_count(2)).await;

        assert_eq!(toggle.toggle(1).await, ToggleOutcome::Unreachable);
        assert_eq!(*notices.0.lock().unwrap(), vec![(1, Notice::CannotInject)]);
        // The toggle path leaves the status alone
        assert_eq!(service.on_query(1).await, TabStatus::from_count(2));
    }

    #[tokio::test]
    async fn test_rejection_notifies() {
        let tab = FakeTab::new(true, false, false);
        let (toggle, _, notices) = setup(&tab, TabStatus::from_count(1)).await;

        assert_eq!(toggle.toggle(1).await, ToggleOutcome::Rejected);
        assert_eq!(*notices.0.lock().unwrap(), vec![(1, Notice::PlaybackRejected)]);
    }

    #[tokio::test]
    async fn test_shortcut_ignores_cached_status() {
        let tab = FakeTab::new(true, false, true);
        let (toggle, _, _) = setup(&tab, TabStatus::NONE).await;

        assert_eq!(toggle.toggle_from_shortcut(1).await, ToggleOutcome::Toggled);
        assert_eq!(
            tab.requests(),
            vec![DetectorRequest::Rescan, DetectorRequest::TogglePlayback]
        );
    }

    #[tokio::test]
    async fn test_shortcut_without_detector() {
        let tab = FakeTab::new(false, true, true);
        let (toggle, _, notices) = setup(&tab, TabStatus::from_count(1)).await;

        assert_eq!(toggle.toggle_from_shortcut(1).await, ToggleOutcome::Unreachable);
        assert_eq!(*notices.0.lock().unwrap(), vec![(1, Notice::CannotInject)]);
    }
}
