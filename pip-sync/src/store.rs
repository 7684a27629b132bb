//! The Store: single owner of per-tab status.
//!
//! `StatusStore` is the state table and only changes through its own
//! operations. `StatusService` is the cloneable handle everything else uses;
//! it serializes access and talks to Detectors without holding the lock
//! across a send.

use crate::config::StoreConfig;
use crate::protocol::{Delivery, DetectorLink, DetectorRequest, DetectorResponse, StoreLink};
use crate::types::{SyncError, TabId, TabStatus, WindowId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

const FEED_CAPACITY: usize = 64;

/// A status change published to subscribers. `status: None` means the entry
/// was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub tab_id: TabId,
    pub status: Option<TabStatus>,
}

impl StatusChange {
    pub fn badge_label(&self) -> Option<String> {
        self.status.and_then(|s| s.badge_label())
    }
}

/// Host tab lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TabEvent {
    Activated { tab_id: TabId, window_id: WindowId },
    Updated { tab_id: TabId, complete: bool },
    /// The tab left its page; whatever was known about it is stale
    Navigated { tab_id: TabId },
    Removed { tab_id: TabId },
    /// `None` when no browser window has focus
    WindowFocusChanged { window_id: Option<WindowId> },
}

pub struct StatusStore {
    statuses: HashMap<TabId, TabStatus>,
    throttle: HashMap<TabId, Instant>,
    active_tabs: HashMap<WindowId, TabId>,
    focused_window: Option<WindowId>,
    cooldown: Duration,
    feed: broadcast::Sender<StatusChange>,
}

impl StatusStore {
    pub fn new(cooldown: Duration) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            statuses: HashMap::new(),
            throttle: HashMap::new(),
            active_tabs: HashMap::new(),
            focused_window: None,
            cooldown,
            feed,
        }
    }

    /// Last write wins
    pub fn on_status_report(&mut self, tab: TabId, status: TabStatus) {
        self.statuses.insert(tab, status);
        self.publish(tab, Some(status));
    }

    pub fn on_query(&self, tab: TabId) -> TabStatus {
        self.statuses.get(&tab).copied().unwrap_or(TabStatus::NONE)
    }

    /// Forget everything about a closed tab
    pub fn on_tab_closed(&mut self, tab: TabId) {
        self.statuses.remove(&tab);
        self.throttle.remove(&tab);
        self.active_tabs.retain(|_, active| *active != tab);
        self.publish(tab, None);
    }

    /// Drop the status of a tab whose page went away
    pub fn on_navigated(&mut self, tab: TabId) {
        if self.statuses.remove(&tab).is_some() {
            self.publish(tab, None);
        }
    }

    /// Explicit tab, else the sender's tab, else the active tab of the
    /// requester's window (or the focused window).
    pub fn resolve_tab(
        &self,
        explicit: Option<TabId>,
        sender: Option<TabId>,
        window: Option<WindowId>,
    ) -> Option<TabId> {
        explicit.or(sender).or_else(|| {
            window
                .or(self.focused_window)
                .and_then(|w| self.active_tabs.get(&w).copied())
        })
    }

    pub fn set_active(&mut self, window: WindowId, tab: TabId) {
        self.active_tabs.insert(window, tab);
    }

    pub fn active_tab(&self, window: WindowId) -> Option<TabId> {
        self.active_tabs.get(&window).copied()
    }

    pub fn set_focused_window(&mut self, window: Option<WindowId>) {
        self.focused_window = window;
    }

    /// Claim the rescan slot for `tab`. The returned stamp identifies this
    /// rescan when its outcome comes back.
    pub fn begin_rescan(&mut self, tab: TabId, now: Instant) -> Result<Instant, SyncError> {
        if let Some(last) = self.throttle.get(&tab) {
            if now.saturating_duration_since(*last) < self.cooldown {
                return Err(SyncError::RateLimited(tab));
            }
        }
        self.throttle.insert(tab, now);
        Ok(now)
    }

    /// Apply the outcome of a forwarded rescan.
    ///
    /// An unreachable Detector resets the tab to the fail-safe default, unless
    /// the tab was closed or rescanned again in the meantime.
    pub fn complete_rescan(
        &mut self,
        tab: TabId,
        stamp: Instant,
        delivery: Delivery<DetectorResponse>,
    ) {
        match delivery {
            Delivery::Delivered(_) => {}
            Delivery::NoReceiver => {
                if self.throttle.get(&tab) == Some(&stamp) {
                    debug!("No Detector in tab {}, assuming no video", tab);
                    self.on_status_report(tab, TabStatus::NONE);
                } else {
                    debug!("Ignoring stale rescan outcome for tab {}", tab);
                }
            }
            Delivery::TimedOut => warn!("Rescan of tab {} timed out", tab),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.feed.subscribe()
    }

    pub fn tracked_tabs(&self) -> usize {
        self.statuses.len()
    }

    pub fn has_throttle_entry(&self, tab: TabId) -> bool {
        self.throttle.contains_key(&tab)
    }

    fn publish(&self, tab_id: TabId, status: Option<TabStatus>) {
        // No subscribers is fine
        let _ = self.feed.send(StatusChange { tab_id, status });
    }
}

/// Shared handle to the Store
#[derive(Clone)]
pub struct StatusService {
    store: Arc<Mutex<StatusStore>>,
    link: Arc<dyn DetectorLink>,
}

impl StatusService {
    pub fn new(config: &StoreConfig, link: Arc<dyn DetectorLink>) -> Self {
        Self {
            store: Arc::new(Mutex::new(StatusStore::new(config.rescan_cooldown()))),
            link,
        }
    }

    pub async fn on_status_report(&self, tab: TabId, status: TabStatus) {
        debug!("Tab {} reported {:?}", tab, status);
        self.store.lock().await.on_status_report(tab, status);
    }

    pub async fn on_query(&self, tab: TabId) -> TabStatus {
        self.store.lock().await.on_query(tab)
    }

    /// Answer a `QueryStatus`; unresolvable tabs read as the default
    pub async fn query(
        &self,
        explicit: Option<TabId>,
        sender: Option<TabId>,
        window: Option<WindowId>,
    ) -> TabStatus {
        let store = self.store.lock().await;
        store
            .resolve_tab(explicit, sender, window)
            .map_or(TabStatus::NONE, |tab| store.on_query(tab))
    }

    pub async fn on_tab_closed(&self, tab: TabId) {
        debug!("Tab {} closed", tab);
        self.store.lock().await.on_tab_closed(tab);
    }

    /// Forward a rescan to the tab's Detector unless one was forwarded within
    /// the cooldown window.
    pub async fn request_rescan(
        &self,
        tab: TabId,
    ) -> Result<Delivery<DetectorResponse>, SyncError> {
        let stamp = match self.store.lock().await.begin_rescan(tab, Instant::now()) {
            Ok(stamp) => stamp,
            Err(e) => {
                debug!("{}", e);
                return Err(e);
            }
        };

        let delivery = self.link.send(tab, DetectorRequest::Rescan).await;
        self.store.lock().await.complete_rescan(tab, stamp, delivery);
        Ok(delivery)
    }

    /// Ask for a rescan without touching the cooldown or the status
    pub async fn nudge_rescan(&self, tab: TabId) -> Delivery<DetectorResponse> {
        let delivery = self.link.send(tab, DetectorRequest::Rescan).await;
        debug!("Nudged rescan of tab {}: {}", tab, delivery.as_str());
        delivery
    }

    /// Send any request to a tab's Detector
    pub async fn send(&self, tab: TabId, request: DetectorRequest) -> Delivery<DetectorResponse> {
        self.link.send(tab, request).await
    }

    pub async fn handle_tab_event(&self, event: TabEvent) {
        if let Some(tab) = self.apply_tab_event(event).await {
            // Cooldown suppression is expected here; several events fire together
            let _ = self.request_rescan(tab).await;
        }
    }

    /// Apply the table side of a tab event and return the tab it should
    /// rescan, if any
    pub async fn apply_tab_event(&self, event: TabEvent) -> Option<TabId> {
        match event {
            TabEvent::Activated { tab_id, window_id } => {
                self.store.lock().await.set_active(window_id, tab_id);
                Some(tab_id)
            }
            TabEvent::Updated { tab_id, complete } => complete.then_some(tab_id),
            TabEvent::Navigated { tab_id } => {
                self.store.lock().await.on_navigated(tab_id);
                None
            }
            TabEvent::Removed { tab_id } => {
                self.on_tab_closed(tab_id).await;
                None
            }
            TabEvent::WindowFocusChanged { window_id } => {
                let mut store = self.store.lock().await;
                store.set_focused_window(window_id);
                window_id.and_then(|w| store.active_tab(w))
            }
        }
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.store.lock().await.subscribe()
    }

    /// Run `f` against the state table
    pub async fn inspect<R>(&self, f: impl FnOnce(&StatusStore) -> R) -> R {
        let store = self.store.lock().await;
        f(&*store)
    }
}

#[async_trait]
impl StoreLink for StatusService {
    async fn report(&self, tab: TabId, status: TabStatus) -> Delivery<()> {
        self.on_status_report(tab, status).await;
        Delivery::Delivered(())
    }
}
