//! Unix socket daemon hosting the Store.
//!
//! Clients speak newline-delimited JSON envelopes tagged by `kind`. A
//! connection can attach as a tab's Detector (Store -> Detector requests are
//! then written to it with correlation ids and answered with `reply`), send
//! Store requests and tab events, drive rescans and toggles, or subscribe to
//! the status feed and notices.

use crate::bus::{DetectorCall, MessageBus};
use crate::config::Config;
use crate::protocol::{DetectorLink, DetectorRequest, DetectorResponse, StoreRequest};
use crate::store::{StatusChange, StatusService, TabEvent};
use crate::toggle::{Notice, Notifier, PlaybackToggle, ScriptInjector, ToggleOutcome};
use crate::types::{SyncError, TabId, TabStatus, WindowId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE: usize = 64;

/// Client -> daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Inbound {
    /// This connection now hosts the Detector of `tab_id`
    Attach { tab_id: TabId },
    /// Answer to a `request` envelope
    Reply { id: u64, response: DetectorResponse },
    /// Store request; `tab_id` and `window_id` describe the sender
    Store {
        #[serde(default)]
        tab_id: Option<TabId>,
        #[serde(default)]
        window_id: Option<WindowId>,
        message: StoreRequest,
    },
    Tab(TabEvent),
    Rescan { tab_id: TabId },
    Toggle {
        tab_id: TabId,
        #[serde(default)]
        shortcut: bool,
    },
    /// Receive status changes, notices and injection requests
    Subscribe,
}

/// Daemon -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Outbound {
    /// Request for the attached Detector
    Request { id: u64, request: DetectorRequest },
    /// Answer to a status query
    State { status: TabStatus },
    Change {
        tab_id: TabId,
        status: Option<TabStatus>,
        badge: Option<String>,
    },
    Rescanned { tab_id: TabId, outcome: String },
    Toggled { tab_id: TabId, ok: bool },
    Notice { tab_id: TabId, notice: Notice },
    /// Ask a subscriber able to inject scripts to load a Detector
    InjectScript { tab_id: TabId },
    Error { message: String },
}

impl From<StatusChange> for Outbound {
    fn from(change: StatusChange) -> Self {
        Outbound::Change {
            tab_id: change.tab_id,
            badge: change.badge_label(),
            status: change.status,
        }
    }
}

/// Fan-out of notices and injection requests to subscribers
pub struct Hub {
    events: broadcast::Sender<Outbound>,
    bus: Arc<MessageBus>,
    inject_wait: Duration,
}

impl Hub {
    pub fn new(bus: Arc<MessageBus>, inject_wait: Duration) -> Self {
        let (events, _) = broadcast::channel(OUTBOUND_QUEUE);
        Self {
            events,
            bus,
            inject_wait,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.events.subscribe()
    }
}

impl Notifier for Hub {
    fn notify(&self, tab: TabId, notice: Notice) {
        if self.events.send(Outbound::Notice { tab_id: tab, notice }).is_err() {
            debug!("No subscriber for {:?} in tab {}", notice, tab);
        }
    }
}

#[async_trait]
impl ScriptInjector for Hub {
    async fn inject(&self, tab: TabId) -> bool {
        if self.events.send(Outbound::InjectScript { tab_id: tab }).is_err() {
            debug!("No subscriber can inject into tab {}", tab);
            return false;
        }
        self.bus.wait_attached(tab, self.inject_wait).await
    }
}

/// State shared by all connections
struct Context {
    bus: Arc<MessageBus>,
    service: StatusService,
    toggle: PlaybackToggle,
    hub: Arc<Hub>,
}

impl Context {
    async fn dispatch_store(
        &self,
        sender: Option<TabId>,
        window: Option<WindowId>,
        message: StoreRequest,
    ) -> Option<Outbound> {
        match message {
            StoreRequest::StatusReport { has_video, count } => match sender {
                Some(tab) => {
                    self.service
                        .on_status_report(tab, TabStatus { has_video, count })
                        .await;
                    None
                }
                None => {
                    warn!("Status report without a sender tab");
                    Some(Outbound::Error {
                        message: "status report needs a tab".to_string(),
                    })
                }
            },
            StoreRequest::QueryStatus { tab_id } => Some(Outbound::State {
                status: self.service.query(tab_id, sender, window).await,
            }),
        }
    }

    async fn dispatch_rescan(&self, tab: TabId) -> Outbound {
        let outcome = match self.service.request_rescan(tab).await {
            Ok(delivery) => delivery.as_str().to_string(),
            Err(SyncError::RateLimited(_)) => "rate_limited".to_string(),
            Err(e) => e.to_string(),
        };
        Outbound::Rescanned {
            tab_id: tab,
            outcome,
        }
    }

    async fn dispatch_toggle(&self, tab: TabId, shortcut: bool) -> Outbound {
        let outcome = if shortcut {
            self.toggle.toggle_from_shortcut(tab).await
        } else {
            self.toggle.toggle(tab).await
        };
        Outbound::Toggled {
            tab_id: tab,
            ok: outcome == ToggleOutcome::Toggled,
        }
    }
}

/// The Store daemon
#[derive(Clone)]
pub struct SyncServer {
    config: Config,
    context: Arc<Context>,
}

impl SyncServer {
    pub fn new(config: Config) -> Self {
        let bus = Arc::new(MessageBus::new(config.store.response_timeout()));
        let service = StatusService::new(&config.store, bus.clone() as Arc<dyn DetectorLink>);
        let hub = Arc::new(Hub::new(Arc::clone(&bus), config.store.inject_wait()));
        let toggle = PlaybackToggle::new(
            service.clone(),
            hub.clone() as Arc<dyn ScriptInjector>,
            hub.clone() as Arc<dyn Notifier>,
        );

        Self {
            config,
            context: Arc::new(Context {
                bus,
                service,
                toggle,
                hub,
            }),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.server.socket_path
    }

    /// Handle to the Store, for in-process Detectors
    pub fn service(&self) -> StatusService {
        self.context.service.clone()
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.context.bus)
    }

    /// Bind the socket, replacing a stale socket file
    pub fn bind(&self) -> Result<UnixListener, SyncError> {
        let path = self.socket_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("pip-sync listening on {:?}", path);
        Ok(listener)
    }

    /// Start the server and listen for connections
    pub async fn run(self) -> Result<(), SyncError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    pub async fn serve(self, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, context).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Run `handler` in its own task and log if it panics
async fn guarded<F>(label: &'static str, handler: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(handler).await {
        error!("{} handler failed: {}", label, e);
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<DetectorResponse>>>>;

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, context: Arc<Context>) -> Result<(), SyncError> {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_outbound(writer, out_rx));

    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let ids = Arc::new(AtomicU64::new(1));
    let mut attached: Option<TabId> = None;
    let mut background = Vec::new();

    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Read error: {}", e);
                break;
            }
        }

        let line = match std::str::from_utf8(&buffer) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping envelope that is not UTF-8: {}", e);
                let _ = out_tx
                    .send(Outbound::Error {
                        message: format!("Invalid UTF-8: {}", e),
                    })
                    .await;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let inbound = match serde_json::from_str::<Inbound>(line) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Failed to parse envelope: {}", e);
                let _ = out_tx
                    .send(Outbound::Error {
                        message: format!("Parse error: {}", e),
                    })
                    .await;
                continue;
            }
        };

        match inbound {
            Inbound::Attach { tab_id } => {
                // Requests carry no tab, so one connection hosts one Detector
                if let Some(current) = attached {
                    warn!("Connection already hosts tab {}, refusing tab {}", current, tab_id);
                    let _ = out_tx
                        .send(Outbound::Error {
                            message: format!("already attached to tab {}", current),
                        })
                        .await;
                    continue;
                }
                let calls = context.bus.attach(tab_id).await;
                info!("Detector for tab {} attached over socket", tab_id);
                background.push(tokio::spawn(forward_calls(
                    calls,
                    out_tx.clone(),
                    Arc::clone(&pending),
                    Arc::clone(&ids),
                )));
                attached = Some(tab_id);
            }
            Inbound::Reply { id, response } => match pending.lock().await.remove(&id) {
                Some(reply) => {
                    let _ = reply.send(response);
                }
                None => debug!("Late or unknown reply {}", id),
            },
            Inbound::Subscribe => {
                // Subscribed before the next envelope is read
                let changes = context.service.subscribe().await;
                let events = context.hub.subscribe();
                background.push(tokio::spawn(forward_feed(changes, events, out_tx.clone())));
            }
            Inbound::Store {
                tab_id,
                window_id,
                message,
            } => {
                // Awaited so reports from one connection apply in order
                let context = Arc::clone(&context);
                let out = out_tx.clone();
                let sender = tab_id.or(attached);
                guarded("store", async move {
                    if let Some(reply) = context.dispatch_store(sender, window_id, message).await {
                        let _ = out.send(reply).await;
                    }
                })
                .await;
            }
            Inbound::Tab(event) => {
                // The table change is awaited like store envelopes; only the
                // rescan it triggers runs on its own
                let context = Arc::clone(&context);
                guarded("tab", async move {
                    if let Some(tab) = context.service.apply_tab_event(event).await {
                        tokio::spawn(guarded("rescan", async move {
                            // Cooldown suppression is expected for lifecycle bursts
                            let _ = context.service.request_rescan(tab).await;
                        }));
                    }
                })
                .await;
            }
            Inbound::Rescan { tab_id } => {
                let context = Arc::clone(&context);
                let out = out_tx.clone();
                tokio::spawn(guarded("rescan", async move {
                    let _ = out.send(context.dispatch_rescan(tab_id).await).await;
                }));
            }
            Inbound::Toggle { tab_id, shortcut } => {
                let context = Arc::clone(&context);
                let out = out_tx.clone();
                tokio::spawn(guarded("toggle", async move {
                    let _ = out.send(context.dispatch_toggle(tab_id, shortcut).await).await;
                }));
            }
        }
    }

    if let Some(tab) = attached {
        info!("Detector for tab {} disconnected", tab);
    }
    // Dropping the call receiver detaches the Detector; pending callers see
    // their reply slot close
    for task in background {
        task.abort();
    }
    pending.lock().await.clear();
    drop(out_tx);

    match writer_task.await {
        Ok(result) => result,
        Err(e) => {
            error!("Writer task failed: {}", e);
            Ok(())
        }
    }
}

/// Write envelopes to the client, one JSON object per line
async fn write_outbound(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
) -> Result<(), SyncError> {
    while let Some(message) = outbound.recv().await {
        let json = serde_json::to_string(&message)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Relay Store -> Detector calls to a socket-attached Detector
async fn forward_calls(
    mut calls: mpsc::Receiver<DetectorCall>,
    out: mpsc::Sender<Outbound>,
    pending: Pending,
    ids: Arc<AtomicU64>,
) {
    while let Some(DetectorCall { request, reply }) = calls.recv().await {
        let id = ids.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = pending.lock().await;
            // Callers that timed out no longer hold their reply slot
            pending.retain(|_, slot| !slot.is_closed());
            pending.insert(id, reply);
        }
        if out.send(Outbound::Request { id, request }).await.is_err() {
            pending.lock().await.remove(&id);
            break;
        }
    }
}

/// Relay the status feed and hub events to a subscriber
async fn forward_feed(
    mut changes: broadcast::Receiver<StatusChange>,
    mut events: broadcast::Receiver<Outbound>,
    out: mpsc::Sender<Outbound>,
) {
    loop {
        let message = tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => Outbound::from(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} status changes", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if out.send(message).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_wire_shapes() {
        let attach: Inbound = serde_json::from_str(r#"{"kind":"attach","tabId":4}"#).unwrap();
        assert_eq!(attach, Inbound::Attach { tab_id: 4 });

        let report: Inbound = serde_json::from_str(
            r#"{"kind":"store","tabId":4,"message":{"type":"VIDEO_STATE","hasVideo":true,"count":1}}"#,
        )
        .unwrap();
        assert_eq!(
            report,
            Inbound::Store {
                tab_id: Some(4),
                window_id: None,
                message: StoreRequest::report(TabStatus::from_count(1)),
            }
        );

        let event: Inbound =
            serde_json::from_str(r#"{"kind":"tab","event":"removed","tabId":4}"#).unwrap();
        assert_eq!(event, Inbound::Tab(TabEvent::Removed { tab_id: 4 }));

        let reply: Inbound =
            serde_json::from_str(r#"{"kind":"reply","id":2,"response":{"ok":true}}"#).unwrap();
        assert_eq!(
            reply,
            Inbound::Reply {
                id: 2,
                response: DetectorResponse::Toggle { ok: true }
            }
        );

        let toggle: Inbound = serde_json::from_str(r#"{"kind":"toggle","tabId":4}"#).unwrap();
        assert_eq!(
            toggle,
            Inbound::Toggle {
                tab_id: 4,
                shortcut: false
            }
        );
    }

    #[test]
    fn test_change_carries_badge() {
        let out = Outbound::from(StatusChange {
            tab_id: 1,
            status: Some(TabStatus::from_count(12)),
        });
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["kind"], "change");
        assert_eq!(json["tabId"], 1);
        assert_eq!(json["badge"], "9");
        assert_eq!(json["status"]["hasVideo"], true);
    }

    #[tokio::test]
    async fn test_hub_injection_without_subscribers() {
        let bus = Arc::new(MessageBus::new(Duration::from_secs(1)));
        let hub = Hub::new(bus, Duration::from_millis(10));
        assert!(!hub.inject(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_injection_waits_for_attach() {
        let bus = Arc::new(MessageBus::new(Duration::from_secs(1)));
        let hub = Hub::new(Arc::clone(&bus), Duration::from_secs(2));
        let mut events = hub.subscribe();

        let injector = tokio::spawn(async move {
            if let Ok(Outbound::InjectScript { tab_id }) = events.recv().await {
                return Some(bus.attach(tab_id).await);
            }
            None
        });

        assert!(hub.inject(6).await);
        assert!(injector.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forwarders_share_request_ids() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let ids = Arc::new(AtomicU64::new(1));
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let mut callers = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..2 {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(forward_calls(rx, out_tx.clone(), Arc::clone(&pending), Arc::clone(&ids)));
            let (reply, answer) = oneshot::channel();
            tx.send(DetectorCall {
                request: DetectorRequest::Rescan,
                reply,
            })
            .await
            .unwrap();
            callers.push(tx);
            slots.push(answer);
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            match out_rx.recv().await {
                Some(Outbound::Request { id, .. }) => seen.push(id),
                other => panic!("expected a request, got {:?}", other),
            }
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(pending.lock().await.len(), 2);
    }
}
