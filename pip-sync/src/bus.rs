//! In-process Store -> Detector routing.
//!
//! Each attached Detector owns the receiving half of a bounded channel keyed
//! by its tab. Sending to a tab with no live receiver yields
//! `Delivery::NoReceiver`; a Detector that accepts a call but never answers
//! yields `Delivery::TimedOut` after the response timeout.

use crate::protocol::{bounded, Delivery, DetectorLink, DetectorRequest, DetectorResponse};
use crate::types::TabId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

const CALL_QUEUE: usize = 16;

/// A request addressed to one Detector, with the slot for its answer
#[derive(Debug)]
pub struct DetectorCall {
    pub request: DetectorRequest,
    pub reply: oneshot::Sender<DetectorResponse>,
}

pub struct MessageBus {
    detectors: Mutex<HashMap<TabId, mpsc::Sender<DetectorCall>>>,
    attached: Notify,
    response_timeout: Duration,
}

impl MessageBus {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            detectors: Mutex::new(HashMap::new()),
            attached: Notify::new(),
            response_timeout,
        }
    }

    /// Register the Detector for `tab`, replacing any previous one.
    ///
    /// Dropping the returned receiver detaches it.
    pub async fn attach(&self, tab: TabId) -> mpsc::Receiver<DetectorCall> {
        let (tx, rx) = mpsc::channel(CALL_QUEUE);
        if self.detectors.lock().await.insert(tab, tx).is_some() {
            debug!("Replaced Detector for tab {}", tab);
        } else {
            debug!("Detector attached for tab {}", tab);
        }
        self.attached.notify_waiters();
        rx
    }

    pub async fn is_attached(&self, tab: TabId) -> bool {
        self.detectors
            .lock()
            .await
            .get(&tab)
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Wait up to `wait` for a Detector to attach to `tab`
    pub async fn wait_attached(&self, tab: TabId, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            // Registered before the check so an attach in between is not missed
            let notified = self.attached.notified();
            if self.is_attached(tab).await {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_attached(tab).await;
            }
        }
    }

    async fn sender_for(&self, tab: TabId) -> Option<mpsc::Sender<DetectorCall>> {
        let mut detectors = self.detectors.lock().await;
        match detectors.get(&tab) {
            Some(tx) if tx.is_closed() => {
                trace!("Pruning closed Detector channel for tab {}", tab);
                detectors.remove(&tab);
                None
            }
            Some(tx) => Some(tx.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl DetectorLink for MessageBus {
    async fn send(&self, tab: TabId, request: DetectorRequest) -> Delivery<DetectorResponse> {
        let Some(tx) = self.sender_for(tab).await else {
            return Delivery::NoReceiver;
        };

        let (reply, answer) = oneshot::channel();
        let call = DetectorCall { request, reply };
        let outcome = bounded(self.response_timeout, async move {
            if tx.send(call).await.is_err() {
                return Delivery::NoReceiver;
            }
            // A dropped reply slot means the Detector went away mid-call
            match answer.await {
                Ok(response) => Delivery::Delivered(response),
                Err(_) => Delivery::NoReceiver,
            }
        })
        .await;

        trace!("{:?} to tab {}: {}", request, tab, outcome.as_str());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_detector() {
        let bus = MessageBus::new(Duration::from_secs(3));
        assert_eq!(
            bus.send(1, DetectorRequest::Rescan).await,
            Delivery::NoReceiver
        );
    }

    #[tokio::test]
    async fn test_send_and_reply() {
        let bus = MessageBus::new(Duration::from_secs(3));
        let mut calls = bus.attach(5).await;
        assert!(bus.is_attached(5).await);

        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                assert_eq!(call.request, DetectorRequest::TogglePlayback);
                let _ = call.reply.send(DetectorResponse::Toggle { ok: true });
            }
        });

        assert_eq!(
            bus.send(5, DetectorRequest::TogglePlayback).await,
            Delivery::Delivered(DetectorResponse::Toggle { ok: true })
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = MessageBus::new(Duration::from_secs(3));
        let calls = bus.attach(2).await;
        drop(calls);

        assert!(!bus.is_attached(2).await);
        assert_eq!(bus.send(2, DetectorRequest::Rescan).await, Delivery::NoReceiver);
        assert!(bus.detectors.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_call_dropped_without_reply() {
        let bus = MessageBus::new(Duration::from_secs(3));
        let mut calls = bus.attach(3).await;
        tokio::spawn(async move {
            // Swallow the call without answering
            let _ = calls.recv().await;
        });
        assert_eq!(bus.send(3, DetectorRequest::Rescan).await, Delivery::NoReceiver);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let bus = MessageBus::new(Duration::from_secs(3));
        let _calls = bus.attach(4).await;
        assert_eq!(bus.send(4, DetectorRequest::Rescan).await, Delivery::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_attached() {
        let bus = std::sync::Arc::new(MessageBus::new(Duration::from_secs(3)));
        assert!(!bus.wait_attached(9, Duration::from_millis(500)).await);

        let late = std::sync::Arc::clone(&bus);
        let attach = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            late.attach(9).await
        });
        assert!(bus.wait_attached(9, Duration::from_secs(2)).await);
        let _calls = attach.await.unwrap();
    }
}
