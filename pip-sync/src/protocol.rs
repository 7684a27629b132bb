//! Messages exchanged between Detectors and the Store.
//!
//! Delivery is at-most-once with no retry. A missing receiver is an ordinary
//! outcome (`Delivery::NoReceiver`), never an error, and every wait for a
//! response is bounded (`Delivery::TimedOut`).
//!
//! The wire shapes match what the browser side sends: requests are tagged by
//! a `type` field, responses are bare objects. Native messaging frames are a
//! 4-byte native-endian length followed by that many bytes of JSON.

use crate::types::{SyncError, TabId, TabStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Largest frame accepted from or sent to the browser
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Requests handled by the Store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreRequest {
    /// Fire-and-forget summary from a tab's Detector
    #[serde(rename = "VIDEO_STATE")]
    StatusReport {
        #[serde(rename = "hasVideo")]
        has_video: bool,
        #[serde(default)]
        count: u32,
    },

    /// Ask for a tab's status; without `tabId` the sender's tab is used,
    /// then the active tab of the sender's window
    #[serde(rename = "GET_STATE")]
    QueryStatus {
        #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
    },
}

impl StoreRequest {
    pub fn report(status: TabStatus) -> Self {
        StoreRequest::StatusReport {
            has_video: status.has_video,
            count: status.count,
        }
    }
}

/// Requests handled by a tab's Detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DetectorRequest {
    /// Run one detection pass now and report
    #[serde(rename = "RESCAN")]
    Rescan,

    /// Toggle out-of-page playback of the top candidate
    #[serde(rename = "DO_PIP")]
    TogglePlayback,
}

/// Detector answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetectorResponse {
    RescanAck { success: bool },
    Toggle { ok: bool },
}

impl DetectorResponse {
    /// Whether the Detector reported success, whatever the request was
    pub fn succeeded(&self) -> bool {
        match *self {
            DetectorResponse::RescanAck { success } => success,
            DetectorResponse::Toggle { ok } => ok,
        }
    }
}

/// Outcome of a cross-context send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery<T> {
    Delivered(T),
    /// No context is listening for this tab
    NoReceiver,
    /// The receiver did not answer within the bound
    TimedOut,
}

impl<T> Delivery<T> {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Delivery<U> {
        match self {
            Delivery::Delivered(value) => Delivery::Delivered(f(value)),
            Delivery::NoReceiver => Delivery::NoReceiver,
            Delivery::TimedOut => Delivery::TimedOut,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Delivered(_) => "delivered",
            Delivery::NoReceiver => "no_receiver",
            Delivery::TimedOut => "timed_out",
        }
    }
}

/// Await a delivery, giving up after `wait`
pub async fn bounded<T, F>(wait: Duration, delivery: F) -> Delivery<T>
where
    F: Future<Output = Delivery<T>>,
{
    match tokio::time::timeout(wait, delivery).await {
        Ok(outcome) => outcome,
        Err(_) => Delivery::TimedOut,
    }
}

/// Store -> Detector channel
#[async_trait]
pub trait DetectorLink: Send + Sync {
    async fn send(&self, tab: TabId, request: DetectorRequest) -> Delivery<DetectorResponse>;
}

/// Detector -> Store channel
#[async_trait]
pub trait StoreLink: Send + Sync {
    async fn report(&self, tab: TabId, status: TabStatus) -> Delivery<()>;
}

/// Read one frame. Returns `None` on end of stream or a zero-length frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, SyncError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_ne_bytes(len_bytes) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge(len));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;
    Ok(Some(buffer))
}

/// Write one frame and flush
pub fn write_frame<W: Write>(writer: &mut W, message: &[u8]) -> Result<(), SyncError> {
    if message.len() > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge(message.len()));
    }
    writer.write_all(&(message.len() as u32).to_ne_bytes())?;
    writer.write_all(message)?;
    writer.flush()?;
    Ok(())
}
