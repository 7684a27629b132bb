//! pip-sync - Video detection and per-tab status synchronization
//!
//! This crate keeps a central Store informed of whether each browser tab
//! exposes a playable video, and drives the picture-in-picture toggle:
//!
//! - **Detection**: find, filter and rank `<video>` elements on a page
//! - **Observation**: debounce page changes into detection passes
//! - **Protocol**: message shapes and at-most-once delivery outcomes
//! - **Store**: per-tab status, rescan cooldown, eviction on close
//! - **Toggle**: route the playback toggle to the right Detector
//!
//! # Architecture
//!
//! One Detector runs per page and reports to the Store over a per-tab
//! channel. The Store answers status queries and forwards rescan and toggle
//! requests back to Detectors. The `pip-sync` daemon exposes the Store over a
//! Unix socket; Detectors may also run in-process on the `MessageBus`.

pub mod bus;
pub mod config;
pub mod detection;
pub mod detector;
pub mod dom;
pub mod observer;
pub mod protocol;
pub mod server;
pub mod store;
pub mod toggle;
pub mod types;

// Re-export commonly used types
pub use bus::{DetectorCall, MessageBus};
pub use config::{Config, ReportPolicy};
pub use detection::detect;
pub use detector::Detector;
pub use dom::{MediaState, Page, SnapshotPage};
pub use observer::{MutationRecord, NodeSummary, PageSignal, Signals, Watcher};
pub use protocol::{
    read_frame, write_frame, Delivery, DetectorLink, DetectorRequest, DetectorResponse,
    StoreLink, StoreRequest,
};
pub use server::{Inbound, Outbound, SyncServer};
pub use store::{StatusChange, StatusService, StatusStore, TabEvent};
pub use toggle::{Notice, Notifier, PlaybackToggle, ScriptInjector, ToggleOutcome};
pub use types::{ElementId, ScanTrigger, SyncError, TabId, TabStatus, VideoCandidate, WindowId};
