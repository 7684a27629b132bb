//! Core types used throughout the engine.
//!
//! This module defines the per-tab status record, the transient video
//! candidate produced by a scan, element geometry, and the error taxonomy.

use serde::{Deserialize, Serialize};

/// Browsing-context identifier assigned by the host platform
pub type TabId = i64;

/// Browser window identifier assigned by the host platform
pub type WindowId = i64;

/// Identity of a page element, valid for the lifetime of that element
pub type ElementId = u64;

/// Last-known video status of one tab
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabStatus {
    pub has_video: bool,
    #[serde(default)]
    pub count: u32,
}

impl TabStatus {
    /// Fail-safe default: no video known
    pub const NONE: TabStatus = TabStatus {
        has_video: false,
        count: 0,
    };

    pub fn from_count(count: usize) -> Self {
        Self {
            has_video: count > 0,
            count: u32::try_from(count).unwrap_or(u32::MAX),
        }
    }

    /// Badge text for the toolbar icon.
    ///
    /// A single video shows the colored icon only; the count is shown from two
    /// upwards and clamped at 9.
    pub fn badge_label(&self) -> Option<String> {
        if self.has_video && self.count > 1 {
            Some(self.count.min(9).to_string())
        } else {
            None
        }
    }
}

/// One ranked entry of a detection pass. Never outlives the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCandidate {
    /// Non-owning handle to the media element
    pub element: ElementId,
    /// Rendered width x height in layout pixels
    pub area: u64,
    /// Not paused, not ended, and buffered past the current frame
    pub is_playing: bool,
}

/// Element bounding box in viewport coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0.0 || self.height == 0.0
    }

    /// Whether any part of the box lies inside the viewport
    pub fn intersects(&self, viewport: &Viewport) -> bool {
        self.bottom() >= 0.0
            && self.right() >= 0.0
            && self.y <= viewport.height
            && self.x <= viewport.width
    }
}

/// Visible area of the page
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 720.0,
        }
    }
}

/// Why a detection pass ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    /// Quick scan shortly after the Detector started
    Startup,
    /// Scan once the page finished loading and settled
    PageSettled,
    /// Relevant DOM mutation (debounced)
    Mutation,
    /// Page became visible again (debounced)
    VisibilityRegained,
    /// Page window received focus (debounced)
    FocusGained,
    /// Store asked for a forced rescan
    RescanRequested,
}

impl ScanTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanTrigger::Startup => "startup",
            ScanTrigger::PageSettled => "page_settled",
            ScanTrigger::Mutation => "mutation",
            ScanTrigger::VisibilityRegained => "visibility",
            ScanTrigger::FocusGained => "focus",
            ScanTrigger::RescanRequested => "rescan",
        }
    }
}

/// Errors that can occur inside the engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("No receiver for tab {0}")]
    NoReceiver(TabId),

    #[error("Inspecting element {element} failed: {reason}")]
    DetectionFault { element: ElementId, reason: String },

    #[error("Out-of-page playback rejected: {0}")]
    PlaybackRejected(String),

    #[error("Rescan for tab {0} suppressed by cooldown")]
    RateLimited(TabId),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
