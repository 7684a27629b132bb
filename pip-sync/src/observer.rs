//! Debounced observation of page changes.
//!
//! The host pushes `PageSignal`s (mutation batches, visibility and focus
//! transitions, load completion) into a `Signals` subscription. `Watcher`
//! turns that stream into detection passes: relevant mutations go through a
//! leaky debounce that allows at most one pass per window, visibility and focus
//! each pass through their own delay first, and nothing fires while the page is
//! hidden. Time is passed in explicitly so the state machine can be driven
//! without a runtime.

use crate::config::ObservationConfig;
use crate::types::ScanTrigger;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Attributes the host should observe on media elements
pub const OBSERVED_ATTRIBUTES: &[&str] = &["style", "class", "src", "data-src"];

/// What a mutation record says about one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSummary {
    /// Element node (text and comment nodes are ignored)
    pub is_element: bool,
    pub tag: String,
    pub class_name: String,
    /// Has a `<video>` somewhere in its subtree
    pub contains_video: bool,
}

impl NodeSummary {
    pub fn element(tag: &str) -> Self {
        Self {
            is_element: true,
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class_name: &str) -> Self {
        self.class_name = class_name.to_string();
        self
    }

    pub fn containing_video(mut self) -> Self {
        self.contains_video = true;
        self
    }

    fn is_video(&self) -> bool {
        self.tag.eq_ignore_ascii_case("video")
    }

    /// Could adding or removing this node change what a pass finds
    fn touches_media(&self) -> bool {
        self.is_element
            && (self.is_video()
                || self.contains_video
                || self.class_name.contains("video")
                || self.class_name.contains("media"))
    }
}

/// One DOM mutation record
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRecord {
    ChildList {
        added: Vec<NodeSummary>,
        removed: Vec<NodeSummary>,
    },
    Attributes {
        target: NodeSummary,
        attribute: String,
    },
}

impl MutationRecord {
    pub fn is_relevant(&self) -> bool {
        match self {
            MutationRecord::ChildList { added, removed } => {
                added.iter().chain(removed.iter()).any(NodeSummary::touches_media)
            }
            MutationRecord::Attributes { target, attribute } => {
                target.is_video() && OBSERVED_ATTRIBUTES.contains(&attribute.as_str())
            }
        }
    }
}

/// Whether a batch of mutations warrants a detection pass
pub fn is_relevant(records: &[MutationRecord]) -> bool {
    records.iter().any(MutationRecord::is_relevant)
}

/// Something that happened on the page
#[derive(Debug, Clone, PartialEq)]
pub enum PageSignal {
    Mutations(Vec<MutationRecord>),
    VisibilityChanged { hidden: bool },
    FocusGained,
    /// Document finished loading
    Loaded,
}

/// Producer half of a page signal subscription
pub type SignalSender = mpsc::Sender<PageSignal>;

/// Consumer half of a page signal subscription.
///
/// The sequence is lazy and unbounded; it ends only when every sender is
/// dropped, after which the host can subscribe again.
pub struct Signals {
    rx: mpsc::Receiver<PageSignal>,
}

impl Signals {
    pub fn subscribe(capacity: usize) -> (SignalSender, Signals) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Signals { rx })
    }

    pub async fn next(&mut self) -> Option<PageSignal> {
        self.rx.recv().await
    }
}

/// Leaky debounce: the first trigger schedules a pass, later triggers before
/// it fires are coalesced into it.
#[derive(Debug)]
pub struct Debouncer {
    base: Duration,
    extended: Duration,
    pending: Option<Instant>,
    last_fired: Option<Instant>,
}

impl Debouncer {
    pub fn new(base: Duration, extended: Duration) -> Self {
        Self {
            base,
            extended,
            pending: None,
            last_fired: None,
        }
    }

    /// Schedule a pass unless one is already pending.
    ///
    /// Returns `true` if this call scheduled a new pass.
    pub fn schedule(&mut self, now: Instant) -> bool {
        if self.pending.is_some() {
            return false;
        }
        let recently_fired = self
            .last_fired
            .map_or(false, |t| now.saturating_duration_since(t) < self.extended);
        let delay = if recently_fired { self.extended } else { self.base };
        self.pending = Some(now + delay);
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Consume the pending pass if it is due
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(deadline) if deadline <= now => {
                self.pending = None;
                self.last_fired = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Drop the pending pass without firing
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

/// Timing state of one page's watch
#[derive(Debug)]
pub struct Watcher {
    config: ObservationConfig,
    hidden: bool,
    debounce: Debouncer,
    visibility_gate: Option<Instant>,
    focus_gate: Option<Instant>,
    startup: Option<Instant>,
    settle: Option<Instant>,
    /// Why the pending debounced pass was scheduled
    reason: Option<ScanTrigger>,
}

impl Watcher {
    /// Start watching; schedules the startup scan and the settle fallback
    pub fn new(config: ObservationConfig, now: Instant, hidden: bool) -> Self {
        let debounce = Debouncer::new(config.debounce(), config.report_cooldown());
        Self {
            startup: Some(now + config.initial_scan_delay()),
            settle: Some(now + config.load_fallback()),
            config,
            hidden,
            debounce,
            visibility_gate: None,
            focus_gate: None,
            reason: None,
        }
    }

    pub fn on_signal(&mut self, signal: PageSignal, now: Instant) {
        match signal {
            PageSignal::Mutations(records) => {
                if self.hidden {
                    trace!("Ignoring mutations while hidden");
                } else if is_relevant(&records) {
                    self.schedule(ScanTrigger::Mutation, now);
                }
            }
            PageSignal::VisibilityChanged { hidden } => {
                self.hidden = hidden;
                if hidden {
                    self.debounce.cancel();
                    self.reason = None;
                    self.visibility_gate = None;
                    self.focus_gate = None;
                } else if self.visibility_gate.is_none() {
                    self.visibility_gate = Some(now + self.config.visibility_delay());
                }
            }
            PageSignal::FocusGained => {
                if self.focus_gate.is_none() {
                    self.focus_gate = Some(now + self.config.focus_delay());
                }
            }
            PageSignal::Loaded => {
                let settle_at = now + self.config.settle_delay();
                self.settle = Some(self.settle.map_or(settle_at, |s| s.min(settle_at)));
            }
        }
    }

    /// Earliest instant at which `poll` may produce something
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.startup,
            self.settle,
            self.visibility_gate,
            self.focus_gate,
            self.debounce.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Advance timers; returns the next pass due at `now`, if any.
    ///
    /// Call repeatedly until it returns `None`.
    pub fn poll(&mut self, now: Instant) -> Option<ScanTrigger> {
        if take_due(&mut self.startup, now) && !self.hidden {
            return Some(ScanTrigger::Startup);
        }
        if take_due(&mut self.settle, now) && !self.hidden {
            return Some(ScanTrigger::PageSettled);
        }

        // Visibility and focus feed the shared debounce
        let mut gated = None;
        if take_due(&mut self.visibility_gate, now) && !self.hidden {
            gated = Some(ScanTrigger::VisibilityRegained);
        }
        if take_due(&mut self.focus_gate, now) && !self.hidden {
            gated = gated.or(Some(ScanTrigger::FocusGained));
        }
        if let Some(trigger) = gated {
            self.schedule(trigger, now);
        }

        if self.debounce.fire(now) {
            let trigger = self.reason.take().unwrap_or(ScanTrigger::Mutation);
            if self.hidden {
                debug!("Skipping debounced {} pass while hidden", trigger.as_str());
                return None;
            }
            return Some(trigger);
        }
        None
    }

    fn schedule(&mut self, trigger: ScanTrigger, now: Instant) {
        if self.debounce.schedule(now) {
            self.reason = Some(trigger);
        } else {
            trace!("{} coalesced into pending pass", trigger.as_str());
        }
    }
}

fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    match *slot {
        Some(deadline) if deadline <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}
