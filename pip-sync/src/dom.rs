//! Page model consumed by the Detector.
//!
//! `Page` is the host DOM surface: the element queries the detection pass
//! runs, per-element inspection, page visibility, and the out-of-page playback
//! primitives. `SnapshotPage` is an in-memory implementation for embedding
//! hosts and tests.

use crate::types::{ElementId, Rect, SyncError, Viewport};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

lazy_static! {
    // Containers commonly wrapping players (data-testid / class substrings)
    static ref MEDIA_CONTAINER: Regex = Regex::new(r"video|media").unwrap();

    // Direct media file references in `src`
    static ref MEDIA_SRC: Regex = Regex::new(r"\.(mp4|webm|ogg)").unwrap();

    // Lazy-loaded media file references in `data-src`
    static ref MEDIA_DATA_SRC: Regex = Regex::new(r"\.(mp4|webm)").unwrap();
}

/// HTMLMediaElement.readyState
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    #[default]
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

/// The subset of computed style that hides an element
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedStyle {
    pub display: String,
    pub visibility: String,
    pub opacity: f64,
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            display: "block".to_string(),
            visibility: "visible".to_string(),
            opacity: 1.0,
        }
    }
}

impl ComputedStyle {
    pub fn is_hidden(&self) -> bool {
        self.display == "none" || self.visibility == "hidden" || self.opacity == 0.0
    }
}

/// Snapshot of one media element taken during inspection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaState {
    pub rect: Rect,
    pub client_width: u32,
    pub client_height: u32,
    pub style: ComputedStyle,
    pub current_src: String,
    pub src: String,
    /// Has a `<source>` child
    pub has_source_child: bool,
    pub ready_state: ReadyState,
    pub paused: bool,
    pub ended: bool,
}

impl MediaState {
    /// A visible, paused element with a source, sized `width` x `height` at
    /// the top-left of the viewport.
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            rect: Rect::new(0.0, 0.0, width as f64, height as f64),
            client_width: width,
            client_height: height,
            src: "https://cdn.example.com/clip.mp4".to_string(),
            current_src: "https://cdn.example.com/clip.mp4".to_string(),
            ready_state: ReadyState::HaveMetadata,
            paused: true,
            ..Self::default()
        }
    }

    /// Mark as actively playing with enough data buffered
    pub fn playing(mut self) -> Self {
        self.paused = false;
        self.ended = false;
        self.ready_state = ReadyState::HaveEnoughData;
        self
    }

    pub fn has_source(&self) -> bool {
        !self.current_src.is_empty() || !self.src.is_empty() || self.has_source_child
    }

    pub fn is_playing(&self) -> bool {
        !self.paused && !self.ended && self.ready_state > ReadyState::HaveCurrentData
    }

    pub fn area(&self) -> u64 {
        self.client_width as u64 * self.client_height as u64
    }
}

/// Host DOM surface for one page
#[async_trait]
pub trait Page: Send + Sync {
    /// Every `<video>` element in document order
    fn query_videos(&self) -> Result<Vec<ElementId>, SyncError>;

    /// Elements that commonly wrap players
    fn query_media_containers(&self) -> Result<Vec<ElementId>, SyncError>;

    /// `<video>` descendants of `container`
    fn query_videos_within(&self, container: ElementId) -> Result<Vec<ElementId>, SyncError>;

    /// Elements whose source attributes reference a media file (any tag)
    fn query_media_sources(&self) -> Result<Vec<ElementId>, SyncError>;

    fn is_video(&self, element: ElementId) -> Result<bool, SyncError>;

    /// Read geometry, style and playback state of a media element
    fn inspect(&self, element: ElementId) -> Result<MediaState, SyncError>;

    fn viewport(&self) -> Viewport;

    /// Whether the page is backgrounded
    fn is_hidden(&self) -> bool;

    /// Element currently in out-of-page playback, if any
    fn picture_in_picture_element(&self) -> Option<ElementId>;

    async fn request_picture_in_picture(&self, element: ElementId) -> Result<(), SyncError>;

    async fn exit_picture_in_picture(&self) -> Result<(), SyncError>;
}

/// One element of a `SnapshotPage`
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub id: ElementId,
    pub tag: String,
    pub class_name: String,
    pub attributes: HashMap<String, String>,
    pub parent: Option<ElementId>,
    pub media: Option<MediaState>,
    /// Inspection of this element fails
    pub faulty: bool,
}

impl Node {
    fn is_video(&self) -> bool {
        self.tag.eq_ignore_ascii_case("video")
    }

    fn attribute(&self, name: &str) -> &str {
        self.attributes.get(name).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug)]
struct PageTree {
    /// Document order
    nodes: Vec<Node>,
    next_id: ElementId,
    viewport: Viewport,
    hidden: bool,
    user_activation: bool,
    pip_element: Option<ElementId>,
}

impl PageTree {
    fn node(&self, id: ElementId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: ElementId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    fn is_descendant(&self, node: &Node, ancestor: ElementId) -> bool {
        let mut parent = node.parent;
        while let Some(id) = parent {
            if id == ancestor {
                return true;
            }
            parent = self.node(id).and_then(|n| n.parent);
        }
        false
    }

    fn request_pip(&mut self, element: ElementId) -> Result<(), SyncError> {
        if !self.user_activation {
            return Err(SyncError::PlaybackRejected(
                "user gesture required".to_string(),
            ));
        }
        match self.node(element) {
            Some(node) if node.is_video() && node.media.is_some() => {
                self.pip_element = Some(element);
                Ok(())
            }
            Some(_) => Err(SyncError::PlaybackRejected(format!(
                "element {} is not a video",
                element
            ))),
            None => Err(SyncError::PlaybackRejected(format!(
                "element {} is gone",
                element
            ))),
        }
    }
}

/// In-memory page
pub struct SnapshotPage {
    tree: RwLock<PageTree>,
}

impl SnapshotPage {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            tree: RwLock::new(PageTree {
                nodes: Vec::new(),
                next_id: 1,
                viewport,
                hidden: false,
                user_activation: true,
                pip_element: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PageTree> {
        self.tree.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PageTree> {
        self.tree.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an element and return its id
    pub fn add_element(&self, parent: Option<ElementId>, tag: &str) -> ElementId {
        let mut tree = self.write();
        let id = tree.next_id;
        tree.next_id += 1;
        tree.nodes.push(Node {
            id,
            tag: tag.to_string(),
            parent,
            ..Node::default()
        });
        id
    }

    /// Append a `<video>` carrying `media`
    pub fn add_video(&self, parent: Option<ElementId>, media: MediaState) -> ElementId {
        let id = self.add_element(parent, "video");
        self.set_media(id, media);
        id
    }

    pub fn set_class(&self, id: ElementId, class_name: &str) {
        if let Some(node) = self.write().node_mut(id) {
            node.class_name = class_name.to_string();
        }
    }

    pub fn set_attribute(&self, id: ElementId, name: &str, value: &str) {
        if let Some(node) = self.write().node_mut(id) {
            node.attributes.insert(name.to_string(), value.to_string());
        }
    }

    pub fn set_media(&self, id: ElementId, media: MediaState) {
        if let Some(node) = self.write().node_mut(id) {
            node.media = Some(media);
        }
    }

    pub fn set_faulty(&self, id: ElementId, faulty: bool) {
        if let Some(node) = self.write().node_mut(id) {
            node.faulty = faulty;
        }
    }

    /// Remove an element and its subtree
    pub fn remove(&self, id: ElementId) {
        let mut tree = self.write();
        let doomed: Vec<ElementId> = tree
            .nodes
            .iter()
            .filter(|n| n.id == id || tree.is_descendant(n, id))
            .map(|n| n.id)
            .collect();
        tree.nodes.retain(|n| !doomed.contains(&n.id));
        if tree.pip_element.map_or(false, |e| doomed.contains(&e)) {
            tree.pip_element = None;
        }
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.write().hidden = hidden;
    }

    /// Whether the page currently has transient user activation
    pub fn set_user_activation(&self, active: bool) {
        self.write().user_activation = active;
    }

    pub fn element_count(&self) -> usize {
        self.read().nodes.len()
    }
}

impl Default for SnapshotPage {
    fn default() -> Self {
        Self::new(Viewport::default())
    }
}

#[async_trait]
impl Page for SnapshotPage {
    fn query_videos(&self) -> Result<Vec<ElementId>, SyncError> {
        Ok(self
            .read()
            .nodes
            .iter()
            .filter(|n| n.is_video())
            .map(|n| n.id)
            .collect())
    }

    fn query_media_containers(&self) -> Result<Vec<ElementId>, SyncError> {
        Ok(self
            .read()
            .nodes
            .iter()
            .filter(|n| {
                MEDIA_CONTAINER.is_match(n.attribute("data-testid"))
                    || MEDIA_CONTAINER.is_match(&n.class_name)
            })
            .map(|n| n.id)
            .collect())
    }

    fn query_videos_within(&self, container: ElementId) -> Result<Vec<ElementId>, SyncError> {
        let tree = self.read();
        Ok(tree
            .nodes
            .iter()
            .filter(|n| n.is_video() && tree.is_descendant(n, container))
            .map(|n| n.id)
            .collect())
    }

    fn query_media_sources(&self) -> Result<Vec<ElementId>, SyncError> {
        Ok(self
            .read()
            .nodes
            .iter()
            .filter(|n| {
                MEDIA_SRC.is_match(n.attribute("src"))
                    || MEDIA_DATA_SRC.is_match(n.attribute("data-src"))
            })
            .map(|n| n.id)
            .collect())
    }

    fn is_video(&self, element: ElementId) -> Result<bool, SyncError> {
        Ok(self.read().node(element).map_or(false, Node::is_video))
    }

    fn inspect(&self, element: ElementId) -> Result<MediaState, SyncError> {
        let tree = self.read();
        let node = tree.node(element).ok_or_else(|| SyncError::DetectionFault {
            element,
            reason: "element detached".to_string(),
        })?;
        if node.faulty {
            return Err(SyncError::DetectionFault {
                element,
                reason: "inspection threw".to_string(),
            });
        }
        node.media.clone().ok_or_else(|| SyncError::DetectionFault {
            element,
            reason: "not a media element".to_string(),
        })
    }

    fn viewport(&self) -> Viewport {
        self.read().viewport
    }

    fn is_hidden(&self) -> bool {
        self.read().hidden
    }

    fn picture_in_picture_element(&self) -> Option<ElementId> {
        self.read().pip_element
    }

    async fn request_picture_in_picture(&self, element: ElementId) -> Result<(), SyncError> {
        let result = self.write().request_pip(element);
        debug!("Picture-in-picture request for element {}: {:?}", element, result);
        result
    }

    async fn exit_picture_in_picture(&self) -> Result<(), SyncError> {
        self.write().pip_element = None;
        Ok(())
    }
}
