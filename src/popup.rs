use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::glossary::{GlossaryEntry, GlossaryTable};
use crate::markup::{escape_attr, escape_text};

/// Distance between the pointer and the overlay corner.
pub const POINTER_OFFSET: f32 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionMode {
    /// Show while the pointer is over a term, hide when it leaves.
    #[default]
    Hover,
    /// Clicking a term toggles a pinned definition; clicking elsewhere closes it.
    ClickToPin,
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionMode::Hover => write!(f, "hover"),
            InteractionMode::ClickToPin => write!(f, "click-to-pin"),
        }
    }
}

impl FromStr for InteractionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hover" => Ok(InteractionMode::Hover),
            "click" | "pin" | "click-to-pin" => Ok(InteractionMode::ClickToPin),
            other => Err(format!(
                "unknown interaction mode {other:?} (expected hover or click-to-pin)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizontal {
    Right,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vertical {
    Below,
    Above,
}

/// The open definition overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub term: String,
    pub entry: GlossaryEntry,
    pub origin: Point,
    pub horizontal: Horizontal,
    pub vertical: Vertical,
    pub pinned: bool,
}

impl Overlay {
    pub fn html(&self) -> String {
        render_definition_html(&self.term, &self.entry)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PopupEvent {
    PointerEnter { term: String, at: Point },
    PointerMove { at: Point },
    PointerLeave { term: String },
    Click { term: String, at: Point },
    ClickOutside,
    Dismiss,
    /// The page was re-rendered; every overlay must go.
    PageChanged,
}

pub struct PopupController {
    glossary: Arc<GlossaryTable>,
    mode: InteractionMode,
    viewport: Size,
    overlay_size: Size,
    open: Option<Overlay>,
}

impl PopupController {
    pub fn new(glossary: Arc<GlossaryTable>, mode: InteractionMode, viewport: Size) -> Self {
        Self {
            glossary,
            mode,
            viewport,
            overlay_size: Size::new(320.0, 180.0),
            open: None,
        }
    }

    pub fn with_overlay_size(mut self, size: Size) -> Self {
        self.overlay_size = size;
        self
    }

    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    pub fn open(&self) -> Option<&Overlay> {
        self.open.as_ref()
    }

    pub fn viewport(&self) -> Size {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Size) {
        self.viewport = viewport;
        if let Some(overlay) = self.open.take() {
            let origin = overlay.origin;
            self.open = Some(self.place(overlay, origin));
        }
    }

    /// Swaps in the glossary of a newly opened chapter and closes any overlay.
    pub fn replace_glossary(&mut self, glossary: Arc<GlossaryTable>) {
        self.glossary = glossary;
        self.open = None;
    }

    pub fn handle(&mut self, event: PopupEvent) -> Option<&Overlay> {
        match (self.mode, event) {
            (_, PopupEvent::PageChanged) | (_, PopupEvent::Dismiss) => self.open = None,
            (InteractionMode::Hover, PopupEvent::PointerEnter { term, at }) => {
                self.open = self.overlay_for(&term, at, false);
            }
            (InteractionMode::Hover, PopupEvent::PointerMove { at }) => {
                if let Some(overlay) = self.open.take() {
                    self.open = Some(self.place(overlay, at));
                }
            }
            (InteractionMode::Hover, PopupEvent::PointerLeave { term }) => {
                if self.is_open_for(&term) {
                    self.open = None;
                }
            }
            (InteractionMode::ClickToPin, PopupEvent::Click { term, at }) => {
                self.open = if self.is_open_for(&term) {
                    None
                } else {
                    self.overlay_for(&term, at, true)
                };
            }
            (InteractionMode::ClickToPin, PopupEvent::ClickOutside) => self.open = None,
            _ => {}
        }
        self.open.as_ref()
    }

    fn is_open_for(&self, term: &str) -> bool {
        self.open.as_ref().is_some_and(|overlay| {
            self.glossary
                .lookup(term)
                .is_some_and(|(canonical, _)| canonical == overlay.term)
        })
    }

    fn overlay_for(&self, term: &str, at: Point, pinned: bool) -> Option<Overlay> {
        let Some((canonical, entry)) = self.glossary.lookup(term) else {
            debug!(term = %term, "No glossary entry for annotated term");
            return None;
        };
        let overlay = Overlay {
            term: canonical.to_string(),
            entry: entry.clone(),
            origin: at,
            horizontal: Horizontal::Right,
            vertical: Vertical::Below,
            pinned,
        };
        Some(self.place(overlay, at))
    }

    fn place(&self, mut overlay: Overlay, at: Point) -> Overlay {
        let fits_right = at.x + POINTER_OFFSET + self.overlay_size.width <= self.viewport.width;
        let fits_left = at.x - POINTER_OFFSET - self.overlay_size.width >= 0.0;
        overlay.horizontal = if fits_right || !fits_left {
            Horizontal::Right
        } else {
            Horizontal::Left
        };
        let fits_below = at.y + POINTER_OFFSET + self.overlay_size.height <= self.viewport.height;
        let fits_above = at.y - POINTER_OFFSET - self.overlay_size.height >= 0.0;
        overlay.vertical = if fits_below || !fits_above {
            Vertical::Below
        } else {
            Vertical::Above
        };
        overlay.origin = at;
        overlay
    }

    /// Top-left corner of the open overlay, kept inside the viewport.
    pub fn overlay_position(&self) -> Option<Point> {
        let overlay = self.open.as_ref()?;
        let x = match overlay.horizontal {
            Horizontal::Right => overlay.origin.x + POINTER_OFFSET,
            Horizontal::Left => overlay.origin.x - POINTER_OFFSET - self.overlay_size.width,
        };
        let y = match overlay.vertical {
            Vertical::Below => overlay.origin.y + POINTER_OFFSET,
            Vertical::Above => overlay.origin.y - POINTER_OFFSET - self.overlay_size.height,
        };
        let max_x = (self.viewport.width - self.overlay_size.width).max(0.0);
        let max_y = (self.viewport.height - self.overlay_size.height).max(0.0);
        Some(Point::new(x.clamp(0.0, max_x), y.clamp(0.0, max_y)))
    }
}

/// Popup body: term label, definition and optional image.
pub fn render_definition_html(term: &str, entry: &GlossaryEntry) -> String {
    let mut html = format!(
        "<strong>{}</strong><p>{}</p>",
        escape_text(term),
        escape_text(&entry.definition)
    );
    if let Some(image) = &entry.image {
        html.push_str(&format!(
            r#"<img src="{}" alt="{}">"#,
            escape_attr(image),
            escape_attr(term)
        ));
    }
    html
}
