pub mod annotate;
pub mod authoring;
pub mod config;
pub mod error;
pub mod glossary;
pub mod loader;
pub mod manifest;
pub mod markup;
pub mod pages;
pub mod paragraphs;
pub mod popup;
pub mod progress;
pub mod reader;
pub mod render;
pub mod site;
#[cfg(feature = "web")]
pub mod web;

pub use annotate::{AnnotationPolicy, Annotator, AnnotatorOptions};
pub use config::PortalConfig;
pub use error::{FetchError, PortalError, Result};
pub use glossary::{GlossaryEntry, GlossaryTable};
pub use loader::{ChapterLoader, DirSource, PortalSource};
pub use manifest::{ChapterManifestEntry, Manifest};
pub use pages::{Page, parse_pages};
pub use paragraphs::split_paragraphs;
pub use popup::{InteractionMode, PopupController, PopupEvent};
pub use progress::{JsonFileProgress, ProgressStore};
pub use reader::{ChapterView, ReaderSession, RenderedPage};
