use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::annotate::{Annotator, AnnotatorOptions, annotated_terms};
use crate::config::PortalConfig;
use crate::error::{FetchError, PortalError, Result};
use crate::glossary::GlossaryTable;
use crate::loader::{ChapterLoader, LoadedChapter, PortalSource};
use crate::pages::{Page, lint_markers, parse_pages, strip_markers};
use crate::paragraphs::split_paragraphs;
use crate::popup::{InteractionMode, PopupController, PopupEvent, Size, render_definition_html};
use crate::progress::{ProgressStore, resume_index};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderState {
    pub current_page_index: usize,
    pub pages: Vec<Page>,
}

impl RenderState {
    /// Starts at the stored index when it is in range, otherwise at the first page.
    pub fn resume(pages: Vec<Page>, stored: Option<usize>) -> Self {
        Self {
            current_page_index: resume_index(stored, pages.len()),
            pages,
        }
    }

    pub fn current(&self) -> Option<&Page> {
        self.pages.get(self.current_page_index)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn has_prev(&self) -> bool {
        self.current_page_index > 0
    }

    pub fn has_next(&self) -> bool {
        self.current_page_index + 1 < self.pages.len()
    }

    /// Number of the last page in source order, used as the counter total.
    pub fn last_number(&self) -> Option<u32> {
        self.pages.last().map(|page| page.number)
    }

    pub fn go_to(&mut self, index: usize) -> bool {
        if index >= self.pages.len() || index == self.current_page_index {
            return false;
        }
        self.current_page_index = index;
        true
    }

    pub fn next(&mut self) -> bool {
        self.has_next() && self.go_to(self.current_page_index + 1)
    }

    pub fn prev(&mut self) -> bool {
        self.has_prev() && self.go_to(self.current_page_index - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterBody {
    Paginated(RenderState),
    Unpaginated { text: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermCard {
    pub term: String,
    pub definition_html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedPage {
    pub chapter: String,
    pub title: String,
    pub page_number: Option<u32>,
    pub index: usize,
    pub page_count: usize,
    pub page_label: String,
    pub counter_label: String,
    pub paragraphs: Vec<String>,
    pub terms: Vec<TermCard>,
    pub has_prev: bool,
    pub has_next: bool,
    pub dropcap: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChapterView {
    chapter: String,
    title: String,
    glossary: Arc<GlossaryTable>,
    annotator: Arc<Annotator>,
    body: ChapterBody,
}

impl ChapterView {
    pub fn from_loaded(
        loaded: LoadedChapter,
        options: AnnotatorOptions,
        strict_pagination: bool,
        stored_index: Option<usize>,
    ) -> Self {
        let annotator = Arc::new(Annotator::new(&loaded.glossary, options));
        let glossary = Arc::new(loaded.glossary);
        Self::build(
            loaded.chapter,
            loaded.title,
            loaded.text,
            glossary,
            annotator,
            strict_pagination,
            stored_index,
        )
    }

    pub fn build(
        chapter: String,
        title: String,
        text: std::result::Result<String, FetchError>,
        glossary: Arc<GlossaryTable>,
        annotator: Arc<Annotator>,
        strict_pagination: bool,
        stored_index: Option<usize>,
    ) -> Self {
        let body = match text {
            Err(source) => ChapterBody::Failed {
                message: PortalError::ChapterUnavailable {
                    chapter: chapter.clone(),
                    source,
                }
                .to_string(),
            },
            Ok(raw) => {
                for warning in lint_markers(&raw) {
                    warn!(chapter = %chapter, "{warning}");
                }
                let pages = parse_pages(&raw);
                if !pages.is_empty() {
                    ChapterBody::Paginated(RenderState::resume(pages, stored_index))
                } else if strict_pagination {
                    ChapterBody::Failed {
                        message: PortalError::Unpaginated(chapter.clone()).to_string(),
                    }
                } else {
                    debug!(chapter = %chapter, "No page markers; rendering unpaginated");
                    ChapterBody::Unpaginated {
                        text: strip_markers(&raw),
                    }
                }
            }
        };
        Self {
            chapter,
            title,
            glossary,
            annotator,
            body,
        }
    }

    pub fn chapter(&self) -> &str {
        &self.chapter
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn glossary(&self) -> &Arc<GlossaryTable> {
        &self.glossary
    }

    pub fn body(&self) -> &ChapterBody {
        &self.body
    }

    pub fn state(&self) -> Option<&RenderState> {
        match &self.body {
            ChapterBody::Paginated(state) => Some(state),
            _ => None,
        }
    }

    pub fn page_count(&self) -> usize {
        self.state().map_or(0, RenderState::page_count)
    }

    /// Index to persist as reading progress; only paginated chapters have one.
    pub fn current_index(&self) -> Option<usize> {
        self.state().map(|state| state.current_page_index)
    }

    pub fn next(&mut self) -> bool {
        self.state_mut().is_some_and(RenderState::next)
    }

    pub fn prev(&mut self) -> bool {
        self.state_mut().is_some_and(RenderState::prev)
    }

    pub fn go_to(&mut self, index: usize) -> bool {
        self.state_mut().is_some_and(|state| state.go_to(index))
    }

    fn state_mut(&mut self) -> Option<&mut RenderState> {
        match &mut self.body {
            ChapterBody::Paginated(state) => Some(state),
            _ => None,
        }
    }

    pub fn render(&self) -> RenderedPage {
        match &self.body {
            ChapterBody::Paginated(state) => self.render_page(state, state.current_page_index),
            ChapterBody::Unpaginated { text } => {
                let paragraphs = self.annotator.annotate_all(&split_paragraphs(text));
                RenderedPage {
                    terms: self.term_cards(&paragraphs),
                    paragraphs,
                    dropcap: true,
                    ..self.empty_page()
                }
            }
            ChapterBody::Failed { message } => RenderedPage {
                error: Some(message.clone()),
                ..self.empty_page()
            },
        }
    }

    /// Renders the page at `index` without moving the view; `None` when out of range
    /// or when the chapter is not paginated.
    pub fn render_at(&self, index: usize) -> Option<RenderedPage> {
        let state = self.state()?;
        (index < state.page_count()).then(|| self.render_page(state, index))
    }

    fn render_page(&self, state: &RenderState, index: usize) -> RenderedPage {
        let Some(page) = state.pages.get(index) else {
            return self.empty_page();
        };
        let paragraphs = self.annotator.annotate_all(&split_paragraphs(&page.content));
        let last = state.last_number().unwrap_or(page.number);
        RenderedPage {
            chapter: self.chapter.clone(),
            title: self.title.clone(),
            page_number: Some(page.number),
            index,
            page_count: state.page_count(),
            page_label: format!("Page {}", page.number),
            counter_label: format!("Page {} of {}", page.number, last),
            terms: self.term_cards(&paragraphs),
            paragraphs,
            has_prev: index > 0,
            has_next: index + 1 < state.page_count(),
            dropcap: index == 0,
            error: None,
        }
    }

    fn empty_page(&self) -> RenderedPage {
        RenderedPage {
            chapter: self.chapter.clone(),
            title: self.title.clone(),
            page_number: None,
            index: 0,
            page_count: 0,
            page_label: String::new(),
            counter_label: String::new(),
            paragraphs: Vec::new(),
            terms: Vec::new(),
            has_prev: false,
            has_next: false,
            dropcap: false,
            error: None,
        }
    }

    fn term_cards(&self, paragraphs: &[String]) -> Vec<TermCard> {
        let mut cards: Vec<TermCard> = Vec::new();
        for term in paragraphs.iter().flat_map(|html| annotated_terms(html)) {
            if cards.iter().any(|card| card.term == term) {
                continue;
            }
            // Spans whose term is not in this glossary get no card.
            if let Some((canonical, entry)) = self.glossary.lookup(&term) {
                cards.push(TermCard {
                    term: term.clone(),
                    definition_html: render_definition_html(canonical, entry),
                });
            }
        }
        cards
    }
}

pub struct ReaderSession<S, P> {
    loader: ChapterLoader<S>,
    progress: P,
    options: AnnotatorOptions,
    strict_pagination: bool,
    popups: PopupController,
    view: Option<ChapterView>,
}

impl<S: PortalSource, P: ProgressStore> ReaderSession<S, P> {
    pub fn new(loader: ChapterLoader<S>, progress: P, config: &PortalConfig, viewport: Size) -> Self {
        Self {
            loader,
            progress,
            options: config.annotator_options(),
            strict_pagination: config.reader.strict_pagination,
            popups: PopupController::new(
                Arc::new(GlossaryTable::new()),
                config.reader.interaction,
                viewport,
            ),
            view: None,
        }
    }

    pub fn with_interaction(mut self, mode: InteractionMode) -> Self {
        let viewport = self.popups.viewport();
        self.popups = PopupController::new(Arc::new(GlossaryTable::new()), mode, viewport);
        if let Some(view) = &self.view {
            self.popups.replace_glossary(Arc::clone(view.glossary()));
        }
        self
    }

    /// Opens a chapter and renders the page the reader last viewed. Returns `Ok(None)`
    /// when a newer load superseded this one.
    pub async fn open(&mut self, chapter: &str) -> Result<Option<RenderedPage>> {
        let Some(loaded) = self.loader.load(chapter).await? else {
            return Ok(None);
        };
        let stored = self.progress.load(&loaded.chapter);
        let view = ChapterView::from_loaded(loaded, self.options, self.strict_pagination, stored);
        info!(
            chapter = %view.chapter(),
            pages = view.page_count(),
            terms = view.glossary().len(),
            "Opened chapter"
        );
        self.popups.replace_glossary(Arc::clone(view.glossary()));
        self.view = Some(view);
        Ok(self.commit())
    }

    pub fn view(&self) -> Option<&ChapterView> {
        self.view.as_ref()
    }

    pub fn current(&self) -> Option<RenderedPage> {
        self.view.as_ref().map(ChapterView::render)
    }

    pub fn next_page(&mut self) -> Option<RenderedPage> {
        self.navigate(ChapterView::next)
    }

    pub fn prev_page(&mut self) -> Option<RenderedPage> {
        self.navigate(ChapterView::prev)
    }

    pub fn go_to(&mut self, index: usize) -> Option<RenderedPage> {
        self.navigate(|view| view.go_to(index))
    }

    pub fn popups(&self) -> &PopupController {
        &self.popups
    }

    pub fn handle_popup(&mut self, event: PopupEvent) -> Option<String> {
        self.popups.handle(event).map(|overlay| overlay.html())
    }

    pub fn progress(&self) -> &P {
        &self.progress
    }

    fn navigate(&mut self, step: impl FnOnce(&mut ChapterView) -> bool) -> Option<RenderedPage> {
        let view = self.view.as_mut()?;
        if !step(view) {
            return None;
        }
        self.commit()
    }

    /// Replaces the rendered output: clears overlays and persists the page index.
    fn commit(&mut self) -> Option<RenderedPage> {
        let view = self.view.as_ref()?;
        self.popups.handle(PopupEvent::PageChanged);
        if let Some(index) = view.current_index() {
            self.progress.save(view.chapter(), index);
        }
        Some(view.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::AnnotationPolicy;
    use crate::loader::{MemorySource, PortalPaths};
    use crate::popup::Point;
    use crate::progress::MemoryProgress;

    const GLOSSARY: &str = r#"{
        "canoe": "a narrow boat",
        "long house": {"definition": "a shared dwelling", "image": "https://example.com/lh.png"},
        "house": "a building"
    }"#;
    const MANIFEST: &str = r#"[{"number": 1, "title": "The River", "file": "chapter1.txt"}]"#;
    const CHAPTER: &str = "[startPage=3]The canoe reached the long house.\n\nA canoe waited.[endPage=3]\
[startPage=4]Nobody was home.[endPage=4][startPage=5]The house was quiet.[endPage=5]";

    fn source() -> MemorySource {
        MemorySource::new()
            .with_file("glossary.json", GLOSSARY)
            .with_file("chapters/manifest.json", MANIFEST)
            .with_file("chapters/chapter1.txt", CHAPTER)
            .with_file("chapters/chapter2.txt", "No markers here.\n\nA canoe drifted.")
    }

    fn session(source: MemorySource, config: &PortalConfig) -> ReaderSession<MemorySource, MemoryProgress> {
        ReaderSession::new(
            ChapterLoader::new(source, PortalPaths::default()),
            MemoryProgress::default(),
            config,
            Size::new(1024.0, 768.0),
        )
    }

    #[tokio::test]
    async fn renders_first_page_with_labels_and_cards() {
        let mut reader = session(source(), &PortalConfig::default());
        let page = reader.open("1").await.expect("loads").expect("current");
        assert_eq!(page.title, "The River");
        assert_eq!(page.page_label, "Page 3");
        assert_eq!(page.counter_label, "Page 3 of 5");
        assert_eq!(page.paragraphs.len(), 2);
        assert!(page.dropcap);
        assert!(!page.has_prev && page.has_next);
        assert!(page.paragraphs[0].contains(r#"data-word="long house""#));
        assert!(!page.paragraphs[0].contains(r#"data-word="house""#));
        let terms: Vec<&str> = page.terms.iter().map(|card| card.term.as_str()).collect();
        assert_eq!(terms, vec!["canoe", "long house"]);
        assert!(page.terms[1].definition_html.contains("lh.png"));
    }

    #[tokio::test]
    async fn navigation_persists_progress_and_resumes() {
        let mut reader = session(source(), &PortalConfig::default());
        reader.open("chapter1.txt").await.expect("loads");
        let page = reader.next_page().expect("moved");
        assert_eq!(page.page_label, "Page 4");
        assert!(!page.dropcap);
        assert_eq!(reader.progress().load("chapter1.txt"), Some(1));
        reader.next_page().expect("moved");
        assert!(reader.next_page().is_none());
        assert_eq!(reader.progress().load("chapter1.txt"), Some(2));

        let page = reader.open("1").await.expect("loads").expect("current");
        assert_eq!(page.page_label, "Page 5");
        assert!(!page.has_next);
    }

    #[tokio::test]
    async fn out_of_range_progress_resumes_at_first_page() {
        let mut progress = MemoryProgress::default();
        progress.save("chapter1.txt", 9);
        let mut reader = ReaderSession::new(
            ChapterLoader::new(source(), PortalPaths::default()),
            progress,
            &PortalConfig::default(),
            Size::new(1024.0, 768.0),
        );
        let page = reader.open("1").await.expect("loads").expect("current");
        assert_eq!(page.index, 0);
        assert_eq!(reader.progress().load("chapter1.txt"), Some(0));
    }

    #[tokio::test]
    async fn glossary_failure_still_renders_without_annotations() {
        let source = MemorySource::new().with_file("chapters/chapter1.txt", CHAPTER);
        let mut reader = session(source, &PortalConfig::default());
        let page = reader.open("1").await.expect("loads").expect("current");
        assert_eq!(page.title, "Chapter 1");
        assert!(page.error.is_none());
        assert!(page.terms.is_empty());
        assert!(page.paragraphs.iter().all(|p| !p.contains("<span")));
    }

    #[tokio::test]
    async fn missing_chapter_renders_error_body() {
        let mut reader = session(source(), &PortalConfig::default());
        let page = reader.open("7").await.expect("loads").expect("current");
        assert!(page.paragraphs.is_empty());
        assert_eq!(
            page.error.as_deref(),
            Some("unable to load chapter chapter7.txt: chapters/chapter7.txt not found")
        );
    }

    #[tokio::test]
    async fn unmarked_chapters_render_whole_or_fail_when_strict() {
        let mut reader = session(source(), &PortalConfig::default());
        let page = reader.open("2").await.expect("loads").expect("current");
        assert_eq!(page.paragraphs.len(), 2);
        assert!(page.dropcap);
        assert!(page.counter_label.is_empty());
        assert!(reader.next_page().is_none());

        let mut config = PortalConfig::default();
        config.reader.strict_pagination = true;
        let mut strict = session(source(), &config);
        let page = strict.open("2").await.expect("loads").expect("current");
        assert_eq!(page.error.as_deref(), Some("chapter chapter2.txt has no page markers"));
    }

    #[tokio::test]
    async fn every_occurrence_policy_wraps_repeats() {
        let mut config = PortalConfig::default();
        config.reader.annotation = AnnotationPolicy::EveryOccurrence;
        let mut reader = session(
            MemorySource::new()
                .with_file("glossary.json", GLOSSARY)
                .with_file("chapters/chapter1.txt", "[startPage=1]canoe and canoe[endPage=1]"),
            &config,
        );
        let page = reader.open("1").await.expect("loads").expect("current");
        assert_eq!(page.paragraphs[0].matches("<span").count(), 2);
        assert_eq!(page.terms.len(), 1);
    }

    #[tokio::test]
    async fn page_change_closes_popups() {
        let mut config = PortalConfig::default();
        config.reader.interaction = InteractionMode::ClickToPin;
        let mut reader = session(source(), &config);
        reader.open("1").await.expect("loads");
        let html = reader
            .handle_popup(PopupEvent::Click {
                term: "canoe".to_string(),
                at: Point::new(10.0, 10.0),
            })
            .expect("pinned");
        assert!(html.contains("a narrow boat"));
        reader.next_page().expect("moved");
        assert!(reader.popups().open().is_none());
    }

    #[test]
    fn render_at_leaves_the_view_in_place() {
        let loaded = LoadedChapter {
            chapter: "chapter1.txt".to_string(),
            title: "The River".to_string(),
            glossary: GlossaryTable::new(),
            manifest: Default::default(),
            text: Ok(CHAPTER.to_string()),
        };
        let view = ChapterView::from_loaded(loaded, AnnotatorOptions::default(), false, None);
        let last = view.render_at(2).expect("in range");
        assert_eq!(last.page_label, "Page 5");
        assert!(view.render_at(3).is_none());
        assert_eq!(view.current_index(), Some(0));
    }
}
