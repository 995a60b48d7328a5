use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PortalConfig;
use crate::error::{FetchError, Result};
use crate::glossary::GlossaryTable;
use crate::manifest::{Manifest, chapter_file_name};

pub trait PortalSource: Send + Sync {
    /// Reads one artifact by its portal-relative path.
    fn fetch(&self, path: &str) -> impl Future<Output = std::result::Result<String, FetchError>> + Send;
}

#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

impl PortalSource for DirSource {
    async fn fetch(&self, path: &str) -> std::result::Result<String, FetchError> {
        tokio::fs::read_to_string(self.root.join(path))
            .await
            .map_err(|err| FetchError::from_io(path, &err))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, String>,
    delays: HashMap<String, Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, body: impl Into<String>) -> Self {
        self.files.insert(path.into(), body.into());
        self
    }

    pub fn with_delay(mut self, path: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(path.into(), delay);
        self
    }
}

impl PortalSource for MemorySource {
    async fn fetch(&self, path: &str) -> std::result::Result<String, FetchError> {
        if let Some(delay) = self.delays.get(path) {
            tokio::time::sleep(*delay).await;
        }
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(path.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalPaths {
    pub glossary: String,
    pub manifest: String,
    pub chapters: String,
}

impl Default for PortalPaths {
    fn default() -> Self {
        Self::from_config(&PortalConfig::default())
    }
}

impl PortalPaths {
    pub fn from_config(config: &PortalConfig) -> Self {
        Self {
            glossary: config.paths.glossary.clone(),
            manifest: config.paths.manifest.clone(),
            chapters: config.paths.chapters.trim_end_matches('/').to_string(),
        }
    }

    pub fn chapter_path(&self, file: &str) -> String {
        if self.chapters.is_empty() {
            file.to_string()
        } else {
            format!("{}/{}", self.chapters, file)
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedChapter {
    /// Resolved chapter file name, also the reading-progress key.
    pub chapter: String,
    pub title: String,
    pub glossary: GlossaryTable,
    pub manifest: Manifest,
    pub text: std::result::Result<String, FetchError>,
}

/// Fetches glossary, manifest and chapter text concurrently and applies the per-source
/// fallbacks. Only an unusable chapter identifier is an error.
pub async fn load_chapter<S: PortalSource + ?Sized>(
    source: &S,
    paths: &PortalPaths,
    chapter: &str,
) -> Result<LoadedChapter> {
    let file = chapter_file_name(chapter)?;
    let chapter_path = paths.chapter_path(&file);

    let (glossary, manifest, text) = tokio::join!(
        source.fetch(&paths.glossary),
        source.fetch(&paths.manifest),
        source.fetch(&chapter_path),
    );

    let glossary = match glossary {
        Ok(body) => GlossaryTable::from_json_or_empty(&body),
        Err(err) => {
            warn!(error = %err, "Glossary unavailable; rendering without annotations");
            GlossaryTable::new()
        }
    };
    let manifest = match manifest {
        Ok(body) => Manifest::from_json_or_empty(&body),
        Err(err) => {
            warn!(error = %err, "Manifest unavailable; using generic chapter titles");
            Manifest::default()
        }
    };
    if let Err(err) = &text {
        warn!(chapter = %file, error = %err, "Chapter text unavailable");
    }

    Ok(LoadedChapter {
        title: manifest.display_title(&file),
        chapter: file,
        glossary,
        manifest,
        text,
    })
}

/// Monotonic load counter shared by everything that can start a chapter load.
#[derive(Debug, Clone, Default)]
pub struct LoadGeneration(Arc<AtomicU64>);

impl LoadGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new load, making every earlier ticket stale.
    pub fn begin(&self) -> LoadTicket {
        let generation = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        LoadTicket {
            generation,
            counter: Arc::clone(&self.0),
        }
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct LoadTicket {
    generation: u64,
    counter: Arc<AtomicU64>,
}

impl LoadTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.generation
    }
}

#[derive(Debug)]
pub struct ChapterLoader<S> {
    source: Arc<S>,
    paths: PortalPaths,
    generation: LoadGeneration,
}

impl<S> Clone for ChapterLoader<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            paths: self.paths.clone(),
            generation: self.generation.clone(),
        }
    }
}

impl<S: PortalSource> ChapterLoader<S> {
    pub fn new(source: S, paths: PortalPaths) -> Self {
        Self {
            source: Arc::new(source),
            paths,
            generation: LoadGeneration::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn paths(&self) -> &PortalPaths {
        &self.paths
    }

    /// Returns `Ok(None)` when another load started before this one finished.
    pub async fn load(&self, chapter: &str) -> Result<Option<LoadedChapter>> {
        let ticket = self.generation.begin();
        let loaded = load_chapter(self.source.as_ref(), &self.paths, chapter).await?;
        if !ticket.is_current() {
            debug!(
                chapter = %loaded.chapter,
                generation = ticket.generation(),
                "Discarding stale chapter load"
            );
            return Ok(None);
        }
        Ok(Some(loaded))
    }
}
