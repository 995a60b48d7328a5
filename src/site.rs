use include_dir::{Dir, include_dir};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::annotate::Annotator;
use crate::config::PortalConfig;
use crate::error::{FetchError, PortalError, Result};
use crate::glossary::GlossaryTable;
use crate::manifest::{ChapterManifestEntry, Manifest, chapter_stem};
use crate::reader::{ChapterBody, ChapterView};
use crate::render::{LinkStyle, render_chapter_page, render_index, render_resume_shim};

static ASSETS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/assets");

/// Bundled stylesheet or script by file name.
pub fn asset(name: &str) -> Option<&'static [u8]> {
    ASSETS.get_file(name).map(|file| file.contents())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterSummary {
    pub file: String,
    pub title: String,
    pub pages: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteSummary {
    pub out_dir: PathBuf,
    pub glossary_terms: usize,
    pub chapters: Vec<ChapterSummary>,
}

impl SiteSummary {
    pub fn page_count(&self) -> usize {
        self.chapters.iter().map(|chapter| chapter.pages).sum()
    }
}

/// Builds the static reader for the portal at `root` into `out_dir`.
pub fn build_site(root: &Path, out_dir: &Path, config: &PortalConfig) -> Result<SiteSummary> {
    let glossary = Arc::new(GlossaryTable::load_or_empty(&config.glossary_path(root)));
    let mut manifest = Manifest::load_or_empty(&config.manifest_path(root));
    let chapters_dir = config.chapters_dir(root);
    if manifest.is_empty() {
        manifest = discover_chapters(&chapters_dir)?;
    }
    let annotator = Arc::new(Annotator::new(&glossary, config.annotator_options()));

    create_dir(out_dir)?;
    let chapters = manifest
        .entries()
        .par_iter()
        .map(|entry| {
            build_chapter(
                entry,
                &manifest,
                &chapters_dir,
                out_dir,
                config,
                &glossary,
                &annotator,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    write(&out_dir.join("index.html"), &render_index(&config.site, &manifest, LinkStyle::Static)?)?;
    write_assets(&out_dir.join("assets"))?;
    if let Some(cover) = &config.site.cover {
        copy_cover(root, out_dir, cover);
    }

    let summary = SiteSummary {
        out_dir: out_dir.to_path_buf(),
        glossary_terms: glossary.len(),
        chapters,
    };
    info!(
        out = %out_dir.display(),
        chapters = summary.chapters.len(),
        pages = summary.page_count(),
        "Static reader written"
    );
    Ok(summary)
}

fn build_chapter(
    entry: &ChapterManifestEntry,
    manifest: &Manifest,
    chapters_dir: &Path,
    out_dir: &Path,
    config: &PortalConfig,
    glossary: &Arc<GlossaryTable>,
    annotator: &Arc<Annotator>,
) -> Result<ChapterSummary> {
    let path = chapters_dir.join(&entry.file);
    let text = fs::read_to_string(&path).map_err(|err| FetchError::from_io(&entry.file, &err));
    let title = manifest.display_title(&entry.file);
    let view = ChapterView::build(
        entry.file.clone(),
        title.clone(),
        text,
        Arc::clone(glossary),
        Arc::clone(annotator),
        config.reader.strict_pagination,
        None,
    );

    let dir = out_dir.join("read").join(chapter_stem(&entry.file));
    create_dir(&dir)?;
    let rendered = match view.body() {
        ChapterBody::Paginated(state) => (0..state.page_count())
            .filter_map(|index| view.render_at(index))
            .collect(),
        _ => vec![view.render()],
    };
    for page in &rendered {
        let html = render_chapter_page(page, &config.site, config.reader.interaction, LinkStyle::Static)?;
        write(&dir.join(format!("{}.html", page.index + 1)), &html)?;
    }
    write(
        &dir.join("index.html"),
        &render_resume_shim(&entry.file, &title, view.page_count())?,
    )?;

    let error = rendered.first().and_then(|page| page.error.clone());
    if let Some(message) = &error {
        warn!(chapter = %entry.file, "{message}");
    }
    Ok(ChapterSummary {
        file: entry.file.clone(),
        title,
        pages: view.page_count(),
        error,
    })
}

/// Chapter files in a directory without a manifest, numbered in name order.
fn discover_chapters(dir: &Path) -> Result<Manifest> {
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(err) => {
            warn!(dir = %dir.display(), "No chapters directory: {err}");
            return Ok(Manifest::default());
        }
    };
    let mut files = Vec::new();
    for item in listing {
        let item = item.map_err(|err| PortalError::io(dir, err))?;
        let name = item.file_name().to_string_lossy().into_owned();
        if name.ends_with(".txt") {
            files.push(name);
        }
    }
    files.sort_by_key(|name| (chapter_number(name), name.clone()));
    warn!(count = files.len(), "Manifest missing; listing chapter files in name order");
    Ok(Manifest::new(
        files
            .into_iter()
            .enumerate()
            .map(|(idx, file)| ChapterManifestEntry {
                number: idx as u32 + 1,
                title: String::new(),
                file,
            })
            .collect(),
    ))
}

fn chapter_number(file: &str) -> u32 {
    let digits: String = chapter_stem(file)
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(u32::MAX)
}

fn write_assets(dir: &Path) -> Result<()> {
    create_dir(dir)?;
    for file in ASSETS.files() {
        let target = dir.join(file.path());
        fs::write(&target, file.contents()).map_err(|err| PortalError::io(&target, err))?;
    }
    Ok(())
}

fn copy_cover(root: &Path, out_dir: &Path, cover: &str) {
    let Some(relative) = portal_relative(cover) else {
        warn!(cover = %cover, "Cover must be a relative path inside the portal; not copied");
        return;
    };
    let source = root.join(&relative);
    let target = out_dir.join(&relative);
    if same_file(&source, &target) {
        return;
    }
    if let Some(parent) = target.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(err) = fs::copy(&source, &target) {
        warn!(cover = %source.display(), "Cover image not copied: {err}");
    }
}

/// `path` as plain relative components, or `None` for absolute, rooted or `..` paths.
fn portal_relative(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    let plain = path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    (plain && path.components().any(|c| matches!(c, Component::Normal(_)))).then(|| path.to_path_buf())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| PortalError::io(dir, err))
}

fn write(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|err| PortalError::io(path, err))
}
