use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{CONFIG_FILE, PortalConfig, SiteConfig};
use crate::error::{PortalError, Result};
use crate::glossary::{GlossaryEntry, GlossaryTable};
use crate::manifest::{ChapterManifestEntry, Manifest};
use crate::pages::{MarkerWarning, lint_markers};
use crate::site::{SiteSummary, build_site};

/// Parses bulk glossary text: `term: definition` per line, plus optional
/// `term: image-url` lines. Each line splits at its first colon, so URLs keep theirs.
/// Images are attached only to terms that have a definition.
pub fn parse_glossary_bulk(definitions: &str, images: &str) -> GlossaryTable {
    let mut entries: BTreeMap<String, GlossaryEntry> = BTreeMap::new();
    for (term, definition) in bulk_lines(definitions) {
        entries.insert(term.to_string(), GlossaryEntry::new(definition));
    }
    for (term, url) in bulk_lines(images) {
        match entries.get_mut(term) {
            Some(entry) => entry.image = Some(url.to_string()),
            None => debug!(term = %term, "Image line for a term without a definition"),
        }
    }
    GlossaryTable::from_entries(entries)
}

fn bulk_lines(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some((term, value)) = line.split_once(':') else {
            debug!(line = %line, "Skipping bulk line without a colon");
            return None;
        };
        let (term, value) = (term.trim(), value.trim());
        (!term.is_empty() && !value.is_empty()).then_some((term, value))
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterDraft {
    pub title: String,
    pub text: String,
}

impl ChapterDraft {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalExport {
    pub glossary: GlossaryTable,
    pub manifest: Manifest,
    pub chapters: Vec<(String, String)>,
    pub config: PortalConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenPortal {
    pub files: Vec<PathBuf>,
    pub site: SiteSummary,
}

/// Numbers drafts from 1 as `chapterN.txt`; blank titles become `Chapter N`.
pub fn build_export(glossary: GlossaryTable, drafts: &[ChapterDraft], site: SiteConfig) -> PortalExport {
    let mut entries = Vec::with_capacity(drafts.len());
    let mut chapters = Vec::with_capacity(drafts.len());
    for (idx, draft) in drafts.iter().enumerate() {
        let number = idx as u32 + 1;
        let file = format!("chapter{number}.txt");
        let title = match draft.title.trim() {
            "" => format!("Chapter {number}"),
            title => title.to_string(),
        };
        entries.push(ChapterManifestEntry {
            number,
            title,
            file: file.clone(),
        });
        chapters.push((file, draft.text.trim().to_string()));
    }
    PortalExport {
        glossary,
        manifest: Manifest::new(entries),
        chapters,
        config: PortalConfig {
            site,
            ..PortalConfig::default()
        },
    }
}

impl PortalExport {
    pub fn lint(&self) -> Vec<(String, MarkerWarning)> {
        self.chapters
            .iter()
            .flat_map(|(file, text)| {
                lint_markers(text)
                    .into_iter()
                    .map(move |warning| (file.clone(), warning))
            })
            .collect()
    }

    pub fn files(&self) -> Result<Vec<(PathBuf, String)>> {
        let paths = &self.config.paths;
        let chapters_dir = PathBuf::from(&paths.chapters);
        let mut files = vec![
            (PathBuf::from(&paths.glossary), self.glossary.to_json_pretty()?),
            (PathBuf::from(&paths.manifest), self.manifest.to_json_pretty()?),
        ];
        for (file, text) in &self.chapters {
            files.push((chapters_dir.join(file), text.clone()));
        }
        files.push((PathBuf::from(CONFIG_FILE), self.config.to_toml_string()?));
        Ok(files)
    }

    /// Writes every artifact under `root`, then renders the static reader beside them
    /// so the chapter links in `index.html` resolve.
    pub fn write_to(&self, root: &Path) -> Result<WrittenPortal> {
        let mut files = Vec::new();
        for (relative, contents) in self.files()? {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| PortalError::io(parent, err))?;
            }
            fs::write(&path, contents).map_err(|err| PortalError::io(&path, err))?;
            files.push(path);
        }
        info!(
            root = %root.display(),
            chapters = self.chapters.len(),
            terms = self.glossary.len(),
            "Portal artifacts exported"
        );
        let site = build_site(root, root, &self.config)?;
        files.push(root.join("index.html"));
        Ok(WrittenPortal { files, site })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_glossary_splits_at_first_colon() {
        let table = parse_glossary_bulk(
            "cattail: tall wetland plant used for mats\n\nratio: 3:1 mix\nno colon here\n: orphan\n",
            "cattail: https://example.com/image.jpg\nunknown: https://example.com/x.jpg\n",
        );
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("cattail"),
            Some(
                &GlossaryEntry::new("tall wetland plant used for mats")
                    .with_image("https://example.com/image.jpg")
            )
        );
        assert_eq!(table.get("ratio").map(|e| e.definition.as_str()), Some("3:1 mix"));
        assert!(table.get("unknown").is_none());
    }

    #[test]
    fn drafts_are_numbered_with_default_titles() {
        let export = build_export(
            GlossaryTable::new(),
            &[
                ChapterDraft::new("The River", "  [startPage=1]Text[endPage=1]\n"),
                ChapterDraft::new(" ", "[startPage=1]More[endPage=1]"),
            ],
            SiteConfig::default(),
        );
        let titles: Vec<&str> = export.manifest.entries().iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["The River", "Chapter 2"]);
        assert_eq!(export.chapters[0], ("chapter1.txt".to_string(), "[startPage=1]Text[endPage=1]".to_string()));
        assert_eq!(export.manifest.entries()[1].file, "chapter2.txt");
    }

    #[test]
    fn lint_reports_marker_problems_per_chapter() {
        let export = build_export(
            GlossaryTable::new(),
            &[ChapterDraft::new("", "[startPage=2]b[endPage=2][startPage=1]a[endPage=1]")],
            SiteConfig::default(),
        );
        let warnings = export.lint();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, "chapter1.txt");
    }

    #[test]
    fn export_writes_loadable_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let glossary = parse_glossary_bulk("canoe: a narrow boat", "");
        let site = SiteConfig {
            title: "Tides".to_string(),
            ..SiteConfig::default()
        };
        let export = build_export(glossary, &[ChapterDraft::new("One", "[startPage=1]A canoe.[endPage=1]")], site);
        let written = export.write_to(dir.path()).expect("writes");
        assert_eq!(written.files.len(), 5);
        assert_eq!(written.site.page_count(), 1);

        let glossary = GlossaryTable::load_or_empty(&dir.path().join("glossary.json"));
        assert_eq!(glossary.len(), 1);
        let manifest = Manifest::load_or_empty(&dir.path().join("chapters/manifest.json"));
        assert_eq!(manifest.display_title("1"), "One");
        assert_eq!(PortalConfig::load_from_dir(dir.path()).site.title, "Tides");
        let index = fs::read_to_string(dir.path().join("index.html")).expect("index");
        assert!(index.contains("Chapter 1: One"));
    }

    #[test]
    fn exported_index_links_resolve() {
        let dir = tempfile::tempdir().expect("tempdir");
        let export = build_export(
            parse_glossary_bulk("canoe: a narrow boat", ""),
            &[
                ChapterDraft::new("One", "[startPage=1]A canoe.[endPage=1]"),
                ChapterDraft::new("Two", "Unmarked text."),
            ],
            SiteConfig::default(),
        );
        export.write_to(dir.path()).expect("writes");

        let index = fs::read_to_string(dir.path().join("index.html")).expect("index");
        let hrefs: Vec<&str> = index
            .split("href=\"")
            .skip(1)
            .filter_map(|rest| rest.split('"').next())
            .filter(|href| href.starts_with("read/"))
            .collect();
        assert_eq!(hrefs.len(), 2);
        for href in hrefs {
            assert!(dir.path().join(href).is_file(), "{href} missing");
        }
        assert!(dir.path().join("read/chapter1/1.html").is_file());
    }
}
