use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::{PortalError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterManifestEntry {
    pub number: u32,
    pub title: String,
    pub file: String,
}

impl ChapterManifestEntry {
    /// File name without its extension, e.g. `chapter3`.
    pub fn stem(&self) -> &str {
        chapter_stem(&self.file)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: Vec<ChapterManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ChapterManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|err| PortalError::json("manifest", err))
    }

    pub fn from_json_or_empty(input: &str) -> Self {
        Self::from_json_str(input).unwrap_or_else(|err| {
            warn!(error = %err, "Ignoring malformed manifest; chapter titles fall back to numbers");
            Self::default()
        })
    }

    pub fn load_or_empty(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json_or_empty(&contents),
            Err(err) => {
                warn!(path = %path.display(), "Manifest unavailable: {err}");
                Self::default()
            }
        }
    }

    pub fn entries(&self) -> &[ChapterManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Finds the entry for a `chapter` value given as a file name, a file stem or a
    /// chapter number.
    pub fn resolve(&self, chapter: &str) -> Option<&ChapterManifestEntry> {
        let chapter = chapter.trim();
        self.entries
            .iter()
            .find(|entry| entry.file == chapter)
            .or_else(|| self.entries.iter().find(|entry| entry.stem() == chapter))
            .or_else(|| {
                let number: u32 = chapter.parse().ok()?;
                self.entries.iter().find(|entry| entry.number == number)
            })
    }

    pub fn display_title(&self, chapter: &str) -> String {
        match self.resolve(chapter) {
            Some(entry) if !entry.title.trim().is_empty() => entry.title.clone(),
            Some(entry) => format!("Chapter {}", entry.number),
            None => generic_title(chapter),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| PortalError::json("manifest", err))
    }
}

/// Maps a `chapter` value to the chapter file to fetch without consulting the manifest:
/// numbers become `chapterN.txt`, stems gain `.txt`, and file names pass through.
/// Anything that could escape the chapters directory is rejected.
pub fn chapter_file_name(chapter: &str) -> Result<String> {
    let chapter = chapter.trim();
    let valid = !chapter.is_empty()
        && !chapter.starts_with('.')
        && !chapter.contains("..")
        && chapter
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(PortalError::InvalidChapter(chapter.to_string()));
    }
    if chapter.chars().all(|c| c.is_ascii_digit()) {
        return Ok(format!("chapter{chapter}.txt"));
    }
    if chapter.contains('.') {
        Ok(chapter.to_string())
    } else {
        Ok(format!("{chapter}.txt"))
    }
}

pub fn chapter_stem(file: &str) -> &str {
    file.rsplit_once('.').map_or(file, |(stem, _)| stem)
}

fn generic_title(chapter: &str) -> String {
    let stem = chapter_stem(chapter.trim());
    let label = stem.strip_prefix("chapter").unwrap_or(stem);
    format!("Chapter {label}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest::from_json_str(
            r#"[
                {"number": 1, "title": "The River", "file": "chapter1.txt"},
                {"number": 2, "title": "", "file": "chapter2.txt"}
            ]"#,
        )
        .expect("valid manifest")
    }

    #[test]
    fn resolves_by_file_stem_or_number() {
        let manifest = manifest();
        assert_eq!(manifest.resolve("chapter1.txt").map(|e| e.number), Some(1));
        assert_eq!(manifest.resolve("chapter1").map(|e| e.number), Some(1));
        assert_eq!(manifest.resolve("2").map(|e| e.file.as_str()), Some("chapter2.txt"));
        assert!(manifest.resolve("chapter9.txt").is_none());
    }

    #[test]
    fn titles_fall_back_to_generic_labels() {
        let manifest = manifest();
        assert_eq!(manifest.display_title("chapter1.txt"), "The River");
        assert_eq!(manifest.display_title("chapter2.txt"), "Chapter 2");
        assert_eq!(manifest.display_title("chapter7.txt"), "Chapter 7");
        assert_eq!(Manifest::default().display_title("3"), "Chapter 3");
    }

    #[test]
    fn malformed_manifest_degrades_to_empty() {
        assert!(Manifest::from_json_or_empty(r#"{"number": 1}"#).is_empty());
    }

    #[test]
    fn chapter_file_names_are_derived_and_sanitized() {
        assert_eq!(chapter_file_name("3").unwrap(), "chapter3.txt");
        assert_eq!(chapter_file_name("chapter3").unwrap(), "chapter3.txt");
        assert_eq!(chapter_file_name("chapter3.txt").unwrap(), "chapter3.txt");
        for bad in ["", "../secret", "a/b.txt", ".hidden", "x..txt", "c%2e.txt"] {
            assert!(chapter_file_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
