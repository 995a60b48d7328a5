use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::error::{PortalError, Result};

/// Storage key for a chapter's saved page index.
pub fn progress_key(chapter: &str) -> String {
    format!("reading_progress_{chapter}")
}

/// Page index to open for a chapter with `page_count` pages. A missing or out-of-range
/// stored index starts the reader at the first page.
pub fn resume_index(stored: Option<usize>, page_count: usize) -> usize {
    match stored {
        Some(index) if index < page_count => index,
        _ => 0,
    }
}

pub trait ProgressStore {
    fn load(&self, chapter: &str) -> Option<usize>;
    fn save(&mut self, chapter: &str, index: usize);
}

#[derive(Debug, Default, Clone)]
pub struct MemoryProgress {
    positions: BTreeMap<String, usize>,
}

impl ProgressStore for MemoryProgress {
    fn load(&self, chapter: &str) -> Option<usize> {
        self.positions.get(&progress_key(chapter)).copied()
    }

    fn save(&mut self, chapter: &str, index: usize) {
        self.positions.insert(progress_key(chapter), index);
    }
}

/// Positions kept in a small JSON object on disk. Write failures are logged and do not
/// interrupt reading.
#[derive(Debug)]
pub struct JsonFileProgress {
    path: PathBuf,
    positions: BTreeMap<String, usize>,
}

impl JsonFileProgress {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let positions = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(path = %path.display(), "Discarding unreadable reading progress: {err}");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, positions }
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| PortalError::io(parent, err))?;
        }
        let body = serde_json::to_string_pretty(&self.positions)
            .map_err(|err| PortalError::json("progress", err))?;
        fs::write(&self.path, body).map_err(|err| PortalError::io(&self.path, err))
    }
}

impl ProgressStore for JsonFileProgress {
    fn load(&self, chapter: &str) -> Option<usize> {
        self.positions.get(&progress_key(chapter)).copied()
    }

    fn save(&mut self, chapter: &str, index: usize) {
        self.positions.insert(progress_key(chapter), index);
        if let Err(err) = self.flush() {
            warn!(error = %err, "Failed to persist reading progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_index_resumes_at_first_page() {
        assert_eq!(resume_index(None, 5), 0);
        assert_eq!(resume_index(Some(3), 5), 3);
        assert_eq!(resume_index(Some(4), 5), 4);
        assert_eq!(resume_index(Some(5), 5), 0);
        assert_eq!(resume_index(Some(40), 5), 0);
        assert_eq!(resume_index(Some(0), 0), 0);
    }

    #[test]
    fn memory_store_is_keyed_by_chapter() {
        let mut store = MemoryProgress::default();
        store.save("chapter1.txt", 2);
        store.save("chapter2.txt", 7);
        assert_eq!(store.load("chapter1.txt"), Some(2));
        assert_eq!(store.load("chapter2.txt"), Some(7));
        assert_eq!(store.load("chapter3.txt"), None);
    }

    #[test]
    fn json_store_persists_between_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("progress.json");
        let mut store = JsonFileProgress::open(&path);
        store.save("chapter1.txt", 4);

        let reopened = JsonFileProgress::open(&path);
        assert_eq!(reopened.load("chapter1.txt"), Some(4));
        let raw = fs::read_to_string(&path).expect("written");
        assert!(raw.contains("reading_progress_chapter1.txt"));
    }

    #[test]
    fn corrupt_progress_file_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("progress.json");
        fs::write(&path, "not json").expect("write");
        assert_eq!(JsonFileProgress::open(&path).load("chapter1.txt"), None);
    }
}
