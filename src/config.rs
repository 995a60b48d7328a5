use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::annotate::{AnnotationPolicy, AnnotatorOptions};
use crate::error::{PortalError, Result};
use crate::popup::InteractionMode;

pub const CONFIG_FILE: &str = "portal.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub reader: ReaderConfig,
    pub site: SiteConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub annotation: AnnotationPolicy,
    pub interaction: InteractionMode,
    /// Fail chapters that carry no page markers instead of showing them unpaginated.
    pub strict_pagination: bool,
    /// Embed definitions as `data-definition` / `data-image` on annotated spans.
    pub inline_definitions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub title: String,
    pub author: String,
    pub subtitle: String,
    pub cover: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            title: "Reading Portal".to_string(),
            author: String::new(),
            subtitle: String::new(),
            cover: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub glossary: String,
    pub manifest: String,
    pub chapters: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            glossary: "glossary.json".to_string(),
            manifest: "chapters/manifest.json".to_string(),
            chapters: "chapters".to_string(),
        }
    }
}

impl PortalConfig {
    pub fn from_toml_str(input: &str, path: &Path) -> Result<Self> {
        toml::from_str(input).map_err(|source| PortalError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads a config file. A missing file yields the defaults silently; an unreadable
    /// or invalid one yields the defaults with a warning.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                warn!(path = %path.display(), "Config unreadable, using defaults: {err}");
                return Self::default();
            }
        };
        Self::from_toml_str(&contents, path).unwrap_or_else(|err| {
            warn!(error = %err, "Config invalid, using defaults");
            Self::default()
        })
    }

    pub fn load_from_dir(root: &Path) -> Self {
        Self::load(&root.join(CONFIG_FILE))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn annotator_options(&self) -> AnnotatorOptions {
        AnnotatorOptions {
            policy: self.reader.annotation,
            inline_definitions: self.reader.inline_definitions,
        }
    }

    pub fn glossary_path(&self, root: &Path) -> PathBuf {
        root.join(&self.paths.glossary)
    }

    pub fn manifest_path(&self, root: &Path) -> PathBuf {
        root.join(&self.paths.manifest)
    }

    pub fn chapters_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.paths.chapters)
    }
}
