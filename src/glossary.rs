use serde::{Deserialize, Serialize, Serializer};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{PortalError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl GlossaryEntry {
    pub fn new(definition: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Accepts both the legacy bare-string form and the object form.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Bare(String),
    Full {
        definition: String,
        #[serde(default)]
        image: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlossaryTable {
    entries: BTreeMap<String, GlossaryEntry>,
    folded: HashMap<String, String>,
}

impl GlossaryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table, skipping blank terms and entries with a blank definition.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, GlossaryEntry)>,
        K: Into<String>,
    {
        let mut table = Self::new();
        for (term, entry) in entries {
            table.insert(term.into(), entry);
        }
        table
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawEntry> =
            serde_json::from_str(input).map_err(|err| PortalError::json("glossary", err))?;
        Ok(Self::from_entries(raw.into_iter().map(|(term, raw)| {
            let entry = match raw {
                RawEntry::Bare(definition) => GlossaryEntry::new(definition),
                RawEntry::Full { definition, image } => GlossaryEntry {
                    definition,
                    image: image.filter(|url| !url.trim().is_empty()),
                },
            };
            (term, entry)
        })))
    }

    pub fn from_json_or_empty(input: &str) -> Self {
        Self::from_json_str(input).unwrap_or_else(|err| {
            warn!(error = %err, "Ignoring malformed glossary; rendering without annotations");
            Self::new()
        })
    }

    pub fn load_or_empty(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json_or_empty(&contents),
            Err(err) => {
                warn!(path = %path.display(), "Glossary unavailable: {err}");
                Self::new()
            }
        }
    }

    fn insert(&mut self, term: String, entry: GlossaryEntry) {
        let term = term.trim().to_string();
        if term.is_empty() {
            return;
        }
        if entry.definition.trim().is_empty() {
            debug!(term = %term, "Skipping glossary term without a definition");
            return;
        }
        let folded = term.to_lowercase();
        if let Some(existing) = self.folded.get(&folded) {
            if existing != &term {
                warn!(term = %term, existing = %existing, "Glossary terms differ only by case");
            }
        } else {
            self.folded.insert(folded, term.clone());
        }
        self.entries.insert(term, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, term: &str) -> Option<&GlossaryEntry> {
        self.entries.get(term)
    }

    /// Lookup by authored term, falling back to a case-insensitive match. Returns the
    /// canonical term with its entry.
    pub fn lookup(&self, term: &str) -> Option<(&str, &GlossaryEntry)> {
        if let Some((key, entry)) = self.entries.get_key_value(term) {
            return Some((key.as_str(), entry));
        }
        let canonical = self.folded.get(&term.to_lowercase())?;
        self.entries
            .get_key_value(canonical)
            .map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GlossaryEntry)> {
        self.entries.iter().map(|(term, entry)| (term.as_str(), entry))
    }

    /// Terms ordered longest first, ties broken alphabetically.
    pub fn terms_longest_first(&self) -> Vec<&str> {
        let mut terms: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        terms.sort_by(|a, b| {
            b.chars()
                .count()
                .cmp(&a.chars().count())
                .then_with(|| a.cmp(b))
        });
        terms
    }

    /// Stable hash of the table contents, used to cache compiled annotators.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.entries.hash(&mut hasher);
        hasher.finish()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| PortalError::json("glossary", err))
    }
}

impl Serialize for GlossaryTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}
