use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::glossary::GlossaryTable;
use crate::markup::{escape_attr, strip_tags, unescape_attr};

pub const ANNOTATION_CLASS: &str = "gloss";

static ANNOTATION_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^<span\b[^>]*\bclass="gloss"[^>]*>"#).expect("valid annotation regex")
});
static DATA_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bdata-word="([^"]*)""#).expect("valid data-word regex"));
static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^&(?:#[0-9]+|#[xX][0-9a-fA-F]+|[A-Za-z][A-Za-z0-9]*);").expect("valid entity regex")
});
static TAG_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^</?\s*([A-Za-z][A-Za-z0-9]*)").expect("valid tag-name regex"));
static SPAN_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<(/?)span\b[^>]*>").expect("valid span regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnnotationPolicy {
    /// Only the first whole-word occurrence of each term in a paragraph.
    #[default]
    FirstOccurrence,
    /// Every whole-word occurrence.
    EveryOccurrence,
}

impl fmt::Display for AnnotationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationPolicy::FirstOccurrence => write!(f, "first-occurrence"),
            AnnotationPolicy::EveryOccurrence => write!(f, "every-occurrence"),
        }
    }
}

impl FromStr for AnnotationPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first" | "first-occurrence" => Ok(AnnotationPolicy::FirstOccurrence),
            "every" | "all" | "every-occurrence" => Ok(AnnotationPolicy::EveryOccurrence),
            other => Err(format!(
                "unknown annotation policy {other:?} (expected first-occurrence or every-occurrence)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AnnotatorOptions {
    pub policy: AnnotationPolicy,
    /// Copy the definition (and image) into `data-*` attributes on each span.
    pub inline_definitions: bool,
}

#[derive(Debug)]
struct TermMatcher {
    term: String,
    pattern: Regex,
    definition: String,
    image: Option<String>,
}

#[derive(Debug)]
pub struct Annotator {
    matchers: Vec<TermMatcher>,
    options: AnnotatorOptions,
}

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Markup(String),
    Annotated { term: String, html: String, visible: String },
}

/// Tags that sit inside a word without separating it.
const INLINE_TAGS: &[&str] = &[
    "a", "abbr", "b", "bdi", "bdo", "cite", "code", "data", "dfn", "em", "font", "i", "kbd",
    "mark", "q", "s", "samp", "small", "span", "strong", "sub", "sup", "time", "u", "var", "wbr",
];

impl Segment {
    fn first_char(&self) -> Option<char> {
        match self {
            Segment::Text(text) => text.chars().next(),
            Segment::Annotated { visible, .. } => visible.chars().next(),
            Segment::Markup(markup) => markup_char(markup),
        }
    }

    fn last_char(&self) -> Option<char> {
        match self {
            Segment::Text(text) => text.chars().next_back(),
            Segment::Annotated { visible, .. } => visible.chars().next_back(),
            Segment::Markup(markup) => markup_char(markup),
        }
    }

    fn is_inline_tag(&self) -> bool {
        let Segment::Markup(markup) = self else {
            return false;
        };
        TAG_NAME.captures(markup).is_some_and(|caps| {
            INLINE_TAGS
                .iter()
                .any(|name| caps[1].eq_ignore_ascii_case(name))
        })
    }

    fn html(&self) -> &str {
        match self {
            Segment::Text(text) | Segment::Markup(text) => text,
            Segment::Annotated { html, .. } => html,
        }
    }
}

impl Annotator {
    pub fn new(glossary: &GlossaryTable, options: AnnotatorOptions) -> Self {
        let matchers = glossary
            .terms_longest_first()
            .into_iter()
            .filter_map(|term| {
                let entry = glossary.get(term)?;
                match term_pattern(term) {
                    Ok(pattern) => Some(TermMatcher {
                        term: term.to_string(),
                        pattern,
                        definition: entry.definition.clone(),
                        image: entry.image.clone(),
                    }),
                    Err(err) => {
                        warn!(term = %term, "Skipping glossary term that cannot be matched: {err}");
                        None
                    }
                }
            })
            .collect();
        Self { matchers, options }
    }

    pub fn options(&self) -> AnnotatorOptions {
        self.options
    }

    pub fn term_count(&self) -> usize {
        self.matchers.len()
    }

    /// Annotates a single paragraph.
    pub fn annotate(&self, paragraph: &str) -> String {
        let mut segments = tokenize(paragraph);
        let first_only = self.options.policy == AnnotationPolicy::FirstOccurrence;
        let mut seen: HashSet<String> = segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Annotated { term, .. } => Some(term.clone()),
                _ => None,
            })
            .collect();

        for matcher in &self.matchers {
            if first_only && seen.contains(&matcher.term) {
                continue;
            }
            let mut wrapped_once = false;
            let mut next = Vec::with_capacity(segments.len());
            for idx in 0..segments.len() {
                let Segment::Text(text) = &segments[idx] else {
                    next.push(segments[idx].clone());
                    continue;
                };
                if first_only && wrapped_once {
                    next.push(segments[idx].clone());
                    continue;
                }
                let before = segments[..idx]
                    .iter()
                    .rev()
                    .find(|segment| !segment.is_inline_tag())
                    .and_then(Segment::last_char);
                let after = segments[idx + 1..]
                    .iter()
                    .find(|segment| !segment.is_inline_tag())
                    .and_then(Segment::first_char);
                let limit = if first_only { Some(1) } else { None };
                let wrapped = self.wrap_matches(matcher, text, before, after, limit, &mut next);
                wrapped_once |= wrapped > 0;
            }
            if wrapped_once {
                seen.insert(matcher.term.clone());
            }
            segments = next;
        }

        segments.iter().map(Segment::html).collect()
    }

    pub fn annotate_all<S: AsRef<str>>(&self, paragraphs: &[S]) -> Vec<String> {
        paragraphs
            .iter()
            .map(|paragraph| self.annotate(paragraph.as_ref()))
            .collect()
    }

    fn wrap_matches(
        &self,
        matcher: &TermMatcher,
        text: &str,
        before: Option<char>,
        after: Option<char>,
        limit: Option<usize>,
        out: &mut Vec<Segment>,
    ) -> usize {
        let mut wrapped = 0;
        let mut cursor = 0;
        let mut search_from = 0;
        while search_from <= text.len() && limit.is_none_or(|max| wrapped < max) {
            let Some(found) = matcher.pattern.find_at(text, search_from) else {
                break;
            };
            let prev = text[..found.start()].chars().next_back().or(before);
            let next = text[found.end()..].chars().next().or(after);
            if is_word_char(prev) || is_word_char(next) {
                search_from = found.start()
                    + text[found.start()..]
                        .chars()
                        .next()
                        .map_or(1, char::len_utf8);
                continue;
            }
            if found.start() > cursor {
                out.push(Segment::Text(text[cursor..found.start()].to_string()));
            }
            let visible = found.as_str().to_string();
            out.push(Segment::Annotated {
                term: matcher.term.clone(),
                html: self.wrap(matcher, &visible),
                visible,
            });
            wrapped += 1;
            cursor = found.end();
            search_from = found.end();
        }
        if cursor < text.len() {
            out.push(Segment::Text(text[cursor..].to_string()));
        }
        wrapped
    }

    fn wrap(&self, matcher: &TermMatcher, visible: &str) -> String {
        let mut html = format!(
            r#"<span class="{ANNOTATION_CLASS}" data-word="{}""#,
            escape_attr(&matcher.term)
        );
        if self.options.inline_definitions {
            html.push_str(&format!(
                r#" data-definition="{}""#,
                escape_attr(&matcher.definition)
            ));
            if let Some(image) = &matcher.image {
                html.push_str(&format!(r#" data-image="{}""#, escape_attr(image)));
            }
        }
        html.push_str(r#" tabindex="0">"#);
        html.push_str(visible);
        html.push_str("</span>");
        html
    }
}

/// Builds a case-insensitive pattern for `term`, letting any whitespace run stand in for
/// the spaces of a multi-word term.
fn term_pattern(term: &str) -> Result<Regex, regex::Error> {
    let pattern = term
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

/// The character an entity stands for; tags yield `None`. Unknown named entities are
/// mostly accented letters, so they stand for the first letter of their name.
fn markup_char(markup: &str) -> Option<char> {
    let name = markup.strip_prefix('&')?.strip_suffix(';')?;
    if let Some(code) = name.strip_prefix('#') {
        let value = match code.strip_prefix(&['x', 'X'][..]) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => code.parse().ok()?,
        };
        return char::from_u32(value);
    }
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" | "ensp" | "emsp" | "thinsp" => Some(' '),
        "mdash" | "ndash" | "hellip" | "middot" | "bull" => Some('-'),
        "lsquo" | "rsquo" | "ldquo" | "rdquo" | "laquo" | "raquo" => Some('"'),
        "copy" | "reg" | "trade" | "sect" | "para" | "deg" => Some('*'),
        _ => name.chars().next(),
    }
}

fn is_word_char(ch: Option<char>) -> bool {
    ch.is_some_and(|c| c.is_alphanumeric() || c == '_')
}

fn tokenize(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut pos = 0;

    let flush = |segments: &mut Vec<Segment>, from: usize, to: usize| {
        if to > from {
            segments.push(Segment::Text(input[from..to].to_string()));
        }
    };

    while pos < input.len() {
        let rest = &input[pos..];
        if rest.starts_with('<') {
            if let Some(open) = ANNOTATION_OPEN.find(rest) {
                let end = matching_span_end(rest).unwrap_or(rest.len());
                let html = &rest[..end];
                let term = DATA_WORD
                    .captures(open.as_str())
                    .map(|caps| unescape_attr(&caps[1]))
                    .unwrap_or_default();
                flush(&mut segments, text_start, pos);
                segments.push(Segment::Annotated {
                    term,
                    html: html.to_string(),
                    visible: strip_tags(html),
                });
                pos += end;
                text_start = pos;
                continue;
            }
            if let Some(close) = rest.find('>') {
                flush(&mut segments, text_start, pos);
                segments.push(Segment::Markup(rest[..=close].to_string()));
                pos += close + 1;
                text_start = pos;
                continue;
            }
        } else if rest.starts_with('&') {
            if let Some(entity) = ENTITY.find(rest) {
                flush(&mut segments, text_start, pos);
                segments.push(Segment::Markup(entity.as_str().to_string()));
                pos += entity.end();
                text_start = pos;
                continue;
            }
        }
        pos += rest.chars().next().map_or(1, char::len_utf8);
    }
    flush(&mut segments, text_start, input.len());
    segments
}

fn matching_span_end(html: &str) -> Option<usize> {
    let mut depth = 0usize;
    for tag in SPAN_TAG.captures_iter(html) {
        let whole = tag.get(0)?;
        if tag[1].is_empty() {
            depth += 1;
        } else {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(whole.end());
            }
        }
    }
    None
}

/// Rewrites annotation spans in already-annotated HTML, passing each span's term and
/// visible text to `render`. Everything else is copied through unchanged.
pub fn map_annotations<F>(html: &str, mut render: F) -> String
where
    F: FnMut(&str, &str) -> String,
{
    tokenize(html)
        .into_iter()
        .map(|segment| match segment {
            Segment::Annotated { term, visible, .. } => render(&term, &visible),
            other => other.html().to_string(),
        })
        .collect()
}

pub fn annotated_terms(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(html)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Annotated { term, .. } if seen.insert(term.clone()) => Some(term),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glossary::GlossaryEntry;

    fn table(entries: &[(&str, &str)]) -> GlossaryTable {
        GlossaryTable::from_entries(
            entries
                .iter()
                .map(|(term, def)| (term.to_string(), GlossaryEntry::new(*def))),
        )
    }

    fn annotator(glossary: &GlossaryTable, policy: AnnotationPolicy) -> Annotator {
        Annotator::new(
            glossary,
            AnnotatorOptions {
                policy,
                inline_definitions: false,
            },
        )
    }

    fn span(term: &str, visible: &str) -> String {
        format!(r#"<span class="gloss" data-word="{term}" tabindex="0">{visible}</span>"#)
    }

    #[test]
    fn longer_term_wins_over_contained_term() {
        let glossary = table(&[("house", "a building"), ("long house", "a shared dwelling")]);
        let out = annotator(&glossary, AnnotationPolicy::EveryOccurrence)
            .annotate("the long house stood");
        assert_eq!(out, format!("the {} stood", span("long house", "long house")));
        assert_eq!(out.matches("<span").count(), 1);
    }

    #[test]
    fn shorter_term_still_matches_outside_the_longer_one() {
        let glossary = table(&[("house", "a building"), ("long house", "a shared dwelling")]);
        let out = annotator(&glossary, AnnotationPolicy::EveryOccurrence)
            .annotate("A long house is a house.");
        assert_eq!(
            out,
            format!(
                "A {} is a {}.",
                span("long house", "long house"),
                span("house", "house")
            )
        );
    }

    #[test]
    fn matches_whole_words_only() {
        let glossary = table(&[("cat", "a small feline")]);
        let ann = annotator(&glossary, AnnotationPolicy::EveryOccurrence);
        assert_eq!(ann.annotate("category concatenate bobcat"), "category concatenate bobcat");
        assert_eq!(ann.annotate("the cat_tail"), "the cat_tail");
        assert_eq!(
            ann.annotate("a cat, (cat) cats"),
            format!("a {}, ({}) cats", span("cat", "cat"), span("cat", "cat"))
        );
    }

    #[test]
    fn case_insensitive_match_keeps_body_casing_and_canonical_key() {
        let glossary = table(&[("Cedar", "a tree")]);
        let out = annotator(&glossary, AnnotationPolicy::FirstOccurrence).annotate("CEDAR bark");
        assert_eq!(out, format!("{} bark", span("Cedar", "CEDAR")));
    }

    #[test]
    fn first_occurrence_policy_wraps_once_per_paragraph() {
        let glossary = table(&[("elk", "a deer")]);
        let ann = annotator(&glossary, AnnotationPolicy::FirstOccurrence);
        let out = ann.annotate("An elk and another elk.");
        assert_eq!(out, format!("An {} and another elk.", span("elk", "elk")));
        let paragraphs = ann.annotate_all(&["elk one", "elk two"]);
        assert!(paragraphs.iter().all(|p| p.matches("<span").count() == 1));
    }

    #[test]
    fn every_occurrence_policy_wraps_all() {
        let glossary = table(&[("elk", "a deer")]);
        let out = annotator(&glossary, AnnotationPolicy::EveryOccurrence)
            .annotate("An elk and another elk.");
        assert_eq!(out.matches("<span").count(), 2);
    }

    #[test]
    fn definitions_inlined_as_attributes_are_never_matched() {
        let glossary = table(&[
            ("canoe", "a boat carved from a cedar log"),
            ("cedar", "a tree"),
        ]);
        let ann = Annotator::new(
            &glossary,
            AnnotatorOptions {
                policy: AnnotationPolicy::EveryOccurrence,
                inline_definitions: true,
            },
        );
        let out = ann.annotate("The canoe waited.");
        assert_eq!(out.matches("<span").count(), 1);
        assert_eq!(
            out,
            r#"The <span class="gloss" data-word="canoe" data-definition="a boat carved from a cedar log" tabindex="0">canoe</span> waited."#
        );
        assert_eq!(ann.annotate(&out), out);
    }

    #[test]
    fn annotating_twice_is_a_no_op() {
        let glossary = table(&[
            ("house", "a building"),
            ("long house", "a shared dwelling"),
            ("elk", "a deer"),
        ]);
        for policy in [AnnotationPolicy::FirstOccurrence, AnnotationPolicy::EveryOccurrence] {
            let ann = annotator(&glossary, policy);
            let once = ann.annotate("An elk by the long house; the house, the elk.");
            assert_eq!(ann.annotate(&once), once, "policy {policy}");
        }
    }

    #[test]
    fn existing_markup_and_entities_are_left_alone() {
        let glossary = table(&[("em", "emphasis"), ("amp", "amplifier"), ("title", "name")]);
        let ann = annotator(&glossary, AnnotationPolicy::EveryOccurrence);
        let html = r#"<em title="x">loud</em> &amp; clear"#;
        assert_eq!(ann.annotate(html), html);
    }

    #[test]
    fn terms_inside_inline_markup_are_wrapped_inside_it() {
        let glossary = table(&[("river", "flowing water")]);
        let out = annotator(&glossary, AnnotationPolicy::EveryOccurrence)
            .annotate("<em>river</em> bank");
        assert_eq!(out, format!("<em>{}</em> bank", span("river", "river")));
    }

    #[test]
    fn words_split_by_inline_markup_stay_whole() {
        let glossary = table(&[("cat", "a small feline")]);
        let ann = annotator(&glossary, AnnotationPolicy::EveryOccurrence);
        assert_eq!(ann.annotate("a <em>cat</em>egory"), "a <em>cat</em>egory");
        assert_eq!(ann.annotate("bob<b>cat</b>"), "bob<b>cat</b>");
        assert_eq!(ann.annotate("cat&eacute;"), "cat&eacute;");
        assert_eq!(ann.annotate("cat&#233;s"), "cat&#233;s");
        assert_eq!(
            ann.annotate("<em>cat</em>, cat&mdash;cat<br>ch"),
            format!(
                "<em>{}</em>, {}&mdash;{}<br>ch",
                span("cat", "cat"),
                span("cat", "cat"),
                span("cat", "cat")
            )
        );
    }

    #[test]
    fn multi_word_terms_match_across_whitespace_runs() {
        let glossary = table(&[("long house", "a shared dwelling")]);
        let out = annotator(&glossary, AnnotationPolicy::EveryOccurrence).annotate("a long\n house");
        assert_eq!(out, format!("a {}", span("long house", "long\n house")));
    }

    #[test]
    fn regex_metacharacters_in_terms_are_literal() {
        let glossary = table(&[("c++", "a language"), ("a.b", "dotted")]);
        let ann = annotator(&glossary, AnnotationPolicy::EveryOccurrence);
        assert_eq!(ann.annotate("axb"), "axb");
        assert_eq!(ann.annotate("use a.b now"), format!("use {} now", span("a.b", "a.b")));
    }

    #[test]
    fn unknown_words_and_empty_glossary_leave_text_unchanged() {
        let ann = annotator(&GlossaryTable::new(), AnnotationPolicy::EveryOccurrence);
        assert_eq!(ann.term_count(), 0);
        assert_eq!(ann.annotate("nothing to see"), "nothing to see");
    }

    #[test]
    fn map_annotations_and_annotated_terms_read_spans_back() {
        let glossary = table(&[("elk", "a deer"), ("bay", "an inlet")]);
        let out = annotator(&glossary, AnnotationPolicy::EveryOccurrence)
            .annotate("Elk in the bay, elk again");
        assert_eq!(annotated_terms(&out), vec!["elk".to_string(), "bay".to_string()]);
        assert_eq!(
            map_annotations(&out, |_, visible| format!("**{visible}**")),
            "**Elk** in the **bay**, **elk** again"
        );
    }

    #[test]
    fn policies_parse_from_short_and_config_names() {
        assert_eq!("first".parse(), Ok(AnnotationPolicy::FirstOccurrence));
        assert_eq!("every-occurrence".parse(), Ok(AnnotationPolicy::EveryOccurrence));
        assert!("sometimes".parse::<AnnotationPolicy>().is_err());
    }
}
