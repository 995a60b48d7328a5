use once_cell::sync::Lazy;
use regex::Regex;

static BLANK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid blank-line regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));
static SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([,.!?;:])").expect("valid punctuation regex"));

const OPENING_QUOTES: &[char] = &['"', '\'', '“', '‘', '«'];

/// Splits one page of text into paragraphs.
///
/// Blank lines separate paragraphs. When a page has no blank lines at all, a line that
/// starts with a capital letter or an opening quote also starts a new paragraph, which
/// recovers structure from transcriptions that put every paragraph on its own line.
/// Whitespace inside a paragraph collapses to single spaces, spaces before punctuation
/// are removed, and empty paragraphs are discarded.
pub fn split_paragraphs(content: &str) -> Vec<String> {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let blocks: Vec<&str> = BLANK_LINE
        .split(normalized.trim())
        .filter(|block| !block.trim().is_empty())
        .collect();

    let raw_paragraphs: Vec<String> = if blocks.len() == 1 {
        split_on_line_starts(blocks[0])
    } else {
        blocks.into_iter().map(str::to_string).collect()
    };

    raw_paragraphs
        .iter()
        .map(|paragraph| tidy(paragraph))
        .filter(|paragraph| !paragraph.is_empty())
        .collect()
}

fn starts_paragraph(line: &str) -> bool {
    line.trim_start()
        .chars()
        .next()
        .is_some_and(|ch| ch.is_uppercase() || OPENING_QUOTES.contains(&ch))
}

fn split_on_line_starts(block: &str) -> Vec<String> {
    let mut paragraphs: Vec<String> = Vec::new();
    for (idx, line) in block.lines().enumerate() {
        match paragraphs.last_mut() {
            Some(current) if idx > 0 && !starts_paragraph(line) => {
                current.push('\n');
                current.push_str(line);
            }
            _ => paragraphs.push(line.to_string()),
        }
    }
    paragraphs
}

fn tidy(paragraph: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(paragraph.trim(), " ");
    SPACE_BEFORE_PUNCT
        .replace_all(&collapsed, "$1")
        .trim()
        .to_string()
}
