use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(startPage|endPage)=(\d+)\]").expect("valid marker regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Start,
    End,
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    kind: MarkerKind,
    /// `None` when the digits are zero or do not fit a `u32`.
    number: Option<u32>,
    start: usize,
    end: usize,
}

fn scan_markers(raw: &str) -> Vec<Marker> {
    MARKER
        .captures_iter(raw)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = if &caps[1] == "startPage" {
                MarkerKind::Start
            } else {
                MarkerKind::End
            };
            let number = caps[2].parse::<u32>().ok().filter(|n| *n > 0);
            Some(Marker {
                kind,
                number,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

pub fn strip_markers(text: &str) -> String {
    MARKER.replace_all(text, "").trim().to_string()
}

/// Each valid start marker opens a page that runs to the next one, so a missing
/// `endPage` never swallows the following page.
pub fn parse_pages(raw: &str) -> Vec<Page> {
    let starts: Vec<(u32, Marker)> = scan_markers(raw)
        .into_iter()
        .filter(|m| m.kind == MarkerKind::Start)
        .filter_map(|m| m.number.map(|n| (n, m)))
        .collect();

    let mut pages = Vec::with_capacity(starts.len());
    for (idx, &(number, marker)) in starts.iter().enumerate() {
        let body_end = starts
            .get(idx + 1)
            .map(|(_, next)| next.start)
            .unwrap_or(raw.len());
        let content = strip_markers(&raw[marker.end..body_end]);
        if !content.is_empty() {
            pages.push(Page { number, content });
        }
    }
    pages
}

/// Authoring problems noticed while scanning markers. None of these change what
/// [`parse_pages`] returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarkerWarning {
    OutOfOrder { previous: u32, found: u32 },
    MismatchedEnd { open: u32, found: u32 },
    MissingEnd { page: u32 },
    StrayEnd { found: u32 },
    InvalidNumber { offset: usize },
    LeadingText,
}

impl fmt::Display for MarkerWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerWarning::OutOfOrder { previous, found } => {
                write!(f, "page {found} follows page {previous}")
            }
            MarkerWarning::MismatchedEnd { open, found } => {
                write!(f, "[endPage={found}] closes page {open}")
            }
            MarkerWarning::MissingEnd { page } => write!(f, "page {page} has no [endPage]"),
            MarkerWarning::StrayEnd { found } => {
                write!(f, "[endPage={found}] appears outside any page")
            }
            MarkerWarning::InvalidNumber { offset } => {
                write!(f, "marker at byte {offset} has an invalid page number")
            }
            MarkerWarning::LeadingText => write!(f, "text before the first page is ignored"),
        }
    }
}

pub fn lint_markers(raw: &str) -> Vec<MarkerWarning> {
    let markers = scan_markers(raw);
    let mut warnings = Vec::new();

    if let Some(first_start) = markers
        .iter()
        .find(|m| m.kind == MarkerKind::Start && m.number.is_some())
    {
        if !strip_markers(&raw[..first_start.start]).is_empty() {
            warnings.push(MarkerWarning::LeadingText);
        }
    }

    let mut open: Option<(u32, bool)> = None;
    let mut previous: Option<u32> = None;
    for marker in &markers {
        let Some(number) = marker.number else {
            warnings.push(MarkerWarning::InvalidNumber {
                offset: marker.start,
            });
            continue;
        };
        match marker.kind {
            MarkerKind::Start => {
                if let Some((page, false)) = open {
                    warnings.push(MarkerWarning::MissingEnd { page });
                }
                if let Some(prev) = previous {
                    if number <= prev {
                        warnings.push(MarkerWarning::OutOfOrder {
                            previous: prev,
                            found: number,
                        });
                    }
                }
                previous = Some(number);
                open = Some((number, false));
            }
            MarkerKind::End => match open {
                Some((page, false)) if page == number => open = Some((page, true)),
                Some((page, false)) => {
                    warnings.push(MarkerWarning::MismatchedEnd {
                        open: page,
                        found: number,
                    });
                    open = Some((page, true));
                }
                _ => warnings.push(MarkerWarning::StrayEnd { found: number }),
            },
        }
    }
    if let Some((page, false)) = open {
        warnings.push(MarkerWarning::MissingEnd { page });
    }
    warnings
}
