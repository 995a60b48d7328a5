use askama::Template;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

use crate::config::SiteConfig;
use crate::error::Result;
use crate::manifest::{Manifest, chapter_stem};
use crate::popup::InteractionMode;
use crate::progress::progress_key;
use crate::reader::RenderedPage;

/// How pages link to each other and to the bundled assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStyle {
    /// Files under `read/<stem>/<n>.html`, resumed from browser storage.
    Static,
    /// Routes served by the web server, resumed from a cookie.
    Server,
}

impl LinkStyle {
    fn root(self, in_chapter: bool) -> &'static str {
        match (self, in_chapter) {
            (LinkStyle::Static, true) => "../../",
            (LinkStyle::Static, false) => "",
            (LinkStyle::Server, _) => "/",
        }
    }

    /// Link from the chapter list; opens the chapter at the saved position.
    pub fn chapter_href(self, file: &str) -> String {
        match self {
            LinkStyle::Static => format!("read/{}/index.html", chapter_stem(file)),
            LinkStyle::Server => format!("/chapter?chapter={}", encode(file)),
        }
    }

    /// Link between pages of the same chapter.
    pub fn page_href(self, file: &str, index: usize) -> String {
        match self {
            LinkStyle::Static => format!("{}.html", index + 1),
            LinkStyle::Server => format!("/chapter?chapter={}&page={index}", encode(file)),
        }
    }

    fn storage(self) -> &'static str {
        match self {
            LinkStyle::Static => "local",
            LinkStyle::Server => "cookie",
        }
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

struct ChapterLink {
    label: String,
    href: String,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{{ site.title }}</title>
    <link rel="stylesheet" href="{{ root }}assets/style.css">
  </head>
  <body>
    <main class="index-container">
      <div class="book-card">
        {% if let Some(cover) = site.cover %}
        <img src="{{ root }}{{ cover }}" alt="Book cover" class="book-cover">
        {% endif %}
        <h1 class="book-title">{{ site.title }}</h1>
        {% if !site.author.is_empty() %}<p class="book-author">by {{ site.author }}</p>{% endif %}
        {% if !site.subtitle.is_empty() %}<p class="book-subtitle">{{ site.subtitle }}</p>{% endif %}
        <nav class="chapter-list">
          {% for chapter in chapters %}
          <a href="{{ chapter.href }}">{{ chapter.label }}</a>
          {% endfor %}
          {% if chapters.is_empty() %}<p>No chapters yet.</p>{% endif %}
        </nav>
      </div>
    </main>
  </body>
</html>"#,
    ext = "html"
)]
struct IndexTemplate<'a> {
    site: &'a SiteConfig,
    chapters: Vec<ChapterLink>,
    root: &'static str,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{{ page.title }} • {{ site_title }}</title>
    <link rel="stylesheet" href="{{ root }}assets/style.css">
    <script src="{{ root }}assets/reader.js" defer></script>
  </head>
  <body data-interaction="{{ interaction }}" data-progress-key="{{ progress_key }}" data-progress-store="{{ storage }}"{% if page.page_number.is_some() %} data-page-index="{{ page.index }}"{% endif %}>
    <header class="chapter-header">
      <a class="home-link" href="{{ home_href }}">{{ site_title }}</a>
      <h1 id="chapter-title">{{ page.title }}</h1>
      <p id="page-number-display">{{ page.page_label }}</p>
    </header>
    <main>
      <article id="chapter-content" class="chapter-content{% if page.dropcap %} dropcap{% endif %}">
        {% if let Some(error) = page.error %}
        <p class="chapter-error" role="alert">{{ error }}</p>
        {% endif %}
        {% for paragraph in page.paragraphs %}
        <p>{{ paragraph|safe }}</p>
        {% endfor %}
      </article>
    </main>
    <footer class="page-footer">
      <span id="left-page-num">{{ page.page_label }}</span>
      <nav class="page-nav">
        {% if let Some(href) = prev_href %}<a id="prevPage" href="{{ href }}" rel="prev">Previous</a>{% else %}<span id="prevPage" class="disabled">Previous</span>{% endif %}
        <span id="page-counter">{{ page.counter_label }}</span>
        {% if let Some(href) = next_href %}<a id="nextPage" href="{{ href }}" rel="next">Next</a>{% else %}<span id="nextPage" class="disabled">Next</span>{% endif %}
      </nav>
      <span id="right-page-num">{% if page.page_number.is_some() %}{{ page.title }}{% endif %}</span>
    </footer>
    <div id="tooltip" class="tooltip hidden" role="tooltip"><div id="tooltip-content"></div></div>
    {% for card in page.terms %}
    <template data-term="{{ card.term }}">{{ card.definition_html|safe }}</template>
    {% endfor %}
  </body>
</html>"#,
    ext = "html"
)]
struct ChapterTemplate<'a> {
    page: &'a RenderedPage,
    site_title: &'a str,
    interaction: InteractionMode,
    progress_key: String,
    storage: &'static str,
    home_href: &'static str,
    prev_href: Option<String>,
    next_href: Option<String>,
    root: &'static str,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>{{ title }}</title>
    <script>
      (function () {
        var index = 0;
        try {
          var stored = parseInt(localStorage.getItem("{{ progress_key }}"), 10);
          if (stored >= 0 && stored < {{ page_count }}) { index = stored; }
        } catch (e) {}
        location.replace((index + 1) + ".html");
      })();
    </script>
  </head>
  <body>
    <noscript><a href="1.html">{{ title }}</a></noscript>
  </body>
</html>"#,
    ext = "html"
)]
struct ResumeTemplate<'a> {
    title: &'a str,
    progress_key: String,
    page_count: usize,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{{ site_title }} • Error</title>
    <link rel="stylesheet" href="{{ root }}assets/style.css">
  </head>
  <body>
    <main class="index-container">
      <div class="book-card">
        <h1 class="book-title">Something went wrong</h1>
        <p class="chapter-error" role="alert">{{ message }}</p>
        <a href="{{ root }}">Back to chapters</a>
      </div>
    </main>
  </body>
</html>"#,
    ext = "html"
)]
struct ErrorTemplate<'a> {
    site_title: &'a str,
    message: &'a str,
    root: &'static str,
}

/// Chapter list page.
pub fn render_index(site: &SiteConfig, manifest: &Manifest, links: LinkStyle) -> Result<String> {
    let chapters = manifest
        .entries()
        .iter()
        .map(|entry| ChapterLink {
            label: format!("Chapter {}: {}", entry.number, manifest.display_title(&entry.file)),
            href: links.chapter_href(&entry.file),
        })
        .collect();
    let template = IndexTemplate {
        site,
        chapters,
        root: links.root(false),
    };
    Ok(template.render()?)
}

/// One reader page, with its definition cards and popup script.
pub fn render_chapter_page(
    page: &RenderedPage,
    site: &SiteConfig,
    interaction: InteractionMode,
    links: LinkStyle,
) -> Result<String> {
    let template = ChapterTemplate {
        page,
        site_title: &site.title,
        interaction,
        progress_key: progress_key(&page.chapter),
        storage: links.storage(),
        home_href: match links {
            LinkStyle::Static => "../../index.html",
            LinkStyle::Server => "/",
        },
        prev_href: page
            .has_prev
            .then(|| links.page_href(&page.chapter, page.index - 1)),
        next_href: page
            .has_next
            .then(|| links.page_href(&page.chapter, page.index + 1)),
        root: links.root(true),
    };
    Ok(template.render()?)
}

/// `read/<stem>/index.html`: forwards to the saved page of a static chapter.
pub fn render_resume_shim(chapter: &str, title: &str, page_count: usize) -> Result<String> {
    let template = ResumeTemplate {
        title,
        progress_key: progress_key(chapter),
        page_count: page_count.max(1),
    };
    Ok(template.render()?)
}

pub fn render_error_page(site_title: &str, message: &str, links: LinkStyle) -> String {
    let template = ErrorTemplate {
        site_title,
        message,
        root: links.root(false),
    };
    template
        .render()
        .unwrap_or_else(|_| format!("<!DOCTYPE html><p>{}</p>", crate::markup::escape_text(message)))
}
