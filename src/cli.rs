use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use atty::Stream;
use clap::{Args, Parser, Subcommand};
use reading_portal::annotate::{AnnotationPolicy, Annotator, map_annotations};
use reading_portal::authoring::{ChapterDraft, build_export, parse_glossary_bulk};
use reading_portal::config::{PortalConfig, SiteConfig};
use reading_portal::glossary::GlossaryTable;
use reading_portal::loader::{ChapterLoader, DirSource, PortalPaths};
use reading_portal::markup::{strip_tags, unescape_attr};
use reading_portal::pages::{lint_markers, parse_pages, strip_markers};
use reading_portal::paragraphs::split_paragraphs;
use reading_portal::popup::{InteractionMode, Overlay, Point, PopupEvent, Size};
use reading_portal::progress::JsonFileProgress;
use reading_portal::reader::{ReaderSession, RenderedPage};
use reading_portal::site::build_site;
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "reading-portal",
    about = "Paginate chapters and annotate them with glossary popups",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a chapter file into pages and report marker problems.
    Pages {
        /// Chapter text file.
        file: PathBuf,
    },
    /// Print a chapter's paragraphs with glossary terms wrapped.
    Annotate {
        /// Chapter text file.
        file: PathBuf,
        /// Glossary JSON file.
        #[arg(short, long, default_value = "glossary.json")]
        glossary: PathBuf,
        /// Annotate `first-occurrence` (per paragraph) or `every-occurrence`.
        #[arg(long, default_value_t = AnnotationPolicy::FirstOccurrence)]
        policy: AnnotationPolicy,
        /// Also embed definitions as `data-definition` attributes.
        #[arg(long)]
        inline_definitions: bool,
    },
    /// Read a chapter in the terminal.
    Read(ReadArgs),
    /// Export portal artifacts from bulk glossary text and chapter drafts.
    Author(AuthorArgs),
    /// Render a static reader site.
    Build {
        /// Portal root holding glossary.json, chapters/ and portal.toml.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
        /// Output directory (defaults to `<root>/site`).
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        reader: ReaderOverrides,
    },
    /// Serve the reader over HTTP.
    #[cfg(feature = "web")]
    Serve {
        /// Portal root holding glossary.json, chapters/ and portal.toml.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: std::net::SocketAddr,
        /// Public base URL used in links.
        #[arg(long)]
        base_url: Option<String>,
    },
}

/// Command-line values that take precedence over `[reader]` in portal.toml.
#[derive(Args, Debug, Clone, Default)]
struct ReaderOverrides {
    /// Annotation policy: `first-occurrence` or `every-occurrence`.
    #[arg(long)]
    policy: Option<AnnotationPolicy>,
    /// Popup interaction: `hover` or `click-to-pin`.
    #[arg(long)]
    interaction: Option<InteractionMode>,
    /// Show an error instead of unpaginated text when a chapter has no markers.
    #[arg(long)]
    strict: bool,
}

impl ReaderOverrides {
    fn apply(&self, config: &mut PortalConfig) {
        if let Some(policy) = self.policy {
            config.reader.annotation = policy;
        }
        if let Some(interaction) = self.interaction {
            config.reader.interaction = interaction;
        }
        if self.strict {
            config.reader.strict_pagination = true;
        }
    }
}

#[derive(Args, Debug)]
struct ReadArgs {
    /// Chapter file name or number.
    chapter: String,
    /// Portal root holding glossary.json, chapters/ and portal.toml.
    #[arg(short, long, default_value = ".")]
    root: PathBuf,
    /// Reading progress file (defaults to `<root>/.reading-progress.json`).
    #[arg(long)]
    progress: Option<PathBuf>,
    #[command(flatten)]
    reader: ReaderOverrides,
}

#[derive(Args, Debug)]
struct AuthorArgs {
    /// Bulk glossary text, one `term: definition` per line.
    #[arg(long)]
    definitions: PathBuf,
    /// Optional image lines, one `term: url` per line.
    #[arg(long)]
    images: Option<PathBuf>,
    /// Chapter text files, in reading order.
    #[arg(long = "chapter", required = true)]
    chapters: Vec<PathBuf>,
    /// Chapter titles, matched to chapters by position.
    #[arg(long = "title")]
    titles: Vec<String>,
    #[arg(long, default_value = "Reading Portal")]
    site_title: String,
    #[arg(long, default_value = "")]
    author: String,
    #[arg(long, default_value = "")]
    subtitle: String,
    /// Cover image path, relative to the portal root.
    #[arg(long)]
    cover: Option<String>,
    /// Directory to write the portal (and its static reader) into.
    #[arg(short, long, default_value = ".")]
    out: PathBuf,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Pages { file } => handle_pages(&file, cli.json),
        Command::Annotate {
            file,
            glossary,
            policy,
            inline_definitions,
        } => handle_annotate(&file, &glossary, policy, inline_definitions, cli.json),
        Command::Read(args) => handle_read(args, cli.json),
        Command::Author(args) => handle_author(args, cli.json),
        Command::Build { root, out, reader } => handle_build(&root, out, &reader, cli.json),
        #[cfg(feature = "web")]
        Command::Serve {
            root,
            addr,
            base_url,
        } => handle_serve(root, addr, base_url),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_file(path: &Path) -> Result<String, Box<dyn Error>> {
    fs::read_to_string(path).map_err(|err| format!("cannot read {}: {err}", path.display()).into())
}

fn handle_pages(file: &Path, as_json: bool) -> Result<(), Box<dyn Error>> {
    let raw = read_file(file)?;
    let pages = parse_pages(&raw);
    let warnings = lint_markers(&raw);

    if as_json {
        let payload = json!({
            "file": file.display().to_string(),
            "pages": pages.iter().map(|page| json!({
                "number": page.number,
                "paragraphs": split_paragraphs(&page.content),
            })).collect::<Vec<_>>(),
            "warnings": warnings,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if pages.is_empty() {
        println!("No page markers in {}; the chapter reads as one page.", file.display());
    } else {
        println!("{:<6}  {:>10}  {}", "PAGE", "PARAGRAPHS", "OPENING");
        println!("{:-<6}  {:->10}  {:-<40}", "", "", "");
        for page in &pages {
            let paragraphs = split_paragraphs(&page.content);
            let opening = paragraphs.first().map(|p| preview(p, 40)).unwrap_or_default();
            println!("{:<6}  {:>10}  {}", page.number, paragraphs.len(), opening);
        }
    }
    for warning in &warnings {
        println!("warning: {warning}");
    }
    Ok(())
}

fn handle_annotate(
    file: &Path,
    glossary: &Path,
    policy: AnnotationPolicy,
    inline_definitions: bool,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let raw = read_file(file)?;
    let table = GlossaryTable::load_or_empty(glossary);
    let mut config = PortalConfig::default();
    config.reader.annotation = policy;
    config.reader.inline_definitions = inline_definitions;
    let annotator = Annotator::new(&table, config.annotator_options());

    let pages = parse_pages(&raw);
    let blocks: Vec<(Option<u32>, Vec<String>)> = if pages.is_empty() {
        vec![(None, annotator.annotate_all(&split_paragraphs(&strip_markers(&raw))))]
    } else {
        pages
            .iter()
            .map(|page| {
                (
                    Some(page.number),
                    annotator.annotate_all(&split_paragraphs(&page.content)),
                )
            })
            .collect()
    };

    if as_json {
        let payload = json!({
            "policy": policy.to_string(),
            "terms": annotator.term_count(),
            "pages": blocks.iter().map(|(number, paragraphs)| json!({
                "number": number,
                "paragraphs": paragraphs,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    for (number, paragraphs) in &blocks {
        if let Some(number) = number {
            println!("<!-- page {number} -->");
        }
        for paragraph in paragraphs {
            println!("<p>{paragraph}</p>");
        }
    }
    Ok(())
}

fn handle_read(args: ReadArgs, as_json: bool) -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(read_chapter(args, as_json))
}

async fn read_chapter(args: ReadArgs, as_json: bool) -> Result<(), Box<dyn Error>> {
    let mut config = PortalConfig::load_from_dir(&args.root);
    args.reader.apply(&mut config);
    let progress_path = args
        .progress
        .clone()
        .unwrap_or_else(|| args.root.join(".reading-progress.json"));
    let loader = ChapterLoader::new(DirSource::new(&args.root), PortalPaths::from_config(&config));
    let (width, height) = terminal_size();
    let mut session = ReaderSession::new(
        loader,
        JsonFileProgress::open(progress_path),
        &config,
        Size::new(f32::from(width), f32::from(height)),
    );

    let page = session
        .open(&args.chapter)
        .await?
        .ok_or("chapter load was superseded")?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }
    print_page(&page);
    if page.error.is_some() {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_prompt();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        let mut words = input.splitn(2, char::is_whitespace);
        match (words.next().unwrap_or(""), words.next().map(str::trim)) {
            ("q" | "quit", _) => break,
            ("" | "n" | "next", _) => match session.next_page() {
                Some(page) => print_page(&page),
                None => println!("Already on the last page."),
            },
            ("p" | "prev", _) => match session.prev_page() {
                Some(page) => print_page(&page),
                None => println!("Already on the first page."),
            },
            ("g" | "gloss", Some(term)) if !term.is_empty() => {
                let event = match session.popups().mode() {
                    InteractionMode::Hover => PopupEvent::PointerEnter {
                        term: term.to_string(),
                        at: Point::default(),
                    },
                    InteractionMode::ClickToPin => PopupEvent::Click {
                        term: term.to_string(),
                        at: Point::default(),
                    },
                };
                session.handle_popup(event);
                match session.popups().open() {
                    Some(overlay) => print_overlay(overlay),
                    None => println!("No definition open."),
                }
            }
            ("c" | "close", _) => {
                session.handle_popup(PopupEvent::Dismiss);
            }
            (word, None) => match word.parse::<usize>() {
                Ok(position) => match session.go_to(position.saturating_sub(1)) {
                    Some(page) => print_page(&page),
                    None => println!("No page at position {position}."),
                },
                Err(_) => print_usage(),
            },
            _ => print_usage(),
        }
        print_prompt();
    }
    Ok(())
}

fn handle_author(args: AuthorArgs, as_json: bool) -> Result<(), Box<dyn Error>> {
    let definitions = read_file(&args.definitions)?;
    let images = match &args.images {
        Some(path) => read_file(path)?,
        None => String::new(),
    };
    let glossary = parse_glossary_bulk(&definitions, &images);
    let drafts = args
        .chapters
        .iter()
        .enumerate()
        .map(|(idx, path)| {
            let title = args.titles.get(idx).cloned().unwrap_or_default();
            read_file(path).map(|text| ChapterDraft::new(title, text))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let site = SiteConfig {
        title: args.site_title,
        author: args.author,
        subtitle: args.subtitle,
        cover: args.cover,
    };

    let export = build_export(glossary, &drafts, site);
    let warnings = export.lint();
    let written = export.write_to(&args.out)?;

    if as_json {
        let payload = json!({
            "written": written.files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "warnings": warnings.iter().map(|(file, warning)| json!({
                "file": file,
                "warning": warning,
            })).collect::<Vec<_>>(),
            "site": written.site,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    for path in &written.files {
        println!("wrote {}", path.display());
    }
    for (file, warning) in &warnings {
        println!("warning: {file}: {warning}");
    }
    println!(
        "Static reader: {} chapters, {} pages",
        written.site.chapters.len(),
        written.site.page_count()
    );
    Ok(())
}

fn handle_build(
    root: &Path,
    out: Option<PathBuf>,
    reader: &ReaderOverrides,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let mut config = PortalConfig::load_from_dir(root);
    reader.apply(&mut config);
    let out = out.unwrap_or_else(|| root.join("site"));
    let summary = build_site(root, &out, &config)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    let width = summary
        .chapters
        .iter()
        .map(|chapter| chapter.file.len())
        .max()
        .unwrap_or(4)
        .max("FILE".len());
    println!("{:<width$}  {:>5}  {}", "FILE", "PAGES", "TITLE", width = width);
    println!("{:-<width$}  {:->5}  {:-<20}", "", "", "", width = width);
    for chapter in &summary.chapters {
        let title = match &chapter.error {
            Some(err) => format!("{} ({err})", chapter.title),
            None => chapter.title.clone(),
        };
        println!("{:<width$}  {:>5}  {}", chapter.file, chapter.pages, title, width = width);
    }
    println!(
        "Wrote {} pages and {} glossary terms to {}",
        summary.page_count(),
        summary.glossary_terms,
        summary.out_dir.display()
    );
    Ok(())
}

#[cfg(feature = "web")]
fn handle_serve(
    root: PathBuf,
    addr: std::net::SocketAddr,
    base_url: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let config = reading_portal::web::WebConfig {
        addr,
        root,
        base_url: base_url.unwrap_or_else(|| format!("http://{addr}")),
    };
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(reading_portal::web::serve(config))?;
    Ok(())
}

fn preview(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Annotated paragraph HTML as terminal markdown, terms in italics.
fn terminal_text(html: &str) -> String {
    let marked = map_annotations(html, |_, visible| format!("*{}*", strip_tags(visible)));
    unescape_attr(&strip_tags(&marked))
}

fn print_page(page: &RenderedPage) {
    let mut text = format!("# {}\n\n", page.title);
    if let Some(error) = &page.error {
        text.push_str(&format!("**{error}**\n"));
        render_markdown(&text);
        return;
    }
    if !page.page_label.is_empty() {
        text.push_str(&format!("*{}*\n\n", page.page_label));
    }
    for paragraph in &page.paragraphs {
        text.push_str(&terminal_text(paragraph));
        text.push_str("\n\n");
    }
    if !page.counter_label.is_empty() {
        text.push_str(&format!("---\n{}\n", page.counter_label));
    }
    if !page.terms.is_empty() {
        let terms: Vec<&str> = page.terms.iter().map(|card| card.term.as_str()).collect();
        text.push_str(&format!("\nGlossary: {}\n", terms.join(", ")));
    }
    render_markdown(&text);
}

fn print_overlay(overlay: &Overlay) {
    let mut text = format!("> **{}**: {}", overlay.term, overlay.entry.definition);
    if let Some(image) = &overlay.entry.image {
        text.push_str(&format!("\n> image: {image}"));
    }
    render_markdown(&text);
}

fn print_usage() {
    println!("Commands: n(ext), p(rev), <position>, g <term>, c(lose), q(uit)");
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn render_markdown(body: &str) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    if stdout_is_tty() {
        let skin = MadSkin::default();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}
