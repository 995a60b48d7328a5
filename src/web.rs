use crate::annotate::Annotator;
use crate::config::PortalConfig;
use crate::error::PortalError;
use crate::glossary::GlossaryTable;
use crate::loader::{DirSource, LoadedChapter, PortalPaths, PortalSource, load_chapter};
use crate::manifest::Manifest;
use crate::popup::render_definition_html;
use crate::progress::progress_key;
use crate::reader::{ChapterView, RenderedPage};
use crate::render::{LinkStyle, render_chapter_page, render_error_page, render_index};
use crate::site::asset;
use axum::{
    Json, Router,
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use cookie::{Cookie, SameSite};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, info};

type SharedState = Arc<AppState>;
type AnnotatorKey = (u64, crate::annotate::AnnotatorOptions);

const ANNOTATOR_CACHE_SIZE: usize = 16;
const PROGRESS_COOKIE_DAYS: i64 = 365;

pub struct AppState {
    pub config: PortalConfig,
    pub base_url: String,
    source: DirSource,
    paths: PortalPaths,
    annotators: Mutex<LruCache<AnnotatorKey, Arc<Annotator>>>,
}

impl AppState {
    pub fn new(root: impl Into<PathBuf>, config: PortalConfig, base_url: impl Into<String>) -> Self {
        let capacity = NonZeroUsize::new(ANNOTATOR_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            paths: PortalPaths::from_config(&config),
            source: DirSource::new(root),
            config,
            base_url: base_url.into(),
            annotators: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compiled annotator for `glossary`, reused while the glossary file is unchanged.
    fn annotator(&self, glossary: &GlossaryTable) -> Arc<Annotator> {
        let options = self.config.annotator_options();
        let key = (glossary.fingerprint(), options);
        if let Some(hit) = self.annotators.lock().get(&key) {
            return Arc::clone(hit);
        }
        debug!(terms = glossary.len(), "Compiling glossary annotator");
        let annotator = Arc::new(Annotator::new(glossary, options));
        self.annotators.lock().put(key, Arc::clone(&annotator));
        annotator
    }

    fn view(&self, loaded: LoadedChapter, stored_index: Option<usize>) -> ChapterView {
        let glossary = Arc::new(loaded.glossary);
        let annotator = self.annotator(&glossary);
        ChapterView::build(
            loaded.chapter,
            loaded.title,
            loaded.text,
            glossary,
            annotator,
            self.config.reader.strict_pagination,
            stored_index,
        )
    }

    async fn glossary(&self) -> GlossaryTable {
        match self.source.fetch(&self.paths.glossary).await {
            Ok(body) => GlossaryTable::from_json_or_empty(&body),
            Err(err) => {
                debug!(error = %err, "Serving empty glossary");
                GlossaryTable::new()
            }
        }
    }

    async fn manifest(&self) -> Manifest {
        match self.source.fetch(&self.paths.manifest).await {
            Ok(body) => Manifest::from_json_or_empty(&body),
            Err(err) => {
                debug!(error = %err, "Serving empty manifest");
                Manifest::default()
            }
        }
    }
}

#[derive(Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub root: PathBuf,
    pub base_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            root: PathBuf::from("."),
            base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum WebError {
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    Serve(std::io::Error),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::Bind { addr, source } => write!(f, "cannot listen on {addr}: {source}"),
            WebError::Serve(err) => write!(f, "server error: {err}"),
        }
    }
}

impl std::error::Error for WebError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WebError::Bind { source, .. } => Some(source),
            WebError::Serve(err) => Some(err),
        }
    }
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let portal = PortalConfig::load_from_dir(&config.root);
    info!(
        %config.addr,
        root = %config.root.display(),
        interaction = %portal.reader.interaction,
        annotation = %portal.reader.annotation,
        base = %config.base_url,
        "Binding HTTP listener"
    );
    let state = Arc::new(AppState::new(
        config.root.clone(),
        portal,
        config.base_url.clone(),
    ));
    let router = build_router(state);
    let listener = TcpListener::bind(config.addr)
        .await
        .map_err(|source| WebError::Bind {
            addr: config.addr,
            source,
        })?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(WebError::Serve)?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<PortalError> for ApiError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::InvalidChapter(_) => Self::bad_request(err.to_string()),
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/chapter", get(chapter_html))
        .route("/api/chapter", get(api_chapter))
        .route("/api/glossary", get(api_glossary))
        .route("/api/manifest", get(api_manifest))
        .route("/assets/:file", get(asset_file))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "reading-portal" }))
}

async fn home(State(state): State<SharedState>) -> impl IntoResponse {
    let manifest = state.manifest().await;
    Html(
        render_index(&state.config.site, &manifest, LinkStyle::Server).unwrap_or_else(|err| {
            render_error_page(&state.config.site.title, &err.to_string(), LinkStyle::Server)
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ChapterParams {
    chapter: Option<String>,
    page: Option<usize>,
}

impl ChapterParams {
    fn chapter(&self) -> Option<&str> {
        self.chapter.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

async fn chapter_html(
    State(state): State<SharedState>,
    Query(params): Query<ChapterParams>,
    headers: HeaderMap,
) -> Response {
    let Some(chapter) = params.chapter() else {
        return Redirect::to("/").into_response();
    };
    let loaded = match load_chapter(&state.source, &state.paths, chapter).await {
        Ok(loaded) => loaded,
        Err(err) => {
            let page = render_error_page(&state.config.site.title, &err.to_string(), LinkStyle::Server);
            return (StatusCode::BAD_REQUEST, Html(page)).into_response();
        }
    };
    let stored = params
        .page
        .or_else(|| stored_progress(&headers, &loaded.chapter));
    let view = state.view(loaded, stored);
    let page = view.render();
    let html = render_chapter_page(
        &page,
        &state.config.site,
        state.config.reader.interaction,
        LinkStyle::Server,
    )
    .unwrap_or_else(|err| render_error_page(&state.config.site.title, &err.to_string(), LinkStyle::Server));

    let mut response = Html(html).into_response();
    if let Some(index) = view.current_index() {
        if let Ok(value) = HeaderValue::from_str(&progress_cookie(view.chapter(), index)) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

async fn api_chapter(
    State(state): State<SharedState>,
    Query(params): Query<ChapterParams>,
) -> Result<Json<RenderedPage>, ApiError> {
    let chapter = params
        .chapter()
        .ok_or_else(|| ApiError::bad_request("Query parameter `chapter` is required"))?;
    let loaded = load_chapter(&state.source, &state.paths, chapter).await?;
    Ok(Json(state.view(loaded, params.page).render()))
}

#[derive(Debug, Deserialize)]
struct GlossaryParams {
    term: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DefinitionPayload {
    term: String,
    definition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    html: String,
}

async fn api_glossary(
    State(state): State<SharedState>,
    Query(params): Query<GlossaryParams>,
) -> Result<Response, ApiError> {
    let glossary = state.glossary().await;
    let Some(term) = params.term else {
        return Ok(Json(glossary).into_response());
    };
    let (canonical, entry) = glossary
        .lookup(&term)
        .ok_or_else(|| ApiError::not_found(format!("No glossary entry for {term:?}")))?;
    Ok(Json(DefinitionPayload {
        term: canonical.to_string(),
        definition: entry.definition.clone(),
        image: entry.image.clone(),
        html: render_definition_html(canonical, entry),
    })
    .into_response())
}

async fn api_manifest(State(state): State<SharedState>) -> Json<Manifest> {
    Json(state.manifest().await)
}

async fn asset_file(UrlPath(file): UrlPath<String>) -> Result<Response, ApiError> {
    let body = asset(&file).ok_or_else(|| ApiError::not_found(format!("No asset named {file:?}")))?;
    let content_type = if file.ends_with(".js") {
        mime::APPLICATION_JAVASCRIPT_UTF_8
    } else if file.ends_with(".css") {
        mime::TEXT_CSS_UTF_8
    } else {
        mime::APPLICATION_OCTET_STREAM
    };
    Ok(([(header::CONTENT_TYPE, content_type.as_ref().to_string())], body).into_response())
}

/// Saved page index for `chapter` from the request's `Cookie` headers.
fn stored_progress(headers: &HeaderMap, chapter: &str) -> Option<usize> {
    let name = progress_key(chapter);
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .and_then(|cookie| cookie.value().parse().ok())
}

fn progress_cookie(chapter: &str, index: usize) -> String {
    Cookie::build((progress_key(chapter), index.to_string()))
        .path("/")
        .max_age(cookie::time::Duration::days(PROGRESS_COOKIE_DAYS))
        .same_site(SameSite::Lax)
        .build()
        .to_string()
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use axum::{body, body::Body, http::Request};
    use std::fs;
    use tower::ServiceExt;

    fn portal() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("chapters")).unwrap();
        fs::write(
            root.join("glossary.json"),
            r#"{"canoe": {"definition": "a narrow boat", "image": "https://example.com/c.png"}}"#,
        )
        .unwrap();
        fs::write(
            root.join("chapters/manifest.json"),
            r#"[{"number": 1, "title": "The River", "file": "chapter1.txt"}]"#,
        )
        .unwrap();
        fs::write(
            root.join("chapters/chapter1.txt"),
            "[startPage=1]The canoe left.[endPage=1][startPage=2]It came back.[endPage=2]",
        )
        .unwrap();
        dir
    }

    fn test_router(root: &std::path::Path) -> Router {
        let state = Arc::new(AppState::new(
            root,
            PortalConfig::default(),
            "http://127.0.0.1:8080",
        ));
        build_router(state)
    }

    async fn body_text(response: Response) -> String {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn home_lists_chapters() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let html = body_text(response).await;
        assert!(html.contains("/chapter?chapter=chapter1%2Etxt"));
        assert!(html.contains("Chapter 1: The River"));
    }

    #[tokio::test]
    async fn chapter_page_resumes_from_cookie_and_sets_it() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(
                Request::get("/chapter?chapter=1")
                    .header(header::COOKIE, "theme=dark; reading_progress_chapter1.txt=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("reading_progress_chapter1.txt=1"));
        let html = body_text(response).await;
        assert!(html.contains("It came back."));
        assert!(html.contains("Page 2 of 2"));
    }

    #[tokio::test]
    async fn chapter_page_marks_glossary_terms() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(
                Request::get("/chapter?chapter=chapter1.txt&page=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let html = body_text(response).await;
        assert!(html.contains(r#"data-word="canoe""#));
        assert!(html.contains(r#"<template data-term="canoe">"#));
    }

    #[tokio::test]
    async fn missing_chapter_param_redirects_home() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(Request::get("/chapter").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_redirection());
    }

    #[tokio::test]
    async fn api_chapter_reports_missing_text_in_body() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(
                Request::get("/api/chapter?chapter=9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        let payload: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("chapter9.txt"));
        assert_eq!(payload["paragraphs"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn api_chapter_rejects_path_traversal() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(
                Request::get("/api/chapter?chapter=..%2Fglossary.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn api_glossary_looks_up_terms_case_insensitively() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(
                Request::get("/api/glossary?term=Canoe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        let payload: DefinitionPayload = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(payload.term, "canoe");
        assert_eq!(payload.image.as_deref(), Some("https://example.com/c.png"));

        let response = test_router(dir.path())
            .oneshot(
                Request::get("/api/glossary?term=kayak")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn degraded_glossary_still_serves_chapters() {
        let dir = portal();
        fs::write(dir.path().join("glossary.json"), "{oops").unwrap();
        let response = test_router(dir.path())
            .oneshot(
                Request::get("/api/chapter?chapter=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let page: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(page["error"].is_null());
        assert_eq!(page["terms"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn assets_are_served_with_content_types() {
        let dir = portal();
        let response = test_router(dir.path())
            .oneshot(Request::get("/assets/reader.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/javascript; charset=utf-8"
        );
    }

    #[test]
    fn progress_cookie_round_trips_through_headers() {
        let mut headers = HeaderMap::new();
        let cookie = progress_cookie("chapter2.txt", 4);
        let pair = cookie.split(';').next().unwrap();
        headers.insert(header::COOKIE, HeaderValue::from_str(pair).unwrap());
        assert_eq!(stored_progress(&headers, "chapter2.txt"), Some(4));
        assert_eq!(stored_progress(&headers, "chapter1.txt"), None);
    }

    #[test]
    fn annotators_are_cached_per_glossary() {
        let state = AppState::new(".", PortalConfig::default(), "http://localhost");
        let glossary = GlossaryTable::from_json_str(r#"{"canoe": "a boat"}"#).unwrap();
        let first = state.annotator(&glossary);
        let second = state.annotator(&glossary);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
