//! HTTP surface: rendered documents, conversion, user attributes and the
//! document listing.

pub mod auth;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use lesson_hub_core::{
    index::DocumentEntry,
    permission::Affordances,
    pipeline::{error_panel, ContentAnchor, Pipeline, RenderRequest, Rendered},
    preferences::{flag_is, set_config, Preferences, CONFIG_ATTRIBUTE, LAST_VISITED_ATTRIBUTE},
    principal::{Principal, SessionRefresher},
    roles::resolve_roles,
};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::{compression::CompressionLayer, services::ServeFile, trace::TraceLayer};
use tracing::{debug, warn};

use crate::config::Settings;
pub use auth::AuthContext;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub refresher: Option<Arc<dyn SessionRefresher>>,
    pub settings: Arc<Settings>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(pipeline: Pipeline, refresher: Option<Arc<dyn SessionRefresher>>, settings: Settings) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            refresher,
            settings: Arc::new(settings),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ConvertRequest {
    url: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct ConvertParams {
    url: Option<String>,
}

#[derive(Serialize)]
struct ConvertResponse {
    html: String,
    content_map: Vec<ContentAnchor>,
}

#[derive(Serialize)]
struct Profile {
    subject: String,
    name: String,
    ldap: Option<String>,
    roles: Vec<String>,
    config: Preferences,
    attributes: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct StoreResult {
    success: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/md/{*path}", get(document))
        .route("/convert", get(convert_url).post(convert))
        .route("/userattributes", get(user_attributes).post(store_user_attributes))
        .route("/api/listing", get(listing))
        .route("/api/affordances", get(affordances))
        .layer(middleware::from_fn(security_headers))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("frame-ancestors 'self'"),
    );
    response
}

/// Scheme and host the caller used, for absolute links in rendered output.
fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("X-Forwarded-Proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{scheme}://{host}")
}

/// The start page, or the last visited page for principals that asked to
/// resume where they left off.
async fn root(State(state): State<AppState>, auth: AuthContext) -> Redirect {
    let store = state.pipeline.evaluator().store();
    let target = match store.attributes(&auth.principal).await {
        Ok(attrs) => {
            let resume = attrs
                .get(CONFIG_ATTRIBUTE)
                .and_then(|raw| Preferences::from_json(raw).ok())
                .is_some_and(|prefs| flag_is(prefs.sl, 1.0));
            match attrs.get(LAST_VISITED_ATTRIBUTE) {
                Some(url) if resume && !url.is_empty() => url.to_string(),
                _ => state.settings.start_page.clone(),
            }
        }
        Err(e) => {
            warn!(user = %auth.principal.subject, error = %e, "failed to load attributes");
            state.settings.start_page.clone()
        }
    };
    Redirect::to(&target)
}

fn remember_visit(state: &AppState, principal: &Principal, url: String) {
    let store = state.pipeline.evaluator().store().clone();
    let principal = principal.clone();
    tokio::spawn(async move {
        if let Err(e) = store.set_attribute(&principal, LAST_VISITED_ATTRIBUTE, &url).await {
            warn!(user = %principal.subject, error = %e, "failed to record last visited page");
        }
    });
}

/// Markdown documents are rendered for the caller; any other file known
/// to the index is served as is.
async fn document(State(state): State<AppState>, Path(path): Path<String>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let auth = match AuthContext::from_request_parts(&mut parts, &state).await {
        Ok(auth) => auth,
        Err(status) => return status.into_response(),
    };
    let snapshot = state.pipeline.index().current();

    if !path.ends_with(".md") {
        let name = path.rsplit('/').next().unwrap_or(&path);
        if !snapshot.files_named(name).contains(&path) {
            return StatusCode::NOT_FOUND.into_response();
        }
        let request = Request::from_parts(parts, body);
        return match ServeFile::new(snapshot.absolute(&path)).oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        };
    }

    if snapshot.entry(&path).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let raw = match tokio::fs::read_to_string(snapshot.absolute(&path)).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path, error = %e, "failed to read document");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let base = base_url(&parts.headers);
    let request = RenderRequest {
        principal: &auth.principal,
        base_url: &base,
    };
    let rendered = match state.pipeline.try_render(&raw, &request).await {
        Ok(rendered) => {
            remember_visit(&state, &auth.principal, parts.uri.to_string());
            rendered
        }
        Err(e) => error_panel(&e, &auth.principal),
    };
    Html(rendered.html).into_response()
}

async fn fetch_markdown(state: &AppState, url: &str, token: &str) -> Result<String, reqwest::Error> {
    state
        .http
        .get(url)
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

async fn render_for(state: &AppState, auth: &AuthContext, headers: &HeaderMap, markdown: &str) -> Rendered {
    let base = base_url(headers);
    let request = RenderRequest {
        principal: &auth.principal,
        base_url: &base,
    };
    state.pipeline.render(markdown, &request).await
}

async fn convert(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(req): Json<ConvertRequest>,
) -> Result<Json<ConvertResponse>, (StatusCode, String)> {
    let markdown = match (req.url, req.content) {
        (Some(url), _) => fetch_markdown(&state, &url, &auth.principal.tokens.access_token)
            .await
            .map_err(|e| {
                debug!(url = %url, error = %e, "remote markdown fetch failed");
                (StatusCode::BAD_GATEWAY, format!("Failed to fetch {url}: {e}"))
            })?,
        (None, Some(content)) => content,
        (None, None) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "Specify 'url' or 'content' in the body to convert markdown to HTML.".to_string(),
            ))
        }
    };
    let rendered = render_for(&state, &auth, &headers, &markdown).await;
    Ok(Json(ConvertResponse {
        html: rendered.html,
        content_map: rendered.content_map,
    }))
}

async fn convert_url(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Query(params): Query<ConvertParams>,
) -> Result<Html<String>, (StatusCode, String)> {
    let Some(url) = params.url else {
        return Err((
            StatusCode::BAD_REQUEST,
            "Provide the markdown file with `?url=<url-encoded-url>`.".to_string(),
        ));
    };
    let markdown = fetch_markdown(&state, &url, &auth.principal.tokens.access_token)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("Failed to fetch {url}: {e}")))?;
    Ok(Html(render_for(&state, &auth, &headers, &markdown).await.html))
}

async fn user_attributes(State(state): State<AppState>, auth: AuthContext) -> Json<Profile> {
    let principal = auth.principal;
    let store = state.pipeline.evaluator().store();
    let attributes = match store.attributes(&principal).await {
        Ok(attrs) => attrs.attributes,
        Err(e) => {
            warn!(user = %principal.subject, error = %e, "failed to load attributes");
            BTreeMap::new()
        }
    };
    let roles = resolve_roles(&principal, state.pipeline.evaluator().client_id())
        .iter()
        .map(String::from)
        .collect();
    Json(Profile {
        subject: principal.subject.clone(),
        name: principal.name.clone(),
        ldap: principal.ldap.clone(),
        roles,
        config: principal.ui_config(),
        attributes,
    })
}

async fn store_user_attributes(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(prefs): Json<Preferences>,
) -> Json<StoreResult> {
    let success = set_config(state.pipeline.evaluator().store().as_ref(), &auth.principal, &prefs).await;
    Json(StoreResult { success })
}

async fn listing(State(state): State<AppState>, auth: AuthContext) -> Json<Vec<DocumentEntry>> {
    let entries = state
        .pipeline
        .index()
        .visible_entries(state.pipeline.evaluator(), &auth.principal)
        .await;
    Json(entries)
}

async fn affordances(State(state): State<AppState>, auth: AuthContext) -> Json<Affordances> {
    Json(state.pipeline.evaluator().affordances(&auth.principal).await)
}
