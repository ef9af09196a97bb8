//! Markdown to HTML for one request: permission gating, raw-text passes,
//! conversion, event passes and sanitization, in that order.

pub mod callout;
pub mod diagram;
pub mod html;
pub mod sanitize;
pub mod text;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::index::{strip_leading_marker, DocumentIndex};
use crate::permission::{AccessContext, Evaluator, MatchMode, PermissionSpec};
use crate::principal::Principal;

pub use callout::{CalloutDef, CalloutStyle, CalloutTable};
pub use sanitize::{AmmoniaSanitizer, HtmlSanitizer};

pub const DEFAULT_PLANTUML_URL: &str = "https://plantuml.unterrainer.info/plantuml";
pub const PERMISSION_DENIED_MESSAGE: &str = "You do not have the required permissions to view this content.";

/// Who is asking and where links should point.
#[derive(Clone, Copy, Debug)]
pub struct RenderRequest<'a> {
    pub principal: &'a Principal,
    pub base_url: &'a str,
}

/// One table-of-contents entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentAnchor {
    pub id: String,
    pub text: String,
    pub level: u8,
}

impl ContentAnchor {
    pub fn root() -> Self {
        Self {
            id: "ROOT".into(),
            text: "TOP".into(),
            level: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Rendered {
    pub html: String,
    pub content_map: Vec<ContentAnchor>,
}

/// Roles and preferences fetched on first use and reused for every check
/// in the same render.
struct LazyAccess<'a> {
    evaluator: &'a Evaluator,
    principal: &'a Principal,
    ctx: Option<AccessContext>,
}

impl LazyAccess<'_> {
    async fn permits(&mut self, spec: &PermissionSpec) -> bool {
        if spec.is_public() {
            return true;
        }
        if self.ctx.is_none() {
            let ctx = self.evaluator.access_context(self.principal).await;
            if ctx.preferences.is_none() {
                warn!(user = %self.principal.subject, "preferences unreadable, restricted content hidden");
            }
            self.ctx = Some(ctx);
        }
        self.ctx
            .as_ref()
            .is_some_and(|ctx| ctx.permits(spec, MatchMode::Any, true))
    }
}

/// The readable stand-in for a document that could not be rendered.
pub fn error_panel(error: &PipelineError, principal: &Principal) -> Rendered {
    match error {
        PipelineError::PermissionDenied(_) => debug!(user = %principal.subject, "render denied"),
        _ => warn!(user = %principal.subject, error = %error, "render failed"),
    }
    Rendered {
        html: format!("<div class=\"render-error\">{}</div>", html::escape_html(&error.to_string())),
        content_map: vec![ContentAnchor::root()],
    }
}

pub struct Pipeline {
    evaluator: Evaluator,
    index: Arc<DocumentIndex>,
    callouts: CalloutTable,
    plantuml_url: String,
    sanitizer: Arc<dyn HtmlSanitizer>,
}

impl Pipeline {
    pub fn new(evaluator: Evaluator, index: Arc<DocumentIndex>) -> Self {
        Self {
            evaluator,
            index,
            callouts: CalloutTable::obsidian(),
            plantuml_url: DEFAULT_PLANTUML_URL.to_string(),
            sanitizer: Arc::new(AmmoniaSanitizer::new()),
        }
    }

    pub fn with_callouts(mut self, callouts: CalloutTable) -> Self {
        self.callouts = callouts;
        self
    }

    pub fn with_plantuml_url(mut self, url: impl Into<String>) -> Self {
        self.plantuml_url = url.into();
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn HtmlSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn index(&self) -> &Arc<DocumentIndex> {
        &self.index
    }

    /// Never fails: stage errors and denials become an error panel.
    pub async fn render(&self, raw: &str, request: &RenderRequest<'_>) -> Rendered {
        match self.try_render(raw, request).await {
            Ok(rendered) => rendered,
            Err(e) => error_panel(&e, request.principal),
        }
    }

    pub async fn try_render(&self, raw: &str, request: &RenderRequest<'_>) -> Result<Rendered, PipelineError> {
        let mut access = LazyAccess {
            evaluator: &self.evaluator,
            principal: request.principal,
            ctx: None,
        };

        let mut body = strip_leading_marker(raw);
        let (first_line, rest) = body.split_once('\n').unwrap_or((body, ""));
        if let Some(spec) = PermissionSpec::parse_directive(first_line) {
            if !access.permits(&spec).await {
                return Err(PipelineError::PermissionDenied(PERMISSION_DENIED_MESSAGE.to_string()));
            }
            body = rest;
        }

        let blocks = text::restricted_blocks(body);
        let mut allowed = Vec::with_capacity(blocks.len());
        for block in &blocks {
            allowed.push(access.permits(&block.spec).await);
        }
        let body = text::apply_restrictions(body, &blocks, &allowed);

        let body = diagram::replace_plantuml(&body, &self.plantuml_url)?;
        let mut protected = text::ProtectedText::new(body);
        diagram::mark_mermaid(&mut protected)?;
        protected.protect_code();

        let snapshot = self.index.current();
        protected.map(|t| text::resolve_wiki_links(t, &snapshot, request.base_url));
        protected.map(text::mark_callouts);
        protected.map(text::mark_fragments);
        protected.map(text::side_by_side);
        let markdown = protected.restore();

        let events = html::parse(&markdown);
        let events = callout::expand_callouts(events, &self.callouts);
        let events = html::resolve_embeds(events, &snapshot, request.base_url);
        let events = html::apply_size_hints(events);
        let events = html::apply_fragments(events);
        let (events, content_map) = html::anchor_headings(events);
        let html = self.sanitizer.sanitize(&html::emit(events));
        Ok(Rendered { html, content_map })
    }
}
