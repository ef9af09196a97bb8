//! Markdown conversion and the passes over the parsed event stream.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use pulldown_cmark::{html, CowStr, Event, HeadingLevel, Options, Parser, Tag, TagEnd, TextMergeStream};
use regex::Regex;

use super::text::FRAGMENT_MARKER;
use super::ContentAnchor;
use crate::index::IndexSnapshot;

pub const ROOT_ANCHOR: &str = "<span id=\"ROOT\" class=\"docanchor\"></span>";

const IMAGE_TYPES: &[&str] = &[
    "png", "jpg", "jpeg", "apng", "avif", "gif", "jfif", "pjpeg", "pjp", "svg", "webp", "bmp", "ico", "tiff", "tif",
    "heif", "heic",
];

static EMBED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[\[(.*?)\]\]").expect("embed regex is valid"));

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Parses with tables, strikethrough, task lists and footnotes. Soft breaks
/// become hard breaks and adjacent text events are merged.
pub fn parse(markdown: &str) -> Vec<Event<'_>> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_FOOTNOTES);
    let events = Parser::new_ext(markdown, options).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        event => event,
    });
    TextMergeStream::new(events).collect()
}

/// HTML for the event stream, behind the `ROOT` anchor.
pub fn emit(events: Vec<Event<'_>>) -> String {
    let mut out = String::from(ROOT_ANCHOR);
    html::push_html(&mut out, events.into_iter());
    out
}

/// Display size parsed from `name|WxH` or `name|W`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeHint {
    pub name: String,
    pub width: String,
    pub height: String,
}

impl SizeHint {
    fn style(&self) -> String {
        format!("width: {}; height: {};", self.width, self.height)
    }
}

fn css_length(value: &str) -> String {
    if value.trim().parse::<f64>().is_ok() {
        format!("{}px", value.trim())
    } else {
        value.to_string()
    }
}

pub fn parse_width_height(input: &str) -> Option<SizeHint> {
    let mut parts = input.split('|');
    let name = parts.next()?.to_string();
    let size = parts.next()?;
    let (width, height) = match size.split('x').collect::<Vec<_>>().as_slice() {
        [w, h] => (css_length(w), css_length(h)),
        [w, ..] => (css_length(w), "auto".to_string()),
        [] => ("100%".to_string(), "auto".to_string()),
    };
    Some(SizeHint { name, width, height })
}

fn extension(path: &str) -> Option<String> {
    let (_, ext) = path.rsplit_once('.')?;
    Some(ext.to_lowercase())
}

fn embed_html(target: &str, path: &str, src: &str, hint: Option<&SizeHint>) -> String {
    let src = escape_html(src);
    let alt = escape_html(target);
    match extension(path).as_deref() {
        Some(ext) if IMAGE_TYPES.contains(&ext) => match hint {
            Some(hint) => format!("<img src=\"{src}\" alt=\"{alt}\" style=\"{}\" />", hint.style()),
            None => format!("<img src=\"{src}\" alt=\"{alt}\" />"),
        },
        Some(ext @ ("mp4" | "webm")) => {
            format!("<video controls><source src=\"{src}\" type=\"video/{ext}\"></video>")
        }
        Some("ogg") => format!("<audio controls><source src=\"{src}\" type=\"audio/ogg\"></audio>"),
        _ => format!("<a href=\"{src}\">{alt}</a>"),
    }
}

/// HTML for one `![[...]]` body, or `None` when no single file matches.
fn resolve_embed(inner: &str, index: &IndexSnapshot, base_url: &str) -> Option<String> {
    let hint = parse_width_height(inner);
    let mut target = hint.as_ref().map_or(inner, |h| h.name.as_str());
    target = target.strip_prefix("/md/").unwrap_or(target);
    target = target.strip_prefix("md/").unwrap_or(target);
    let base = target.rsplit('/').next().unwrap_or(target);
    let path = match index.files_named(base) {
        [] => return None,
        [only] => only,
        many => many.iter().find(|p| p.as_str() == target)?,
    };
    let src = format!("{}/{}{}", base_url.trim_end_matches('/'), index.prefix, path);
    Some(embed_html(target, path, &src, hint.as_ref()))
}

/// Opens a region whose text must reach the writer untouched.
fn is_raw(tag: &Tag<'_>) -> bool {
    matches!(tag, Tag::CodeBlock(_) | Tag::Image { .. } | Tag::HtmlBlock | Tag::MetadataBlock(_))
}

/// Replaces `![[file]]` embeds in ordinary text with media markup.
pub fn resolve_embeds<'a>(events: Vec<Event<'a>>, index: &IndexSnapshot, base_url: &str) -> Vec<Event<'a>> {
    let mut out = Vec::with_capacity(events.len());
    let mut raw: Vec<bool> = Vec::new();
    for event in events {
        match event {
            Event::Start(tag) => {
                raw.push(is_raw(&tag) || raw.last().copied().unwrap_or(false));
                out.push(Event::Start(tag));
            }
            Event::End(tag) => {
                raw.pop();
                out.push(Event::End(tag));
            }
            Event::Text(text) if !raw.last().copied().unwrap_or(false) && EMBED.is_match(&text) => {
                let mut pos = 0;
                for caps in EMBED.captures_iter(&text) {
                    let Some(whole) = caps.get(0) else { continue };
                    let Some(html) = resolve_embed(&caps[1], index, base_url) else {
                        continue;
                    };
                    if whole.start() > pos {
                        out.push(Event::Text(CowStr::from(text[pos..whole.start()].to_string())));
                    }
                    out.push(Event::InlineHtml(CowStr::from(html)));
                    pos = whole.end();
                }
                if pos < text.len() {
                    out.push(Event::Text(CowStr::from(text[pos..].to_string())));
                }
            }
            event => out.push(event),
        }
    }
    out
}

fn alt_text(events: &[Event<'_>]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Text(t) | Event::Code(t) => Some(t.as_ref()),
            _ => None,
        })
        .collect()
}

/// Images whose alt text carries `|WxH` get an explicit inline size.
pub fn apply_size_hints(events: Vec<Event<'_>>) -> Vec<Event<'_>> {
    let mut out = Vec::with_capacity(events.len());
    let mut i = 0;
    while i < events.len() {
        let Event::Start(Tag::Image { dest_url, .. }) = &events[i] else {
            out.push(events[i].clone());
            i += 1;
            continue;
        };
        let Some(len) = events[i + 1..]
            .iter()
            .position(|e| matches!(e, Event::End(TagEnd::Image)))
        else {
            out.push(events[i].clone());
            i += 1;
            continue;
        };
        let end = i + 1 + len;
        let alt = alt_text(&events[i + 1..end]);
        match parse_width_height(&alt) {
            Some(hint) => {
                out.push(Event::InlineHtml(CowStr::from(format!(
                    "<img alt=\"{}\" src=\"{}\" style=\"{}\" />",
                    escape_html(&hint.name),
                    escape_html(dest_url),
                    hint.style()
                ))));
            }
            _ => out.extend_from_slice(&events[i..=end]),
        }
        i = end + 1;
    }
    out
}

enum Close<'a> {
    Keep,
    Replace(String),
    Append(Event<'a>),
}

struct Frame<'a> {
    close: Close<'a>,
    raw: bool,
}

/// Reveal-fragment state: every marker starts the next fragment, h2/h3
/// start over.
struct Fragments {
    index: i32,
    started: bool,
}

impl Fragments {
    fn attrs(&self) -> String {
        format!(" class=\"fragment\" data-fragment-index=\"{}\"", self.index)
    }

    fn reset(&mut self) {
        self.index = -1;
        self.started = false;
    }

    /// Counts the markers in `html` and returns what is left of it.
    fn take_markers(&mut self, html: &str) -> Option<String> {
        let count = html.matches(FRAGMENT_MARKER).count();
        if count == 0 {
            return None;
        }
        self.index += count as i32;
        self.started = true;
        Some(html.replace(FRAGMENT_MARKER, ""))
    }
}

fn open_tag<'a>(tag: Tag<'a>, fragments: &Fragments) -> (Vec<Event<'a>>, Close<'a>) {
    let marks = fragments.attrs();
    let raw = |open: String, close: &str| (vec![Event::Html(CowStr::from(open))], Close::Replace(close.to_string()));
    match tag {
        Tag::Paragraph => raw(format!("<p{marks}>"), "</p>\n"),
        Tag::Item => raw(format!("<li{marks}>"), "</li>\n"),
        Tag::Emphasis => raw(format!("<em{marks}>"), "</em>"),
        Tag::Strong => raw(format!("<strong{marks}>"), "</strong>"),
        Tag::Strikethrough => raw(format!("<del{marks}>"), "</del>"),
        Tag::BlockQuote(_) => raw(format!("<blockquote{marks}>\n"), "</blockquote>\n"),
        Tag::List(None) => raw(format!("<ul{marks}>\n"), "</ul>\n"),
        Tag::List(Some(1)) => raw(format!("<ol{marks}>\n"), "</ol>\n"),
        Tag::List(Some(start)) => raw(format!("<ol start=\"{start}\"{marks}>\n"), "</ol>\n"),
        Tag::Heading {
            level,
            id,
            mut classes,
            mut attrs,
        } => {
            classes.push(CowStr::Borrowed("fragment"));
            attrs.push((
                CowStr::Borrowed("data-fragment-index"),
                Some(CowStr::from(fragments.index.to_string())),
            ));
            let tag = Tag::Heading { level, id, classes, attrs };
            (vec![Event::Start(tag)], Close::Keep)
        }
        tag @ (Tag::Table(_) | Tag::CodeBlock(_) | Tag::HtmlBlock) => (
            vec![Event::Html(CowStr::from(format!("<div{marks}>\n"))), Event::Start(tag)],
            Close::Append(Event::Html(CowStr::Borrowed("</div>\n"))),
        ),
        tag @ (Tag::Link { .. } | Tag::Image { .. }) => (
            vec![Event::InlineHtml(CowStr::from(format!("<span{marks}>"))), Event::Start(tag)],
            Close::Append(Event::InlineHtml(CowStr::Borrowed("</span>"))),
        ),
        tag => (vec![Event::Start(tag)], Close::Keep),
    }
}

/// Turns fragment markers into `class="fragment"` and
/// `data-fragment-index` on everything that follows them.
pub fn apply_fragments(events: Vec<Event<'_>>) -> Vec<Event<'_>> {
    let mut fragments = Fragments {
        index: -1,
        started: false,
    };
    let mut frames: Vec<Frame<'_>> = Vec::new();
    let mut out = Vec::with_capacity(events.len());
    for event in unwrap_marker_blocks(events) {
        let in_raw = frames.last().is_some_and(|f| f.raw);
        match event {
            Event::Html(html) => match fragments.take_markers(&html) {
                Some(rest) if rest.trim().is_empty() => {}
                Some(rest) => out.push(Event::Html(CowStr::from(rest))),
                None => out.push(Event::Html(html)),
            },
            Event::InlineHtml(html) => match fragments.take_markers(&html) {
                Some(rest) if rest.trim().is_empty() => {}
                Some(rest) => out.push(Event::InlineHtml(CowStr::from(rest))),
                None => out.push(Event::InlineHtml(html)),
            },
            Event::Start(tag) => {
                if matches!(
                    tag,
                    Tag::Heading {
                        level: HeadingLevel::H2 | HeadingLevel::H3,
                        ..
                    }
                ) {
                    fragments.reset();
                }
                let raw = in_raw || is_raw(&tag);
                if !fragments.started || in_raw || is_table_part(&tag) {
                    frames.push(Frame { close: Close::Keep, raw });
                    out.push(Event::Start(tag));
                    continue;
                }
                let (open, close) = open_tag(tag, &fragments);
                out.extend(open);
                frames.push(Frame { close, raw });
            }
            Event::End(end) => match frames.pop().map(|f| f.close) {
                Some(Close::Replace(html)) => out.push(Event::Html(CowStr::from(html))),
                Some(Close::Append(after)) => {
                    out.push(Event::End(end));
                    out.push(after);
                }
                Some(Close::Keep) | None => out.push(Event::End(end)),
            },
            Event::Text(text) if fragments.started && !in_raw && !text.trim().is_empty() => {
                out.push(Event::InlineHtml(CowStr::from(format!("<span{}>", fragments.attrs()))));
                out.push(Event::Text(text));
                out.push(Event::InlineHtml(CowStr::Borrowed("</span>")));
            }
            Event::Code(code) if fragments.started && !in_raw => {
                out.push(Event::InlineHtml(CowStr::from(format!("<span{}>", fragments.attrs()))));
                out.push(Event::Code(code));
                out.push(Event::InlineHtml(CowStr::Borrowed("</span>")));
            }
            event => out.push(event),
        }
    }
    out
}

/// A marker on its own line parses as an HTML block; keep only the marker
/// so the block itself is never treated as content.
fn unwrap_marker_blocks(events: Vec<Event<'_>>) -> Vec<Event<'_>> {
    let mut out = Vec::with_capacity(events.len());
    let mut i = 0;
    while i < events.len() {
        if let [Event::Start(Tag::HtmlBlock), Event::Html(html), Event::End(TagEnd::HtmlBlock)] =
            &events[i..events.len().min(i + 3)]
        {
            if html.trim() == FRAGMENT_MARKER {
                out.push(Event::Html(CowStr::Borrowed(FRAGMENT_MARKER)));
                i += 3;
                continue;
            }
        }
        out.push(events[i].clone());
        i += 1;
    }
    out
}

fn is_table_part(tag: &Tag<'_>) -> bool {
    matches!(tag, Tag::TableHead | Tag::TableRow | Tag::TableCell)
}

fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            out.push(c);
        } else if (c.is_whitespace() || c == '-' || c == '_') && !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches('-');
    if out.is_empty() {
        "section".to_string()
    } else {
        out.to_string()
    }
}

fn heading_text(events: &[Event<'_>]) -> String {
    let mut text = String::new();
    for event in events {
        match event {
            Event::End(TagEnd::Heading(_)) => break,
            Event::Text(t) | Event::Code(t) => text.push_str(t),
            _ => {}
        }
    }
    text.trim().to_string()
}

/// Gives every heading a unique id and the `docanchor` class, and lists
/// them after the `ROOT` entry.
pub fn anchor_headings(mut events: Vec<Event<'_>>) -> (Vec<Event<'_>>, Vec<ContentAnchor>) {
    let mut anchors = vec![ContentAnchor::root()];
    let mut used = BTreeSet::new();
    for i in 0..events.len() {
        let Event::Start(Tag::Heading { level, .. }) = &events[i] else {
            continue;
        };
        let level = *level as u8;
        let text = heading_text(&events[i + 1..]);
        let base = slug(&text);
        let mut id = base.clone();
        let mut n = 0;
        while !used.insert(id.clone()) {
            n += 1;
            id = format!("{base}-{n}");
        }
        if let Event::Start(Tag::Heading { id: slot, classes, .. }) = &mut events[i] {
            *slot = Some(CowStr::from(id.clone()));
            classes.insert(0, CowStr::Borrowed("docanchor"));
        }
        anchors.push(ContentAnchor { id, text, level });
    }
    (events, anchors)
}
