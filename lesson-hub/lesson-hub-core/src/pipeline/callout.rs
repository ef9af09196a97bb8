//! Callout types and the tree pass that turns marked sections into styled
//! containers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use pulldown_cmark::{CowStr, Event, Tag, TagEnd};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::text::{CALLOUT_END, CALLOUT_START};
use crate::error::CalloutTableError;

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\[!([^\]]*)\](.*)$").expect("callout header regex is valid"));

/// Obsidian's built-in callouts: type, lucide icon, color.
const OBSIDIAN_STYLES: &[(&str, &str, &str)] = &[
    ("note", "pencil", "#086ddd"),
    ("abstract", "clipboard-list", "#00bfbc"),
    ("info", "info", "#086ddd"),
    ("todo", "check-circle-2", "#086ddd"),
    ("tip", "flame", "#00bfbc"),
    ("success", "check", "#08b94e"),
    ("question", "help-circle", "#ec7500"),
    ("warning", "alert-triangle", "#ec7500"),
    ("failure", "x", "#e93147"),
    ("danger", "zap", "#e93147"),
    ("bug", "bug", "#e93147"),
    ("example", "list", "#7852ee"),
    ("quote", "quote", "#9e9e9e"),
];

const OBSIDIAN_ALIASES: &[(&str, &str)] = &[
    ("summary", "abstract"),
    ("tldr", "abstract"),
    ("hint", "tip"),
    ("important", "tip"),
    ("done", "success"),
    ("check", "success"),
    ("help", "question"),
    ("faq", "question"),
    ("caution", "warning"),
    ("attention", "warning"),
    ("fail", "failure"),
    ("missing", "failure"),
    ("error", "danger"),
    ("cite", "quote"),
];

/// One entry of a callout table file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CalloutDef {
    Style { icon: String, color: String },
    Alias { link: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalloutStyle {
    pub icon: String,
    pub color: String,
}

/// Callout types with every alias already resolved to its styled type.
#[derive(Clone, Debug, Default)]
pub struct CalloutTable {
    resolved: BTreeMap<String, (String, CalloutStyle)>,
}

fn obsidian_entries() -> BTreeMap<String, CalloutDef> {
    let styles = OBSIDIAN_STYLES.iter().map(|(name, icon, color)| {
        (
            name.to_string(),
            CalloutDef::Style {
                icon: icon.to_string(),
                color: color.to_string(),
            },
        )
    });
    let aliases = OBSIDIAN_ALIASES
        .iter()
        .map(|(name, link)| (name.to_string(), CalloutDef::Alias { link: link.to_string() }));
    styles.chain(aliases).collect()
}

fn resolve_entry(
    name: &str,
    defs: &BTreeMap<String, CalloutDef>,
) -> Result<(String, CalloutStyle), CalloutTableError> {
    let mut seen = BTreeSet::new();
    let mut current = name.to_string();
    loop {
        if !seen.insert(current.clone()) {
            return Err(CalloutTableError::Cycle(name.to_string()));
        }
        match defs.get(&current) {
            Some(CalloutDef::Style { icon, color }) => {
                let style = CalloutStyle {
                    icon: icon.clone(),
                    color: color.clone(),
                };
                return Ok((current, style));
            }
            Some(CalloutDef::Alias { link }) => current = link.trim().to_lowercase(),
            None => {
                return Err(CalloutTableError::Dangling {
                    name: name.to_string(),
                    target: current,
                })
            }
        }
    }
}

fn normalize<I>(entries: I) -> BTreeMap<String, CalloutDef>
where
    I: IntoIterator<Item = (String, CalloutDef)>,
{
    entries
        .into_iter()
        .map(|(name, def)| (name.trim().to_lowercase(), def))
        .collect()
}

impl CalloutTable {
    /// Fails on the first alias chain that loops or leads nowhere.
    pub fn from_entries<I>(entries: I) -> Result<Self, CalloutTableError>
    where
        I: IntoIterator<Item = (String, CalloutDef)>,
    {
        let defs = normalize(entries);
        let mut resolved = BTreeMap::new();
        for name in defs.keys() {
            resolved.insert(name.clone(), resolve_entry(name, &defs)?);
        }
        Ok(Self { resolved })
    }

    /// Drops entries whose alias chain does not resolve; callouts of those
    /// types render as if the type were unknown.
    pub fn lenient<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, CalloutDef)>,
    {
        let defs = normalize(entries);
        let mut resolved = BTreeMap::new();
        for name in defs.keys() {
            match resolve_entry(name, &defs) {
                Ok(entry) => {
                    resolved.insert(name.clone(), entry);
                }
                Err(e) => warn!(error = %e, "dropping callout type"),
            }
        }
        Self { resolved }
    }

    pub fn obsidian() -> Self {
        Self::lenient(obsidian_entries())
    }

    /// The built-in table extended (or overridden) by `extra`.
    pub fn obsidian_with<I>(extra: I) -> Result<Self, CalloutTableError>
    where
        I: IntoIterator<Item = (String, CalloutDef)>,
    {
        let mut defs = obsidian_entries();
        defs.extend(normalize(extra));
        Self::from_entries(defs)
    }

    /// Canonical type name and style for `kind`, case-insensitively.
    pub fn resolve(&self, kind: &str) -> Option<(&str, &CalloutStyle)> {
        self.resolved
            .get(&kind.trim().to_lowercase())
            .map(|(canonical, style)| (canonical.as_str(), style))
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Marker {
    Start,
    End,
}

/// A marker is an HTML block holding nothing but the marker tag.
fn marker_at(events: &[Event<'_>], i: usize) -> Option<Marker> {
    match events.get(i..i + 3)? {
        [Event::Start(Tag::HtmlBlock), Event::Html(html), Event::End(TagEnd::HtmlBlock)] => {
            match html.trim() {
                CALLOUT_START => Some(Marker::Start),
                CALLOUT_END => Some(Marker::End),
                _ => None,
            }
        }
        _ => None,
    }
}

fn matching_end(events: &[Event<'_>], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i < events.len() {
        match marker_at(events, i) {
            Some(Marker::Start) => {
                depth += 1;
                i += 3;
            }
            Some(Marker::End) => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                i += 3;
            }
            None => i += 1,
        }
    }
    None
}

/// Replaces every marker-delimited section with a styled container.
/// Sections of unknown type keep their markers and content as they are.
pub fn expand_callouts<'a>(events: Vec<Event<'a>>, table: &CalloutTable) -> Vec<Event<'a>> {
    let mut out = Vec::with_capacity(events.len());
    let mut i = 0;
    while i < events.len() {
        if marker_at(&events, i) == Some(Marker::Start) {
            if let Some(end) = matching_end(&events, i) {
                let inner = expand_callouts(events[i + 3..end].to_vec(), table);
                match render(inner, table) {
                    Ok(rendered) => out.extend(rendered),
                    Err(inner) => {
                        out.extend_from_slice(&events[i..i + 3]);
                        out.extend(inner);
                        out.extend_from_slice(&events[end..end + 3]);
                    }
                }
                i = end + 3;
                continue;
            }
        }
        out.push(events[i].clone());
        i += 1;
    }
    out
}

fn has_content(events: &[Event<'_>]) -> bool {
    events.iter().any(|e| match e {
        Event::Start(Tag::Paragraph) | Event::End(TagEnd::Paragraph) => false,
        Event::HardBreak | Event::SoftBreak => false,
        Event::Text(t) => !t.trim().is_empty(),
        _ => true,
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Builds the container for one section, or hands the section back when
/// it does not start with a known `[!type]` header.
fn render<'a>(inner: Vec<Event<'a>>, table: &CalloutTable) -> Result<Vec<Event<'a>>, Vec<Event<'a>>> {
    let header = match (inner.first(), inner.get(1)) {
        (Some(Event::Start(Tag::Paragraph)), Some(Event::Text(first))) => HEADER
            .captures(first)
            .map(|caps| (caps[1].to_string(), caps[2].to_string())),
        _ => None,
    };
    let Some((kind, caption_head)) = header else {
        return Err(inner);
    };
    let Some((canonical, style)) = table.resolve(&kind) else {
        return Err(inner);
    };
    let Some(para_end) = inner.iter().position(|e| matches!(e, Event::End(TagEnd::Paragraph))) else {
        return Err(inner);
    };
    let line_break = inner[2..para_end]
        .iter()
        .position(|e| matches!(e, Event::HardBreak | Event::SoftBreak))
        .map(|p| p + 2);

    // Only a dash right after the bracket folds the callout; its title is
    // whatever follows, possibly nothing.
    let collapsible = caption_head.starts_with('-');
    let caption_head = if collapsible {
        caption_head[1..].trim_start()
    } else {
        caption_head.trim_start()
    };
    let mut title: Vec<Event<'a>> = Vec::new();
    if !caption_head.is_empty() {
        title.push(Event::Text(CowStr::from(caption_head.to_string())));
    }
    title.extend_from_slice(&inner[2..line_break.unwrap_or(para_end)]);
    if !collapsible && !has_content(&title) {
        let default = if canonical == kind.to_lowercase() { kind.as_str() } else { canonical };
        title = vec![Event::Text(CowStr::from(capitalize(default)))];
    }

    let mut body: Vec<Event<'a>> = Vec::new();
    if let Some(brk) = line_break {
        body.push(Event::Start(Tag::Paragraph));
        body.extend_from_slice(&inner[brk + 1..=para_end]);
    }
    body.extend_from_slice(&inner[para_end + 1..]);
    let filled = has_content(&body);

    let color = &style.color;
    let mut out = Vec::with_capacity(body.len() + title.len() + 3);
    out.push(Event::Html(CowStr::from(format!(
        "<div class=\"obsidian-callout{}\" style=\"background-color: {color}1a;\">\
         <div class=\"row obsidian-collapsable-trigger\" style=\"cursor: {};\">\
         <div class=\"col obsidian-callout-icon\"><i data-lucide=\"{}\" style=\"color: {color};\"></i></div>\
         <div class=\"col obsidian-callout-title\" style=\"color: {color};\">",
        if collapsible { " obsidian-collapsable" } else { "" },
        if collapsible { "pointer" } else { "default" },
        style.icon,
    ))));
    out.extend(title);
    let chevron = if collapsible {
        format!(
            "<div class=\"col obsidian-callout-chevron\" style=\"color: {color};\">\
             <i data-lucide=\"chevron-right\" style=\"color: {color};\"></i></div>"
        )
    } else {
        String::new()
    };
    out.push(Event::Html(CowStr::from(format!(
        "</div>{chevron}</div><div class=\"{}obsidian-callout-content\" style=\"{}\">",
        if collapsible { "collapsable " } else { "" },
        if filled { "" } else { "display: none; overflow: hidden;" },
    ))));
    if filled {
        out.extend(body);
    }
    out.push(Event::Html(CowStr::from("</div></div>\n")));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulldown_cmark::{html, Parser};

    fn def_alias(name: &str, link: &str) -> (String, CalloutDef) {
        (name.to_string(), CalloutDef::Alias { link: link.to_string() })
    }

    fn def_style(name: &str) -> (String, CalloutDef) {
        (
            name.to_string(),
            CalloutDef::Style {
                icon: "star".into(),
                color: "#123456".into(),
            },
        )
    }

    fn render_marked(md: &str) -> String {
        let events: Vec<Event> = Parser::new(md)
            .map(|e| if e == Event::SoftBreak { Event::HardBreak } else { e })
            .collect();
        let events = pulldown_cmark::TextMergeStream::new(events.into_iter()).collect();
        let mut out = String::new();
        html::push_html(&mut out, expand_callouts(events, &CalloutTable::obsidian()).into_iter());
        out
    }

    #[test]
    fn default_table_resolves_aliases() {
        let table = CalloutTable::obsidian();
        assert_eq!(table.len(), OBSIDIAN_STYLES.len() + OBSIDIAN_ALIASES.len());
        let (canonical, style) = table.resolve("TLDR").unwrap();
        assert_eq!(canonical, "abstract");
        assert_eq!(style.icon, "clipboard-list");
        assert!(table.resolve("nope").is_none());
    }

    #[test]
    fn strict_table_rejects_cycles_and_dangling_links() {
        let cyclic = CalloutTable::from_entries(vec![def_alias("a", "b"), def_alias("b", "a")]);
        assert_eq!(cyclic.unwrap_err(), CalloutTableError::Cycle("a".into()));

        let selfish = CalloutTable::from_entries(vec![def_alias("me", "me")]);
        assert_eq!(selfish.unwrap_err(), CalloutTableError::Cycle("me".into()));

        let dangling = CalloutTable::from_entries(vec![def_alias("x", "ghost")]);
        assert_eq!(
            dangling.unwrap_err(),
            CalloutTableError::Dangling {
                name: "x".into(),
                target: "ghost".into()
            }
        );
    }

    #[test]
    fn lenient_table_drops_only_broken_entries() {
        let table = CalloutTable::lenient(vec![
            def_style("star"),
            def_alias("shiny", "star"),
            def_alias("loop", "loop"),
        ]);
        assert_eq!(table.len(), 2);
        assert!(table.resolve("loop").is_none());
        assert_eq!(table.resolve("shiny").map(|(c, _)| c), Some("star"));
    }

    #[test]
    fn extensions_override_defaults() {
        let table = CalloutTable::obsidian_with(vec![def_style("note"), def_alias("memo", "note")]).unwrap();
        assert_eq!(table.resolve("memo").unwrap().1.color, "#123456");
        assert!(CalloutTable::obsidian_with(vec![def_alias("memo", "nothing")]).is_err());
    }

    #[test]
    fn parses_callout_definitions_from_json() {
        let defs: BTreeMap<String, CalloutDef> =
            serde_json::from_str(r##"{"star":{"icon":"star","color":"#fff"},"shiny":{"link":"star"}}"##).unwrap();
        assert_eq!(defs["shiny"], CalloutDef::Alias { link: "star".into() });
    }

    #[test]
    fn expands_known_callout() {
        let html = render_marked("<calloutstart/>\n\n[!tldr] Short *story*\nbody text\n\n<calloutend/>\n");
        assert!(html.contains("obsidian-callout\""));
        assert!(html.contains("data-lucide=\"clipboard-list\""));
        assert!(html.contains("color: #00bfbc;\">Short <em>story</em></div>"));
        assert!(html.contains("<p>body text</p>"));
        assert!(!html.contains("calloutstart"));
    }

    #[test]
    fn default_title_and_collapsible() {
        let html = render_marked("<calloutstart/>\n\n[!faq]\n\n<calloutend/>\n");
        assert!(html.contains(">Question</div>"));
        assert!(!html.contains("obsidian-collapsable"));

        let html = render_marked("<calloutstart/>\n\n[!faq]- \n\n<calloutend/>\n");
        assert!(html.contains("obsidian-callout obsidian-collapsable"));
        assert!(html.contains("obsidian-callout-title\" style=\"color: #ec7500;\"></div>"));
        assert!(!html.contains("Question"));
        assert!(html.contains("display: none; overflow: hidden;"));
        assert!(html.contains("chevron-right"));
    }

    #[test]
    fn dash_must_follow_the_bracket_to_collapse() {
        let html = render_marked("<calloutstart/>\n\n[!tip]- Hidden\nbody\n\n<calloutend/>\n");
        assert!(html.contains("obsidian-collapsable"));
        assert!(html.contains(">Hidden</div>"));

        let html = render_marked("<calloutstart/>\n\n[!tip] -spaced\nbody\n\n<calloutend/>\n");
        assert!(!html.contains("obsidian-collapsable"));
        assert!(html.contains(">-spaced</div>"));
    }

    #[test]
    fn nested_callouts_expand_inside_out() {
        let html = render_marked(
            "<calloutstart/>\n\n[!note] Outer\n\n<calloutstart/>\n\n[!tip] Inner\n\n<calloutend/>\n\n<calloutend/>\n",
        );
        assert_eq!(html.matches("class=\"obsidian-callout\"").count(), 2);
        assert!(html.find(">Outer</div>").unwrap() < html.find(">Inner</div>").unwrap());
    }

    #[test]
    fn unknown_type_is_left_alone() {
        let html = render_marked("<calloutstart/>\n\n[!mystery] Who\n\n<calloutend/>\n");
        assert!(html.contains("<calloutstart/>"));
        assert!(html.contains("[!mystery] Who"));
        assert!(!html.contains("obsidian-callout"));
    }
}
