//! Raw-text passes that run before markdown parsing.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::index::IndexSnapshot;
use crate::permission::PermissionSpec;

pub const CALLOUT_START: &str = "<calloutstart/>";
pub const CALLOUT_END: &str = "<calloutend/>";
pub const FRAGMENT_MARKER: &str = "<!-- __fragment-marker__ -->";

const SIDE_BY_SIDE_START: &str = "##side-by-side-start";
const SIDE_BY_SIDE_END: &str = "##side-by-side-end";
const SIDE_BY_SIDE_SEPARATOR: &str = "##separator";

static RESTRICTED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*@@@([^\n]*)\n((?s:.*?))@@@").expect("restricted block regex is valid")
});
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*```([^\n]*)\n").expect("code fence regex is valid"));
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{E000}code(\\d+)\u{E001}").expect("placeholder regex is valid"));
static WIKI_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]\n]+)\]\]").expect("wiki link regex is valid"));
static CALLOUT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*>[ \t]*\[!").expect("callout header regex is valid"));
static FRAGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"##fragment(\s|$)").expect("fragment regex is valid"));
static SIDE_BY_SIDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "(?s){}.*?{}",
        regex::escape(SIDE_BY_SIDE_START),
        regex::escape(SIDE_BY_SIDE_END)
    ))
    .expect("side-by-side regex is valid")
});

/// Text with opaque blocks cut out and replaced by placeholder tokens.
#[derive(Debug, Default)]
pub struct ProtectedText {
    pub text: String,
    blocks: Vec<String>,
}

impl ProtectedText {
    pub fn new(text: String) -> Self {
        Self {
            text,
            blocks: Vec::new(),
        }
    }

    /// Stores `block` and returns the token standing in for it.
    pub fn stash(&mut self, block: String) -> String {
        let token = format!("\u{E000}code{}\u{E001}", self.blocks.len());
        self.blocks.push(block);
        token
    }

    /// Cuts out every fenced code block, normalizing the language tag to
    /// lowercase and dropping indentation before the opening fence. An
    /// unclosed fence is left as text.
    pub fn protect_code(&mut self) {
        let text = std::mem::take(&mut self.text);
        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        while let Some(caps) = CODE_FENCE.captures_at(&text, pos) {
            let (Some(open), Some(lang)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let Some(close) = text[open.end()..].find("```").map(|i| open.end() + i) else {
                break;
            };
            let block = format!(
                "```{}\n{}```",
                lang.as_str().to_lowercase(),
                &text[open.end()..close]
            );
            out.push_str(&text[pos..open.start()]);
            out.push_str(&self.stash(block));
            pos = close + 3;
        }
        out.push_str(&text[pos..]);
        self.text = out;
    }

    pub fn map(&mut self, pass: impl FnOnce(&str) -> String) {
        self.text = pass(&self.text);
    }

    /// Puts every stashed block back in place of its token.
    pub fn restore(self) -> String {
        let blocks = self.blocks;
        PLACEHOLDER
            .replace_all(&self.text, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| blocks.get(i))
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

/// An `@@@roles` ... `@@@` region of the body. The opening marker must
/// start a line; the region closes at the next `@@@` anywhere, even
/// mid-line, so regions never nest.
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictedBlock {
    pub start: usize,
    pub end: usize,
    pub spec: PermissionSpec,
    pub content: String,
}

pub fn restricted_blocks(text: &str) -> Vec<RestrictedBlock> {
    RESTRICTED_BLOCK
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(RestrictedBlock {
                start: whole.start(),
                end: whole.end(),
                spec: PermissionSpec::from_tokens(caps[1].split(',')),
                content: caps[2].to_string(),
            })
        })
        .collect()
}

/// Replaces each block by its content when allowed, by nothing otherwise.
pub fn apply_restrictions(text: &str, blocks: &[RestrictedBlock], allowed: &[bool]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for (block, &allow) in blocks.iter().zip(allowed) {
        out.push_str(&text[pos..block.start]);
        if allow {
            out.push_str(&block.content);
        }
        pos = block.end;
    }
    out.push_str(&text[pos..]);
    out
}

/// Rewrites `[[target]]` and `[[target|label]]` into markdown links when the
/// target names exactly one document. Embeds (`![[...]]`) are left alone.
pub fn resolve_wiki_links(text: &str, index: &IndexSnapshot, base_url: &str) -> String {
    WIKI_LINK
        .replace_all(text, |caps: &Captures| {
            let whole = &caps[0];
            let preceded_by_bang = caps
                .get(0)
                .is_some_and(|m| text[..m.start()].ends_with('!'));
            if preceded_by_bang {
                return whole.to_string();
            }
            let inner = &caps[1];
            let (mut target, label) = match inner.split_once('|') {
                Some((target, rest)) => {
                    let target = target.trim();
                    let target = target.strip_suffix('\\').unwrap_or(target);
                    let label = rest.split('|').next().unwrap_or_default().trim();
                    (target, (!label.is_empty()).then_some(label))
                }
                None => (inner, None),
            };
            target = target.strip_prefix("/md/").unwrap_or(target);
            target = target.strip_prefix("md/").unwrap_or(target);

            let base = target.rsplit('/').next().unwrap_or(target);
            let path = match index.documents_named(base) {
                [] => return whole.to_string(),
                [only] => only,
                many => match many.iter().find(|p| **p == format!("{target}.md")) {
                    Some(exact) => exact,
                    None => return whole.to_string(),
                },
            };
            format!(
                "[{}](<{}/{}{}>)",
                label.unwrap_or(target),
                base_url.trim_end_matches('/'),
                index.prefix,
                path
            )
        })
        .into_owned()
}

/// Turns `> [!type] caption` blockquotes into marker-delimited sections.
/// Nested callouts are marked recursively.
pub fn mark_callouts(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if !CALLOUT_HEADER.is_match(line) {
            out.push_str(line);
            if i + 1 < lines.len() {
                out.push('\n');
            }
            i += 1;
            continue;
        }
        let header = line.trim().strip_prefix('>').unwrap_or(line).trim();
        i += 1;
        let mut body = Vec::new();
        while i < lines.len() && lines[i].trim_start().starts_with('>') {
            if let Some((_, rest)) = lines[i].split_once('>') {
                body.push(rest);
            }
            i += 1;
        }
        let inner = mark_callouts(&body.join("\n"));
        out.push_str(&format!("\n{CALLOUT_START}\n\n{header}\n{inner}\n\n{CALLOUT_END}\n\n"));
    }
    out
}

pub fn mark_fragments(text: &str) -> String {
    FRAGMENT
        .replace_all(text, |caps: &Captures| format!("{FRAGMENT_MARKER}{}", &caps[1]))
        .into_owned()
}

pub fn side_by_side(text: &str) -> String {
    SIDE_BY_SIDE
        .replace_all(text, |caps: &Captures| {
            let inner = caps[0]
                .trim_start_matches(SIDE_BY_SIDE_START)
                .trim_end_matches(SIDE_BY_SIDE_END)
                .trim();
            let columns: Vec<String> = inner
                .split(SIDE_BY_SIDE_SEPARATOR)
                .map(|col| format!("<div class=\"side-by-side-col\">\n\n{}\n\n</div>", col.trim()))
                .collect();
            format!("<div class=\"side-by-side\">\n{}\n</div>\n\n", columns.join("\n"))
        })
        .into_owned()
}
