//! Diagram fences: PlantUML becomes an image served by a rendering server,
//! Mermaid becomes a `<pre class="mermaid">` block for the client renderer.

use std::io::Write;
use std::sync::LazyLock;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use regex::Regex;

use super::html::escape_html;
use super::text::ProtectedText;
use crate::error::PipelineError;

const ALPHABET: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

// Opening fences may end in CRLF.
static PLANTUML_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^[ \t]*```+[ \t]*plantuml[ \t]*\r?$").expect("plantuml regex is valid"));
static MERMAID_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^[ \t]*```+[ \t]*mermaid[ \t]*\r?$").expect("mermaid regex is valid"));

/// Packs bytes MSB-first into 6-bit symbols; a trailing partial group is
/// shifted left and zero padded.
pub fn pack(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 / 3 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &byte in bytes {
        acc = ((acc << 8) | u32::from(byte)) & 0xffff;
        bits += 8;
        while bits >= 6 {
            bits -= 6;
            out.push(char::from(ALPHABET[((acc >> bits) & 0x3f) as usize]));
        }
    }
    if bits > 0 {
        out.push(char::from(ALPHABET[((acc << (6 - bits)) & 0x3f) as usize]));
    }
    out
}

/// zlib-deflates the diagram source at level 6 and packs the result.
pub fn encode_plantuml(source: &str) -> Result<String, PipelineError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(source.as_bytes())?;
    Ok(pack(&encoder.finish()?))
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

/// Runs `replace` on each fence found by `fence`, with the fence body
/// running up to the next triple backtick.
fn replace_fences<F>(text: &str, fence: &Regex, kind: &'static str, mut replace: F) -> Result<String, PipelineError>
where
    F: FnMut(&str) -> Result<String, PipelineError>,
{
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(open) = fence.find_at(text, pos) {
        let Some(close) = text[open.end()..].find("```").map(|i| open.end() + i) else {
            return Err(PipelineError::UnterminatedFence {
                kind,
                line: line_of(text, open.start()),
            });
        };
        out.push_str(&text[pos..open.start()]);
        out.push_str(&replace(&text[open.end()..close])?);
        pos = close + 3;
    }
    out.push_str(&text[pos..]);
    Ok(out)
}

pub fn replace_plantuml(text: &str, server_url: &str) -> Result<String, PipelineError> {
    let server_url = server_url.trim_end_matches('/');
    replace_fences(text, &PLANTUML_FENCE, "plantuml", |body| {
        Ok(format!("![PlantUML]({server_url}/svg/{})", encode_plantuml(body)?))
    })
}

/// Mermaid output is stashed like a code block so later text passes leave
/// the diagram source alone.
pub fn mark_mermaid(protected: &mut ProtectedText) -> Result<(), PipelineError> {
    let text = std::mem::take(&mut protected.text);
    let replaced = replace_fences(&text, &MERMAID_FENCE, "mermaid", |body| {
        Ok(protected.stash(format!("<pre class=\"mermaid\">{}</pre>", escape_html(body))))
    });
    match replaced {
        Ok(replaced) => {
            protected.text = replaced;
            Ok(())
        }
        Err(e) => {
            protected.text = text;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_six_bits_per_symbol() {
        assert_eq!(pack(&[]), "");
        assert_eq!(pack(&[0, 1, 2]), "0042");
        assert_eq!(pack(&[0x78, 0x9c]), "U9m");
        assert_eq!(pack(&[0xff, 0xff, 0xff]), "____");
    }

    #[test]
    fn encodes_empty_source() {
        // zlib stream for "": 78 9c 03 00 00 00 00 01
        assert_eq!(encode_plantuml("").unwrap(), "U9m30000004");
    }

    #[test]
    fn replaces_plantuml_fences_with_images() {
        let md = "before\n```plantuml\nA -> B\n```\nafter";
        let out = replace_plantuml(md, "https://uml.example/plantuml/").unwrap();
        let encoded = encode_plantuml("\nA -> B\n").unwrap();
        assert_eq!(
            out,
            format!("before\n![PlantUML](https://uml.example/plantuml/svg/{encoded})\nafter")
        );
    }

    #[test]
    fn crlf_fences_are_recognized() {
        let md = "before\r\n```plantuml\r\nA -> B\r\n```\r\nafter";
        let out = replace_plantuml(md, "http://u").unwrap();
        let encoded = encode_plantuml("\nA -> B\r\n").unwrap();
        assert_eq!(out, format!("before\r\n![PlantUML](http://u/svg/{encoded})\r\nafter"));

        let mut protected = ProtectedText::new("```mermaid\r\ngraph TD\r\n```\r\n".to_string());
        mark_mermaid(&mut protected).unwrap();
        assert_eq!(protected.restore(), "<pre class=\"mermaid\">\ngraph TD\r\n</pre>\r\n");
    }

    #[test]
    fn unterminated_fence_is_an_error() {
        let err = replace_plantuml("x\n\n```plantuml\nA -> B\n", "http://u").unwrap_err();
        assert!(matches!(err, PipelineError::UnterminatedFence { kind: "plantuml", line: 3 }));
    }

    #[test]
    fn mermaid_is_escaped_and_stashed() {
        let mut protected = ProtectedText::new("```mermaid\ngraph TD; A[[x]]-->B<C\n```\n".to_string());
        mark_mermaid(&mut protected).unwrap();
        assert!(!protected.text.contains("mermaid"));
        let restored = protected.restore();
        assert_eq!(
            restored,
            "<pre class=\"mermaid\">\ngraph TD; A[[x]]--&gt;B&lt;C\n</pre>\n"
        );
    }
}
