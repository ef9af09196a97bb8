use ammonia::Builder;

/// Final pass over rendered HTML.
pub trait HtmlSanitizer: Send + Sync {
    fn sanitize(&self, html: &str) -> String;
}

/// Keeps the markup the pipeline produces and drops scripts, event
/// handlers and comments.
pub struct AmmoniaSanitizer {
    builder: Builder<'static>,
}

impl AmmoniaSanitizer {
    pub fn new() -> Self {
        let mut builder = Builder::default();
        builder
            .add_tags(["video", "audio", "source", "section", "input"])
            .add_generic_attributes(["class", "style", "id"])
            .add_generic_attribute_prefixes(["data-"])
            .add_tag_attributes("source", ["src", "type"])
            .add_tag_attributes("video", ["controls"])
            .add_tag_attributes("audio", ["controls"])
            .add_tag_attributes("input", ["type", "checked", "disabled"]);
        Self { builder }
    }
}

impl Default for AmmoniaSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlSanitizer for AmmoniaSanitizer {
    fn sanitize(&self, html: &str) -> String {
        self.builder.clean(html).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_pipeline_markup() {
        let html = r#"<div class="obsidian-callout" style="color: red;"><i data-lucide="info"></i></div><video controls=""><source src="a.mp4" type="video/mp4"></video><h1 id="x" class="docanchor">X</h1>"#;
        let clean = AmmoniaSanitizer::new().sanitize(html);
        assert!(clean.contains(r#"data-lucide="info""#));
        assert!(clean.contains(r#"style="color: red;""#));
        assert!(clean.contains(r#"<source src="a.mp4" type="video/mp4">"#));
        assert!(clean.contains(r#"<h1 id="x" class="docanchor">"#));
    }

    #[test]
    fn strips_scripts_and_handlers() {
        let clean = AmmoniaSanitizer::new().sanitize(r#"<p onclick="x()">hi<script>alert(1)</script></p><!-- note -->"#);
        assert_eq!(clean, "<p>hi</p>");
    }
}
