//! Readable-text extraction from fetched pages.
//!
//! The ingestion coordinator depends only on the [`ContentExtractor`] trait;
//! [`HtmlExtractor`] is the default implementation. It is deliberately
//! heuristic: drop non-content elements, prefer `<article>` or `<main>` when
//! they carry enough text, strip the remaining tags, decode entities and
//! normalize whitespace while keeping paragraph breaks.
//!
//! Also hosts the content checksum and the pre-enrichment cleanup pass.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};

/// `(raw content) -> plain text | failure`. Failure is treated as an item-fetch failure.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, raw: &str) -> PipelineResult<String>;
}

/// Default extractor for HTML pages.
#[derive(Debug, Clone)]
pub struct HtmlExtractor {
    /// Extracted text shorter than this is reported as a failure.
    pub min_chars: usize,
}

impl Default for HtmlExtractor {
    fn default() -> Self {
        Self { min_chars: 100 }
    }
}

static RE_DROP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|nav|footer|header|aside|iframe|noscript|form|svg)\b[^>]*>.*?</\s*(script|style|nav|footer|header|aside|iframe|noscript|form|svg)\s*>")
        .expect("static regex")
});
static RE_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static RE_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<article\b[^>]*>(.*?)</article\s*>").expect("static regex"));
static RE_MAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<main\b[^>]*>(.*?)</main\s*>").expect("static regex"));
static RE_BLOCK_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</(p|div|h[1-6]|li|blockquote|pre|section|tr)\s*>|<br\s*/?>")
        .expect("static regex")
});
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"));
static RE_INLINE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\f\v]+").expect("static regex"));
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").expect("static regex"));
static RE_MD_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("static regex"));
static RE_HTML_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("static regex"));
static RE_MD_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("static regex"));
static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("static regex"));

impl ContentExtractor for HtmlExtractor {
    fn extract(&self, raw: &str) -> PipelineResult<String> {
        let text = html_to_text(raw);
        let len = text.chars().count();
        if len < self.min_chars {
            return Err(PipelineError::Extraction(format!(
                "only {} characters of readable text (minimum {})",
                len, self.min_chars
            )));
        }
        Ok(text)
    }
}

/// Convert an HTML document or fragment into normalized plain text.
pub fn html_to_text(html: &str) -> String {
    let cleaned = RE_COMMENT.replace_all(html, "");
    let cleaned = RE_DROP.replace_all(&cleaned, "");

    // Prefer the main content container when it holds most of the text.
    let region = [&*RE_ARTICLE, &*RE_MAIN]
        .iter()
        .find_map(|re| {
            re.captures(&cleaned)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .filter(|inner| strip_tags(inner).trim().chars().count() >= 200)
        })
        .unwrap_or_else(|| cleaned.to_string());

    strip_tags(&region)
}

fn strip_tags(html: &str) -> String {
    let text = RE_BLOCK_END.replace_all(html, "\n\n");
    let text = RE_TAGS.replace_all(&text, " ");
    let text = html_escape::decode_html_entities(&text);
    normalize_whitespace(&text)
}

/// Collapse runs of spaces and keep at most one blank line between paragraphs.
pub fn normalize_whitespace(text: &str) -> String {
    let text = RE_INLINE_WS.replace_all(text, " ");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    RE_BLANK_LINES.replace_all(&joined, "\n\n").trim().to_string()
}

/// Clean text before it is sent for enrichment: images, link targets, bare
/// URLs and leftover tags carry no signal and waste the content budget.
pub fn prepare_for_enrichment(text: &str) -> String {
    let text = RE_MD_IMAGE.replace_all(text, "");
    let text = RE_HTML_IMAGE.replace_all(&text, "");
    let text = RE_MD_LINK.replace_all(&text, "$1");
    let text = RE_URL.replace_all(&text, "");
    let text = RE_TAGS.replace_all(&text, " ");
    normalize_whitespace(&text)
}

/// SHA-256 hex digest of stored item content.
pub fn checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>T</title><style>body { color: red }</style></head>
<body>
<nav><a href="/">Home</a> | <a href="/about">About</a></nav>
<header>Site banner</header>
<article>
<h1>Ownership &amp; borrowing</h1>
<p>Rust's ownership model guarantees memory safety without a garbage collector.
It does so by tracking which binding owns each value.</p>
<p>Borrowing lets code refer to a value without taking ownership, and the borrow
checker enforces that references never outlive the data they point to.</p>
<script>trackVisitor();</script>
</article>
<footer>Copyright</footer>
</body></html>"#;

    #[test]
    fn extracts_article_text() {
        let text = HtmlExtractor::default().extract(PAGE).unwrap();
        assert!(text.starts_with("Ownership & borrowing"));
        assert!(text.contains("borrow\nchecker") || text.contains("borrow checker"));
        assert!(text.contains("\n\n"));
        assert!(!text.contains("trackVisitor"));
        assert!(!text.contains("Home"));
        assert!(!text.contains("Copyright"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn short_pages_fail() {
        let err = HtmlExtractor::default()
            .extract("<html><body><p>Too short.</p></body></html>")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[test]
    fn enrichment_cleanup_removes_links_and_images() {
        let input = "See ![diagram](https://x.test/d.png) and [the docs](https://x.test/docs).\n\n\n\
                     Raw link https://x.test/raw <b>bold</b>   text";
        let out = prepare_for_enrichment(input);
        assert_eq!(out, "See and the docs.\n\nRaw link bold text");
    }

    #[test]
    fn checksum_is_stable_sha256() {
        assert_eq!(
            checksum("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
