//! Source fetcher contract and shared parsing helpers.
//!
//! Each source family implements [`SourceFetcher`]: enumerate the units a
//! pipeline run walks (CFR parts, statute codes, TAC titles, counties,
//! cities), then produce parsed [`Section`]s plus the raw documents to
//! persist for one unit at a time. Units are the restart grain — the
//! orchestrator checkpoints after each — and memory is bounded by one
//! unit's sections.
//!
//! HTML parsing helpers here implement the ranked-selector strategy the
//! state and county fetchers share: try selectors in order, first match
//! wins, and always hand back owned strings (the parsed DOM never crosses
//! an await point).

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::models::{Checkpoint, RawDocument, Section, SourceType, Subsection};

/// Everything produced by fetching one unit.
#[derive(Debug, Default)]
pub struct FetchedUnit {
    pub sections: Vec<Section>,
    pub raw_docs: Vec<RawDocument>,
    /// Sections skipped on upstream 404.
    pub skipped_not_found: usize,
    /// Per-section failures that did not abort the unit.
    pub section_errors: Vec<String>,
    /// Parse-quality warnings (missing headings, low pass rates).
    pub warnings: Vec<String>,
}

/// A lazy, resumable producer of parsed sections for one source family.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Object-store key of this pipeline's checkpoint.
    fn checkpoint_key(&self) -> String;

    /// Units in processing order.
    async fn list_units(&self) -> Result<Vec<String>>;

    /// Fetch and parse one unit.
    async fn fetch_unit(&self, unit: &str) -> Result<FetchedUnit>;

    /// Record a completed unit on the checkpoint, in the field this
    /// family's checkpoint schema uses.
    fn record_progress(&self, checkpoint: &mut Checkpoint, unit: &str);
}

// ============ Subsection detection ============

fn subsection_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(?:^|[ \t])(\([a-z0-9]+\)(?:\([a-zA-Z0-9]+\))*)")
            .expect("subsection marker pattern is valid")
    })
}

/// Detect lettered/numbered subsection markers (`(a)`, `(a)(1)`,
/// `(a)(2)(A)`) and split the body at them, attaching each block to the
/// preceding marker. Text before the first marker is folded into the
/// first subsection so nothing is dropped. Fewer than two markers means
/// no subsection structure.
pub fn detect_subsections(text: &str) -> Vec<Subsection> {
    let mut markers: Vec<(usize, String)> = Vec::new();
    for caps in subsection_re().captures_iter(text) {
        if let Some(m) = caps.get(1) {
            markers.push((m.start(), m.as_str().to_string()));
        }
    }
    if markers.len() < 2 {
        return Vec::new();
    }

    let mut subsections = Vec::with_capacity(markers.len());
    for (i, (start, id)) in markers.iter().enumerate() {
        let end = markers.get(i + 1).map(|(s, _)| *s).unwrap_or(text.len());
        // The first block absorbs any lead-in text.
        let block_start = if i == 0 { 0 } else { *start };
        let block = text[block_start..end].trim();
        if block.is_empty() {
            continue;
        }
        subsections.push(Subsection {
            id: id.clone(),
            text: block.to_string(),
        });
    }
    subsections
}

// ============ Ranked-selector HTML parsing ============

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::Validation(format!("bad selector '{css}': {e}")))
}

/// Heading selectors tried in order; first non-empty match wins.
pub const HEADING_SELECTORS: &[&str] = &[
    "h2.section-heading",
    "h2",
    ".statute-heading",
    "h1 + h2",
    "p.heading",
    "b",
];

/// Body container selectors tried in order.
pub const BODY_SELECTORS: &[&str] = &[
    ".section-text",
    ".statute-body",
    "article",
    "main",
    "body",
];

/// Extract a heading via a ranked selector list.
pub fn extract_heading(html: &str, selectors: &[&str]) -> Result<Option<String>> {
    let document = Html::parse_document(html);
    for css in selectors {
        let selector = parse_selector(css)?;
        if let Some(element) = document.select(&selector).next() {
            let text = collapse_inline_whitespace(&element.text().collect::<String>());
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
    }
    Ok(None)
}

/// Extract body text via ranked container selectors, preferring `<p>`
/// children so paragraph breaks survive, stripping boilerplate lines.
pub fn extract_body_text(html: &str, selectors: &[&str]) -> Result<String> {
    let document = Html::parse_document(html);
    let p_selector = parse_selector("p")?;

    for css in selectors {
        let selector = parse_selector(css)?;
        let Some(container) = document.select(&selector).next() else {
            continue;
        };

        let mut paragraphs: Vec<String> = container
            .select(&p_selector)
            .map(|p| collapse_inline_whitespace(&p.text().collect::<String>()))
            .filter(|p| !p.is_empty() && !is_boilerplate(p))
            .collect();

        if paragraphs.is_empty() {
            let flat = collapse_inline_whitespace(&container.text().collect::<String>());
            if !flat.is_empty() && !is_boilerplate(&flat) {
                paragraphs.push(flat);
            }
        }

        let body = paragraphs.join("\n\n");
        if !body.is_empty() {
            return Ok(body);
        }
    }
    Ok(String::new())
}

/// Collect `(anchor text, href)` pairs whose href matches `pattern`.
pub fn extract_links(html: &str, pattern: &Regex) -> Result<Vec<(String, String)>> {
    let document = Html::parse_document(html);
    let a_selector = parse_selector("a")?;
    let mut links = Vec::new();
    for anchor in document.select(&a_selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if pattern.is_match(href) {
            let text = collapse_inline_whitespace(&anchor.text().collect::<String>());
            links.push((text, href.to_string()));
        }
    }
    Ok(links)
}

/// Collapse runs of whitespace within a line while keeping the text flat.
pub fn collapse_inline_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_boilerplate(text: &str) -> bool {
    let lower = text.to_lowercase();
    const MARKERS: &[&str] = &[
        "copyright",
        "all rights reserved",
        "terms of use",
        "privacy policy",
        "skip to main content",
        "return to top",
    ];
    MARKERS.iter().any(|m| lower.contains(m)) && text.len() < 200
}

/// Minimum-field validation applied to every parsed section: non-empty
/// id, body of at least 10 characters. A missing heading is a warning,
/// not a rejection.
pub fn validate_section(section: &Section) -> Result<Vec<String>> {
    if section.section_id.trim().is_empty() {
        return Err(Error::Validation("section has an empty section_id".into()));
    }
    if section.text.trim().len() < 10 {
        return Err(Error::Validation(format!(
            "section {} has under 10 characters of text",
            section.section_id
        )));
    }
    let mut warnings = Vec::new();
    if section.heading.trim().is_empty() {
        warnings.push(format!("section {} has no heading", section.section_id));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provenance;
    use chrono::Utc;

    #[test]
    fn detects_simple_subsections() {
        let text = "In this chapter: (a) Alpha requirement applies here. (b) Beta requirement applies there.";
        let subs = detect_subsections(text);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].id, "(a)");
        assert!(subs[0].text.starts_with("In this chapter:"));
        assert!(subs[0].text.contains("Alpha"));
        assert_eq!(subs[1].id, "(b)");
        assert!(subs[1].text.starts_with("(b)"));
    }

    #[test]
    fn detects_nested_markers() {
        let text = "(a)(1) First nested block with text.\n(a)(2)(A) Deep nested block with text.";
        let subs = detect_subsections(text);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].id, "(a)(1)");
        assert_eq!(subs[1].id, "(a)(2)(A)");
    }

    #[test]
    fn single_marker_is_not_structure() {
        let text = "As defined in paragraph (a) of this section, a facility must register.";
        assert!(detect_subsections(text).is_empty());
    }

    #[test]
    fn inline_reference_mid_word_is_ignored() {
        let text = "Weight(kg) and size(cm) are units, not subsections.";
        assert!(detect_subsections(text).is_empty());
    }

    #[test]
    fn heading_falls_through_ranked_selectors() {
        let html = r#"<html><body><h2>Sec. 30.02. BURGLARY.</h2><p>text</p></body></html>"#;
        let heading = extract_heading(html, HEADING_SELECTORS).unwrap();
        assert_eq!(heading.as_deref(), Some("Sec. 30.02. BURGLARY."));

        let html_b = r#"<html><body><b>FALLBACK HEADING</b></body></html>"#;
        let heading = extract_heading(html_b, HEADING_SELECTORS).unwrap();
        assert_eq!(heading.as_deref(), Some("FALLBACK HEADING"));
    }

    #[test]
    fn body_prefers_paragraphs_and_strips_boilerplate() {
        let html = r#"<html><body><main>
            <p>First   paragraph
            of the section.</p>
            <p>Second paragraph.</p>
            <p>Copyright 2024 State of Texas. All rights reserved.</p>
        </main></body></html>"#;
        let body = extract_body_text(html, BODY_SELECTORS).unwrap();
        assert_eq!(body, "First paragraph of the section.\n\nSecond paragraph.");
    }

    #[test]
    fn links_filter_by_pattern() {
        let html = r#"<html><body>
            <a href="PE.30.htm">Chapter 30</a>
            <a href="PE.31.htm">Chapter 31</a>
            <a href="index.htm">Home</a>
        </body></html>"#;
        let re = Regex::new(r"^PE\.\d+\.htm$").unwrap();
        let links = extract_links(html, &re).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].1, "PE.30.htm");
    }

    #[test]
    fn section_validation_flags_missing_heading() {
        let section = Section {
            provenance: Provenance::TexasStatute {
                code: "PE".into(),
                code_name: "Penal".into(),
                chapter: "30".into(),
            },
            jurisdiction: "TX".into(),
            section_id: "30.02".into(),
            heading: String::new(),
            text: "A person commits an offense if the person enters a habitation.".into(),
            subsections: vec![],
            source_url: "https://example.com".into(),
            fetched_at: Utc::now(),
            effective_date: None,
            last_amended: None,
        };
        let warnings = validate_section(&section).unwrap();
        assert_eq!(warnings.len(), 1);

        let mut empty = section.clone();
        empty.text = "short".into();
        assert!(validate_section(&empty).is_err());
    }
}
