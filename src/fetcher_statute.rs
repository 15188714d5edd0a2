//! Texas statutes fetcher (HTML).
//!
//! Units are statute codes (`PE`, `HS`, …). For each code the walk is:
//! table-of-contents page → chapter pages → section pages, discovering
//! each level through anchor filename patterns (`{code}.{ch}.htm`, then
//! `{code}.{ch}.{sec}.htm`). Section pages parse through the shared
//! ranked-selector strategy; 404s are skipped, other scrape failures
//! abort only the section they hit.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::citation::statute_code_name;
use crate::error::{Error, Result};
use crate::fetcher::{
    detect_subsections, extract_body_text, extract_heading, extract_links, validate_section,
    FetchedUnit, SourceFetcher, BODY_SELECTORS, HEADING_SELECTORS,
};
use crate::models::{Checkpoint, Provenance, RawDocument, Section, SourceType};
use crate::object_store::keys;
use crate::scrape::Scraper;

pub struct StatuteFetcher {
    scraper: Arc<Scraper>,
    base_url: String,
    codes: Vec<String>,
}

impl StatuteFetcher {
    pub fn new(scraper: Arc<Scraper>, base_url: &str, codes: Vec<String>) -> Self {
        Self {
            scraper,
            base_url: base_url.trim_end_matches('/').to_string(),
            codes,
        }
    }

    fn doc_url(&self, code: &str, file: &str) -> String {
        format!("{}/Docs/{code}/htm/{file}", self.base_url)
    }

    /// Chapter identifiers from the code's TOC page, unique and sorted.
    async fn discover_chapters(&self, code: &str) -> Result<Vec<String>> {
        let url = self.doc_url(code, &format!("{code}.toc.htm"));
        let html = self.scraper.fetch_text(&url, "statute-toc").await?;
        let pattern = Regex::new(&format!(r"{}\.(\w+)\.htm$", regex::escape(code)))
            .map_err(|e| Error::Validation(format!("chapter pattern: {e}")))?;

        let mut chapters = BTreeSet::new();
        for (_, href) in extract_links(&html, &pattern)? {
            if let Some(caps) = pattern.captures(&href) {
                let chapter = caps[1].to_string();
                if chapter != "toc" {
                    chapters.insert(chapter);
                }
            }
        }
        let mut chapters: Vec<String> = chapters.into_iter().collect();
        sort_numeric(&mut chapters);
        Ok(chapters)
    }

    /// Section identifiers listed on a chapter page.
    async fn discover_sections(&self, code: &str, chapter: &str) -> Result<Vec<String>> {
        let url = self.doc_url(code, &format!("{code}.{chapter}.htm"));
        let html = self.scraper.fetch_text(&url, "statute-chapter").await?;
        let pattern = Regex::new(&format!(
            r"{}\.{}\.(\S+?)\.htm$",
            regex::escape(code),
            regex::escape(chapter)
        ))
        .map_err(|e| Error::Validation(format!("section pattern: {e}")))?;

        let mut sections = BTreeSet::new();
        for (_, href) in extract_links(&html, &pattern)? {
            if let Some(caps) = pattern.captures(&href) {
                sections.insert(format!("{chapter}.{}", &caps[1]));
            }
        }
        let mut sections: Vec<String> = sections.into_iter().collect();
        sort_numeric(&mut sections);
        Ok(sections)
    }

    async fn fetch_section(
        &self,
        code: &str,
        chapter: &str,
        section_id: &str,
    ) -> Result<(Section, RawDocument)> {
        let url = self.doc_url(code, &format!("{code}.{section_id}.htm"));
        let html = self.scraper.fetch_text(&url, "statute-section").await?;

        let section = parse_statute_section(&html, code, chapter, section_id, &url)?;
        let raw = RawDocument::new(
            keys::statute_section_html(code, chapter, section_id),
            html.into_bytes(),
            &format!("tx-statute-{code}"),
            "statute-section-html",
        )
        .with_meta("code", code)
        .with_meta("chapter", chapter)
        .with_meta("section", section_id);
        Ok((section, raw))
    }
}

#[async_trait]
impl SourceFetcher for StatuteFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::State
    }

    fn checkpoint_key(&self) -> String {
        keys::texas_checkpoint("statute")
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        Ok(self.codes.clone())
    }

    async fn fetch_unit(&self, code: &str) -> Result<FetchedUnit> {
        let chapters = self.discover_chapters(code).await?;
        info!(code, chapters = chapters.len(), "discovered statute chapters");
        let mut unit = FetchedUnit::default();

        for chapter in &chapters {
            let section_ids = match self.discover_sections(code, chapter).await {
                Ok(ids) => ids,
                Err(Error::NotFound { .. }) => {
                    unit.skipped_not_found += 1;
                    continue;
                }
                Err(e) if e.is_unit_recoverable() => {
                    warn!(code, chapter, error = %e, "chapter index failed");
                    unit.section_errors.push(format!("chapter {chapter}: {e}"));
                    continue;
                }
                Err(e) => return Err(e),
            };

            for section_id in &section_ids {
                match self.fetch_section(code, chapter, section_id).await {
                    Ok((section, raw)) => match validate_section(&section) {
                        Ok(warnings) => {
                            unit.warnings.extend(warnings);
                            unit.sections.push(section);
                            unit.raw_docs.push(raw);
                        }
                        Err(e) => {
                            unit.section_errors.push(format!("{section_id}: {e}"));
                        }
                    },
                    Err(Error::NotFound { .. }) => {
                        unit.skipped_not_found += 1;
                    }
                    Err(e) if e.is_unit_recoverable() => {
                        warn!(code, section_id, error = %e, "section fetch failed");
                        unit.section_errors.push(format!("{section_id}: {e}"));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(unit)
    }

    fn record_progress(&self, checkpoint: &mut Checkpoint, unit: &str) {
        checkpoint.last_processed_code = Some(unit.to_string());
    }
}

/// Parse one statute section page. Pure and synchronous.
pub fn parse_statute_section(
    html: &str,
    code: &str,
    chapter: &str,
    section_id: &str,
    url: &str,
) -> Result<Section> {
    let heading = extract_heading(html, HEADING_SELECTORS)?
        .map(|h| strip_heading_prefix(&h, section_id))
        .unwrap_or_default();
    let text = extract_body_text(html, BODY_SELECTORS)?;
    let subsections = detect_subsections(&text);

    Ok(Section {
        provenance: Provenance::TexasStatute {
            code: code.to_string(),
            code_name: statute_code_name(code).to_string(),
            chapter: chapter.to_string(),
        },
        jurisdiction: "TX".to_string(),
        section_id: section_id.to_string(),
        heading,
        text,
        subsections,
        source_url: url.to_string(),
        fetched_at: Utc::now(),
        effective_date: None,
        last_amended: None,
    })
}

/// `"Sec. 30.02. BURGLARY."` → `"BURGLARY."`.
pub fn strip_heading_prefix(heading: &str, section_id: &str) -> String {
    let mut h = heading.trim();
    for prefix in ["Section", "Sec.", "Sec", "§"] {
        if let Some(rest) = h.strip_prefix(prefix) {
            h = rest.trim_start();
            break;
        }
    }
    if let Some(rest) = h.strip_prefix(section_id) {
        h = rest.trim_start_matches(['.', ':', '-', ' ']);
    }
    h.trim().to_string()
}

/// Sort identifiers numerically where possible (`2` before `10`),
/// falling back to lexicographic order for suffixes like `30A`.
pub fn sort_numeric(values: &mut [String]) {
    values.sort_by(|a, b| {
        let na = leading_number(a);
        let nb = leading_number(b);
        na.partial_cmp(&nb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
}

fn leading_number(value: &str) -> f64 {
    let digits: String = value
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().unwrap_or(f64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTION_HTML: &str = r#"<html><body>
        <h2 class="section-heading">Sec. 30.02. BURGLARY.</h2>
        <div class="section-text">
            <p>(a) A person commits an offense if, without the effective consent of the owner, the person enters a habitation.</p>
            <p>(b) For purposes of this section, "enter" means to intrude any part of the body.</p>
            <p>Copyright 2024. All rights reserved.</p>
        </div>
    </body></html>"#;

    #[test]
    fn parses_section_page() {
        let section = parse_statute_section(
            SECTION_HTML,
            "PE",
            "30",
            "30.02",
            "https://statutes.capitol.texas.gov/Docs/PE/htm/PE.30.02.htm",
        )
        .unwrap();
        assert_eq!(section.heading, "BURGLARY.");
        assert_eq!(section.jurisdiction, "TX");
        assert!(section.text.contains("habitation"));
        assert!(!section.text.to_lowercase().contains("copyright"));
        assert_eq!(section.subsections.len(), 2);
        assert_eq!(section.subsections[0].id, "(a)");
        assert!(section.source_url.ends_with("PE.30.02.htm"));
    }

    #[test]
    fn heading_prefix_variants() {
        assert_eq!(strip_heading_prefix("Sec. 30.02. BURGLARY.", "30.02"), "BURGLARY.");
        assert_eq!(strip_heading_prefix("Section 30.02: BURGLARY", "30.02"), "BURGLARY");
        assert_eq!(strip_heading_prefix("BURGLARY.", "30.02"), "BURGLARY.");
    }

    #[test]
    fn numeric_sort_orders_chapters() {
        let mut chapters = vec![
            "10".to_string(),
            "2".to_string(),
            "30A".to_string(),
            "30".to_string(),
        ];
        sort_numeric(&mut chapters);
        assert_eq!(chapters, vec!["2", "10", "30", "30A"]);
    }

    #[test]
    fn statute_provenance_carries_code_name() {
        let section =
            parse_statute_section(SECTION_HTML, "PE", "30", "30.02", "https://x.example/PE.30.02.htm")
                .unwrap();
        match &section.provenance {
            Provenance::TexasStatute { code, code_name, chapter } => {
                assert_eq!(code, "PE");
                assert_eq!(code_name, "Penal");
                assert_eq!(chapter, "30");
            }
            other => panic!("wrong provenance: {other:?}"),
        }
    }
}
