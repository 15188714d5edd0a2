//! Texas Administrative Code fetcher against the SOS TAC viewer.
//!
//! Units are TAC titles. Chapters are discovered from anchors carrying a
//! `ch=` query parameter on the title page, rules from anchors carrying
//! `rl=` on each chapter page. Rule pages parse through the same
//! ranked-selector strategy as the statute fetcher.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fetcher::{
    detect_subsections, extract_body_text, extract_heading, extract_links, validate_section,
    FetchedUnit, SourceFetcher, BODY_SELECTORS, HEADING_SELECTORS,
};
use crate::models::{Checkpoint, Provenance, RawDocument, Section, SourceType};
use crate::object_store::keys;
use crate::scrape::Scraper;

pub struct TacFetcher {
    scraper: Arc<Scraper>,
    base_url: String,
    titles: Vec<u32>,
}

impl TacFetcher {
    pub fn new(scraper: Arc<Scraper>, base_url: &str, titles: Vec<u32>) -> Self {
        Self {
            scraper,
            base_url: base_url.trim_end_matches('/').to_string(),
            titles,
        }
    }

    fn title_url(&self, title: u32) -> String {
        format!(
            "{}/public/readtac$ext.ViewTAC?tac_view=3&ti={title}",
            self.base_url
        )
    }

    fn resolve(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!("{}/{}", self.base_url, href.trim_start_matches('/'))
        }
    }

    /// `(chapter id, absolute url)` pairs from the title page.
    async fn discover_chapters(&self, title: u32) -> Result<Vec<(String, String)>> {
        let html = self
            .scraper
            .fetch_text(&self.title_url(title), "tac-title")
            .await?;
        let pattern = chapter_link_re();
        let mut seen = BTreeSet::new();
        let mut chapters = Vec::new();
        for (_, href) in extract_links(&html, pattern)? {
            let Some(chapter) = query_param(&href, "ch") else {
                continue;
            };
            if seen.insert(chapter.clone()) {
                chapters.push((chapter, self.resolve(&href)));
            }
        }
        Ok(chapters)
    }

    /// `(rule id, absolute url)` pairs from a chapter page.
    async fn discover_rules(&self, chapter_url: &str) -> Result<Vec<(String, String)>> {
        let html = self.scraper.fetch_text(chapter_url, "tac-chapter").await?;
        let pattern = rule_link_re();
        let mut seen = BTreeSet::new();
        let mut rules = Vec::new();
        for (_, href) in extract_links(&html, pattern)? {
            let Some(rule) = query_param(&href, "rl") else {
                continue;
            };
            if seen.insert(rule.clone()) {
                rules.push((rule, self.resolve(&href)));
            }
        }
        Ok(rules)
    }
}

fn chapter_link_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]ch=\w+").expect("chapter link pattern is valid"))
}

fn rule_link_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]rl=[\w.]+").expect("rule link pattern is valid"))
}

/// Extract a query parameter value from an href.
fn query_param(href: &str, key: &str) -> Option<String> {
    let (_, query) = href.split_once('?')?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=')?;
        if k.eq_ignore_ascii_case(key) && !v.is_empty() {
            return Some(v.to_string());
        }
    }
    None
}

#[async_trait]
impl SourceFetcher for TacFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::State
    }

    fn checkpoint_key(&self) -> String {
        keys::texas_checkpoint("tac")
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        Ok(self.titles.iter().map(|t| t.to_string()).collect())
    }

    async fn fetch_unit(&self, unit: &str) -> Result<FetchedUnit> {
        let title: u32 = unit
            .parse()
            .map_err(|_| Error::Validation(format!("TAC title '{unit}' is not a number")))?;
        let chapters = self.discover_chapters(title).await?;
        info!(title, chapters = chapters.len(), "discovered TAC chapters");
        let mut out = FetchedUnit::default();

        for (chapter, chapter_url) in &chapters {
            let rules = match self.discover_rules(chapter_url).await {
                Ok(rules) => rules,
                Err(Error::NotFound { .. }) => {
                    out.skipped_not_found += 1;
                    continue;
                }
                Err(e) if e.is_unit_recoverable() => {
                    warn!(title, chapter, error = %e, "chapter page failed");
                    out.section_errors.push(format!("chapter {chapter}: {e}"));
                    continue;
                }
                Err(e) => return Err(e),
            };

            for (rule, rule_url) in &rules {
                match self.scraper.fetch_text(rule_url, "tac-rule").await {
                    Ok(html) => {
                        match parse_tac_rule(&html, title, chapter, rule, rule_url) {
                            Ok(section) => match validate_section(&section) {
                                Ok(warnings) => {
                                    out.warnings.extend(warnings);
                                    out.raw_docs.push(
                                        RawDocument::new(
                                            keys::tac_section_html(title, chapter, rule),
                                            html.into_bytes(),
                                            &format!("tx-tac-{title}"),
                                            "tac-rule-html",
                                        )
                                        .with_meta("title", title.to_string())
                                        .with_meta("chapter", chapter.as_str())
                                        .with_meta("rule", rule.as_str()),
                                    );
                                    out.sections.push(section);
                                }
                                Err(e) => out.section_errors.push(format!("rule {rule}: {e}")),
                            },
                            Err(e) => out.section_errors.push(format!("rule {rule}: {e}")),
                        }
                    }
                    Err(Error::NotFound { .. }) => out.skipped_not_found += 1,
                    Err(e) if e.is_unit_recoverable() => {
                        warn!(title, rule, error = %e, "rule fetch failed");
                        out.section_errors.push(format!("rule {rule}: {e}"));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(out)
    }

    fn record_progress(&self, checkpoint: &mut Checkpoint, unit: &str) {
        checkpoint.last_processed_title = unit.parse().ok();
    }
}

/// Parse one TAC rule page. Pure and synchronous.
pub fn parse_tac_rule(
    html: &str,
    title: u32,
    chapter: &str,
    rule: &str,
    url: &str,
) -> Result<Section> {
    let heading = extract_heading(html, HEADING_SELECTORS)?
        .map(|h| crate::fetcher_statute::strip_heading_prefix(&h, rule))
        .unwrap_or_default();
    let text = extract_body_text(html, BODY_SELECTORS)?;
    let subsections = detect_subsections(&text);

    Ok(Section {
        provenance: Provenance::TexasAdminCode {
            title,
            chapter: chapter.to_string(),
        },
        jurisdiction: "TX".to_string(),
        section_id: rule.to_string(),
        heading,
        text,
        subsections,
        source_url: url.to_string(),
        fetched_at: Utc::now(),
        effective_date: None,
        last_amended: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_extract() {
        assert_eq!(
            query_param("readtac$ext.ViewTAC?tac_view=4&ti=16&ch=5", "ch").as_deref(),
            Some("5")
        );
        assert_eq!(
            query_param("readtac$ext.TacPage?sl=R&app=9&rl=5.31", "rl").as_deref(),
            Some("5.31")
        );
        assert_eq!(query_param("page.htm", "ch"), None);
        assert_eq!(query_param("page?ch=", "ch"), None);
    }

    #[test]
    fn chapter_and_rule_patterns() {
        assert!(chapter_link_re().is_match("x?tac_view=4&ti=16&ch=5"));
        assert!(!chapter_link_re().is_match("x?tac_view=4&ti=16"));
        assert!(rule_link_re().is_match("x?sl=R&rl=5.31"));
    }

    #[test]
    fn parses_rule_page_with_nested_subsections() {
        let html = r#"<html><body><main>
            <h2>§5.31. License Applications.</h2>
            <p>(a) An applicant must file on a form prescribed by the commission.</p>
            <p>(a)(1) The form must include the applicant's business address.</p>
            <p>(b) The commission may request additional information.</p>
        </main></body></html>"#;
        let section =
            parse_tac_rule(html, 16, "5", "5.31", "https://texreg.example/x?rl=5.31").unwrap();
        assert_eq!(section.section_id, "5.31");
        assert!(section.heading.contains("License Applications"));
        assert!(section.subsections.len() >= 2);
        assert_eq!(section.subsections[0].id, "(a)");
        match &section.provenance {
            Provenance::TexasAdminCode { title, chapter } => {
                assert_eq!(*title, 16);
                assert_eq!(chapter, "5");
            }
            other => panic!("wrong provenance: {other:?}"),
        }
    }
}
