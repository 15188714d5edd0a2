//! County code fetcher with per-platform adapters.
//!
//! Counties publish their codes of ordinances through one of three HTML
//! platforms. Each platform differs only in how chapter and section
//! links are shaped, so an adapter is a [`PlatformSpec`]: two href
//! patterns (capture group 1 is the identifier) plus selector overrides.
//! The registry maps the `platform` key in each county's config entry to
//! its spec; the walk itself (index → chapters → sections → parse) is
//! shared.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CountyTarget;
use crate::error::{Error, Result};
use crate::fetcher::{
    detect_subsections, extract_body_text, extract_heading, extract_links, validate_section,
    FetchedUnit, SourceFetcher, BODY_SELECTORS, HEADING_SELECTORS,
};
use crate::models::{Checkpoint, Provenance, RawDocument, Section, SourceType};
use crate::object_store::keys;
use crate::scrape::Scraper;

/// How one publishing platform shapes its chapter and section links.
pub struct PlatformSpec {
    pub key: &'static str,
    /// Chapter href pattern; capture 1 is the chapter identifier.
    pub chapter_href: &'static str,
    /// Section href pattern; capture 1 is the section identifier.
    pub section_href: &'static str,
    /// Platform-specific selectors tried before the shared fallbacks.
    pub heading_selectors: &'static [&'static str],
    pub body_selectors: &'static [&'static str],
}

const PLATFORMS: &[PlatformSpec] = &[
    PlatformSpec {
        key: "municode",
        chapter_href: r"nodeId=CHAPTER_([\w.-]+)",
        section_href: r"nodeId=SEC_([\w.-]+)",
        heading_selectors: &["h2.chunk-title"],
        body_selectors: &["div.chunk-content"],
    },
    PlatformSpec {
        key: "amlegal",
        chapter_href: r"chapter[-_]([\w.]+)(?:\.html?)?$",
        section_href: r"section[-_]([\w.-]+)(?:\.html?)?$",
        heading_selectors: &["h1.ordinance-title"],
        body_selectors: &["div.ordinance-text"],
    },
    PlatformSpec {
        key: "civicplus",
        chapter_href: r"[?&]chapterId=([\w.-]+)",
        section_href: r"[?&]sectionId=([\w.-]+)",
        heading_selectors: &["h3.section-title"],
        body_selectors: &["div.section-body"],
    },
];

/// Look up a platform adapter by its registry key.
pub fn find_platform(key: &str) -> Option<&'static PlatformSpec> {
    PLATFORMS.iter().find(|p| p.key == key)
}

pub struct CountyFetcher {
    scraper: Arc<Scraper>,
    counties: Vec<CountyTarget>,
}

impl CountyFetcher {
    pub fn new(scraper: Arc<Scraper>, counties: Vec<CountyTarget>) -> Self {
        Self { scraper, counties }
    }

    fn resolve(base: &str, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                href.trim_start_matches('/')
            )
        }
    }

    async fn discover(
        &self,
        url: &str,
        base: &str,
        pattern: &Regex,
        label: &str,
    ) -> Result<Vec<(String, String)>> {
        let html = self.scraper.fetch_text(url, label).await?;
        let mut seen = BTreeSet::new();
        let mut found = Vec::new();
        for (_, href) in extract_links(&html, pattern)? {
            let Some(caps) = pattern.captures(&href) else {
                continue;
            };
            let id = caps[1].to_string();
            if seen.insert(id.clone()) {
                found.push((id, Self::resolve(base, &href)));
            }
        }
        Ok(found)
    }

    async fn fetch_county(&self, county: &CountyTarget) -> Result<FetchedUnit> {
        let platform = find_platform(&county.platform).ok_or_else(|| {
            Error::Config(format!(
                "county {} references unknown platform '{}'",
                county.id, county.platform
            ))
        })?;
        let chapter_re = Regex::new(platform.chapter_href)
            .map_err(|e| Error::Validation(format!("chapter pattern: {e}")))?;
        let section_re = Regex::new(platform.section_href)
            .map_err(|e| Error::Validation(format!("section pattern: {e}")))?;

        let mut unit = FetchedUnit::default();
        let chapters = self
            .discover(&county.base_url, &county.base_url, &chapter_re, "county-index")
            .await?;
        info!(county = %county.id, chapters = chapters.len(), "discovered county chapters");

        for (chapter, chapter_url) in &chapters {
            let sections = match self
                .discover(chapter_url, &county.base_url, &section_re, "county-chapter")
                .await
            {
                Ok(s) => s,
                Err(Error::NotFound { .. }) => {
                    unit.skipped_not_found += 1;
                    continue;
                }
                Err(e) if e.is_unit_recoverable() => {
                    unit.section_errors.push(format!("chapter {chapter}: {e}"));
                    continue;
                }
                Err(e) => return Err(e),
            };

            for (section_id, section_url) in &sections {
                match self.scraper.fetch_text(section_url, "county-section").await {
                    Ok(html) => {
                        match parse_county_section(
                            &html, platform, county, chapter, section_id, section_url,
                        ) {
                            Ok(section) => match validate_section(&section) {
                                Ok(warnings) => {
                                    unit.warnings.extend(warnings);
                                    unit.raw_docs.push(
                                        RawDocument::new(
                                            keys::county_section_html(
                                                &county.id, chapter, section_id,
                                            ),
                                            html.into_bytes(),
                                            &format!("county-{}", county.id),
                                            "county-section-html",
                                        )
                                        .with_meta("county", county.id.as_str())
                                        .with_meta("chapter", chapter.as_str())
                                        .with_meta("section", section_id.as_str()),
                                    );
                                    unit.sections.push(section);
                                }
                                Err(e) => {
                                    unit.section_errors.push(format!("{section_id}: {e}"));
                                }
                            },
                            Err(e) => unit.section_errors.push(format!("{section_id}: {e}")),
                        }
                    }
                    Err(Error::NotFound { .. }) => unit.skipped_not_found += 1,
                    Err(e) if e.is_unit_recoverable() => {
                        warn!(county = %county.id, section_id, error = %e, "section fetch failed");
                        unit.section_errors.push(format!("{section_id}: {e}"));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(unit)
    }
}

#[async_trait]
impl SourceFetcher for CountyFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::County
    }

    fn checkpoint_key(&self) -> String {
        keys::county_checkpoint()
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        Ok(self.counties.iter().map(|c| c.id.clone()).collect())
    }

    async fn fetch_unit(&self, unit: &str) -> Result<FetchedUnit> {
        let county = self
            .counties
            .iter()
            .find(|c| c.id == unit)
            .ok_or_else(|| Error::Config(format!("county '{unit}' is not configured")))?;
        self.fetch_county(county).await
    }

    fn record_progress(&self, checkpoint: &mut Checkpoint, unit: &str) {
        checkpoint.last_processed_jurisdiction = Some(unit.to_string());
    }
}

/// Parse one county section page, trying the platform's selectors before
/// the shared fallbacks. Pure and synchronous.
pub fn parse_county_section(
    html: &str,
    platform: &PlatformSpec,
    county: &CountyTarget,
    chapter: &str,
    section_id: &str,
    url: &str,
) -> Result<Section> {
    let mut heading_selectors: Vec<&str> = platform.heading_selectors.to_vec();
    heading_selectors.extend_from_slice(HEADING_SELECTORS);
    let mut body_selectors: Vec<&str> = platform.body_selectors.to_vec();
    body_selectors.extend_from_slice(BODY_SELECTORS);

    let heading = extract_heading(html, &heading_selectors)?.unwrap_or_default();
    let text = extract_body_text(html, &body_selectors)?;
    let subsections = detect_subsections(&text);
    let state = county.id.split('-').next().unwrap_or_default().to_string();

    Ok(Section {
        provenance: Provenance::County {
            county_id: county.id.clone(),
            county_name: county.name.clone(),
            state,
            chapter: chapter.to_string(),
        },
        jurisdiction: county.id.clone(),
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
