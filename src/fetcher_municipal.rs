//! Municipal code fetcher via the external Markdown rendering service.
//!
//! Cities are rendered to clean Markdown by an external service; the
//! fetcher posts each configured city's base URL, stores the raw page,
//! and walks the Markdown token stream:
//!
//! - chapter boundaries: `# Chapter N`, `## Article I`, `## Part I`;
//! - section headings at depth 2–4 shaped like `Sec. 12-34. Title` (with
//!   or without the `Sec.` lead);
//! - section text: the paragraph, list, blockquote, and code content up
//!   to the next section or chapter heading;
//! - lettered/numbered subsection markers populate `subsections`.
//!
//! Sections keep their chapter labels verbatim (Roman-numeral articles
//! included); only the minimum fields are enforced, with warnings
//! collected and a source-level warning when under half the discovered
//! sections validate.

use async_trait::async_trait;
use chrono::Utc;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

use crate::config::{CityTarget, Credentials, RenderConfig};
use crate::error::{Error, Result};
use crate::fetcher::{detect_subsections, FetchedUnit, SourceFetcher};
use crate::models::{Checkpoint, Provenance, RawDocument, Section, SourceType};
use crate::object_store::keys;

const SERVICE: &str = "render";

/// Client for the Markdown rendering service: `POST {url} → {markdown}`.
pub struct RenderClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl RenderClient {
    pub fn new(config: &RenderConfig, creds: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build render client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: creds.render_api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// Render a page to Markdown.
    pub async fn render(&self, url: &str) -> Result<String> {
        let mut request = self.client.post(&self.endpoint).json(&json!({ "url": url }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::from_transport(SERVICE, self.timeout_secs, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                service: SERVICE.to_string(),
                message: format!(
                    "render of {url} failed (HTTP {status}): {}",
                    body.chars().take(300).collect::<String>()
                ),
            });
        }
        let value: serde_json::Value = response.json().await.map_err(|e| Error::Api {
            service: SERVICE.to_string(),
            message: format!("render response parse failed: {e}"),
        })?;
        value
            .get("markdown")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .ok_or_else(|| Error::Api {
                service: SERVICE.to_string(),
                message: "render response missing 'markdown'".to_string(),
            })
    }
}

pub struct MunicipalFetcher {
    render: Arc<RenderClient>,
    cities: Vec<CityTarget>,
}

impl MunicipalFetcher {
    pub fn new(render: Arc<RenderClient>, cities: Vec<CityTarget>) -> Self {
        Self { render, cities }
    }
}

#[async_trait]
impl SourceFetcher for MunicipalFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Municipal
    }

    fn checkpoint_key(&self) -> String {
        keys::municipal_checkpoint()
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        Ok(self.cities.iter().map(|c| c.jurisdiction()).collect())
    }

    async fn fetch_unit(&self, unit: &str) -> Result<FetchedUnit> {
        let city = self
            .cities
            .iter()
            .find(|c| c.jurisdiction() == unit)
            .ok_or_else(|| Error::Config(format!("city '{unit}' is not configured")))?;

        let markdown = self.render.render(&city.base_url).await?;
        info!(city = %unit, bytes = markdown.len(), "rendered municipal page");

        let mut out = FetchedUnit::default();
        out.raw_docs.push(
            RawDocument::new(
                keys::municipal_raw_page(unit),
                markdown.clone().into_bytes(),
                &format!("muni-{unit}"),
                "municipal-markdown",
            )
            .with_meta("city", city.name.as_str())
            .with_meta("url", city.base_url.as_str()),
        );

        let parsed = parse_municipal_markdown(&markdown, city, &city.base_url);
        out.warnings.extend(parsed.warnings);

        for section in parsed.sections {
            let chapter = match &section.provenance {
                Provenance::Municipal { chapter, .. } => chapter.clone(),
                _ => String::new(),
            };
            let key = keys::municipal_section_json(unit, &chapter, &section.section_id);
            let bytes = serde_json::to_vec(&section)
                .map_err(|e| Error::Validation(format!("section serialize failed: {e}")))?;
            out.raw_docs.push(
                RawDocument::new(key, bytes, &format!("muni-{unit}"), "municipal-section-json")
                    .with_meta("chapter", chapter.as_str())
                    .with_meta("section", section.section_id.as_str()),
            );
            out.sections.push(section);
        }
        Ok(out)
    }

    fn record_progress(&self, checkpoint: &mut Checkpoint, unit: &str) {
        checkpoint.last_processed_jurisdiction = Some(unit.to_string());
    }
}

// ============ Markdown parsing ============

/// Outcome of one page parse.
pub struct ParsedMunicipalPage {
    pub sections: Vec<Section>,
    pub warnings: Vec<String>,
}

fn chapter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:chapter|article|part)\s+([\w.-]+)")
            .expect("chapter heading pattern is valid")
    })
}

fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:sec(?:tion)?\.?\s*)?(\d[\d.-]*)[.:\s-]+(.+)$")
            .expect("section heading pattern is valid")
    })
}

struct PendingSection {
    id: String,
    heading: String,
    chapter: String,
    text: String,
}

/// Walk a rendered Markdown document into sections. Pure and synchronous.
pub fn parse_municipal_markdown(
    markdown: &str,
    city: &CityTarget,
    page_url: &str,
) -> ParsedMunicipalPage {
    let jurisdiction = city.jurisdiction();
    let mut sections: Vec<Section> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut rejected = 0usize;

    let mut current_chapter: Option<String> = None;
    let mut pending: Option<PendingSection> = None;

    let mut in_heading = false;
    let mut heading_level = 1u32;
    let mut heading_buf = String::new();
    let mut block_buf = String::new();

    let mut finish = |pending: &mut Option<PendingSection>,
                      sections: &mut Vec<Section>,
                      warnings: &mut Vec<String>,
                      rejected: &mut usize| {
        let Some(section) = pending.take() else {
            return;
        };
        let text = section.text.trim().to_string();
        if text.len() < 10 {
            *rejected += 1;
            warnings.push(format!(
                "section {} rejected: under 10 characters of text",
                section.id
            ));
            return;
        }
        if section.heading.trim().is_empty() {
            warnings.push(format!("section {} has no heading", section.id));
        }
        let subsections = detect_subsections(&text);
        sections.push(Section {
            provenance: Provenance::Municipal {
                state: city.state.clone(),
                city: city.name.clone(),
                chapter: section.chapter.clone(),
            },
            jurisdiction: jurisdiction.clone(),
            section_id: section.id,
            heading: section.heading,
            text,
            subsections,
            source_url: page_url.to_string(),
            fetched_at: Utc::now(),
            effective_date: None,
            last_amended: None,
        });
    };

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                in_heading = true;
                heading_level = level as u32;
                heading_buf.clear();
            }
            Event::End(TagEnd::Heading(_)) => {
                in_heading = false;
                let heading_text = heading_buf.trim().to_string();

                let is_chapter = match heading_level {
                    1 => heading_text.to_lowercase().starts_with("chapter"),
                    2 => {
                        let lower = heading_text.to_lowercase();
                        lower.starts_with("article") || lower.starts_with("part")
                    }
                    _ => false,
                };

                if is_chapter {
                    finish(&mut pending, &mut sections, &mut warnings, &mut rejected);
                    let label = chapter_re()
                        .captures(&heading_text)
                        .map(|c| c[1].to_string())
                        .unwrap_or_else(|| heading_text.clone());
                    current_chapter = Some(label);
                    continue;
                }

                // Any heading ends the running section's text.
                finish(&mut pending, &mut sections, &mut warnings, &mut rejected);

                if (2..=4).contains(&heading_level) {
                    if let Some(caps) = section_re().captures(&heading_text) {
                        match &current_chapter {
                            Some(chapter) => {
                                pending = Some(PendingSection {
                                    id: caps[1].to_string(),
                                    heading: caps[2].trim().to_string(),
                                    chapter: chapter.clone(),
                                    text: String::new(),
                                });
                            }
                            None => warnings.push(format!(
                                "section heading '{heading_text}' appears before any chapter"
                            )),
                        }
                    }
                }
            }
            Event::Text(t) | Event::Code(t) => {
                if in_heading {
                    heading_buf.push_str(&t);
                } else if pending.is_some() {
                    block_buf.push_str(&t);
                }
            }
            Event::SoftBreak => {
                if in_heading {
                    heading_buf.push(' ');
                } else {
                    block_buf.push(' ');
                }
            }
            Event::HardBreak => {
                if !in_heading {
                    block_buf.push('\n');
                }
            }
            Event::End(TagEnd::Paragraph) | Event::End(TagEnd::CodeBlock) => {
                if let Some(section) = pending.as_mut() {
                    let block = block_buf.trim();
                    if !block.is_empty() {
                        if !section.text.is_empty() {
                            section.text.push_str("\n\n");
                        }
                        section.text.push_str(block);
                    }
                }
                block_buf.clear();
            }
            Event::End(TagEnd::Item) => {
                if let Some(section) = pending.as_mut() {
                    let block = block_buf.trim();
                    if !block.is_empty() {
                        if !section.text.is_empty() {
                            section.text.push('\n');
                        }
                        section.text.push_str(block);
                    }
                }
                block_buf.clear();
            }
            _ => {}
        }
    }
    finish(&mut pending, &mut sections, &mut warnings, &mut rejected);

    let total = sections.len() + rejected;
    if total > 0 && sections.len() * 2 < total {
        warnings.push(format!(
            "{} of {total} discovered sections validated for {jurisdiction}: pass rate under 50%",
            sections.len()
        ));
    }

    ParsedMunicipalPage { sections, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn houston() -> CityTarget {
        CityTarget {
            state: "TX".into(),
            name: "Houston".into(),
            base_url: "https://codes.example.com/tx/houston".into(),
        }
    }

    const PAGE: &str = r#"# Chapter 1 General Provisions

## Sec. 1-2. Definitions.

In this Code: (a) City means the City of Houston. (b) Council means the governing body of the city.

## Sec. 1-3. Catchhead notes.

The catchheads of the several sections of this Code are intended as mere catchwords
to indicate the contents of the section.

- They shall not be deemed titles.
- They shall not limit or expand meaning.

## Article II Administration

### Section 2-1: Officers generally.

All officers shall perform the duties required of them by state law and city ordinance.

### 2-2 Bonds required

x
"#;

    #[test]
    fn walks_chapters_and_sections() {
        let parsed = parse_municipal_markdown(PAGE, &houston(), "https://codes.example.com/tx/houston");
        let ids: Vec<&str> = parsed.sections.iter().map(|s| s.section_id.as_str()).collect();
        assert_eq!(ids, vec!["1-2", "1-3", "2-1"]);

        let first = &parsed.sections[0];
        assert_eq!(first.heading, "Definitions.");
        assert_eq!(first.jurisdiction, "TX-houston");
        assert!(first.text.contains("City of Houston"));
        assert_eq!(first.subsections.len(), 2);
        match &first.provenance {
            Provenance::Municipal { chapter, .. } => assert_eq!(chapter, "1"),
            other => panic!("wrong provenance: {other:?}"),
        }
    }

    #[test]
    fn article_heading_switches_chapters() {
        let parsed = parse_municipal_markdown(PAGE, &houston(), "u");
        let officers = parsed
            .sections
            .iter()
            .find(|s| s.section_id == "2-1")
            .unwrap();
        match &officers.provenance {
            Provenance::Municipal { chapter, .. } => assert_eq!(chapter, "II"),
            other => panic!("wrong provenance: {other:?}"),
        }
    }

    #[test]
    fn list_items_join_section_text() {
        let parsed = parse_municipal_markdown(PAGE, &houston(), "u");
        let catchheads = parsed
            .sections
            .iter()
            .find(|s| s.section_id == "1-3")
            .unwrap();
        assert!(catchheads.text.contains("They shall not be deemed titles."));
    }

    #[test]
    fn short_sections_are_rejected_with_warning() {
        let parsed = parse_municipal_markdown(PAGE, &houston(), "u");
        assert!(parsed.sections.iter().all(|s| s.section_id != "2-2"));
        assert!(parsed
            .warnings
            .iter()
            .any(|w| w.contains("2-2") && w.contains("under 10 characters")));
    }

    #[test]
    fn low_pass_rate_adds_source_warning() {
        let md = "# Chapter 1\n\n## Sec. 1-1. A.\n\nx\n\n## Sec. 1-2. B.\n\ny\n";
        let parsed = parse_municipal_markdown(md, &houston(), "u");
        assert!(parsed.sections.is_empty());
        assert!(parsed.warnings.iter().any(|w| w.contains("pass rate")));
    }

    #[test]
    fn sections_before_any_chapter_are_skipped() {
        let md = "## Sec. 9-1. Orphan.\n\nThis section has no chapter above it.\n";
        let parsed = parse_municipal_markdown(md, &houston(), "u");
        assert!(parsed.sections.is_empty());
        assert!(parsed.warnings.iter().any(|w| w.contains("before any chapter")));
    }
}
