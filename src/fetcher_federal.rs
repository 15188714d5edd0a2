//! Federal (CFR) fetcher against the eCFR versioner API.
//!
//! One fetcher instance covers one CFR title; its units are the title's
//! parts. The walk is: resolve the latest available issue date from
//! `/titles` (cached for the process lifetime, falling back to seven days
//! ago), read the title structure JSON to enumerate parts, then fetch
//! each part's XML and collect `DIV8 TYPE="SECTION"` nodes. The full-part
//! response may arrive wrapped (`<ECFR><DIV1>…`) or as a bare
//! `<DIV5 TYPE="PART">`; the event-driven walk handles both.
//!
//! A pre-parse cache pass ([`cache_title`]) stores raw XML, parsed
//! sections ([`CachedPart`]), and per-title manifests side by side in the
//! object store, keyed by an `xml_hash`, so the chunking workflow reads
//! sections without ever running the XML parser.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fetcher::{collapse_inline_whitespace, FetchedUnit, SourceFetcher};
use crate::models::{
    CachedPart, CachedPartMeta, Checkpoint, Provenance, RawDocument, Section, SourceType,
};
use crate::object_store::{keys, ObjectStore};
use crate::scrape::Scraper;

pub struct FederalFetcher {
    scraper: Arc<Scraper>,
    base_url: String,
    title: u32,
    available_date: OnceCell<String>,
}

impl FederalFetcher {
    pub fn new(scraper: Arc<Scraper>, base_url: &str, title: u32) -> Self {
        Self {
            scraper,
            base_url: base_url.trim_end_matches('/').to_string(),
            title,
            available_date: OnceCell::new(),
        }
    }

    pub fn title(&self) -> u32 {
        self.title
    }

    /// Latest issue date for this title, resolved once per process.
    async fn available_date(&self) -> Result<String> {
        self.available_date
            .get_or_try_init(|| async {
                let url = format!("{}/titles.json", self.base_url);
                match self.scraper.fetch_text(&url, "ecfr-titles").await {
                    Ok(body) => {
                        let value: serde_json::Value =
                            serde_json::from_str(&body).unwrap_or_default();
                        if let Some(date) = pick_issue_date(&value, self.title) {
                            return Ok(date);
                        }
                        warn!(title = self.title, "no issue date in /titles; using fallback");
                        Ok(fallback_date())
                    }
                    Err(e) => {
                        warn!(title = self.title, error = %e, "titles metadata unavailable");
                        Ok(fallback_date())
                    }
                }
            })
            .await
            .map(|date| date.clone())
    }

    async fn fetch_part_xml(&self, part: &str) -> Result<String> {
        let date = self.available_date().await?;
        let url = format!(
            "{}/full/{date}/title-{}.xml?part={part}",
            self.base_url, self.title
        );
        self.scraper.fetch_text(&url, "ecfr-part").await
    }
}

#[async_trait]
impl SourceFetcher for FederalFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Federal
    }

    fn checkpoint_key(&self) -> String {
        keys::federal_checkpoint(self.title)
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        let date = self.available_date().await?;
        let url = format!(
            "{}/structure/{date}/title-{}.json",
            self.base_url, self.title
        );
        let body = self.scraper.fetch_text(&url, "ecfr-structure").await?;
        let value: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            Error::Validation(format!("title {} structure is not JSON: {e}", self.title))
        })?;
        let mut parts = Vec::new();
        collect_parts(&value, &mut parts);
        Ok(parts)
    }

    async fn fetch_unit(&self, part: &str) -> Result<FetchedUnit> {
        let xml = self.fetch_part_xml(part).await?;
        let sections = parse_part_xml(&xml, self.title)?;
        info!(title = self.title, part, sections = sections.len(), "parsed CFR part");

        let raw = RawDocument::new(
            keys::federal_part_xml(self.title, part),
            xml.into_bytes(),
            &format!("cfr-title-{}", self.title),
            "cfr-part-xml",
        )
        .with_meta("title", self.title.to_string())
        .with_meta("part", part);

        Ok(FetchedUnit {
            sections,
            raw_docs: vec![raw],
            ..Default::default()
        })
    }

    fn record_progress(&self, checkpoint: &mut Checkpoint, unit: &str) {
        checkpoint.title_number = Some(self.title);
        checkpoint.last_processed_part = Some(unit.to_string());
    }
}

fn fallback_date() -> String {
    (Utc::now() - Duration::days(7)).format("%Y-%m-%d").to_string()
}

/// Pull this title's issue date out of the `/titles` payload.
fn pick_issue_date(value: &serde_json::Value, title: u32) -> Option<String> {
    let titles = value.get("titles")?.as_array()?;
    let entry = titles
        .iter()
        .find(|t| t.get("number").and_then(|n| n.as_u64()) == Some(u64::from(title)))?;
    entry
        .get("latest_issue_date")
        .or_else(|| entry.get("up_to_date_as_of"))
        .and_then(|d| d.as_str())
        .map(|d| d.to_string())
}

/// Depth-first walk of the structure JSON collecting `part` identifiers.
fn collect_parts(node: &serde_json::Value, out: &mut Vec<String>) {
    if node.get("type").and_then(|t| t.as_str()) == Some("part") {
        if let Some(id) = node.get("identifier").and_then(|i| i.as_str()) {
            out.push(id.to_string());
        }
    }
    if let Some(children) = node.get("children").and_then(|c| c.as_array()) {
        for child in children {
            collect_parts(child, out);
        }
    }
}

// ============ Part XML parsing ============

/// Parse one part's XML into sections. Pure and synchronous; the XML may
/// be the wrapped full-title form or a bare `DIV5`.
pub fn parse_part_xml(xml: &str, title: u32) -> Result<Vec<Section>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    #[derive(PartialEq)]
    enum TextTarget {
        None,
        Sectno,
        Head,
    }

    let mut sections = Vec::new();
    let mut current_part = String::new();
    let mut in_section = false;
    let mut in_paragraph = false;
    let mut target = TextTarget::None;

    let mut attr_n = String::new();
    let mut sectno = String::new();
    let mut head = String::new();
    let mut effective: Option<String> = None;
    let mut amended: Option<String> = None;
    let mut paragraphs: Vec<String> = Vec::new();
    let mut para_buf = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"DIV5" => {
                    if attr_value(&e, b"TYPE").as_deref() == Some("PART") {
                        current_part = attr_value(&e, b"N").unwrap_or_default();
                    }
                }
                b"DIV8" => {
                    if attr_value(&e, b"TYPE").as_deref() == Some("SECTION") {
                        in_section = true;
                        attr_n = attr_value(&e, b"N").unwrap_or_default();
                        effective = attr_value(&e, b"EFFECTIVE");
                        amended = attr_value(&e, b"AMENDED");
                        sectno.clear();
                        head.clear();
                        paragraphs.clear();
                    }
                }
                b"SECTNO" if in_section => target = TextTarget::Sectno,
                b"HEAD" if in_section && !in_paragraph => target = TextTarget::Head,
                b"P" | b"FP" if in_section => {
                    in_paragraph = true;
                    para_buf.clear();
                }
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"DIV8" if in_section => {
                    in_section = false;
                    if let Some(section) = finish_section(
                        title,
                        &current_part,
                        &attr_n,
                        &sectno,
                        &head,
                        &paragraphs,
                        effective.take(),
                        amended.take(),
                    ) {
                        sections.push(section);
                    }
                }
                b"SECTNO" => target = TextTarget::None,
                b"HEAD" => target = TextTarget::None,
                b"P" | b"FP" if in_paragraph => {
                    in_paragraph = false;
                    let text = collapse_inline_whitespace(&para_buf);
                    if !text.is_empty() {
                        paragraphs.push(text);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                if in_paragraph {
                    para_buf.push_str(&text);
                    para_buf.push(' ');
                } else {
                    match target {
                        TextTarget::Sectno => sectno.push_str(&text),
                        TextTarget::Head => head.push_str(&text),
                        TextTarget::None => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::Validation(format!(
                    "malformed part XML for title {title}: {e}"
                )))
            }
        }
    }

    Ok(sections)
}

#[allow(clippy::too_many_arguments)]
fn finish_section(
    title: u32,
    part: &str,
    attr_n: &str,
    sectno: &str,
    head: &str,
    paragraphs: &[String],
    effective: Option<String>,
    amended: Option<String>,
) -> Option<Section> {
    let section_id = if !attr_n.is_empty() {
        attr_n.to_string()
    } else {
        clean_sectno(sectno)
    };
    if section_id.is_empty() || paragraphs.is_empty() {
        return None;
    }

    // A part number can be missing on bare single-part payloads whose
    // DIV5 was elided; derive it from the section number prefix.
    let part = if part.is_empty() {
        section_id.split('.').next().unwrap_or_default().to_string()
    } else {
        part.to_string()
    };

    let heading = strip_section_prefix(head, &section_id);
    let source_url = format!(
        "https://www.ecfr.gov/current/title-{title}/section-{section_id}"
    );

    Some(Section {
        provenance: Provenance::Cfr {
            title,
            part,
        },
        jurisdiction: "US".to_string(),
        section_id,
        heading,
        text: paragraphs.join("\n\n"),
        subsections: Vec::new(),
        source_url,
        fetched_at: Utc::now(),
        effective_date: effective,
        last_amended: amended,
    })
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `"§ 117.3"` → `"117.3"`.
fn clean_sectno(sectno: &str) -> String {
    sectno.trim().trim_start_matches('§').trim().to_string()
}

/// Strip a leading `§ N.N` (and punctuation) off a section heading.
fn strip_section_prefix(head: &str, section_id: &str) -> String {
    let mut h = head.trim().trim_start_matches('§').trim();
    if let Some(rest) = h.strip_prefix(section_id) {
        h = rest.trim_start_matches(['.', ':', '-', ' ']);
    }
    collapse_inline_whitespace(h)
}

// ============ Pre-parse cache ============

/// What one cache pass over a title produced.
#[derive(Debug, Default)]
pub struct CacheSummary {
    pub parts_fetched: usize,
    pub parts_reparsed: usize,
    pub parts_unchanged: usize,
    pub sections_cached: usize,
    pub failures: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TitleManifest {
    pub title_number: u32,
    pub parts: Vec<String>,
    pub generated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RootManifest {
    #[serde(default)]
    pub titles: Vec<u32>,
    pub generated_at: Option<chrono::DateTime<Utc>>,
}

/// Fetch, parse, and cache every part of a title. Unchanged XML (by
/// hash) keeps its existing cached sections.
pub async fn cache_title(fetcher: &FederalFetcher, store: &ObjectStore) -> Result<CacheSummary> {
    let title = fetcher.title();
    let parts = fetcher.list_units().await?;
    let mut summary = CacheSummary::default();

    for part in &parts {
        let xml = match fetcher.fetch_part_xml(part).await {
            Ok(xml) => xml,
            Err(e) if e.is_unit_recoverable() => {
                warn!(title, part, error = %e, "skipping part in cache pass");
                summary.failures.push(format!("part {part}: {e}"));
                continue;
            }
            Err(e) => return Err(e),
        };
        summary.parts_fetched += 1;
        let xml_hash = hex::encode(Sha256::digest(xml.as_bytes()));

        let cache_key = keys::federal_cached_part(title, part);
        let existing: Option<CachedPart> = store.get_json(&cache_key).await?;
        if let Some(ref cached) = existing {
            if cached.metadata.xml_hash == xml_hash {
                summary.parts_unchanged += 1;
                summary.sections_cached += cached.sections.len();
                continue;
            }
        }

        let fetched_at = Utc::now();
        let sections = parse_part_xml(&xml, title)?;
        summary.parts_reparsed += 1;
        summary.sections_cached += sections.len();

        let raw = RawDocument::new(
            keys::federal_part_xml(title, part),
            xml.into_bytes(),
            &format!("cfr-title-{title}"),
            "cfr-part-xml",
        )
        .with_meta("title", title.to_string())
        .with_meta("part", part.as_str())
        .with_meta("xml_hash", xml_hash.as_str());
        store.put(&raw.key, &raw.bytes, &raw.metadata).await?;

        let cached = CachedPart {
            title_number: title,
            part_number: part.clone(),
            metadata: CachedPartMeta {
                fetched_at,
                parsed_at: Utc::now(),
                xml_hash,
                section_count: sections.len(),
            },
            sections,
        };
        store
            .put_json(&cache_key, &cached, &Default::default())
            .await?;
    }

    let manifest = TitleManifest {
        title_number: title,
        parts: parts.clone(),
        generated_at: Utc::now(),
    };
    store
        .put_json(&keys::federal_title_manifest(title), &manifest, &Default::default())
        .await?;

    let mut root: RootManifest = store
        .get_json(&keys::federal_cache_manifest())
        .await?
        .unwrap_or_default();
    if !root.titles.contains(&title) {
        root.titles.push(title);
        root.titles.sort_unstable();
    }
    root.generated_at = Some(Utc::now());
    store
        .put_json(&keys::federal_cache_manifest(), &root, &Default::default())
        .await?;

    Ok(summary)
}

/// Read one cached part, if the cache pass has produced it.
pub async fn load_cached_part(
    store: &ObjectStore,
    title: u32,
    part: &str,
) -> Result<Option<CachedPart>> {
    store.get_json(&keys::federal_cached_part(title, part)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WRAPPED_XML: &str = r#"<?xml version="1.0"?>
<ECFR>
  <DIV1 N="21" TYPE="TITLE">
    <DIV5 N="117" TYPE="PART">
      <HEAD>PART 117—CURRENT GOOD MANUFACTURING PRACTICE</HEAD>
      <DIV8 N="117.1" TYPE="SECTION">
        <SECTNO>§ 117.1</SECTNO>
        <HEAD>§ 117.1 Applicability and status.</HEAD>
        <P>Criteria in this part apply in determining whether food is adulterated.</P>
        <P>Compliance with this part is required.</P>
      </DIV8>
      <DIV8 N="117.3" TYPE="SECTION" EFFECTIVE="2015-11-16">
        <SECTNO>§ 117.3</SECTNO>
        <HEAD>§ 117.3 Definitions.</HEAD>
        <P>The definitions of terms in section 201 apply to such terms when used in this part.</P>
        <FP>Acid foods means foods that have a natural pH of 4.6 or below.</FP>
      </DIV8>
    </DIV5>
  </DIV1>
</ECFR>"#;

    const BARE_XML: &str = r#"<DIV5 N="117" TYPE="PART">
  <DIV8 N="117.5" TYPE="SECTION">
    <SECTNO>§ 117.5</SECTNO>
    <HEAD>§ 117.5 Exemptions.</HEAD>
    <P>Except as provided by subpart E, subparts C and G do not apply <E T="03">in part</E> to certain facilities.</P>
  </DIV8>
</DIV5>"#;

    #[test]
    fn parses_wrapped_full_title_xml() {
        let sections = parse_part_xml(WRAPPED_XML, 21).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].section_id, "117.1");
        assert_eq!(sections[0].heading, "Applicability and status.");
        assert!(sections[0].text.contains("adulterated"));
        assert!(sections[0].text.contains("\n\n"));
        assert_eq!(sections[1].effective_date.as_deref(), Some("2015-11-16"));
        match &sections[1].provenance {
            Provenance::Cfr { title, part } => {
                assert_eq!(*title, 21);
                assert_eq!(part, "117");
            }
            other => panic!("wrong provenance: {other:?}"),
        }
    }

    #[test]
    fn parses_bare_single_part_xml_with_inline_markup() {
        let sections = parse_part_xml(BARE_XML, 21).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].section_id, "117.5");
        // Inline <E> markup contributes its text.
        assert!(sections[0].text.contains("in part"));
        assert_eq!(
            sections[0].source_url,
            "https://www.ecfr.gov/current/title-21/section-117.5"
        );
    }

    #[test]
    fn jurisdiction_is_federal() {
        let sections = parse_part_xml(BARE_XML, 21).unwrap();
        assert_eq!(sections[0].jurisdiction, "US");
        assert_eq!(sections[0].source_type(), SourceType::Federal);
    }

    #[test]
    fn structure_walk_collects_parts_in_order() {
        let structure = json!({
            "type": "title",
            "identifier": "21",
            "children": [
                {
                    "type": "chapter",
                    "identifier": "I",
                    "children": [
                        { "type": "part", "identifier": "1" },
                        { "type": "subchapter", "identifier": "B", "children": [
                            { "type": "part", "identifier": "117" },
                            { "type": "part", "identifier": "120" },
                        ]},
                    ]
                }
            ]
        });
        let mut parts = Vec::new();
        collect_parts(&structure, &mut parts);
        assert_eq!(parts, vec!["1", "117", "120"]);
    }

    #[test]
    fn issue_date_prefers_latest_issue_date() {
        let titles = json!({
            "titles": [
                { "number": 21, "latest_issue_date": "2024-05-01", "up_to_date_as_of": "2024-05-10" },
                { "number": 40, "up_to_date_as_of": "2024-04-01" },
            ]
        });
        assert_eq!(pick_issue_date(&titles, 21).as_deref(), Some("2024-05-01"));
        assert_eq!(pick_issue_date(&titles, 40).as_deref(), Some("2024-04-01"));
        assert!(pick_issue_date(&titles, 7).is_none());
    }

    #[test]
    fn heading_prefix_stripping() {
        assert_eq!(strip_section_prefix("§ 117.3 Definitions.", "117.3"), "Definitions.");
        assert_eq!(strip_section_prefix("117.3 - Definitions.", "117.3"), "Definitions.");
        assert_eq!(strip_section_prefix("Definitions.", "117.3"), "Definitions.");
    }

    #[test]
    fn sectno_cleaning() {
        assert_eq!(clean_sectno("§ 117.3"), "117.3");
        assert_eq!(clean_sectno(" 117.3 "), "117.3");
    }
}
