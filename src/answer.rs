//! Prompt assembly and answer parsing.
//!
//! The system prompt is a fixed template: answer only from the provided
//! regulatory text, cite with `[N]` markers, organize by jurisdiction
//! level, and close with a "Required Permits" section. Parsing walks the
//! generated answer back into structure: resolved citations (out-of-range
//! markers become warnings, never errors), permits by field regex,
//! per-jurisdiction section text, and a 500-character summary.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::models::{CitationRef, Permit};

/// One retrieved chunk as presented to the model, 1-based by position.
#[derive(Debug, Clone)]
pub struct ContextChunk {
    pub chunk_id: String,
    pub citation: String,
    pub url: String,
    pub text: String,
}

/// Fixed system prompt for answer generation.
pub fn system_prompt() -> &'static str {
    "You are a legal-compliance research assistant. Answer only from the \
regulatory text provided in the user message; do not rely on outside \
knowledge. Cite every claim using [N] markers that refer to the numbered \
excerpts. Organize the answer by jurisdiction level, in this order and \
with these headings: ### Federal, ### State, ### County, ### Municipal. \
After the jurisdiction sections, append a section titled \"Required \
Permits\" listing each permit as: Permit Name, Issuing Agency, \
Jurisdiction, URL (if known), Regulatory Reference. If the provided \
excerpts do not cover a jurisdiction the question concerns, state: \
\"Insufficient coverage for definitive answer.\""
}

/// The user prompt: the question followed by numbered excerpts.
pub fn user_prompt(question: &str, chunks: &[ContextChunk]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str("Question: ");
    prompt.push_str(question);
    prompt.push_str("\n\nRegulatory excerpts:\n\n");
    for (i, chunk) in chunks.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n{}\n\n", i + 1, chunk.citation, chunk.text));
    }
    prompt
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("citation marker pattern is valid"))
}

/// Resolve `[N]` markers against the retrieval context. Each unique
/// in-range index becomes a [`CitationRef`]; out-of-range indices are
/// recorded as warnings and omitted.
pub fn parse_citations(
    answer: &str,
    chunks: &[ContextChunk],
) -> (Vec<CitationRef>, Vec<String>) {
    let mut citations: Vec<CitationRef> = Vec::new();
    let mut warnings = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    for caps in marker_re().captures_iter(answer) {
        let Ok(index) = caps[1].parse::<usize>() else {
            continue;
        };
        if !seen.insert(index) {
            continue;
        }
        if index == 0 || index > chunks.len() {
            warnings.push(format!(
                "citation [{index}] is out of range (retrieved {} chunks)",
                chunks.len()
            ));
            continue;
        }
        let chunk = &chunks[index - 1];
        citations.push(CitationRef {
            index,
            chunk_id: chunk.chunk_id.clone(),
            citation: chunk.citation.clone(),
            url: chunk.url.clone(),
        });
    }
    (citations, warnings)
}

fn permit_field_re(field: &str) -> Regex {
    Regex::new(&format!(r"(?im)^[\s*-]*{field}\s*[:*]+\s*(.+?)\s*$"))
        .expect("permit field pattern is valid")
}

/// Parse the "Required Permits" section into permit records.
pub fn parse_permits(answer: &str) -> Vec<Permit> {
    let Some(section) = section_after_heading(answer, "Required Permits") else {
        return Vec::new();
    };

    let name_re = permit_field_re("Permit Name");
    let agency_re = permit_field_re("Issuing Agency");
    let jurisdiction_re = permit_field_re("Jurisdiction");
    let url_re = permit_field_re("URL");
    let reference_re = permit_field_re(r"Regulatory Reference");

    // Items start at each "Permit Name" field.
    let mut starts: Vec<usize> = name_re.find_iter(&section).map(|m| m.start()).collect();
    starts.push(section.len());

    let mut permits = Vec::new();
    for window in starts.windows(2) {
        let block = &section[window[0]..window[1]];
        let Some(name) = first_capture(&name_re, block) else {
            continue;
        };
        permits.push(Permit {
            name,
            issuing_agency: first_capture(&agency_re, block).unwrap_or_default(),
            jurisdiction: first_capture(&jurisdiction_re, block).unwrap_or_default(),
            url: first_capture(&url_re, block).filter(|u| !u.is_empty()),
            regulatory_reference: first_capture(&reference_re, block).unwrap_or_default(),
        });
    }
    permits
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .map(|c| c[1].trim().trim_matches('*').trim().to_string())
}

/// Text from a `Required Permits`-style heading to the next heading.
fn section_after_heading(answer: &str, heading: &str) -> Option<String> {
    let heading_re = Regex::new(&format!(r"(?im)^#{{0,6}}\s*\**{heading}\**:?\s*$")).ok()?;
    let start = heading_re.find(answer)?.end();
    let rest = &answer[start..];
    let end = Regex::new(r"(?m)^#{1,6}\s")
        .ok()?
        .find(rest)
        .map(|m| m.start())
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// Split the answer at the four jurisdiction headings.
pub fn split_jurisdiction_sections(answer: &str) -> BTreeMap<String, String> {
    let heading_re =
        Regex::new(r"(?m)^###\s+(Federal|State|County|Municipal)\s*$").expect("valid pattern");
    let mut sections = BTreeMap::new();

    let matches: Vec<(String, usize, usize)> = heading_re
        .captures_iter(answer)
        .filter_map(|caps| {
            let m = caps.get(0)?;
            Some((caps[1].to_string(), m.start(), m.end()))
        })
        .collect();

    for (i, (name, _, end)) in matches.iter().enumerate() {
        let text_end = matches
            .get(i + 1)
            .map(|(_, start, _)| *start)
            .unwrap_or(answer.len());
        // A later section heading (e.g. Required Permits) ends the block.
        let block = &answer[*end..text_end];
        let block_end = Regex::new(r"(?m)^#{1,3}\s")
            .expect("valid pattern")
            .find(block)
            .map(|m| m.start())
            .unwrap_or(block.len());
        sections.insert(name.clone(), block[..block_end].trim().to_string());
    }
    sections
}

/// First paragraph of the answer (skipping headings), capped at 500
/// characters on a character boundary.
pub fn summarize(answer: &str) -> String {
    let first_paragraph = answer
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && !p.starts_with('#'))
        .unwrap_or("");
    first_paragraph.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(n: usize) -> Vec<ContextChunk> {
        (0..n)
            .map(|i| ContextChunk {
                chunk_id: format!("chunk-{i}"),
                citation: format!("21 C.F.R. § 117.{i}"),
                url: format!("https://www.ecfr.gov/s/{i}"),
                text: format!("Excerpt {i}"),
            })
            .collect()
    }

    #[test]
    fn user_prompt_numbers_from_one() {
        let prompt = user_prompt("What permits do I need?", &chunks(2));
        assert!(prompt.contains("[1] 21 C.F.R. § 117.0"));
        assert!(prompt.contains("[2] 21 C.F.R. § 117.1"));
        assert!(prompt.starts_with("Question: What permits"));
    }

    #[test]
    fn citations_resolve_one_based_and_dedupe() {
        let answer = "Registration is required [1]. Renewals happen biennially [2], see also [1].";
        let (citations, warnings) = parse_citations(answer, &chunks(3));
        assert!(warnings.is_empty());
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].index, 1);
        assert_eq!(citations[0].chunk_id, "chunk-0");
        assert_eq!(citations[1].index, 2);
    }

    #[test]
    fn out_of_range_marker_warns_and_is_omitted() {
        let answer = "A valid claim [2]. A hallucinated one [99].";
        let (citations, warnings) = parse_citations(answer, &chunks(10));
        assert_eq!(citations.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("[99]"));
    }

    #[test]
    fn permits_parse_fields_including_optional_url() {
        let answer = "\
### Municipal

Body text [3].

## Required Permits

- Permit Name: Food Dealer's Permit
  Issuing Agency: Houston Health Department
  Jurisdiction: TX-houston
  URL: https://houstonhealth.example.com/permits
  Regulatory Reference: Houston, Tex., Code § 20-21

- Permit Name: Sales and Use Tax Permit
  Issuing Agency: Texas Comptroller
  Jurisdiction: TX
  Regulatory Reference: Tex. Tax Code Ann. § 151.201
";
        let permits = parse_permits(answer);
        assert_eq!(permits.len(), 2);
        assert_eq!(permits[0].name, "Food Dealer's Permit");
        assert_eq!(permits[0].jurisdiction, "TX-houston");
        assert!(permits[0].url.as_deref().unwrap().contains("houstonhealth"));
        assert!(permits[1].url.is_none());
        assert_eq!(
            permits[1].regulatory_reference,
            "Tex. Tax Code Ann. § 151.201"
        );
    }

    #[test]
    fn no_permits_section_is_empty() {
        assert!(parse_permits("### Federal\n\nNothing here [1].").is_empty());
    }

    #[test]
    fn jurisdiction_sections_split() {
        let answer = "\
### Federal

Federal registration applies [1].

### State

State licensing applies [2].

### Municipal

City permit required [3].

## Required Permits

- Permit Name: X
";
        let sections = split_jurisdiction_sections(answer);
        assert_eq!(sections.len(), 3);
        assert!(sections["Federal"].contains("registration"));
        assert!(sections["State"].contains("licensing"));
        assert!(sections["Municipal"].contains("City permit"));
        assert!(!sections["Municipal"].contains("Permit Name"));
    }

    #[test]
    fn summary_is_first_paragraph_capped() {
        let answer = format!("### Federal\n\n{}\n\nSecond paragraph.", "word ".repeat(200));
        let summary = summarize(&answer);
        assert_eq!(summary.chars().count(), 500);
        assert!(summary.starts_with("word"));

        assert_eq!(summarize("### Heading\n\nShort answer."), "Short answer.");
    }
}
