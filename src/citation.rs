//! Bluebook citation formatting, hierarchy breadcrumbs, and stable IDs.
//!
//! Every function here is pure: the same identifiers always produce the
//! same citation, breadcrumb list, or ID. Re-running ingestion over an
//! unchanged source therefore yields byte-identical chunk IDs, which is
//! what makes vector upserts idempotent.

use sha2::{Digest, Sha256};

use crate::models::Provenance;

/// Lowercase a name into `[a-z0-9-]`: spaces become hyphens, everything
/// else non-alphanumeric is stripped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().to_lowercase().chars() {
        match ch {
            'a'..='z' | '0'..='9' | '-' => slug.push(ch),
            ' ' => slug.push('-'),
            _ => {}
        }
    }
    // Collapse runs introduced by stripped characters.
    let mut out = String::with_capacity(slug.len());
    let mut prev_dash = false;
    for ch in slug.chars() {
        if ch == '-' {
            if !prev_dash && !out.is_empty() {
                out.push('-');
            }
            prev_dash = true;
        } else {
            out.push(ch);
            prev_dash = false;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Bluebook abbreviation for a postal state code. Unknown states fall
/// back to the postal code itself.
pub fn bluebook_state(postal: &str) -> &str {
    match postal {
        "AL" => "Ala.",
        "AZ" => "Ariz.",
        "AR" => "Ark.",
        "CA" => "Cal.",
        "CO" => "Colo.",
        "FL" => "Fla.",
        "GA" => "Ga.",
        "IL" => "Ill.",
        "LA" => "La.",
        "NM" => "N.M.",
        "NY" => "N.Y.",
        "OK" => "Okla.",
        "TX" => "Tex.",
        "WA" => "Wash.",
        other => other,
    }
}

/// Full name of a Texas statute code abbreviation, for citations like
/// `Tex. Penal Code Ann. § 30.02`.
pub fn statute_code_name(code: &str) -> &str {
    match code {
        "AG" => "Agriculture",
        "AL" => "Alcoholic Beverage",
        "BC" => "Business & Commerce",
        "BO" => "Business Organizations",
        "CP" => "Civil Practice & Remedies",
        "ED" => "Education",
        "FI" => "Finance",
        "GV" => "Government",
        "HS" => "Health & Safety",
        "IN" => "Insurance",
        "LA" => "Labor",
        "LG" => "Local Government",
        "NR" => "Natural Resources",
        "OC" => "Occupations",
        "PE" => "Penal",
        "PR" => "Property",
        "TX" => "Tax",
        "TN" => "Transportation",
        "WA" => "Water",
        other => other,
    }
}

/// Format a Bluebook-style citation for a section, with the subsection
/// appended when present (`21 C.F.R. § 117.3(a)`).
pub fn format_citation(provenance: &Provenance, section_id: &str, subsection: Option<&str>) -> String {
    let base = match provenance {
        Provenance::Cfr { title, .. } => format!("{title} C.F.R. § {section_id}"),
        Provenance::TexasStatute { code_name, .. } => {
            format!("Tex. {code_name} Code Ann. § {section_id}")
        }
        Provenance::TexasAdminCode { title, .. } => {
            format!("{title} Tex. Admin. Code § {section_id}")
        }
        Provenance::County {
            county_name, state, ..
        } => format!("{county_name}, {}, Code § {section_id}", bluebook_state(state)),
        Provenance::Municipal { state, city, .. } => {
            format!("{city}, {}, Code § {section_id}", bluebook_state(state))
        }
    };
    match subsection {
        Some(sub) if !sub.is_empty() => format!("{base}{sub}"),
        _ => base,
    }
}

/// Ordered hierarchy breadcrumbs, outermost first, ending at the section.
pub fn hierarchy(provenance: &Provenance, section_id: &str, heading: &str) -> Vec<String> {
    let leaf = if heading.is_empty() {
        format!("§ {section_id}")
    } else {
        format!("§ {section_id} {heading}")
    };
    match provenance {
        Provenance::Cfr { title, part } => vec![
            format!("Title {title}"),
            format!("Part {part}"),
            leaf,
        ],
        Provenance::TexasStatute {
            code_name, chapter, ..
        } => vec![
            format!("Texas {code_name} Code"),
            format!("Chapter {chapter}"),
            leaf,
        ],
        Provenance::TexasAdminCode { title, chapter } => vec![
            format!("Texas Administrative Code Title {title}"),
            format!("Chapter {chapter}"),
            leaf,
        ],
        Provenance::County {
            county_name,
            chapter,
            ..
        } => vec![
            format!("{county_name} Code of Ordinances"),
            format!("Chapter {chapter}"),
            leaf,
        ],
        Provenance::Municipal { city, chapter, .. } => vec![
            format!("{city} Code of Ordinances"),
            format!("Chapter {chapter}"),
            leaf,
        ],
    }
}

/// Stable source identifier, e.g. `cfr-title-21`, `tx-statute-PE`,
/// `tx-tac-16`, `county-TX-48201`, `muni-TX-houston`.
pub fn source_id(provenance: &Provenance) -> String {
    match provenance {
        Provenance::Cfr { title, .. } => format!("cfr-title-{title}"),
        Provenance::TexasStatute { code, .. } => format!("tx-statute-{code}"),
        Provenance::TexasAdminCode { title, .. } => format!("tx-tac-{title}"),
        Provenance::County { county_id, .. } => format!("county-{county_id}"),
        Provenance::Municipal { state, city, .. } => {
            format!("muni-{state}-{}", slugify(city))
        }
    }
}

/// Deterministic chunk ID: a readable prefix plus a digest over the full
/// identifier tuple so distinct subsections of the same index never
/// collide.
pub fn chunk_id(
    source_id: &str,
    section_id: &str,
    subsection: Option<&str>,
    chunk_index: usize,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"|");
    hasher.update(section_id.as_bytes());
    hasher.update(b"|");
    hasher.update(subsection.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(chunk_index.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{source_id}-{section_id}-{chunk_index}-{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfr() -> Provenance {
        Provenance::Cfr {
            title: 21,
            part: "117".into(),
        }
    }

    #[test]
    fn slugs_are_lowercase_hyphenated() {
        assert_eq!(slugify("Houston"), "houston");
        assert_eq!(slugify("San Antonio"), "san-antonio");
        assert_eq!(slugify("O'Fallon  Park"), "ofallon-park");
        assert_eq!(slugify("  Corpus Christi "), "corpus-christi");
    }

    #[test]
    fn federal_citation() {
        assert_eq!(format_citation(&cfr(), "117.3", None), "21 C.F.R. § 117.3");
        assert_eq!(
            format_citation(&cfr(), "117.3", Some("(a)")),
            "21 C.F.R. § 117.3(a)"
        );
    }

    #[test]
    fn statute_citation() {
        let p = Provenance::TexasStatute {
            code: "PE".into(),
            code_name: statute_code_name("PE").into(),
            chapter: "30".into(),
        };
        assert_eq!(
            format_citation(&p, "30.02", None),
            "Tex. Penal Code Ann. § 30.02"
        );
    }

    #[test]
    fn tac_citation() {
        let p = Provenance::TexasAdminCode {
            title: 16,
            chapter: "5".into(),
        };
        assert_eq!(format_citation(&p, "5.31", None), "16 Tex. Admin. Code § 5.31");
    }

    #[test]
    fn municipal_citation() {
        let p = Provenance::Municipal {
            state: "TX".into(),
            city: "Houston".into(),
            chapter: "1".into(),
        };
        assert_eq!(format_citation(&p, "1-2", None), "Houston, Tex., Code § 1-2");
    }

    #[test]
    fn source_ids_are_canonical() {
        assert_eq!(source_id(&cfr()), "cfr-title-21");
        let muni = Provenance::Municipal {
            state: "TX".into(),
            city: "San Antonio".into(),
            chapter: "10".into(),
        };
        assert_eq!(source_id(&muni), "muni-TX-san-antonio");
        let county = Provenance::County {
            county_id: "TX-48201".into(),
            county_name: "Harris County".into(),
            state: "TX".into(),
            chapter: "10".into(),
        };
        assert_eq!(source_id(&county), "county-TX-48201");
    }

    #[test]
    fn chunk_ids_are_deterministic_and_distinct() {
        let a = chunk_id("cfr-title-21", "117.3", None, 0);
        let b = chunk_id("cfr-title-21", "117.3", None, 0);
        let c = chunk_id("cfr-title-21", "117.3", None, 1);
        let d = chunk_id("cfr-title-21", "117.3", Some("(a)"), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("cfr-title-21-117.3-0-"));
    }

    #[test]
    fn hierarchy_is_outermost_first() {
        let crumbs = hierarchy(&cfr(), "117.3", "Definitions");
        assert_eq!(
            crumbs,
            vec![
                "Title 21".to_string(),
                "Part 117".to_string(),
                "§ 117.3 Definitions".to_string()
            ]
        );
    }
}
