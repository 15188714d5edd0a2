//! Structure-aware chunking of parsed sections.
//!
//! The decision procedure, in order:
//!
//! 1. A section that fits the token budget becomes exactly one chunk.
//! 2. A too-large section with detected subsections emits one chunk per
//!    subsection, splitting any oversized subsection by paragraphs.
//! 3. Otherwise the section text is split at paragraph boundaries, with a
//!    trailing-paragraph overlap seeded into each following chunk so
//!    cross-references like "as defined in paragraph (a)" survive the cut.
//!
//! Token counts come from [`crate::tokenizer`] — the same BPE the
//! embedding service applies — and any chunk still over budget after the
//! procedure fails fast rather than reaching the embedder.

use crate::citation::{chunk_id, format_citation, hierarchy, source_id};
use crate::error::{Error, Result};
use crate::models::{Chunk, Section};
use crate::tokenizer::count_tokens;

/// Per-source context carried onto every chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkContext {
    /// Activity tag, e.g. `"food-service"`.
    pub category: Option<String>,
    /// ISO date of the last upstream content change, when known.
    pub last_updated: Option<String>,
}

/// Chunk one section. `max_tokens` is the soft budget (1500 in normal
/// operation); `overlap_ratio` the trailing-overlap fraction (0.15).
pub fn chunk_section(
    section: &Section,
    ctx: &ChunkContext,
    max_tokens: usize,
    overlap_ratio: f64,
) -> Result<Vec<Chunk>> {
    let overlap_tokens = (max_tokens as f64 * overlap_ratio) as usize;

    // (subsection tag, text) pieces in document order.
    let mut pieces: Vec<(Option<String>, String)> = Vec::new();

    if count_tokens(&section.text) <= max_tokens {
        pieces.push((None, section.text.clone()));
    } else if !section.subsections.is_empty() {
        for sub in &section.subsections {
            if count_tokens(&sub.text) <= max_tokens {
                pieces.push((Some(sub.id.clone()), sub.text.clone()));
            } else {
                for part in paragraph_chunks(&sub.text, max_tokens, overlap_tokens) {
                    pieces.push((Some(sub.id.clone()), part));
                }
            }
        }
    } else {
        for part in paragraph_chunks(&section.text, max_tokens, overlap_tokens) {
            pieces.push((None, part));
        }
    }

    let total_chunks = pieces.len();
    let sid = source_id(&section.provenance);
    let source_type = section.source_type();
    let crumbs = hierarchy(&section.provenance, &section.section_id, &section.heading);
    // Recency means upstream content change, not fetch time.
    let last_updated = ctx
        .last_updated
        .clone()
        .or_else(|| section.last_amended.clone())
        .or_else(|| section.effective_date.clone());

    let chunks: Vec<Chunk> = pieces
        .into_iter()
        .enumerate()
        .map(|(index, (subsection, text))| Chunk {
            chunk_id: chunk_id(&sid, &section.section_id, subsection.as_deref(), index),
            source_id: sid.clone(),
            source_type,
            jurisdiction: section.jurisdiction.clone(),
            citation: format_citation(
                &section.provenance,
                &section.section_id,
                subsection.as_deref(),
            ),
            url: section.source_url.clone(),
            chunk_index: index,
            total_chunks,
            subsection,
            category: ctx.category.clone(),
            hierarchy: crumbs.clone(),
            effective_date: section.effective_date.clone(),
            last_amended: section.last_amended.clone(),
            last_updated: last_updated.clone(),
            indexed_at: None,
            text,
        })
        .collect();

    // Fail fast on anything still over budget (a pathological paragraph):
    // the embedder must never see it.
    let oversized: Vec<String> = chunks
        .iter()
        .filter_map(|c| {
            let tokens = count_tokens(&c.text);
            (tokens > max_tokens).then(|| format!("{} ({tokens} tokens)", c.citation))
        })
        .collect();
    if !oversized.is_empty() {
        return Err(Error::Validation(format!(
            "chunk(s) exceed the {max_tokens}-token budget: {}",
            oversized.join(", ")
        )));
    }

    Ok(chunks)
}

/// Greedy paragraph accumulation with trailing overlap.
///
/// Budget checks count the *joined* candidate text, not a sum of parts:
/// the `\n\n` separators carry tokens of their own and the ≤ budget
/// invariant is on the emitted chunk text.
fn paragraph_chunks(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let paragraphs = split_paragraphs(text);
    if paragraphs.is_empty() {
        return vec![text.trim().to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    // Paragraphs in the chunk under construction.
    let mut current: Vec<String> = Vec::new();

    for para in paragraphs {
        if !current.is_empty() {
            let candidate = format!("{}\n\n{para}", current.join("\n\n"));
            if count_tokens(&candidate) > max_tokens {
                chunks.push(current.join("\n\n"));

                // Seed the next chunk with the most recent full
                // paragraphs that fit the overlap budget.
                let mut seed: Vec<String> = Vec::new();
                for p in current.iter().rev() {
                    let mut attempt = vec![p.clone()];
                    attempt.extend(seed.iter().cloned());
                    if count_tokens(&attempt.join("\n\n")) > overlap_tokens {
                        break;
                    }
                    seed = attempt;
                }
                // The overlap is best-effort: drop it rather than overflow.
                if !seed.is_empty() {
                    let seeded = format!("{}\n\n{para}", seed.join("\n\n"));
                    if count_tokens(&seeded) > max_tokens {
                        seed.clear();
                    }
                }
                current = seed;
            }
        }
        current.push(para);
    }

    if !current.is_empty() {
        chunks.push(current.join("\n\n"));
    }
    chunks
}

/// Split at blank lines or at a newline followed by indentation (the
/// common layout of lettered legal paragraphs).
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();

    let mut flush = |current: &mut String, paragraphs: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            paragraphs.push(trimmed.to_string());
        }
        current.clear();
    };

    for line in text.lines() {
        if line.trim().is_empty() {
            flush(&mut current, &mut paragraphs);
        } else if (line.starts_with(' ') || line.starts_with('\t')) && !current.trim().is_empty() {
            flush(&mut current, &mut paragraphs);
            current.push_str(line.trim_start());
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    flush(&mut current, &mut paragraphs);
    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provenance, Subsection};
    use chrono::Utc;

    fn section(text: &str, subsections: Vec<Subsection>) -> Section {
        Section {
            provenance: Provenance::Cfr {
                title: 21,
                part: "117".into(),
            },
            jurisdiction: "US".into(),
            section_id: "117.3".into(),
            heading: "Definitions".into(),
            text: text.to_string(),
            subsections,
            source_url: "https://www.ecfr.gov/current/title-21/section-117.3".into(),
            fetched_at: Utc::now(),
            effective_date: None,
            last_amended: None,
        }
    }

    fn sentence(n: usize) -> String {
        (0..n)
            .map(|i| format!("Requirement number {i} applies to every covered facility."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn section_within_budget_is_one_chunk() {
        let text = sentence(5);
        let budget = count_tokens(&text);
        let chunks = chunk_section(&section(&text, vec![]), &ChunkContext::default(), budget, 0.15)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].citation, "21 C.F.R. § 117.3");
        assert!(chunks[0].url.contains("ecfr.gov"));
    }

    #[test]
    fn oversized_section_splits_with_contiguous_indices() {
        let text = format!("{}\n\n{}\n\n{}", sentence(8), sentence(8), sentence(8));
        let budget = count_tokens(&sentence(8)) * 2;
        let chunks = chunk_section(&section(&text, vec![]), &ChunkContext::default(), budget, 0.15)
            .unwrap();
        assert!(chunks.len() >= 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert_eq!(c.total_chunks, chunks.len());
            assert!(count_tokens(&c.text) <= budget);
        }
    }

    #[test]
    fn overlap_carries_the_trailing_paragraph() {
        let a = sentence(4);
        let b = sentence(4);
        let c = sentence(4);
        let text = format!("{a}\n\n{b}\n\n{c}");
        let para = count_tokens(&a);
        // Two paragraphs fit; overlap budget covers one full paragraph.
        let budget = para * 2 + 4;
        let chunks =
            chunk_section(&section(&text, vec![]), &ChunkContext::default(), budget, 0.5).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with(&a));
        // The second chunk is seeded with the overlap paragraph.
        assert!(chunks[1].text.starts_with(&b));
        assert!(chunks[1].text.ends_with(&c));
    }

    #[test]
    fn subsections_chunk_one_each_when_they_fit() {
        let subs = vec![
            Subsection {
                id: "(a)".into(),
                text: sentence(6),
            },
            Subsection {
                id: "(b)".into(),
                text: sentence(6),
            },
            Subsection {
                id: "(c)".into(),
                text: sentence(6),
            },
        ];
        let full: String = subs.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n\n");
        let budget = count_tokens(&sentence(6)) + 8;
        let chunks =
            chunk_section(&section(&full, subs), &ChunkContext::default(), budget, 0.15).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].subsection.as_deref(), Some("(a)"));
        assert_eq!(chunks[2].subsection.as_deref(), Some("(c)"));
        assert_eq!(chunks[0].citation, "21 C.F.R. § 117.3(a)");
        assert_eq!(chunks[2].chunk_index, 2);
        assert_eq!(chunks[2].total_chunks, 3);
    }

    #[test]
    fn oversized_subsection_splits_but_keeps_its_tag() {
        let big = format!("{}\n\n{}\n\n{}", sentence(6), sentence(6), sentence(6));
        let subs = vec![
            Subsection {
                id: "(a)".into(),
                text: sentence(3),
            },
            Subsection {
                id: "(b)".into(),
                text: big.clone(),
            },
        ];
        let full = format!("{}\n\n{big}", sentence(3));
        let budget = count_tokens(&sentence(6)) * 2;
        let chunks =
            chunk_section(&section(&full, subs), &ChunkContext::default(), budget, 0.15).unwrap();
        assert!(chunks.len() >= 3);
        let b_chunks: Vec<_> = chunks
            .iter()
            .filter(|c| c.subsection.as_deref() == Some("(b)"))
            .collect();
        assert!(b_chunks.len() >= 2);
    }

    #[test]
    fn pathological_paragraph_fails_fast_with_citation() {
        // One paragraph, no split points, way over budget.
        let text = sentence(40).replace("\n", " ");
        let budget = count_tokens(&sentence(5));
        let err = chunk_section(&section(&text, vec![]), &ChunkContext::default(), budget, 0.15)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("21 C.F.R. § 117.3"));
        assert!(msg.contains("tokens"));
    }

    #[test]
    fn chunk_ids_are_reproducible_across_runs() {
        let text = format!("{}\n\n{}\n\n{}", sentence(8), sentence(8), sentence(8));
        let s = section(&text, vec![]);
        let budget = count_tokens(&sentence(8)) * 2;
        let a = chunk_section(&s, &ChunkContext::default(), budget, 0.15).unwrap();
        let b = chunk_section(&s, &ChunkContext::default(), budget, 0.15).unwrap();
        let ids_a: Vec<_> = a.iter().map(|c| c.chunk_id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|c| c.chunk_id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn indented_lines_start_new_paragraphs() {
        let text = "Lead-in sentence.\n   (a) First item text.\n   (b) Second item text.";
        let paragraphs = split_paragraphs(text);
        assert_eq!(paragraphs.len(), 3);
        assert!(paragraphs[1].starts_with("(a)"));
    }
}
