use std::path::Path;

use crate::config::DocChunkConfig;

#[derive(Debug, Clone)]
pub struct DocChunk {
    pub chunk_index: u32,
    pub section_title: Option<String>,
    pub content: String,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
}

struct RawSection {
    title: Option<String>,
    level: u8,
    body: String,
}

fn parse_heading(line: &str) -> Option<(u8, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') && !rest.is_empty() {
        return None;
    }
    Some((hashes as u8, rest.trim().to_string()))
}

/// Splits by heading hierarchy: each heading opens a section whose body
/// extends to the next heading of equal or higher level (a smaller or equal
/// `level` number — i.e. a deeper sub-heading does NOT close it, its text
/// stays nested inside the parent's body), or end of file. A preamble
/// section (title=None) covers anything before the first heading.
fn split_sections(content: &str) -> Vec<RawSection> {
    let lines: Vec<&str> = content.lines().collect();

    struct Heading {
        level: u8,
        title: String,
        line_idx: usize,
    }
    let mut headings = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some((level, title)) = parse_heading(line) {
            headings.push(Heading { level, title, line_idx: i });
        }
    }

    let mut sections = Vec::new();

    let preamble_end = headings.first().map(|h| h.line_idx).unwrap_or(lines.len());
    sections.push(RawSection { title: None, level: 0, body: lines[..preamble_end].join("\n") });

    for (i, h) in headings.iter().enumerate() {
        let body_start = h.line_idx + 1;
        let body_end = headings[i + 1..]
            .iter()
            .find(|next| next.level <= h.level)
            .map(|next| next.line_idx)
            .unwrap_or(lines.len());
        let body = if body_start < body_end { lines[body_start..body_end].join("\n") } else { String::new() };
        sections.push(RawSection { title: Some(h.title.clone()), level: h.level, body });
    }
    sections
}

/// Splits oversize section bodies into overlapping sub-chunks. Split points
/// prefer ". " boundaries within the second half of the window, then
/// newline boundaries, then a hard cut.
fn chunk_content(body: &str, cfg: &DocChunkConfig) -> Vec<String> {
    let chars: Vec<char> = body.chars().collect();
    if chars.len() <= cfg.max_chunk_size {
        return vec![body.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + cfg.max_chunk_size).min(chars.len());
        let mut end = hard_end;

        if hard_end < chars.len() {
            let half = start + cfg.max_chunk_size / 2;
            let window: String = chars[half..hard_end].iter().collect();
            if let Some(byte_pos) = window.rfind(". ") {
                let char_pos = window[..byte_pos].chars().count();
                end = half + char_pos + 2;
            } else if let Some(byte_pos) = window.rfind('\n') {
                let char_pos = window[..byte_pos].chars().count();
                end = half + char_pos + 1;
            }
        }

        if end <= start {
            end = hard_end;
        }

        let chunk: String = chars[start..end].iter().collect();
        chunks.push(chunk);

        if end >= chars.len() {
            break;
        }
        start = if end > cfg.overlap && end - cfg.overlap > start {
            end - cfg.overlap
        } else {
            end
        };
    }

    chunks
}

/// Locates the line range of `chunk` within the original file by scanning
/// for the chunk's first non-blank line.
fn locate_line_range(original_lines: &[&str], chunk: &str) -> (Option<u32>, Option<u32>) {
    let chunk_lines: Vec<&str> = chunk.lines().collect();
    let Some(first_line) = chunk_lines.iter().find(|l| !l.trim().is_empty()) else {
        return (None, None);
    };

    let Some(start_idx) = original_lines.iter().position(|l| l == first_line) else {
        return (None, None);
    };

    let line_count = chunk_lines.len().max(1);
    let end_idx = (start_idx + line_count - 1).min(original_lines.len().saturating_sub(1));
    (Some(start_idx as u32 + 1), Some(end_idx as u32 + 1))
}

/// Segments a prose document into retrieval chunks per the heading-hierarchy
/// + overlapping-sub-chunk algorithm. Discards sub-chunks shorter than
/// `cfg.min_chunk_size`.
pub fn chunk_document(content: &str, cfg: &DocChunkConfig) -> Vec<DocChunk> {
    let original_lines: Vec<&str> = content.lines().collect();
    let sections = split_sections(content);

    let mut out = Vec::new();
    let mut chunk_index = 0u32;

    for section in sections {
        if section.body.trim().is_empty() {
            continue;
        }
        for sub in chunk_content(&section.body, cfg) {
            if sub.trim().chars().count() < cfg.min_chunk_size {
                continue;
            }
            let (line_start, line_end) = locate_line_range(&original_lines, &sub);
            out.push(DocChunk {
                chunk_index,
                section_title: section.title.clone(),
                content: sub,
                line_start,
                line_end,
            });
            chunk_index += 1;
        }
    }

    out
}

const README_STEM: &str = "readme";

pub fn doc_type_for_path(path: &Path) -> &'static str {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    if stem == README_STEM {
        "readme"
    } else {
        "markdown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cfg() -> DocChunkConfig {
        DocChunkConfig::default()
    }

    #[test]
    fn preamble_and_sections_are_separated() {
        let content = "intro text\n\n# Installation\nrun the installer\n\n# Usage\ndo things\n";
        let chunks = chunk_document(content, &cfg());
        assert!(chunks.iter().any(|c| c.section_title.is_none() && c.content.contains("intro")));
        assert!(chunks.iter().any(|c| c.section_title.as_deref() == Some("Installation")));
        assert!(chunks.iter().any(|c| c.section_title.as_deref() == Some("Usage")));
    }

    #[test]
    fn section_ends_at_equal_or_higher_heading() {
        let content = "# Top\nbody top\n## Sub\nbody sub\n# Next\nbody next\n";
        let chunks = chunk_document(content, &cfg());
        let top = chunks.iter().find(|c| c.section_title.as_deref() == Some("Top")).unwrap();
        // A deeper sub-heading does not close the parent section: its text
        // stays nested inside "Top"'s body.
        assert!(top.content.contains("body top"));
        assert!(top.content.contains("body sub"));
        assert!(!top.content.contains("body next"));

        // The sub-heading also gets its own section covering just its body.
        let sub = chunks.iter().find(|c| c.section_title.as_deref() == Some("Sub")).unwrap();
        assert!(sub.content.contains("body sub"));
        assert!(!sub.content.contains("body top"));

        let next = chunks.iter().find(|c| c.section_title.as_deref() == Some("Next")).unwrap();
        assert!(next.content.contains("body next"));
    }

    #[test]
    fn oversize_section_is_split_with_overlap() {
        let sentence = "This is a sentence with some words in it. ";
        let body = sentence.repeat(60);
        let content = format!("# Big\n{body}\n");
        let mut small_cfg = cfg();
        small_cfg.max_chunk_size = 200;
        small_cfg.overlap = 20;
        small_cfg.min_chunk_size = 10;
        let chunks = chunk_document(&content, &small_cfg);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.chars().count() <= small_cfg.max_chunk_size + 2);
        }
    }

    #[test]
    fn tiny_sections_are_discarded() {
        let content = "# A\nhi\n# B\nthis one is long enough to survive the minimum chunk size filter easily\n";
        let chunks = chunk_document(content, &cfg());
        assert!(chunks.iter().all(|c| c.section_title.as_deref() != Some("A")));
    }

    #[test]
    fn readme_stem_is_classified_specially() {
        assert_eq!(doc_type_for_path(&PathBuf::from("README.md")), "readme");
        assert_eq!(doc_type_for_path(&PathBuf::from("readme.markdown")), "readme");
        assert_eq!(doc_type_for_path(&PathBuf::from("CHANGELOG.md")), "markdown");
    }
}
