use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::params;
use serde::Serialize;

use crate::embedder::Embedder;
use crate::errors::Result;
use crate::store::{BmHit, SearchTable, Store, VecHit};
use crate::validation::sanitize_fts_query;

/// Task-type prefix for the query side of an asymmetric retrieval pair —
/// the natural-language question being matched against indexed code/prose.
const TASK_QUERY_SIDE: &str = "nl2code";

const BM25_LIMIT: usize = 50;
const VECTOR_K: usize = 50;
const RRF_K: f64 = 60.0;
const SINGLE_SOURCE_CAP: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Hybrid,
    Keyword,
    Semantic,
}

impl MatchReason {
    pub fn label(self) -> &'static str {
        match self {
            MatchReason::Hybrid => "hybrid (BM25 + semantic)",
            MatchReason::Keyword => "keyword match (BM25)",
            MatchReason::Semantic => "semantic match (vector)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HybridHit {
    pub row_id: i64,
    pub fused_score: f64,
    pub confidence: f64,
    pub match_reason: MatchReason,
}

/// Reciprocal-rank fusion over independent BM25 and vector result lists for
/// one `table`. A query-parse failure in the lexical leg degrades silently
/// to an empty BM25 list rather than propagating an error (§4.F).
pub fn hybrid_search(store: &Store, table: SearchTable, query: &str, query_vec: &[f32], top_n: usize) -> Result<Vec<HybridHit>> {
    let bm_hits: Vec<BmHit> = store.bm25_search(table, &sanitize_fts_query(query), BM25_LIMIT)?;
    let vec_hits: Vec<VecHit> = store.vector_search(table, query_vec, VECTOR_K)?;

    let mut bm_rank: HashMap<i64, usize> = HashMap::new();
    for (i, h) in bm_hits.iter().enumerate() {
        bm_rank.insert(h.row_id, i + 1);
    }
    let mut vec_rank: HashMap<i64, usize> = HashMap::new();
    for (i, h) in vec_hits.iter().enumerate() {
        vec_rank.insert(h.row_id, i + 1);
    }

    let mut ids: Vec<i64> = bm_rank.keys().chain(vec_rank.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let hybrid_max = 2.0 / (RRF_K + 1.0);
    let single_max = 1.0 / (RRF_K + 1.0);

    let mut hits: Vec<HybridHit> = ids
        .into_iter()
        .map(|id| {
            let b = bm_rank.get(&id).copied();
            let v = vec_rank.get(&id).copied();
            let mut score = 0.0;
            if let Some(r) = b {
                score += 1.0 / (RRF_K + r as f64);
            }
            if let Some(r) = v {
                score += 1.0 / (RRF_K + r as f64);
            }
            let (match_reason, confidence) = match (b, v) {
                (Some(_), Some(_)) => (MatchReason::Hybrid, (score / hybrid_max).min(1.0)),
                (Some(_), None) => (MatchReason::Keyword, (score / single_max).min(1.0).min(SINGLE_SOURCE_CAP)),
                (None, Some(_)) => (MatchReason::Semantic, (score / single_max).min(1.0).min(SINGLE_SOURCE_CAP)),
                (None, None) => unreachable!("id only ever comes from one of the two rank maps"),
            };
            HybridHit { row_id: id, fused_score: score, confidence, match_reason }
        })
        .collect();

    hits.sort_by(|a, b| b.fused_score.partial_cmp(&a.fused_score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_n);
    Ok(hits)
}

/// Up to three highlighted snippets for a BM25 hit: the FTS5 snippet
/// primitive first, falling back to a naive substring scan of the stored
/// source text when the primitive itself errors.
fn snippets_for_symbol(store: &Store, symbol_id: i64, query: &str) -> Vec<String> {
    if let Some(s) = store.symbol_snippets(symbol_id, &sanitize_fts_query(query)) {
        if !s.is_empty() {
            return s;
        }
    }
    simple_highlights(store.symbol_source_text(symbol_id).ok().flatten().as_deref().unwrap_or(""), query)
}

/// Naive substring fallback: up to three lines of `text` containing any
/// whitespace-separated query term, case sensitivity and word boundaries
/// intentionally left unspecified per §9 open questions.
fn simple_highlights(text: &str, query: &str) -> Vec<String> {
    let terms: Vec<String> = query.split_whitespace().map(|t| t.to_lowercase()).collect();
    text.lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            terms.iter().any(|t| !t.is_empty() && lower.contains(t.as_str()))
        })
        .take(3)
        .map(|l| l.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ParentInfo {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefinitionResult {
    pub symbol_id: i64,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub line_start: u32,
    pub line_end: u32,
    pub match_reason: String,
    pub confidence: f64,
    pub snippets: Vec<String>,
    pub parent: Option<ParentInfo>,
    pub docstring: Option<String>,
    pub signature: Option<String>,
}

struct SymbolRow {
    id: i64,
    file_id: i64,
    file_path: String,
    name: String,
    kind: String,
    line_start: u32,
    line_end: u32,
    parent_symbol_id: Option<i64>,
    source_text: String,
    signature: String,
}

fn fetch_symbol(store: &Store, id: i64) -> Result<Option<SymbolRow>> {
    use rusqlite::OptionalExtension;
    Ok(store
        .conn()
        .query_row(
            "SELECT s.id, s.file_id, f.path, s.name, s.kind, s.line_start, s.line_end, s.parent_symbol_id, s.source_text, s.signature
             FROM symbols s JOIN files f ON f.id = s.file_id WHERE s.id = ?1",
            params![id],
            |r| {
                Ok(SymbolRow {
                    id: r.get(0)?,
                    file_id: r.get(1)?,
                    file_path: r.get(2)?,
                    name: r.get(3)?,
                    kind: r.get(4)?,
                    line_start: r.get(5)?,
                    line_end: r.get(6)?,
                    parent_symbol_id: r.get(7)?,
                    source_text: r.get(8)?,
                    signature: r.get(9)?,
                })
            },
        )
        .optional()?)
}

fn fetch_docstring_covering(store: &Store, file_path: &str, line: u32) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    Ok(store
        .conn()
        .query_row(
            "SELECT c.content FROM doc_chunks c JOIN doc_files d ON d.id = c.doc_file_id
             WHERE d.path = ?1 AND c.line_start IS NOT NULL AND c.line_end IS NOT NULL
               AND c.line_start <= ?2 AND c.line_end >= ?2
             ORDER BY c.chunk_index LIMIT 1",
            params![file_path, line],
            |r| r.get(0),
        )
        .optional()?)
}

/// `find_definition`: hybrid search over symbols, then an exact
/// case-sensitive name post-filter; falls back to the top 5 best guesses
/// when nothing matches exactly.
pub fn find_definition(store: &Store, embedder: &Embedder, name: &str, with_context: bool) -> Result<Vec<DefinitionResult>> {
    let qvec = embedder.encode_one(name, TASK_QUERY_SIDE);
    let hits = hybrid_search(store, SearchTable::Symbols, name, &qvec, 20)?;

    let mut rows: Vec<(HybridHit, SymbolRow)> = Vec::new();
    for h in &hits {
        if let Some(row) = fetch_symbol(store, h.row_id)? {
            rows.push((h.clone(), row));
        }
    }

    let exact: Vec<&(HybridHit, SymbolRow)> = rows.iter().filter(|(_, r)| r.name == name).collect();
    let selected: Vec<&(HybridHit, SymbolRow)> = if !exact.is_empty() { exact } else { rows.iter().take(5).collect() };

    let mut out = Vec::new();
    for (hit, row) in selected {
        let snippets = snippets_for_symbol(store, row.id, name);
        let (parent, docstring, signature) = if with_context {
            let parent = match row.parent_symbol_id {
                Some(pid) => fetch_symbol(store, pid)?.map(|p| ParentInfo { name: p.name, kind: p.kind }),
                None => None,
            };
            let docstring = fetch_docstring_covering(store, &row.file_path, row.line_start)?;
            let signature = Some(if !row.signature.is_empty() {
                row.signature.clone()
            } else {
                derive_signature(&row.source_text)
            });
            (parent, docstring, signature)
        } else {
            (None, None, None)
        };

        out.push(DefinitionResult {
            symbol_id: row.id,
            name: row.name.clone(),
            kind: row.kind.clone(),
            file: row.file_path.clone(),
            line_start: row.line_start,
            line_end: row.line_end,
            match_reason: hit.match_reason.label().to_string(),
            confidence: hit.confidence,
            snippets,
            parent,
            docstring,
            signature,
        });
    }
    Ok(out)
}

fn derive_signature(source_text: &str) -> String {
    let first_line = source_text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first_line.chars().count() > 100 {
        let truncated: String = first_line.chars().take(100).collect();
        format!("{truncated}...")
    } else {
        first_line.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceResult {
    pub symbol_name: String,
    pub file: String,
    pub line: u32,
    pub source_line: Option<String>,
    pub containing_symbol: Option<ParentInfo>,
}

/// `find_references`: exact-match lookup in the reference table ordered by
/// (file, line); references are heuristic free-identifier occurrences, not
/// resolved, per the data model.
pub fn find_references(store: &Store, project_dir: &Path, name: &str, with_context: bool) -> Result<Vec<ReferenceResult>> {
    let mut stmt = store.conn().prepare(
        "SELECT r.file_id, f.path, r.line FROM \"references\" r JOIN files f ON f.id = r.file_id
         WHERE r.symbol_name = ?1 ORDER BY f.path, r.line",
    )?;
    let rows = stmt.query_map(params![name], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, u32>(2)?)))?;

    let mut out = Vec::new();
    for row in rows {
        let (file_id, file_path, line) = row?;
        let (source_line, containing_symbol) = if with_context {
            let source_line = read_source_line(project_dir, &file_path, line);
            let containing = innermost_symbol(store, file_id, line)?;
            (source_line, containing)
        } else {
            (None, None)
        };
        out.push(ReferenceResult { symbol_name: name.to_string(), file: file_path, line, source_line, containing_symbol });
    }
    Ok(out)
}

fn read_source_line(project_dir: &Path, rel_path: &str, line: u32) -> Option<String> {
    let content = std::fs::read_to_string(project_dir.join(rel_path)).ok()?;
    content.lines().nth(line.checked_sub(1)? as usize).map(|l| l.to_string())
}

/// Smallest symbol in `file_id` whose line range contains `line` — the
/// innermost enclosing scope, or `None` at top level.
fn innermost_symbol(store: &Store, file_id: i64, line: u32) -> Result<Option<ParentInfo>> {
    use rusqlite::OptionalExtension;
    Ok(store
        .conn()
        .query_row(
            "SELECT name, kind FROM symbols WHERE file_id = ?1 AND line_start <= ?2 AND line_end >= ?2
             ORDER BY (line_end - line_start) ASC LIMIT 1",
            params![file_id, line],
            |r| Ok(ParentInfo { name: r.get(0)?, kind: r.get(1)? }),
        )
        .optional()?)
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSymbolEntry {
    pub name: String,
    pub kind: String,
    pub line_start: u32,
    pub line_end: u32,
    pub parent_name: Option<String>,
}

/// `get_file_structure`: every symbol in the file at the absolute form of
/// `path` (resolved against `directory` when `path` is relative), ordered
/// by line_start. Files are stored keyed by absolute path (§3), so the
/// lookup key has to match that form exactly.
pub fn get_file_structure(store: &Store, directory: &Path, path: &str) -> Result<Vec<FileSymbolEntry>> {
    let abs_path = crate::scanner::normalize_abs_path(Path::new(path), directory);
    let mut stmt = store.conn().prepare(
        "SELECT s.name, s.kind, s.line_start, s.line_end, p.name
         FROM symbols s JOIN files f ON f.id = s.file_id
         LEFT JOIN symbols p ON p.id = s.parent_symbol_id
         WHERE f.path = ?1 ORDER BY s.line_start",
    )?;
    let rows = stmt.query_map(params![abs_path], |r| {
        Ok(FileSymbolEntry {
            name: r.get(0)?,
            kind: r.get(1)?,
            line_start: r.get(2)?,
            line_end: r.get(3)?,
            parent_name: r.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicFileResult {
    pub file: String,
    pub relevance: f64,
    pub matched_symbols: Vec<String>,
    pub kinds: Vec<String>,
    pub snippets: Vec<String>,
}

const SNIPPET_MAX_LINES: usize = 15;
const SNIPPET_MAX_CHARS: usize = 500;

fn truncate_snippet(source_text: &str) -> String {
    let lines: Vec<&str> = source_text.lines().take(SNIPPET_MAX_LINES).collect();
    let mut joined = lines.join("\n");
    let truncated_lines = source_text.lines().count() > SNIPPET_MAX_LINES;
    if joined.chars().count() > SNIPPET_MAX_CHARS {
        joined = joined.chars().take(SNIPPET_MAX_CHARS).collect();
        joined.push_str("\n... (truncated)");
    } else if truncated_lines {
        joined.push_str("\n... (truncated)");
    }
    joined
}

/// `discover_topic`: hybrid search over symbols only, aggregated by owning
/// file. Per-file relevance is a plain sum of contributing hybrid scores —
/// a file with many weak matches can outrank one strong match, which §9
/// treats as intentional rather than a bug to silently fix.
pub fn discover_topic(store: &Store, embedder: &Embedder, topic: &str, top_k: usize, with_snippets: bool) -> Result<Vec<TopicFileResult>> {
    let qvec = embedder.encode_one(topic, TASK_QUERY_SIDE);
    let hits = hybrid_search(store, SearchTable::Symbols, topic, &qvec, 50)?;

    struct Agg {
        file: String,
        relevance: f64,
        names: Vec<String>,
        kinds: HashSet<String>,
        best_symbols: Vec<(f64, i64)>,
    }

    let mut by_file: HashMap<i64, Agg> = HashMap::new();
    for hit in &hits {
        let Some(row) = fetch_symbol(store, hit.row_id)? else { continue };
        let agg = by_file.entry(row.file_id).or_insert_with(|| Agg {
            file: row.file_path.clone(),
            relevance: 0.0,
            names: Vec::new(),
            kinds: HashSet::new(),
            best_symbols: Vec::new(),
        });
        agg.relevance += hit.fused_score;
        agg.names.push(row.name.clone());
        agg.kinds.insert(row.kind.clone());
        agg.best_symbols.push((hit.fused_score, row.id));
    }

    let mut files: Vec<Agg> = by_file.into_values().collect();
    files.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
    files.truncate(top_k);

    let mut out = Vec::new();
    for mut f in files {
        let snippets = if with_snippets {
            f.best_symbols.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            f.best_symbols
                .iter()
                .take(2)
                .filter_map(|(_, id)| fetch_symbol(store, *id).ok().flatten())
                .map(|row| truncate_snippet(&row.source_text))
                .collect()
        } else {
            Vec::new()
        };
        out.push(TopicFileResult {
            file: f.file,
            relevance: f.relevance,
            matched_symbols: f.names,
            kinds: f.kinds.into_iter().collect(),
            snippets,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjacentChunk {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocSearchResult {
    pub doc_file: String,
    pub chunk_index: u32,
    pub section_title: Option<String>,
    pub content: String,
    pub match_reason: String,
    pub confidence: f64,
    pub context: Vec<AdjacentChunk>,
}

struct ChunkRow {
    id: i64,
    doc_file_id: i64,
    doc_file_path: String,
    chunk_index: u32,
    section_title: Option<String>,
    content: String,
}

fn fetch_chunk(store: &Store, id: i64) -> Result<Option<ChunkRow>> {
    use rusqlite::OptionalExtension;
    Ok(store
        .conn()
        .query_row(
            "SELECT c.id, c.doc_file_id, d.path, c.chunk_index, c.section_title, c.content
             FROM doc_chunks c JOIN doc_files d ON d.id = c.doc_file_id WHERE c.id = ?1",
            params![id],
            |r| {
                Ok(ChunkRow {
                    id: r.get(0)?,
                    doc_file_id: r.get(1)?,
                    doc_file_path: r.get(2)?,
                    chunk_index: r.get(3)?,
                    section_title: r.get(4)?,
                    content: r.get(5)?,
                })
            },
        )
        .optional()?)
}

const ADJACENT_TRUNCATE: usize = 200;

fn fetch_adjacent(store: &Store, doc_file_id: i64, chunk_index: u32, kind: &str) -> Option<AdjacentChunk> {
    use rusqlite::OptionalExtension;
    let content: Option<String> = store
        .conn()
        .query_row(
            "SELECT content FROM doc_chunks WHERE doc_file_id = ?1 AND chunk_index = ?2",
            params![doc_file_id, chunk_index],
            |r| r.get(0),
        )
        .optional()
        .ok()?;
    content.map(|c| AdjacentChunk {
        kind: kind.to_string(),
        content: c.chars().take(ADJACENT_TRUNCATE).collect(),
    })
}

/// `search_documentation`: symmetric hybrid search over doc chunks; with
/// `with_context`, each hit gains previous/current/next chunk summaries
/// from the same doc file by adjacent `chunk_index`.
pub fn search_documentation(store: &Store, embedder: &Embedder, query: &str, k: usize, with_context: bool) -> Result<Vec<DocSearchResult>> {
    let qvec = embedder.encode_one(query, TASK_QUERY_SIDE);
    let hits = hybrid_search(store, SearchTable::DocChunks, query, &qvec, k)?;

    let mut out = Vec::new();
    for hit in hits {
        let Some(row) = fetch_chunk(store, hit.row_id)? else { continue };
        let mut context = Vec::new();
        if with_context {
            if row.chunk_index > 0 {
                if let Some(prev) = fetch_adjacent(store, row.doc_file_id, row.chunk_index - 1, "previous") {
                    context.push(prev);
                }
            }
            context.push(AdjacentChunk { kind: "current".to_string(), content: row.content.chars().take(ADJACENT_TRUNCATE).collect() });
            if let Some(next) = fetch_adjacent(store, row.doc_file_id, row.chunk_index + 1, "next") {
                context.push(next);
            }
        }
        out.push(DocSearchResult {
            doc_file: row.doc_file_path,
            chunk_index: row.chunk_index,
            section_title: row.section_title,
            content: row.content,
            match_reason: hit.match_reason.label().to_string(),
            confidence: hit.confidence,
            context,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_reason_labels_match_spec_strings() {
        assert_eq!(MatchReason::Hybrid.label(), "hybrid (BM25 + semantic)");
        assert_eq!(MatchReason::Keyword.label(), "keyword match (BM25)");
        assert_eq!(MatchReason::Semantic.label(), "semantic match (vector)");
    }

    #[test]
    fn simple_highlights_is_case_insensitive_substring() {
        let text = "fn login() {}\nfn logout() {}\nfn unrelated() {}\n";
        let hits = simple_highlights(text, "LOGIN");
        assert_eq!(hits, vec!["fn login() {}".to_string()]);
    }

    #[test]
    fn truncate_snippet_caps_lines() {
        let text = (0..20).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let snippet = truncate_snippet(&text);
        assert!(snippet.lines().count() <= SNIPPET_MAX_LINES + 1);
    }
}
