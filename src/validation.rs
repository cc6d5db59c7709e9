use std::path::{Path, PathBuf};

use crate::errors::{CodeMemoryError, Result};

pub const MAX_QUERY_LEN: usize = 1000;
pub const DEFAULT_TOP_K: u32 = 10;
pub const MIN_TOP_K: u32 = 1;
pub const MAX_TOP_K: u32 = 100;

/// Trims and bounds-checks a free-text query string.
pub fn validate_query(query: &str) -> Result<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CodeMemoryError::validation("query must not be empty"));
    }
    if trimmed.chars().count() > MAX_QUERY_LEN {
        return Err(CodeMemoryError::validation(format!(
            "query must be at most {MAX_QUERY_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_top_k(top_k: Option<u32>) -> Result<u32> {
    let k = top_k.unwrap_or(DEFAULT_TOP_K);
    if !(MIN_TOP_K..=MAX_TOP_K).contains(&k) {
        return Err(CodeMemoryError::validation(format!(
            "top_k must be between {MIN_TOP_K} and {MAX_TOP_K}"
        )));
    }
    Ok(k)
}

pub fn validate_search_type(value: &str, allowed: &[&str]) -> Result<String> {
    if !allowed.contains(&value) {
        return Err(CodeMemoryError::validation(format!(
            "search_type must be one of {allowed:?}, got '{value}'"
        )));
    }
    Ok(value.to_string())
}

pub fn validate_line_number(line: i64, field: &str) -> Result<u32> {
    if line < 1 {
        return Err(CodeMemoryError::validation(format!("{field} must be >= 1")));
    }
    Ok(line as u32)
}

pub fn validate_line_range(start: Option<i64>, end: Option<i64>) -> Result<(Option<u32>, Option<u32>)> {
    let start = start.map(|s| validate_line_number(s, "line_start")).transpose()?;
    let end = end.map(|e| validate_line_number(e, "line_end")).transpose()?;
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(CodeMemoryError::validation("line_start must be <= line_end"));
        }
    }
    Ok((start, end))
}

pub fn validate_directory(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| CodeMemoryError::validation(format!("cannot resolve current directory: {e}")))?
            .join(p)
    };
    let meta = std::fs::metadata(&abs)
        .map_err(|_| CodeMemoryError::validation(format!("directory does not exist: {}", abs.display())))?;
    if !meta.is_dir() {
        return Err(CodeMemoryError::validation(format!("not a directory: {}", abs.display())));
    }
    Ok(abs)
}

/// Guards against a path escaping the project directory via `..` components
/// once both sides are canonicalized.
pub fn validate_path_in_directory(path: &Path, directory: &Path) -> Result<PathBuf> {
    let canon_dir = directory
        .canonicalize()
        .map_err(|e| CodeMemoryError::validation(format!("invalid directory: {e}")))?;
    let candidate = if path.is_absolute() { path.to_path_buf() } else { directory.join(path) };
    let canon_path = candidate
        .canonicalize()
        .map_err(|e| CodeMemoryError::validation(format!("path does not exist: {e}")))?;
    if !canon_path.starts_with(&canon_dir) {
        return Err(CodeMemoryError::validation("path escapes the project directory"));
    }
    Ok(canon_path)
}

/// Escapes an FTS5 query so arbitrary user text can be embedded in a MATCH
/// expression without tripping the query-syntax parser. Double quotes are
/// escaped by doubling; the whole query is wrapped in quotes when it contains
/// characters FTS5 treats as operators.
pub fn sanitize_fts_query(query: &str) -> String {
    const SPECIAL: &[char] = &['"', '*', '^', ':', '(', ')', '-'];
    if query.chars().any(|c| SPECIAL.contains(&c)) {
        format!("\"{}\"", query.replace('"', "\"\""))
    } else {
        query.to_string()
    }
}

pub fn validate_commit_hash(hash: &str) -> Result<String> {
    let h = hash.trim();
    let ok = (7..=40).contains(&h.len()) && h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if !ok {
        return Err(CodeMemoryError::validation(
            "commit hash must be 7-40 lowercase hexadecimal characters",
        ));
    }
    Ok(h.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_query() {
        assert!(validate_query("   ").is_err());
    }

    #[test]
    fn rejects_oversize_query() {
        let q = "a".repeat(1001);
        assert!(validate_query(&q).is_err());
    }

    #[test]
    fn top_k_defaults_and_bounds() {
        assert_eq!(validate_top_k(None).unwrap(), 10);
        assert!(validate_top_k(Some(0)).is_err());
        assert!(validate_top_k(Some(101)).is_err());
        assert_eq!(validate_top_k(Some(50)).unwrap(), 50);
    }

    #[test]
    fn line_range_rejects_inverted() {
        assert!(validate_line_range(Some(10), Some(5)).is_err());
        assert!(validate_line_range(Some(5), Some(10)).is_ok());
    }

    #[test]
    fn commit_hash_length_bounds() {
        assert!(validate_commit_hash("abcdef1").is_ok());
        assert!(validate_commit_hash("abc").is_err());
        assert!(validate_commit_hash("ABCDEF1").is_err());
    }

    #[test]
    fn fts_query_sanitization_wraps_special_chars() {
        assert_eq!(sanitize_fts_query("plain"), "plain");
        assert_eq!(sanitize_fts_query("a\"b"), "\"a\"\"b\"");
    }
}
