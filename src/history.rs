use std::path::Path;

use git2::{DiffOptions, Repository};
use serde::Serialize;

use crate::errors::{CodeMemoryError, Result};

/// Opens the repository rooted at or above `path`, the way a local tool
/// walks up from a working file to find `.git` rather than requiring the
/// caller to name the repo root exactly.
pub fn resolve(path: &Path) -> Result<Repository> {
    Repository::discover(path).map_err(|e| CodeMemoryError::git(format!("no git repository found above {}: {e}", path.display())))
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitSummary {
    pub hash: String,
    pub short_hash: String,
    pub author: String,
    pub author_email: String,
    pub date: i64,
    pub message: String,
}

fn short_hash(hash: &str) -> String {
    hash[..7.min(hash.len())].to_string()
}

fn summarize(commit: &git2::Commit) -> CommitSummary {
    let hash = commit.id().to_string();
    let author = commit.author();
    CommitSummary {
        short_hash: short_hash(&hash),
        hash,
        author: author.name().unwrap_or("").to_string(),
        author_email: author.email().unwrap_or("").to_string(),
        date: commit.time().seconds(),
        message: commit.message().unwrap_or("").to_string(),
    }
}

/// Commits whose message contains `query` (case-insensitive), optionally
/// restricted to ones touching `file`. Bounds the underlying traversal to
/// `limit * 5` commits rather than walking the whole history.
pub fn search_commits(repo: &Repository, query: &str, file: Option<&str>, limit: usize) -> Result<Vec<CommitSummary>> {
    let mut revwalk = repo.revwalk().map_err(|e| CodeMemoryError::git(e.to_string()))?;
    revwalk.push_head().map_err(|e| CodeMemoryError::git(e.to_string()))?;

    let query_lower = query.to_lowercase();
    let scan_cap = limit.saturating_mul(5).max(limit);
    let mut out = Vec::new();

    for (seen, oid_result) in revwalk.enumerate() {
        if seen >= scan_cap || out.len() >= limit {
            break;
        }
        let oid = oid_result.map_err(|e| CodeMemoryError::git(e.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|e| CodeMemoryError::git(e.to_string()))?;

        if let Some(f) = file {
            if !commit_touches_file(repo, &commit, f)? {
                continue;
            }
        }

        let message = commit.message().unwrap_or("").to_lowercase();
        if message.contains(&query_lower) {
            out.push(summarize(&commit));
        }
    }
    Ok(out)
}

fn commit_touches_file(repo: &Repository, commit: &git2::Commit, file: &str) -> Result<bool> {
    let tree = commit.tree().map_err(|e| CodeMemoryError::git(e.to_string()))?;
    let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());

    let mut opts = DiffOptions::new();
    opts.pathspec(file);
    let diff = repo
        .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))
        .map_err(|e| CodeMemoryError::git(e.to_string()))?;
    Ok(diff.deltas().len() > 0)
}

#[derive(Debug, Clone, Serialize)]
pub struct FileHistoryEntry {
    #[serde(flatten)]
    pub commit: CommitSummary,
    pub path_at_commit: String,
}

/// Log of commits affecting `rel_path`, following renames: at each step the
/// per-commit diff is computed unfiltered (no pathspec) so both sides of a
/// rename are present, `find_similar` pairs them, and the delta whose
/// new-side path equals the path used at this step tells us what the file
/// was called one commit further back.
pub fn file_history(repo: &Repository, rel_path: &str, limit: usize) -> Result<Vec<FileHistoryEntry>> {
    let mut revwalk = repo.revwalk().map_err(|e| CodeMemoryError::git(e.to_string()))?;
    revwalk.push_head().map_err(|e| CodeMemoryError::git(e.to_string()))?;

    let mut current_path = rel_path.to_string();
    let mut out = Vec::new();

    for oid_result in revwalk {
        if out.len() >= limit {
            break;
        }
        let oid = oid_result.map_err(|e| CodeMemoryError::git(e.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|e| CodeMemoryError::git(e.to_string()))?;

        let tree = commit.tree().map_err(|e| CodeMemoryError::git(e.to_string()))?;
        let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());

        // No pathspec here: a rename's delete-side delta (the old path) has
        // to be present in the full diff for `find_similar` to pair it with
        // the new path. Filtering to `current_path` up front would drop that
        // delta before similarity detection ever runs.
        let mut diff = repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
            .map_err(|e| CodeMemoryError::git(e.to_string()))?;
        diff.find_similar(None).map_err(|e| CodeMemoryError::git(e.to_string()))?;

        let matching_delta = diff
            .deltas()
            .find(|d| d.new_file().path().map(|p| p.to_string_lossy().replace('\\', "/")) == Some(current_path.clone()));

        let Some(delta) = matching_delta else {
            continue;
        };

        out.push(FileHistoryEntry { commit: summarize(&commit), path_at_commit: current_path.clone() });

        if let Some(old_path) = delta.old_file().path() {
            current_path = old_path.to_string_lossy().replace('\\', "/");
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStat {
    pub path: String,
    pub insertions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitDetail {
    pub hash: String,
    pub short_hash: String,
    pub author: String,
    pub author_email: String,
    pub date: i64,
    pub message: String,
    pub parents: Vec<String>,
    pub files: Vec<FileStat>,
    pub diff: Option<String>,
}

/// Parent short hashes, per-file (insertions, deletions), and — if `file`
/// is given — the unified diff restricted to that one path. The root
/// commit (no parents) diffs against an empty tree.
pub fn commit_detail(repo: &Repository, hash: &str, file: Option<&str>) -> Result<CommitDetail> {
    let oid = git2::Oid::from_str(hash).map_err(|e| CodeMemoryError::git(format!("invalid commit hash '{hash}': {e}")))?;
    let commit = repo.find_commit(oid).map_err(|e| CodeMemoryError::git(format!("commit '{hash}' not found: {e}")))?;

    let tree = commit.tree().map_err(|e| CodeMemoryError::git(e.to_string()))?;
    let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());

    let mut opts = DiffOptions::new();
    if let Some(f) = file {
        opts.pathspec(f);
    }
    let diff = repo
        .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))
        .map_err(|e| CodeMemoryError::git(e.to_string()))?;

    let mut files = Vec::new();
    for delta_idx in 0..diff.deltas().len() {
        let patch = git2::Patch::from_diff(&diff, delta_idx).map_err(|e| CodeMemoryError::git(e.to_string()))?;
        let Some(patch) = patch else { continue };
        let (_ctx, additions, deletions) = patch.line_stats().map_err(|e| CodeMemoryError::git(e.to_string()))?;
        let path = patch
            .delta()
            .new_file()
            .path()
            .or_else(|| patch.delta().old_file().path())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        files.push(FileStat { path, insertions: additions as u32, deletions: deletions as u32 });
    }

    let diff_text = if file.is_some() {
        let mut buf = String::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            let prefix = match line.origin() {
                '+' | '-' | ' ' => line.origin().to_string(),
                _ => String::new(),
            };
            buf.push_str(&prefix);
            buf.push_str(&String::from_utf8_lossy(line.content()));
            true
        })
        .map_err(|e| CodeMemoryError::git(e.to_string()))?;
        Some(buf)
    } else {
        None
    };

    let hash_str = commit.id().to_string();
    Ok(CommitDetail {
        short_hash: short_hash(&hash_str),
        hash: hash_str,
        author: commit.author().name().unwrap_or("").to_string(),
        author_email: commit.author().email().unwrap_or("").to_string(),
        date: commit.time().seconds(),
        message: commit.message().unwrap_or("").to_string(),
        parents: commit.parent_ids().map(|id| short_hash(&id.to_string())).collect(),
        files,
        diff: diff_text,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct BlameEntry {
    pub line_start: u32,
    pub line_end: u32,
    pub commit_hash: String,
    pub author: String,
    pub line_content: String,
}

/// Line-level blame on HEAD, grouped by consecutive runs sharing the same
/// commit, filtered to `[start, end]` only after grouping — a requested
/// range beginning or ending mid-run still yields one grouped entry
/// spanning the whole run, clipped textually but not split.
pub fn blame(repo: &Repository, rel_path: &str, range: Option<(u32, u32)>) -> Result<Vec<BlameEntry>> {
    let blame = repo.blame_file(Path::new(rel_path), None).map_err(|e| CodeMemoryError::git(e.to_string()))?;

    let workdir = repo.workdir().ok_or_else(|| CodeMemoryError::git("repository has no working directory".to_string()))?;
    let content = std::fs::read_to_string(workdir.join(rel_path))?;
    let lines: Vec<&str> = content.lines().collect();

    struct RawLine {
        line_no: u32,
        commit_hash: String,
        author: String,
        content: String,
    }

    let mut raw = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx as u32 + 1;
        let hunk = blame.get_line(line_no as usize);
        let (commit_hash, author) = match hunk {
            Some(h) => (h.final_commit_id().to_string(), h.final_signature().name().unwrap_or("").to_string()),
            None => (String::new(), String::new()),
        };
        raw.push(RawLine { line_no, commit_hash, author, content: line.to_string() });
    }

    let mut grouped: Vec<BlameEntry> = Vec::new();
    for r in raw {
        match grouped.last_mut() {
            Some(last) if last.commit_hash == r.commit_hash && last.line_end + 1 == r.line_no => {
                last.line_end = r.line_no;
                last.line_content.push('\n');
                last.line_content.push_str(&r.content);
            }
            _ => grouped.push(BlameEntry {
                line_start: r.line_no,
                line_end: r.line_no,
                commit_hash: short_hash(&r.commit_hash),
                author: r.author,
                line_content: r.content,
            }),
        }
    }

    if let Some((start, end)) = range {
        grouped.retain(|g| g.line_end >= start && g.line_start <= end);
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn init_repo_with_commit() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "line one\nline two\n").unwrap();

        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
        };
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        run(&["add", "a.txt"]);
        run(&["commit", "-m", "add a.txt with initial content"]);

        (dir, repo)
    }

    #[test]
    fn resolve_finds_repo_from_subdirectory() {
        let (dir, _repo) = init_repo_with_commit();
        let sub = dir.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        let repo = resolve(&sub).unwrap();
        assert!(repo.workdir().is_some());
    }

    #[test]
    fn resolve_fails_cleanly_outside_any_repo() {
        let dir = tempdir().unwrap();
        let err = resolve(dir.path()).unwrap_err();
        assert_eq!(err.error_type(), "git");
    }

    #[test]
    fn search_commits_matches_case_insensitively() {
        let (_dir, repo) = init_repo_with_commit();
        let hits = search_commits(&repo, "INITIAL", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn blame_groups_consecutive_same_commit_lines() {
        let (_dir, repo) = init_repo_with_commit();
        let entries = blame(&repo, "a.txt", None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].line_start, 1);
        assert_eq!(entries[0].line_end, 2);
    }

    #[test]
    fn blame_range_filters_after_grouping() {
        let (_dir, repo) = init_repo_with_commit();
        let entries = blame(&repo, "a.txt", Some((2, 2))).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].line_start, 1);
        assert_eq!(entries[0].line_end, 2);
    }

    #[test]
    fn file_history_follows_renames() {
        let (dir, repo) = init_repo_with_commit();
        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
        };
        run(&["mv", "a.txt", "b.txt"]);
        run(&["commit", "-m", "rename a.txt to b.txt"]);
        std::fs::write(dir.path().join("b.txt"), "line one\nline two\nline three\n").unwrap();
        run(&["add", "b.txt"]);
        run(&["commit", "-m", "extend b.txt"]);

        let entries = file_history(&repo, "b.txt", 10).unwrap();
        let messages: Vec<&str> = entries.iter().map(|e| e.commit.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("extend b.txt")));
        assert!(messages.iter().any(|m| m.contains("rename a.txt to b.txt")));
        assert!(messages.iter().any(|m| m.contains("add a.txt with initial content")));

        let rename_entry = entries.iter().find(|e| e.commit.message.contains("rename a.txt to b.txt")).unwrap();
        assert_eq!(rename_entry.path_at_commit, "b.txt");
        let initial_entry = entries.iter().find(|e| e.commit.message.contains("add a.txt with initial content")).unwrap();
        assert_eq!(initial_entry.path_at_commit, "a.txt");
    }
}
