use anyhow::{Context, Result};
use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use std::path::{Path, PathBuf};

use crate::parser::is_known_source_extension;

/// Directories skipped unconditionally, regardless of `.gitignore` contents:
/// build/output dirs, virtual-env dirs, VCS metadata, test/lint caches, and
/// dependency caches. `.egg-info` directories are matched by suffix below
/// since their name is project-specific (`myproject.egg-info`).
const ALWAYS_SKIP_DIRS: &[&str] = &[
    "target", "dist", "build", "out",
    "venv", ".venv", "env",
    ".git", ".hg", ".svn",
    ".pytest_cache", ".mypy_cache", ".ruff_cache", "__pycache__",
    "node_modules",
];

const DOC_EXTENSIONS: &[&str] = &["md", "markdown"];

fn default_overrides(repo_root: &Path, exclude_dir_names: &[String]) -> Result<Override> {
    let mut ob = OverrideBuilder::new(repo_root);

    // For directories, include patterns for both the directory entry and its
    // descendants, otherwise walkers may still descend into the directory.
    for d in ALWAYS_SKIP_DIRS {
        ob.add(&format!("**/{d}"))?;
        ob.add(&format!("**/{d}/**"))?;
    }
    ob.add("**/*.egg-info")?;
    ob.add("**/*.egg-info/**")?;

    // Project-specific excluded dirs (from configuration).
    for d in exclude_dir_names {
        let d = d.trim().trim_matches('/');
        if d.is_empty() {
            continue;
        }
        ob.add(&format!("**/{d}"))?;
        ob.add(&format!("**/{d}/**"))?;
    }

    Ok(ob.build()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Source,
    Doc,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub abs_path: PathBuf,
    pub rel_path: PathBuf,
    pub bytes: u64,
    pub role: FileRole,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub repo_root: PathBuf,
    pub target: PathBuf,
    pub max_file_bytes: u64,
    pub exclude_dir_names: Vec<String>,
}

impl ScanOptions {
    pub fn target_root(&self) -> PathBuf {
        if self.target.is_absolute() {
            self.target.clone()
        } else {
            self.repo_root.join(&self.target)
        }
    }
}

fn ext_lower(path: &Path) -> String {
    path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase()
}

fn role_for_path(path: &Path) -> Option<FileRole> {
    let ext = ext_lower(path);
    if DOC_EXTENSIONS.contains(&ext.as_str()) {
        return Some(FileRole::Doc);
    }
    if is_known_source_extension(&ext) {
        return Some(FileRole::Source);
    }
    None
}

/// Walks `opts.target`, honoring nested `.gitignore`/`.ignore` files plus the
/// built-in always-skip list, and returns every candidate source or doc file
/// (any other file, including ones with no recognized extension at all, is
/// left out of the walk — the Source Parser's own "no grammar" fallback only
/// applies to files that make it through here as `FileRole::Source`).
pub fn scan_workspace(opts: &ScanOptions) -> Result<Vec<FileEntry>> {
    let target_root = opts.target_root();

    let meta = std::fs::metadata(&target_root)
        .with_context(|| format!("Target does not exist: {}", target_root.display()))?;

    if meta.is_file() {
        return scan_single_file(&opts.repo_root, &target_root, opts.max_file_bytes)
            .map(|v| v.into_iter().collect());
    }

    let mut entries = Vec::new();
    let overrides = default_overrides(&opts.repo_root, &opts.exclude_dir_names)?;
    let walker = WalkBuilder::new(&target_root)
        .standard_filters(true) // .gitignore, .ignore, hidden, etc.
        .overrides(overrides)
        .build();

    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };

        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();

        let Some(role) = role_for_path(&abs_path) else {
            continue;
        };

        let bytes = match std::fs::metadata(&abs_path).map(|m| m.len()) {
            Ok(b) => b,
            Err(_) => continue,
        };

        if bytes == 0 || bytes > opts.max_file_bytes {
            continue;
        }

        let rel_path = path_relative_to(&abs_path, &opts.repo_root)
            .with_context(|| format!("Failed to relativize path: {}", abs_path.display()))?;

        entries.push(FileEntry { abs_path, rel_path, bytes, role });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

fn scan_single_file(repo_root: &Path, abs_path: &Path, max_file_bytes: u64) -> Result<Vec<FileEntry>> {
    let ov = default_overrides(repo_root, &[])?;
    if ov.matched(abs_path, /* is_dir */ false).is_ignore() {
        return Ok(vec![]);
    }

    let Some(role) = role_for_path(abs_path) else {
        return Ok(vec![]);
    };

    let bytes = std::fs::metadata(abs_path)?.len();
    if bytes == 0 || bytes > max_file_bytes {
        return Ok(vec![]);
    }

    let rel_path = path_relative_to(abs_path, repo_root)?;
    Ok(vec![FileEntry {
        abs_path: abs_path.to_path_buf(),
        rel_path,
        bytes,
        role,
    }])
}

fn path_relative_to(path: &Path, base: &Path) -> Result<PathBuf> {
    let rel = path
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", path.display(), base.display()))?;
    Ok(rel.to_path_buf())
}

/// Resolves `path` (absolute or relative to `base`) to the absolute,
/// slash-normalized form used as the storage key for `files.path` /
/// `doc_files.path` (and as the lookup key everywhere a caller supplies a
/// path back to the store). Falls back to the joined-but-uncanonicalized
/// path when the file doesn't exist on disk (canonicalize requires the path
/// to resolve), since callers may be normalizing an already-deleted file.
pub fn normalize_abs_path(path: &Path, base: &Path) -> String {
    let joined = if path.is_absolute() { path.to_path_buf() } else { base.join(path) };
    let resolved = joined.canonicalize().unwrap_or(joined);
    resolved.to_string_lossy().replace('\\', "/")
}
