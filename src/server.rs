use serde_json::json;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::config::load_config;
use crate::embedder::global_embedder;
use crate::errors::{CodeMemoryError, Result};
use crate::history;
use crate::orchestrator::index_project;
use crate::query;
use crate::store::Store;
use crate::validation::{validate_commit_hash, validate_directory, validate_line_range, validate_query, validate_search_type, validate_top_k};

#[derive(Default)]
pub struct ServerState {
    /// Canonical workspace root. Populated from (highest priority first):
    ///   1. `directory` field in a tool call — per-call override.
    ///   2. MCP `initialize` params (`rootUri` / `rootPath` / `workspaceFolders`).
    ///   3. Startup root / env vars.
    ///   4. `cwd` — last resort; refused if it equals $HOME or OS root.
    repo_root: Option<PathBuf>,
}

/// Returns `true` for "useless" roots that indicate the server started with the
/// wrong cwd (usually $HOME or filesystem root on any OS).
fn is_dead_root(p: &Path) -> bool {
    if p.parent().is_none() {
        return true;
    }
    if p.components().count() <= 1 {
        return true;
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        if p == Path::new(home.trim()) {
            return true;
        }
    }
    false
}

/// Parses a file URI (or plain path string) into an OS-native `PathBuf`,
/// handling the Windows `file:///C:/...` drive-root quirk.
fn extract_path_from_uri(uri: &str) -> Option<PathBuf> {
    let rest = uri.strip_prefix("file://").unwrap_or(uri);
    let rest = if rest.starts_with('/') && rest.len() >= 3 && rest.as_bytes()[1].is_ascii_alphabetic() && rest.as_bytes()[2] == b':' {
        &rest[1..]
    } else {
        rest
    };
    let s = rest.trim_end_matches('/');
    if s.is_empty() {
        None
    } else {
        Some(PathBuf::from(s))
    }
}

impl ServerState {
    /// Called once when the MCP `initialize` request is received. Extracts
    /// the workspace root from standard LSP/MCP protocol fields.
    fn capture_init_root(&mut self, params: &serde_json::Value) {
        let raw_uri = params
            .get("workspaceFolders")
            .and_then(|f| f.as_array())
            .and_then(|a| a.first())
            .and_then(|f| f.get("uri").or_else(|| f.get("path")))
            .and_then(|v| v.as_str())
            .or_else(|| params.get("rootUri").or_else(|| params.get("rootPath")).and_then(|v| v.as_str()));

        if let Some(uri) = raw_uri {
            if let Some(path) = extract_path_from_uri(uri) {
                if !is_dead_root(&path) {
                    self.repo_root = Some(path);
                }
            }
        }
    }

    /// Resolves the workspace root for one tool call, per the priority
    /// cascade documented on `repo_root`.
    fn directory_from_params(&mut self, params: &serde_json::Value) -> Result<PathBuf> {
        if let Some(dir) = params.get("directory").and_then(|v| v.as_str()) {
            let abs = validate_directory(dir)?;
            self.repo_root = Some(abs.clone());
            return Ok(abs);
        }

        if let Some(root) = &self.repo_root {
            return Ok(root.clone());
        }

        let fallback = std::env::current_dir().map_err(|e| CodeMemoryError::validation(format!("cannot resolve current directory: {e}")))?;
        if is_dead_root(&fallback) {
            return Err(CodeMemoryError::validation(
                "workspace root resolved to an OS root or home directory; pass 'directory' explicitly",
            ));
        }
        self.repo_root = Some(fallback.clone());
        Ok(fallback)
    }

    fn tool_list(&self, id: serde_json::Value) -> serde_json::Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [
                    {
                        "name": "check_index_status",
                        "description": "Reports whether code_memory.db exists and has been populated for the given directory, without opening a write handle.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "directory": { "type": "string", "description": "Project directory. Defaults to the resolved workspace root." }
                            }
                        }
                    },
                    {
                        "name": "get_index_stats",
                        "description": "Returns row counts (files, symbols, references, doc files, doc chunks) and the configured embedding model for the index under the given directory.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "directory": { "type": "string" }
                            }
                        }
                    },
                    {
                        "name": "index_codebase",
                        "description": "Runs a full incremental index pass (source + docs) over the given directory and returns final stats plus error tallies.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "directory": { "type": "string" }
                            }
                        }
                    },
                    {
                        "name": "search_code",
                        "description": "Hybrid BM25+vector search over indexed symbols. search_type selects the operation: topic_discovery (query=topic), definition (query=symbol name), references (query=symbol name), file_structure (query=file path).",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "query": { "type": "string" },
                                "search_type": { "type": "string", "enum": ["topic_discovery", "definition", "references", "file_structure"] },
                                "directory": { "type": "string" }
                            },
                            "required": ["query", "search_type"]
                        }
                    },
                    {
                        "name": "search_docs",
                        "description": "Hybrid BM25+vector search over indexed documentation chunks.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "query": { "type": "string" },
                                "directory": { "type": "string" },
                                "top_k": { "type": "integer", "description": "1-100, default 10." }
                            },
                            "required": ["query"]
                        }
                    },
                    {
                        "name": "search_history",
                        "description": "Reads local git history. search_type selects the operation: commits (query=message substring), file_history (target_file), blame (target_file, optional line_start/line_end), commit_detail (query=commit hash, optional target_file).",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "query": { "type": "string" },
                                "directory": { "type": "string" },
                                "search_type": { "type": "string", "enum": ["commits", "file_history", "blame", "commit_detail"] },
                                "target_file": { "type": "string" },
                                "line_start": { "type": "integer" },
                                "line_end": { "type": "integer" }
                            },
                            "required": ["search_type"]
                        }
                    }
                ]
            }
        })
    }

    fn tool_call(&mut self, id: serde_json::Value, params: &serde_json::Value) -> serde_json::Value {
        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let result = self.dispatch(name, &args);
        let (text, is_error) = match result {
            Ok(value) => (value.to_string(), false),
            Err(e) => (serde_json::to_string(&e.to_record()).unwrap_or_else(|_| e.to_string()), true),
        };

        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{ "type": "text", "text": text }],
                "isError": is_error
            }
        })
    }

    fn dispatch(&mut self, name: &str, args: &serde_json::Value) -> Result<serde_json::Value> {
        match name {
            "check_index_status" => {
                let dir = self.directory_from_params(args)?;
                check_index_status(&dir)
            }
            "get_index_stats" => {
                let dir = self.directory_from_params(args)?;
                get_index_stats(&dir)
            }
            "index_codebase" => {
                let dir = self.directory_from_params(args)?;
                run_index_codebase(&dir)
            }
            "search_code" => {
                let dir = self.directory_from_params(args)?;
                let query_str = validate_query(args.get("query").and_then(|v| v.as_str()).unwrap_or(""))?;
                let search_type = args.get("search_type").and_then(|v| v.as_str()).unwrap_or("");
                let search_type = validate_search_type(search_type, &["topic_discovery", "definition", "references", "file_structure"])?;
                run_search_code(&dir, &query_str, &search_type)
            }
            "search_docs" => {
                let dir = self.directory_from_params(args)?;
                let query_str = validate_query(args.get("query").and_then(|v| v.as_str()).unwrap_or(""))?;
                let top_k = validate_top_k(args.get("top_k").and_then(|v| v.as_u64()).map(|n| n as u32))?;
                run_search_docs(&dir, &query_str, top_k as usize)
            }
            "search_history" => {
                let dir = self.directory_from_params(args)?;
                let search_type = args.get("search_type").and_then(|v| v.as_str()).unwrap_or("");
                let search_type = validate_search_type(search_type, &["commits", "file_history", "blame", "commit_detail"])?;
                run_search_history(&dir, args, &search_type)
            }
            _ => Err(CodeMemoryError::validation(format!("unknown tool '{name}'"))),
        }
    }
}

fn check_index_status(directory: &Path) -> Result<serde_json::Value> {
    let cfg = load_config(directory);
    let db_path = cfg.db_path(directory);
    let indexed = std::fs::metadata(&db_path).map(|m| m.len() > 0).unwrap_or(false);
    Ok(json!({
        "indexed": indexed,
        "db_path": db_path.to_string_lossy()
    }))
}

fn get_index_stats(directory: &Path) -> Result<serde_json::Value> {
    let cfg = load_config(directory);
    let db_path = cfg.db_path(directory);
    if !std::fs::metadata(&db_path).map(|m| m.len() > 0).unwrap_or(false) {
        return Ok(json!({
            "indexed": false,
            "files": 0, "symbols": 0, "references": 0, "doc_files": 0, "doc_chunks": 0,
            "embedding_model": serde_json::Value::Null
        }));
    }
    let store = Store::open_for_read(&db_path)?;
    let stats = store.index_stats()?;
    Ok(json!({
        "indexed": true,
        "files": stats.counts.files,
        "symbols": stats.counts.symbols,
        "references": stats.counts.references,
        "doc_files": stats.counts.doc_files,
        "doc_chunks": stats.counts.doc_chunks,
        "symbol_kinds": stats.symbol_kinds,
        "top_extensions": stats.top_extensions,
        "last_indexed_source": stats.last_indexed_source,
        "last_indexed_docs": stats.last_indexed_docs,
        "embedding_model": stats.embedding_model,
        "embedding_dim": stats.embedding_dim,
        "db_size_mb": stats.db_size_mb,
        "journal_mode": stats.journal_mode,
        "wal_present": stats.wal_present,
        "wal_size_mb": stats.wal_size_mb,
    }))
}

fn run_index_codebase(directory: &Path) -> Result<serde_json::Value> {
    let cfg = load_config(directory);
    let embedder = global_embedder(&cfg.embedding.model)?;
    let db_path = cfg.db_path(directory);
    let mut store = Store::open(&db_path, embedder.model_name(), embedder.dimension())?;

    let mut progress = |current: usize, total: usize, phase: &str| {
        tracing::debug!(current, total, phase, "indexing progress");
    };
    let report = index_project(directory, &cfg, &mut store, &embedder, &mut progress)?;
    Ok(serde_json::to_value(report).map_err(|e| CodeMemoryError::indexing(e.to_string()))?)
}

fn open_store_for_query(directory: &Path) -> Result<(Store, std::sync::Arc<crate::embedder::Embedder>)> {
    let cfg = load_config(directory);
    let embedder = global_embedder(&cfg.embedding.model)?;
    let db_path = cfg.db_path(directory);
    if !std::fs::metadata(&db_path).map(|m| m.len() > 0).unwrap_or(false) {
        return Err(CodeMemoryError::indexing("no index found for this directory; run index_codebase first"));
    }
    let store = Store::open(&db_path, embedder.model_name(), embedder.dimension())?;
    Ok((store, embedder))
}

fn run_search_code(directory: &Path, query_str: &str, search_type: &str) -> Result<serde_json::Value> {
    let (store, embedder) = open_store_for_query(directory)?;
    let value = match search_type {
        "topic_discovery" => {
            let results = query::discover_topic(&store, &embedder, query_str, 15, true)?;
            serde_json::to_value(results)
        }
        "definition" => {
            let results = query::find_definition(&store, &embedder, query_str, true)?;
            serde_json::to_value(results)
        }
        "references" => {
            let results = query::find_references(&store, directory, query_str, true)?;
            serde_json::to_value(results)
        }
        "file_structure" => {
            let results = query::get_file_structure(&store, directory, query_str)?;
            serde_json::to_value(results)
        }
        other => return Err(CodeMemoryError::validation(format!("unhandled search_type '{other}'"))),
    };
    value.map_err(|e| CodeMemoryError::storage(e.to_string()))
}

fn run_search_docs(directory: &Path, query_str: &str, top_k: usize) -> Result<serde_json::Value> {
    let (store, embedder) = open_store_for_query(directory)?;
    let results = query::search_documentation(&store, &embedder, query_str, top_k, true)?;
    serde_json::to_value(results).map_err(|e| CodeMemoryError::storage(e.to_string()))
}

const DEFAULT_HISTORY_LIMIT: usize = 20;

fn run_search_history(directory: &Path, args: &serde_json::Value, search_type: &str) -> Result<serde_json::Value> {
    let repo = history::resolve(directory)?;
    let target_file = args.get("target_file").and_then(|v| v.as_str());
    let (line_start, line_end) = validate_line_range(
        args.get("line_start").and_then(|v| v.as_i64()),
        args.get("line_end").and_then(|v| v.as_i64()),
    )?;

    match search_type {
        "commits" => {
            let query_str = validate_query(args.get("query").and_then(|v| v.as_str()).unwrap_or(""))?;
            let hits = history::search_commits(&repo, &query_str, target_file, DEFAULT_HISTORY_LIMIT)?;
            serde_json::to_value(hits).map_err(|e| CodeMemoryError::git(e.to_string()))
        }
        "file_history" => {
            let path = target_file.ok_or_else(|| CodeMemoryError::validation("target_file is required for file_history"))?;
            let hits = history::file_history(&repo, path, DEFAULT_HISTORY_LIMIT)?;
            serde_json::to_value(hits).map_err(|e| CodeMemoryError::git(e.to_string()))
        }
        "blame" => {
            let path = target_file.ok_or_else(|| CodeMemoryError::validation("target_file is required for blame"))?;
            let range = match (line_start, line_end) {
                (Some(s), Some(e)) => Some((s, e)),
                _ => None,
            };
            let hits = history::blame(&repo, path, range)?;
            serde_json::to_value(hits).map_err(|e| CodeMemoryError::git(e.to_string()))
        }
        "commit_detail" => {
            let hash = validate_commit_hash(args.get("query").and_then(|v| v.as_str()).unwrap_or(""))?;
            let detail = history::commit_detail(&repo, &hash, target_file)?;
            serde_json::to_value(detail).map_err(|e| CodeMemoryError::git(e.to_string()))
        }
        other => Err(CodeMemoryError::validation(format!("unhandled search_type '{other}'"))),
    }
}

/// Runs the stdio JSON-RPC 2.0 loop: one newline-delimited request per line,
/// one newline-delimited response per line. Notifications (no `id`) are
/// accepted and ignored except for `initialize`, which may carry a
/// workspace-root hint worth capturing even without a reply.
pub fn run_stdio_server(startup_root: Option<PathBuf>) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    let mut state = ServerState::default();
    if let Some(root) = startup_root {
        state.repo_root = Some(root);
    }

    for line in stdin.lock().lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        if method == "initialize" {
            if let Some(p) = msg.get("params") {
                state.capture_init_root(p);
            }
        }

        let has_id = msg.get("id").is_some();
        if !has_id {
            continue;
        }
        let id = msg.get("id").cloned().unwrap_or(json!(null));

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": msg.get("params").and_then(|p| p.get("protocolVersion")).cloned().unwrap_or(json!("2024-11-05")),
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "codenexus", "version": env!("CARGO_PKG_VERSION") }
                }
            }),
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => state.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                state.tool_call(id, &params)
            }
            "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] } }),
            "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };

        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_path_from_uri_strips_scheme() {
        assert_eq!(extract_path_from_uri("file:///Users/hero/project"), Some(PathBuf::from("/Users/hero/project")));
    }

    #[test]
    fn extract_path_from_uri_fixes_windows_drive() {
        assert_eq!(extract_path_from_uri("file:///C:/Users/hero/project"), Some(PathBuf::from("C:/Users/hero/project")));
    }

    #[test]
    fn is_dead_root_rejects_os_root() {
        assert!(is_dead_root(Path::new("/")));
    }

    #[test]
    fn is_dead_root_accepts_real_project_dir() {
        assert!(!is_dead_root(Path::new("/home/user/project")));
    }
}
