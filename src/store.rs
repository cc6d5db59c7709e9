use std::path::Path;
use std::sync::OnceLock;

use rusqlite::ffi::{sqlite3_auto_extension, SQLITE_OK};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use crate::errors::{CodeMemoryError, Result};

/// Registers the sqlite-vec extension process-wide via `sqlite3_auto_extension`
/// so every `Connection::open` call in the process picks up `vec0` virtual
/// tables and the `vec_f32`/`vec_distance_cosine` scalar functions.
fn register_vec_extension() -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    let result = INIT.get_or_init(|| unsafe {
        let rc = sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(format!("sqlite-vec auto extension registration failed (rc={rc})"))
        }
    });
    result.clone().map_err(CodeMemoryError::storage)
}

/// Which relational table a lexical/vector search targets; each maps to its
/// own FTS5 shadow table and `vec0` embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTable {
    Symbols,
    DocChunks,
}

impl SearchTable {
    fn fts_table(self) -> &'static str {
        match self {
            SearchTable::Symbols => "symbols_fts",
            SearchTable::DocChunks => "doc_chunks_fts",
        }
    }

    fn vec_table(self) -> &'static str {
        match self {
            SearchTable::Symbols => "symbol_embeddings",
            SearchTable::DocChunks => "doc_embeddings",
        }
    }

    fn vec_key_column(self) -> &'static str {
        match self {
            SearchTable::Symbols => "symbol_id",
            SearchTable::DocChunks => "chunk_id",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BmHit {
    pub row_id: i64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct VecHit {
    pub row_id: i64,
    pub distance: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreCounts {
    pub files: i64,
    pub symbols: i64,
    pub references: i64,
    pub doc_files: i64,
    pub doc_chunks: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStatsReport {
    pub counts: StoreCounts,
    /// Symbol count per `kind` (function, method, class, variable, file).
    pub symbol_kinds: Vec<(String, i64)>,
    /// Top 10 file extensions by occurrence in `files.path`.
    pub top_extensions: Vec<(String, i64)>,
    pub last_indexed_source: Option<i64>,
    pub last_indexed_docs: Option<i64>,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<usize>,
    pub db_size_mb: f64,
    pub journal_mode: String,
    pub wal_present: bool,
    pub wal_size_mb: f64,
}

/// Embedded, single-writer store combining relational tables, an FTS5 BM25
/// index, and two `vec0` k-NN tables (one for symbols, one for doc chunks)
/// inside a single `code_memory.db` file.
pub struct Store {
    conn: Connection,
    dim: usize,
    db_path: std::path::PathBuf,
}

/// `code_memory.db-wal`, sitting alongside the main database file.
fn wal_sidecar_path(db_path: &Path) -> std::path::PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-wal");
    std::path::PathBuf::from(os)
}

fn embedding_to_json(vector: &[f32]) -> String {
    let mut s = String::with_capacity(vector.len() * 12 + 2);
    s.push('[');
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push_str(&v.to_string());
    }
    s.push(']');
    s
}

impl Store {
    /// Opens (creating if absent) the database under `project_dir`, ensures
    /// schema + triggers, and reconciles the recorded embedding model/dim
    /// against `(model_name, dim)`. A mismatch triggers a full reset before
    /// any caller can write.
    pub fn open(db_path: &Path, model_name: &str, dim: usize) -> Result<Self> {
        register_vec_extension()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let mut store = Store { conn, dim, db_path: db_path.to_path_buf() };
        store.ensure_relational_schema()?;
        store.reconcile_metadata(model_name, dim)?;
        Ok(store)
    }

    fn ensure_relational_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS index_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                last_modified INTEGER NOT NULL,
                fingerprint TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS symbols (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                parent_symbol_id INTEGER REFERENCES symbols(id) ON DELETE SET NULL,
                source_text TEXT NOT NULL,
                signature TEXT NOT NULL DEFAULT '',
                UNIQUE(file_id, name, kind, line_start)
            );

            CREATE TABLE IF NOT EXISTS "references" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol_name TEXT NOT NULL,
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                line INTEGER NOT NULL,
                UNIQUE(symbol_name, file_id, line)
            );

            CREATE TABLE IF NOT EXISTS doc_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                last_modified INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                doc_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS doc_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_file_id INTEGER NOT NULL REFERENCES doc_files(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                section_title TEXT,
                content TEXT NOT NULL,
                line_start INTEGER,
                line_end INTEGER,
                UNIQUE(doc_file_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_id);
            CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
            CREATE INDEX IF NOT EXISTS idx_references_name ON "references"(symbol_name);
            CREATE INDEX IF NOT EXISTS idx_references_file ON "references"(file_id);
            CREATE INDEX IF NOT EXISTS idx_doc_chunks_file ON doc_chunks(doc_file_id);

            CREATE VIRTUAL TABLE IF NOT EXISTS symbols_fts USING fts5(
                name,
                source_text,
                content='symbols',
                content_rowid='id'
            );

            CREATE TRIGGER IF NOT EXISTS symbols_ai AFTER INSERT ON symbols BEGIN
                INSERT INTO symbols_fts(rowid, name, source_text) VALUES (new.id, new.name, new.source_text);
            END;
            CREATE TRIGGER IF NOT EXISTS symbols_ad AFTER DELETE ON symbols BEGIN
                INSERT INTO symbols_fts(symbols_fts, rowid, name, source_text) VALUES ('delete', old.id, old.name, old.source_text);
            END;
            CREATE TRIGGER IF NOT EXISTS symbols_au AFTER UPDATE ON symbols BEGIN
                INSERT INTO symbols_fts(symbols_fts, rowid, name, source_text) VALUES ('delete', old.id, old.name, old.source_text);
                INSERT INTO symbols_fts(rowid, name, source_text) VALUES (new.id, new.name, new.source_text);
            END;

            CREATE VIRTUAL TABLE IF NOT EXISTS doc_chunks_fts USING fts5(
                content,
                content='doc_chunks',
                content_rowid='id'
            );

            CREATE TRIGGER IF NOT EXISTS doc_chunks_ai AFTER INSERT ON doc_chunks BEGIN
                INSERT INTO doc_chunks_fts(rowid, content) VALUES (new.id, new.content);
            END;
            CREATE TRIGGER IF NOT EXISTS doc_chunks_ad AFTER DELETE ON doc_chunks BEGIN
                INSERT INTO doc_chunks_fts(doc_chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
            END;
            CREATE TRIGGER IF NOT EXISTS doc_chunks_au AFTER UPDATE ON doc_chunks BEGIN
                INSERT INTO doc_chunks_fts(doc_chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
                INSERT INTO doc_chunks_fts(rowid, content) VALUES (new.id, new.content);
            END;
            "#,
        )?;
        Ok(())
    }

    fn create_vec_tables(&self, dim: usize) -> Result<()> {
        self.conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS symbol_embeddings USING vec0(symbol_id INTEGER PRIMARY KEY, embedding FLOAT[{dim}]);
             CREATE VIRTUAL TABLE IF NOT EXISTS doc_embeddings USING vec0(chunk_id INTEGER PRIMARY KEY, embedding FLOAT[{dim}]);"
        ))?;
        Ok(())
    }

    fn read_metadata(&self) -> Result<Option<(String, usize)>> {
        let model: Option<String> = self
            .conn
            .query_row("SELECT value FROM index_metadata WHERE key = 'embedding_model'", [], |r| r.get(0))
            .optional()?;
        let dim: Option<String> = self
            .conn
            .query_row("SELECT value FROM index_metadata WHERE key = 'embedding_dim'", [], |r| r.get(0))
            .optional()?;
        match (model, dim) {
            (Some(m), Some(d)) => {
                let parsed = d.parse::<usize>().map_err(|e| CodeMemoryError::storage(e.to_string()))?;
                Ok(Some((m, parsed)))
            }
            _ => Ok(None),
        }
    }

    fn write_metadata(&self, model_name: &str, dim: usize) -> Result<()> {
        self.conn.execute(
            "INSERT INTO index_metadata(key, value) VALUES ('embedding_model', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![model_name],
        )?;
        self.conn.execute(
            "INSERT INTO index_metadata(key, value) VALUES ('embedding_dim', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![dim.to_string()],
        )?;
        Ok(())
    }

    /// Reads stored embedding-model metadata; absent means first-open (write
    /// it and create sized `vec0` tables), present-but-different means the
    /// configured model changed (purge and re-initialize before any write).
    fn reconcile_metadata(&mut self, model_name: &str, dim: usize) -> Result<()> {
        match self.read_metadata()? {
            None => {
                self.write_metadata(model_name, dim)?;
                self.create_vec_tables(dim)?;
            }
            Some((stored_model, stored_dim)) => {
                if stored_model != model_name || stored_dim != dim {
                    self.reset(model_name, dim)?;
                } else {
                    self.create_vec_tables(dim)?;
                }
            }
        }
        Ok(())
    }

    /// Drops and recreates both embedding tables, truncates every derived
    /// row (symbols, references, doc chunks, files, doc files), and writes
    /// fresh metadata. The only destructive operation in the store; it only
    /// runs when `open` detects a model/dimension change.
    fn reset(&mut self, model_name: &str, dim: usize) -> Result<()> {
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS symbol_embeddings;
             DROP TABLE IF EXISTS doc_embeddings;
             DELETE FROM \"references\";
             DELETE FROM symbols;
             DELETE FROM doc_chunks;
             DELETE FROM doc_files;
             DELETE FROM files;",
        )?;
        self.dim = dim;
        self.write_metadata(model_name, dim)?;
        self.create_vec_tables(dim)?;
        Ok(())
    }

    /// Opens an existing database for read-only queries (status/stats
    /// reporting) without enforcing the configured embedding model/dim —
    /// callers like `check_index_status`/`get_index_stats` must not risk
    /// triggering a destructive reset just to report counts. Skips creating
    /// `vec0` tables when no metadata row exists yet (nothing indexed).
    pub fn open_for_read(db_path: &Path) -> Result<Self> {
        register_vec_extension()?;
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let store = Store { conn, dim: 0, db_path: db_path.to_path_buf() };
        store.ensure_relational_schema()?;
        let dim = match store.read_metadata()? {
            Some((_, d)) => {
                store.create_vec_tables(d)?;
                d
            }
            None => 0,
        };
        Ok(Store { conn: store.conn, dim, db_path: store.db_path })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Row counts across every table, for the `get_index_stats` report.
    pub fn counts(&self) -> Result<StoreCounts> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |r| r.get(0))?) };
        Ok(StoreCounts {
            files: count("SELECT COUNT(*) FROM files")?,
            symbols: count("SELECT COUNT(*) FROM symbols")?,
            references: count("SELECT COUNT(*) FROM \"references\"")?,
            doc_files: count("SELECT COUNT(*) FROM doc_files")?,
            doc_chunks: count("SELECT COUNT(*) FROM doc_chunks")?,
        })
    }

    pub fn metadata(&self) -> Result<Option<(String, usize)>> {
        self.read_metadata()
    }

    /// Full `get_index_stats` report: row counts, symbol-kind and
    /// file-extension distributions, freshness, embedding metadata, and
    /// on-disk footprint (db file size, journaling mode, WAL sidecar).
    pub fn index_stats(&self) -> Result<IndexStatsReport> {
        let counts = self.counts()?;
        let meta = self.read_metadata()?;

        let mut symbol_kinds = Vec::new();
        {
            let mut stmt = self.conn.prepare("SELECT kind, COUNT(*) FROM symbols GROUP BY kind ORDER BY COUNT(*) DESC")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                symbol_kinds.push(row?);
            }
        }

        let mut ext_counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        {
            let mut stmt = self.conn.prepare("SELECT path FROM files")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            for row in rows {
                let path = row?;
                let ext = Path::new(&path)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_ascii_lowercase();
                *ext_counts.entry(ext).or_insert(0) += 1;
            }
        }
        let mut top_extensions: Vec<(String, i64)> = ext_counts.into_iter().collect();
        top_extensions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_extensions.truncate(10);

        let last_indexed_source: Option<i64> = self.conn.query_row("SELECT MAX(last_modified) FROM files", [], |r| r.get(0))?;
        let last_indexed_docs: Option<i64> = self.conn.query_row("SELECT MAX(last_modified) FROM doc_files", [], |r| r.get(0))?;

        let journal_mode: String = self.conn.pragma_query_value(None, "journal_mode", |r| r.get(0)).unwrap_or_else(|_| "unknown".to_string());

        let db_size_mb = std::fs::metadata(&self.db_path).map(|m| m.len() as f64 / 1_048_576.0).unwrap_or(0.0);
        let wal_path = wal_sidecar_path(&self.db_path);
        let wal_meta = std::fs::metadata(&wal_path);
        let wal_present = wal_meta.is_ok();
        let wal_size_mb = wal_meta.map(|m| m.len() as f64 / 1_048_576.0).unwrap_or(0.0);

        Ok(IndexStatsReport {
            counts,
            symbol_kinds,
            top_extensions,
            last_indexed_source,
            last_indexed_docs,
            embedding_model: meta.as_ref().map(|(m, _)| m.clone()),
            embedding_dim: meta.map(|(_, d)| d),
            db_size_mb,
            journal_mode,
            wal_present,
            wal_size_mb,
        })
    }

    // ---- file / symbol / reference / doc upserts (outside any explicit tx use self.conn directly) ----

    pub fn upsert_file(&self, path: &str, last_modified: i64, fingerprint: &str) -> Result<i64> {
        upsert_file_tx(&self.conn, path, last_modified, fingerprint)
    }

    pub fn get_file(&self, path: &str) -> Result<Option<(i64, i64, String)>> {
        get_file_tx(&self.conn, path)
    }

    pub fn delete_file_data(&self, file_id: i64) -> Result<()> {
        delete_file_data_tx(&self.conn, file_id)
    }

    pub fn upsert_doc_file(&self, path: &str, last_modified: i64, fingerprint: &str, doc_type: &str) -> Result<i64> {
        upsert_doc_file_tx(&self.conn, path, last_modified, fingerprint, doc_type)
    }

    pub fn get_doc_file(&self, path: &str) -> Result<Option<(i64, i64, String)>> {
        get_doc_file_tx(&self.conn, path)
    }

    pub fn delete_doc_file_data(&self, doc_file_id: i64) -> Result<()> {
        delete_doc_file_data_tx(&self.conn, doc_file_id)
    }

    pub fn upsert_embedding(&self, symbol_id: i64, vector: &[f32]) -> Result<()> {
        upsert_symbol_embedding_tx(&self.conn, symbol_id, vector)
    }

    pub fn upsert_doc_embedding(&self, chunk_id: i64, vector: &[f32]) -> Result<()> {
        upsert_doc_embedding_tx(&self.conn, chunk_id, vector)
    }

    /// Runs a BM25 match over `table`; returns rows ordered best-first
    /// (ascending raw BM25 score — lower is better under this convention).
    /// A query-parse failure degrades to an empty result rather than an
    /// error, per the lexical-search fallback policy.
    pub fn bm25_search(&self, table: SearchTable, query: &str, limit: usize) -> Result<Vec<BmHit>> {
        let sql = format!(
            "SELECT rowid, bm25({fts}) AS score FROM {fts} WHERE {fts} MATCH ?1 ORDER BY score LIMIT ?2",
            fts = table.fts_table()
        );
        let mut stmt = match self.conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return Ok(vec![]),
        };
        let rows = stmt.query_map(params![query, limit as i64], |r| {
            Ok(BmHit { row_id: r.get(0)?, score: r.get(1)? })
        });
        let rows = match rows {
            Ok(r) => r,
            Err(_) => return Ok(vec![]),
        };
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(h) => out.push(h),
                Err(_) => return Ok(vec![]),
            }
        }
        Ok(out)
    }

    /// k-NN search over `table`'s `vec0` table, ordered by ascending
    /// Euclidean distance (equivalent to cosine on L2-normalized vectors).
    pub fn vector_search(&self, table: SearchTable, query_vec: &[f32], k: usize) -> Result<Vec<VecHit>> {
        if k == 0 {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {key}, distance FROM {vt} WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
            key = table.vec_key_column(),
            vt = table.vec_table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let json = embedding_to_json(query_vec);
        let rows = stmt.query_map(params![json, k as i64], |r| {
            Ok(VecHit { row_id: r.get(0)?, distance: r.get(1)? })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Looks up a symbol's BM25-indexed source text so the simple-highlights
    /// fallback (§4.F) can scan it when the FTS snippet primitive fails.
    pub fn symbol_source_text(&self, symbol_id: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT source_text FROM symbols WHERE id = ?1", params![symbol_id], |r| r.get(0))
            .optional()?)
    }

    /// Up to three FTS5 snippet highlights for a symbol match, or `None` if
    /// the snippet primitive itself fails (caller falls back to a manual scan).
    pub fn symbol_snippets(&self, symbol_id: i64, query: &str) -> Option<Vec<String>> {
        let sql = "SELECT snippet(symbols_fts, 1, '[', ']', '...', 10) FROM symbols_fts WHERE rowid = ?1 AND symbols_fts MATCH ?2 LIMIT 3";
        let mut stmt = self.conn.prepare(sql).ok()?;
        let rows = stmt.query_map(params![symbol_id, query], |r| r.get::<_, String>(0)).ok()?;
        let mut out = Vec::new();
        for row in rows.flatten() {
            out.push(row);
        }
        Some(out)
    }
}

// Free functions so both `&Connection` and `&Transaction` callers (which
// deref to `Connection`) can share the same SQL without borrow conflicts.

pub fn upsert_file_tx(conn: &Connection, path: &str, last_modified: i64, fingerprint: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO files(path, last_modified, fingerprint) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET last_modified = excluded.last_modified, fingerprint = excluded.fingerprint",
        params![path, last_modified, fingerprint],
    )?;
    Ok(conn.query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| r.get(0))?)
}

pub fn get_file_tx(conn: &Connection, path: &str) -> Result<Option<(i64, i64, String)>> {
    Ok(conn
        .query_row(
            "SELECT id, last_modified, fingerprint FROM files WHERE path = ?1",
            params![path],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?)
}

pub fn delete_file_data_tx(conn: &Connection, file_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM symbol_embeddings WHERE symbol_id IN (SELECT id FROM symbols WHERE file_id = ?1)",
        params![file_id],
    )?;
    conn.execute("DELETE FROM symbols WHERE file_id = ?1", params![file_id])?;
    conn.execute("DELETE FROM \"references\" WHERE file_id = ?1", params![file_id])?;
    Ok(())
}

pub fn upsert_doc_file_tx(conn: &Connection, path: &str, last_modified: i64, fingerprint: &str, doc_type: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO doc_files(path, last_modified, fingerprint, doc_type) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(path) DO UPDATE SET last_modified = excluded.last_modified, fingerprint = excluded.fingerprint, doc_type = excluded.doc_type",
        params![path, last_modified, fingerprint, doc_type],
    )?;
    Ok(conn.query_row("SELECT id FROM doc_files WHERE path = ?1", params![path], |r| r.get(0))?)
}

pub fn get_doc_file_tx(conn: &Connection, path: &str) -> Result<Option<(i64, i64, String)>> {
    Ok(conn
        .query_row(
            "SELECT id, last_modified, fingerprint FROM doc_files WHERE path = ?1",
            params![path],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?)
}

pub fn delete_doc_file_data_tx(conn: &Connection, doc_file_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM doc_embeddings WHERE chunk_id IN (SELECT id FROM doc_chunks WHERE doc_file_id = ?1)",
        params![doc_file_id],
    )?;
    conn.execute("DELETE FROM doc_chunks WHERE doc_file_id = ?1", params![doc_file_id])?;
    Ok(())
}

/// Inserts a symbol row, resolving `parent_local_index` (an index into the
/// same file's symbol list being persisted) to an already-inserted database
/// id via `local_to_db_id`, per the pre-order persistence contract.
pub fn upsert_symbol_tx(
    conn: &Connection,
    file_id: i64,
    name: &str,
    kind: &str,
    line_start: u32,
    line_end: u32,
    parent_symbol_id: Option<i64>,
    source_text: &str,
    signature: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO symbols(file_id, name, kind, line_start, line_end, parent_symbol_id, source_text, signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(file_id, name, kind, line_start) DO UPDATE SET
             line_end = excluded.line_end,
             parent_symbol_id = excluded.parent_symbol_id,
             source_text = excluded.source_text,
             signature = excluded.signature",
        params![file_id, name, kind, line_start, line_end, parent_symbol_id, source_text, signature],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM symbols WHERE file_id = ?1 AND name = ?2 AND kind = ?3 AND line_start = ?4",
        params![file_id, name, kind, line_start],
        |r| r.get(0),
    )?)
}

pub fn upsert_reference_tx(conn: &Connection, symbol_name: &str, file_id: i64, line: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO \"references\"(symbol_name, file_id, line) VALUES (?1, ?2, ?3)
         ON CONFLICT(symbol_name, file_id, line) DO NOTHING",
        params![symbol_name, file_id, line],
    )?;
    Ok(())
}

pub fn upsert_doc_chunk_tx(
    conn: &Connection,
    doc_file_id: i64,
    chunk_index: u32,
    section_title: Option<&str>,
    content: &str,
    line_start: Option<u32>,
    line_end: Option<u32>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO doc_chunks(doc_file_id, chunk_index, section_title, content, line_start, line_end)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(doc_file_id, chunk_index) DO UPDATE SET
             section_title = excluded.section_title,
             content = excluded.content,
             line_start = excluded.line_start,
             line_end = excluded.line_end",
        params![doc_file_id, chunk_index, section_title, content, line_start, line_end],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM doc_chunks WHERE doc_file_id = ?1 AND chunk_index = ?2",
        params![doc_file_id, chunk_index],
        |r| r.get(0),
    )?)
}

pub fn upsert_symbol_embedding_tx(conn: &Connection, symbol_id: i64, vector: &[f32]) -> Result<()> {
    conn.execute("DELETE FROM symbol_embeddings WHERE symbol_id = ?1", params![symbol_id])?;
    conn.execute(
        "INSERT INTO symbol_embeddings(symbol_id, embedding) VALUES (?1, ?2)",
        params![symbol_id, embedding_to_json(vector)],
    )?;
    Ok(())
}

pub fn upsert_doc_embedding_tx(conn: &Connection, chunk_id: i64, vector: &[f32]) -> Result<()> {
    conn.execute("DELETE FROM doc_embeddings WHERE chunk_id = ?1", params![chunk_id])?;
    conn.execute(
        "INSERT INTO doc_embeddings(chunk_id, embedding) VALUES (?1, ?2)",
        params![chunk_id, embedding_to_json(vector)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_store(dim: usize) -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("code_memory.db");
        let store = Store::open(&db_path, "test-model", dim).unwrap();
        (dir, store)
    }

    #[test]
    fn fresh_open_writes_metadata_and_vec_tables() {
        let (_dir, store) = open_test_store(8);
        let meta = store.read_metadata().unwrap().unwrap();
        assert_eq!(meta, ("test-model".to_string(), 8));
    }

    #[test]
    fn model_change_resets_derived_rows() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("code_memory.db");
        {
            let store = Store::open(&db_path, "model-a", 4).unwrap();
            let file_id = store.upsert_file("a.py", 1, "fp1").unwrap();
            let sym_id = upsert_symbol_tx(&store.conn, file_id, "foo", "function", 1, 2, None, "def foo(): pass", "def foo():").unwrap();
            store.upsert_embedding(sym_id, &[0.1, 0.2, 0.3, 0.4]).unwrap();
        }
        let store = Store::open(&db_path, "model-b", 6).unwrap();
        let count: i64 = store.conn.query_row("SELECT COUNT(*) FROM symbols", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
        assert_eq!(store.dim(), 6);
    }

    #[test]
    fn delete_file_data_cascades() {
        let (_dir, store) = open_test_store(4);
        let file_id = store.upsert_file("a.py", 1, "fp").unwrap();
        let sym_id = upsert_symbol_tx(&store.conn, file_id, "foo", "function", 1, 2, None, "def foo(): pass", "def foo():").unwrap();
        upsert_reference_tx(&store.conn, "foo", file_id, 5).unwrap();
        store.upsert_embedding(sym_id, &[0.0; 4]).unwrap();

        store.delete_file_data(file_id).unwrap();

        let syms: i64 = store.conn.query_row("SELECT COUNT(*) FROM symbols", [], |r| r.get(0)).unwrap();
        let refs: i64 = store.conn.query_row("SELECT COUNT(*) FROM \"references\"", [], |r| r.get(0)).unwrap();
        let embs: i64 = store.conn.query_row("SELECT COUNT(*) FROM symbol_embeddings", [], |r| r.get(0)).unwrap();
        assert_eq!(syms, 0);
        assert_eq!(refs, 0);
        assert_eq!(embs, 0);
    }

    #[test]
    fn index_stats_reports_histograms_and_footprint() {
        let (_dir, store) = open_test_store(4);
        let file_id = store.upsert_file("src/a.py", 100, "fp").unwrap();
        upsert_symbol_tx(&store.conn, file_id, "foo", "function", 1, 2, None, "def foo(): pass", "def foo():").unwrap();
        upsert_symbol_tx(&store.conn, file_id, "Bar", "class", 3, 5, None, "class Bar: pass", "class Bar:").unwrap();

        let stats = store.index_stats().unwrap();
        assert_eq!(stats.counts.files, 1);
        assert_eq!(stats.counts.symbols, 2);
        assert!(stats.symbol_kinds.contains(&("function".to_string(), 1)));
        assert!(stats.symbol_kinds.contains(&("class".to_string(), 1)));
        assert!(stats.top_extensions.contains(&("py".to_string(), 1)));
        assert_eq!(stats.last_indexed_source, Some(100));
        assert_eq!(stats.embedding_model.as_deref(), Some("test-model"));
        assert_eq!(stats.journal_mode.to_lowercase(), "wal");
    }

    #[test]
    fn bm25_and_vector_search_roundtrip() {
        let (_dir, store) = open_test_store(4);
        let file_id = store.upsert_file("a.py", 1, "fp").unwrap();
        let sym_id = upsert_symbol_tx(&store.conn, file_id, "login_handler", "function", 1, 3, None, "def login_handler(): authenticate()", "def login_handler():").unwrap();
        store.upsert_embedding(sym_id, &[1.0, 0.0, 0.0, 0.0]).unwrap();

        let bm = store.bm25_search(SearchTable::Symbols, "login_handler", 10).unwrap();
        assert!(bm.iter().any(|h| h.row_id == sym_id));

        let vec = store.vector_search(SearchTable::Symbols, &[1.0, 0.0, 0.0, 0.0], 5).unwrap();
        assert!(vec.iter().any(|h| h.row_id == sym_id));
    }
}
