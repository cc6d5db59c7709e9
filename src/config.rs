use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard safety ceiling: files larger than this are **always** skipped, regardless of config.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 1_000_000; // 1 MB

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocChunkConfig {
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size: usize,
}

impl Default for DocChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            overlap: 100,
            min_chunk_size: 50,
        }
    }
}

/// Controls workspace scanning behavior beyond the built-in always-skip list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory *names* to skip anywhere in the tree, layered on top of the
    /// built-in always-skip list (target/dist/build/.git/venv/node_modules/...).
    pub exclude_dir_names: Vec<String>,
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_dir_names: vec![],
            max_file_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// HuggingFace model repo ID used by Model2Vec-RS.
    pub model: String,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "minishlab/potion-retrieval-32M".to_string(),
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory (relative to the project root, unless absolute) holding
    /// `code_memory.db`. Defaults to the project root itself.
    pub db_dir: PathBuf,
    pub scan: ScanConfig,
    pub doc_chunk: DocChunkConfig,
    pub embedding: EmbeddingConfig,
    /// Size of the bounded worker pool used by the parse phase.
    pub worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("."),
            scan: ScanConfig::default(),
            doc_chunk: DocChunkConfig::default(),
            embedding: EmbeddingConfig::default(),
            worker_threads: 4,
        }
    }
}

impl Config {
    pub fn db_path(&self, project_dir: &Path) -> PathBuf {
        let dir = if self.db_dir.is_absolute() {
            self.db_dir.clone()
        } else {
            project_dir.join(&self.db_dir)
        };
        dir.join("code_memory.db")
    }
}

/// Loads `.code-memory.json` from the project root, falling back to all
/// defaults on any read or parse failure. Intentionally lenient: a malformed
/// config should never block indexing or search.
pub fn load_config(project_dir: &Path) -> Config {
    let primary = project_dir.join(".code-memory.json");
    let Ok(text) = std::fs::read_to_string(&primary) else {
        return Config::default();
    };
    serde_json::from_str::<Config>(&text).unwrap_or_else(|_| Config::default())
}
