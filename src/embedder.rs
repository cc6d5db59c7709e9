use std::sync::{Arc, OnceLock};

use model2vec_rs::model::StaticModel;

use crate::errors::{CodeMemoryError, Result};

/// Turns text into a dense, L2-normalized vector. Backed by a Model2Vec
/// static embedding model loaded once per process; `encode_batch` is the
/// only supported path for bulk indexing since the underlying model favors
/// large batches over many single calls.
pub struct Embedder {
    model: StaticModel,
    model_name: String,
    dim: usize,
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

impl Embedder {
    /// Loads the named HuggingFace Model2Vec repo and determines its native
    /// dimension from a throwaway encode, since the crate does not expose a
    /// dimension accessor ahead of the first call.
    pub fn load(model_name: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_name, None, None, None)
            .map_err(|e| CodeMemoryError::embedding(format!("failed to load embedding model '{model_name}': {e}")))?;
        let probe = model.encode_single("dimension probe");
        let dim = probe.len();
        if dim == 0 {
            return Err(CodeMemoryError::embedding(format!(
                "embedding model '{model_name}' produced a zero-length vector"
            )));
        }
        Ok(Self { model, model_name: model_name.to_string(), dim })
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    fn prefixed(task_type: &str, text: &str) -> String {
        if task_type.is_empty() {
            text.to_string()
        } else {
            format!("{task_type}: {text}")
        }
    }

    /// Encodes one string, L2-normalized to unit length.
    pub fn encode_one(&self, text: &str, task_type: &str) -> Vec<f32> {
        normalize_l2(self.model.encode_single(&Self::prefixed(task_type, text)))
    }

    /// Encodes many strings in input order, `batch_size` at a time. The
    /// chunking exists so a caller can bound peak memory on very large
    /// indexing runs; each text within a chunk still goes through the same
    /// task-type prefix as `encode_one`.
    pub fn encode_batch(&self, texts: &[String], task_type: &str, batch_size: usize) -> Vec<Vec<f32>> {
        let batch_size = batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(batch_size) {
            for text in chunk {
                out.push(normalize_l2(self.model.encode_single(&Self::prefixed(task_type, text))));
            }
        }
        out
    }

    /// Loads weights and runs one throwaway encode to amortize cold-start
    /// latency before the first real request.
    pub fn warmup(&self) {
        let _ = self.model.encode_single("warmup");
    }
}

static INSTANCE: OnceLock<std::result::Result<Arc<Embedder>, String>> = OnceLock::new();

/// Process-wide lazy singleton. The model named in the first successful call
/// wins for the lifetime of the process, matching the "single embedder
/// instance" resource policy — callers are expected to pass the same
/// configured model name on every call within one process.
pub fn global_embedder(model_name: &str) -> Result<Arc<Embedder>> {
    let result = INSTANCE.get_or_init(|| Embedder::load(model_name).map(Arc::new).map_err(|e| e.to_string()));
    result.clone().map_err(CodeMemoryError::embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_includes_task_type() {
        assert_eq!(Embedder::prefixed("nl2code", "hello"), "nl2code: hello");
        assert_eq!(Embedder::prefixed("", "hello"), "hello");
    }

    #[test]
    fn normalize_l2_produces_unit_vector() {
        let v = normalize_l2(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn normalize_l2_handles_zero_vector() {
        let v = normalize_l2(vec![0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
