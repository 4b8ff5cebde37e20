//! Embedding provider trait, chunk embedder, and vector utilities.
//!
//! Concrete HTTP providers (OpenAI, Ollama) live in the `mimic` app crate.
//! [`HashingEmbedder`] is a deterministic offline provider used by tests and
//! by `provider = "hash"` setups without network access.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::error::CoreError;
use crate::keyword;
use crate::models::{Chunk, EmbeddedChunk};

/// Default dimensionality of document embeddings.
pub const DOC_EMBEDDING_DIM: usize = 1536;

/// An embedding backend.
///
/// `embed_texts` must return one vector per input, in input order, and be
/// deterministic for identical input.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed_texts(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::provider(provider.model_name(), "empty embedding response").into())
}

/// Embed chunks in batches of `batch_size` texts per provider call.
///
/// Each chunk contributes its full content followed by its mini-chunks, so
/// the resulting `embeddings` list has `1 + mini_chunks.len()` entries.
/// Output order matches input order.
pub async fn embed_chunks(
    provider: &dyn EmbeddingProvider,
    chunks: &[Chunk],
    batch_size: usize,
) -> Result<Vec<EmbeddedChunk>> {
    let batch_size = batch_size.max(1);

    let mut texts: Vec<String> = Vec::new();
    let mut counts: Vec<usize> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        texts.push(chunk.content.clone());
        texts.extend(chunk.mini_chunks.iter().cloned());
        counts.push(1 + chunk.mini_chunks.len());
    }

    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let embedded = provider.embed_texts(batch).await?;
        if embedded.len() != batch.len() {
            return Err(CoreError::provider(
                provider.model_name(),
                format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embedded.len()
                ),
            )
            .into());
        }
        for v in &embedded {
            if v.len() != provider.dims() {
                bail!(
                    "embedding dimension mismatch: model '{}' returned {} dims, expected {}",
                    provider.model_name(),
                    v.len(),
                    provider.dims()
                );
            }
        }
        vectors.extend(embedded);
    }

    let mut vectors = vectors.into_iter();
    let embedded_chunks = chunks
        .iter()
        .zip(counts)
        .map(|(chunk, n)| EmbeddedChunk {
            chunk: chunk.clone(),
            embeddings: vectors.by_ref().take(n).collect(),
        })
        .collect();

    Ok(embedded_chunks)
}

/// Deterministic feature-hashing embedder over non-stopword terms.
///
/// Texts sharing terms get positive cosine similarity; the vectors are
/// L2-normalised. Not a semantic model, but stable and offline.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for term in keyword::analyze(text) {
            let h = fnv1a(term.as_bytes());
            let idx = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, mismatched, or
/// zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentSource;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_texts(texts).await
        }
    }

    fn chunk(id: usize, content: &str, minis: &[&str]) -> Chunk {
        Chunk {
            document_id: "d".to_string(),
            chunk_id: id,
            content: content.to_string(),
            blurb: String::new(),
            source_links: BTreeMap::new(),
            section_continuation: false,
            source_type: DocumentSource::Web,
            semantic_identifier: "d".to_string(),
            metadata: BTreeMap::new(),
            mini_chunks: minis.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_embed_chunks_batches_and_preserves_order() {
        let provider = CountingEmbedder {
            inner: HashingEmbedder::new(32),
            calls: AtomicUsize::new(0),
        };
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(i, &format!("text {}", i), &[])).collect();
        let embedded = embed_chunks(&provider, &chunks, 8).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(embedded.len(), 10);
        for (i, e) in embedded.iter().enumerate() {
            assert_eq!(e.chunk.chunk_id, i);
            assert_eq!(e.embeddings.len(), 1);
            assert_eq!(e.embeddings[0], provider.inner.embed_one(&format!("text {}", i)));
        }
    }

    #[tokio::test]
    async fn test_embed_chunks_with_mini_chunks() {
        let provider = HashingEmbedder::new(16);
        let chunks = vec![chunk(0, "alpha beta", &["alpha", "beta"]), chunk(1, "gamma", &[])];
        let embedded = embed_chunks(&provider, &chunks, 3).await.unwrap();
        assert_eq!(embedded[0].embeddings.len(), 3);
        assert_eq!(embedded[0].embeddings[1], provider.embed_one("alpha"));
        assert_eq!(embedded[1].embeddings.len(), 1);
        assert_eq!(embedded[1].embeddings[0], provider.embed_one("gamma"));
    }

    #[test]
    fn test_hashing_embedder_similarity() {
        let e = HashingEmbedder::new(256);
        let a = e.embed_one("The Eiffel Tower is in Paris");
        let b = e.embed_one("Where is the Eiffel Tower?");
        let c = e.embed_one("Quarterly revenue grew strongly");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
