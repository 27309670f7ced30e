use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::embedding::{Embedder, EmbeddingError, cosine_similarity};
use crate::models::{
    DetectionCatalog, DetectionPointConfig, EngineSignal, EvidenceSpan, Transcript,
};
use crate::stats::PipelineStats;

/// Configuration for the semantic matcher
#[derive(Debug, Clone)]
pub struct SemanticConfig {
    /// Texts per embedding request
    pub batch_size: usize,
    /// Maximum cached utterance embeddings
    pub cache_capacity: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            cache_capacity: 1000,
        }
    }
}

/// Embedded exemplar phrases per detection point, built once at startup
#[derive(Debug, Default)]
pub struct ExemplarIndex {
    vectors: HashMap<String, Vec<Vec<f32>>>,
    /// Points whose exemplars could not be embedded, with the reason
    failed: HashMap<String, String>,
}

impl ExemplarIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Embed every point's exemplars; failures only disable that point
    pub async fn build(
        catalog: &DetectionCatalog,
        embedder: &dyn Embedder,
        batch_size: usize,
    ) -> Self {
        let mut index = Self::default();

        for point in catalog.points() {
            if point.exemplar_phrases.is_empty() {
                continue;
            }

            let mut vectors = Vec::with_capacity(point.exemplar_phrases.len());
            let mut failure = None;
            for chunk in point.exemplar_phrases.chunks(batch_size.max(1)) {
                match embedder.embed_batch(chunk).await {
                    Ok(batch) => vectors.extend(batch),
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }

            match failure {
                Some(reason) => {
                    warn!("Exemplar embedding failed for {}: {}", point.key(), reason);
                    index.failed.insert(point.key(), reason);
                }
                None => {
                    index.vectors.insert(point.key(), vectors);
                }
            }
        }

        info!(
            "Exemplar index built with {} ({} points, {} failed)",
            embedder.model_name(),
            index.vectors.len(),
            index.failed.len()
        );
        index
    }

    pub fn insert(&mut self, key: impl Into<String>, vectors: Vec<Vec<f32>>) {
        self.vectors.insert(key.into(), vectors);
    }

    pub fn exemplars(&self, key: &str) -> Option<&[Vec<f32>]> {
        self.vectors.get(key).map(|v| v.as_slice())
    }

    pub fn failure(&self, key: &str) -> Option<&str> {
        self.failed.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

/// Size-bounded utterance embedding cache keyed by text
///
/// When full, the oldest insertion is evicted.
#[derive(Debug)]
pub struct EmbeddingCache {
    entries: DashMap<String, (u64, Arc<Vec<f32>>)>,
    capacity: usize,
    sequence: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.entries.get(text).map(|e| Arc::clone(&e.value().1))
    }

    pub fn insert(&self, text: String, vector: Arc<Vec<f32>>) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&text) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(text, (seq, vector));
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().0)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of one semantic match
#[derive(Debug, Clone)]
pub struct SemanticOutcome {
    pub signal: EngineSignal,
    /// Set when the backend or index failed
    pub failure_reason: Option<String>,
}

impl SemanticOutcome {
    fn absent() -> Self {
        Self {
            signal: EngineSignal::Absent,
            failure_reason: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            signal: EngineSignal::Absent,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Similarity search of utterances against point exemplars
pub struct SemanticMatcher {
    embedder: Option<Arc<dyn Embedder>>,
    index: Arc<ExemplarIndex>,
    cache: EmbeddingCache,
    config: SemanticConfig,
    stats: Arc<PipelineStats>,
}

impl SemanticMatcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<ExemplarIndex>,
        config: SemanticConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            embedder: Some(embedder),
            index,
            cache: EmbeddingCache::new(config.cache_capacity),
            config,
            stats,
        }
    }

    /// A matcher that always reports `Absent`
    pub fn disabled(stats: Arc<PipelineStats>) -> Self {
        let config = SemanticConfig::default();
        Self {
            embedder: None,
            index: Arc::new(ExemplarIndex::empty()),
            cache: EmbeddingCache::new(0),
            config,
            stats,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Score one point; backend problems come back as `Absent` plus a reason
    pub async fn match_point(
        &self,
        point: &DetectionPointConfig,
        transcript: &Transcript,
    ) -> SemanticOutcome {
        let Some(embedder) = &self.embedder else {
            return SemanticOutcome::absent();
        };

        let key = point.key();
        if let Some(reason) = self.index.failure(&key) {
            return SemanticOutcome::failed(format!("exemplar index unavailable: {}", reason));
        }
        let Some(exemplars) = self.index.exemplars(&key) else {
            return SemanticOutcome::absent();
        };
        if exemplars.is_empty() {
            return SemanticOutcome::absent();
        }

        let candidates: Vec<_> = transcript
            .by_speaker(point.speaker_filter)
            .filter(|u| !u.text.trim().is_empty())
            .collect();
        if candidates.is_empty() {
            return SemanticOutcome::absent();
        }

        let texts: Vec<String> = candidates.iter().map(|u| u.text.trim().to_string()).collect();
        let vectors = match self.embed_texts(embedder.as_ref(), &texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                self.stats.record_semantic_error();
                warn!("Semantic match degraded for {}: {}", key, e);
                return SemanticOutcome::failed(e.to_string());
            }
        };

        let mut spans = Vec::new();
        for (utterance, vector) in candidates.iter().zip(vectors.iter()) {
            let mut best = 0.0f32;
            for exemplar in exemplars {
                if exemplar.len() != vector.len() {
                    self.stats.record_semantic_error();
                    let err = EmbeddingError::DimensionMismatch {
                        expected: exemplar.len(),
                        actual: vector.len(),
                    };
                    warn!("Semantic match degraded for {}: {}", key, err);
                    return SemanticOutcome::failed(err.to_string());
                }
                best = best.max(cosine_similarity(vector, exemplar));
            }

            let score = f64::from(best).clamp(0.0, 1.0);
            if score >= point.similarity_threshold && score > 0.0 {
                spans.push(EvidenceSpan {
                    utterance_index: utterance.index,
                    quote: utterance.text.trim().to_string(),
                    timestamp: utterance.timestamp,
                    confidence: score,
                });
            }
        }

        debug!("Semantic match {}: {} span(s)", key, spans.len());

        let confidence = spans.iter().map(|s| s.confidence).fold(0.0, f64::max);
        SemanticOutcome {
            signal: EngineSignal::present(confidence, spans),
            failure_reason: None,
        }
    }

    /// Embed every utterance of a call once, before points fan out
    ///
    /// Points running in parallel then read the cache instead of each
    /// requesting the same texts. Failures are left for the per-point path.
    pub async fn prefetch(&self, transcript: &Transcript) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        if self.index.is_empty() {
            return;
        }

        let texts: Vec<String> = transcript
            .utterances()
            .iter()
            .map(|u| u.text.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if let Err(e) = self.embed_texts(embedder.as_ref(), &texts).await {
            warn!("Utterance embedding prefetch failed: {}", e);
        }
    }

    /// Embed texts through the cache, requesting only misses in batches
    async fn embed_texts(
        &self,
        embedder: &dyn Embedder,
        texts: &[String],
    ) -> Result<Vec<Arc<Vec<f32>>>, EmbeddingError> {
        let mut resolved: HashMap<&str, Arc<Vec<f32>>> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();

        for text in texts {
            if resolved.contains_key(text.as_str()) || missing.contains(text) {
                continue;
            }
            match self.cache.get(text) {
                Some(vector) => {
                    resolved.insert(text.as_str(), vector);
                }
                None => missing.push(text.clone()),
            }
        }

        self.stats.record_cache_hits(resolved.len() as u64);
        self.stats.record_cache_misses(missing.len() as u64);

        let mut fetched: HashMap<String, Arc<Vec<f32>>> = HashMap::new();
        for chunk in missing.chunks(self.config.batch_size.max(1)) {
            self.stats.record_semantic_call();
            let batch = embedder.embed_batch(chunk).await?;
            if batch.len() != chunk.len() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: chunk.len(),
                    actual: batch.len(),
                });
            }
            for (text, vector) in chunk.iter().zip(batch) {
                let vector = Arc::new(vector);
                self.cache.insert(text.clone(), Arc::clone(&vector));
                fetched.insert(text.clone(), vector);
            }
        }

        texts
            .iter()
            .map(|text| {
                resolved
                    .get(text.as_str())
                    .or_else(|| fetched.get(text))
                    .cloned()
                    .ok_or_else(|| EmbeddingError::Backend(format!("no vector for {:?}", text)))
            })
            .collect()
    }
}
