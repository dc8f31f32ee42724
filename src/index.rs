/// Search indexes layered over the storage engine.
///
/// Two independent indexes receive `(key, value)` updates on every write and
/// key removals on delete:
///
/// - [`FullTextIndex`]: an inverted word index (`word → keys`) answering
///   AND-queries over tokenised values.
/// - [`EmbeddingIndex`]: a 27-dimensional character-frequency embedding per
///   value, answering top-k cosine-similarity queries.
///
/// Both are persisted whole to disk (flush + fsync) after each update, and
/// both are decorators: the storage engine itself knows nothing about them.
use crate::error::KvResult;
use crate::store::{persist_json, KvStore};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Inverted-index file name inside the data directory.
const FULLTEXT_FILE: &str = "fulltext_index.json";

/// Embedding-index file name inside the data directory.
const EMBEDDING_FILE: &str = "embedding_index.json";

/// Dimensions of the value embedding: a–z frequencies plus a length feature.
const EMBEDDING_DIMS: usize = 27;

/// Lowercase word tokens of a text, split on non-word characters.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

/// Full-text search over stored values via an inverted index.
pub struct FullTextIndex {
    index_path: PathBuf,
    /// word → keys whose value contains the word
    index: HashMap<String, BTreeSet<String>>,
}

impl FullTextIndex {
    /// Load the index from `data_dir`, starting empty if the file is
    /// missing or unreadable.
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        let index_path = data_dir.as_ref().join(FULLTEXT_FILE);
        let index = fs::read(&index_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self { index_path, index }
    }

    /// Index a value for a key, replacing any prior postings for that key.
    pub fn index_value(&mut self, key: &str, value: &str) -> KvResult<()> {
        self.remove_postings(key);
        for word in tokenize(value) {
            self.index.entry(word).or_default().insert(key.to_string());
        }
        self.save()
    }

    /// Remove all postings for a key.
    pub fn remove_key(&mut self, key: &str) -> KvResult<()> {
        self.remove_postings(key);
        self.save()
    }

    /// Keys whose values contain every word of the query (AND search).
    pub fn search(&self, query: &str) -> Vec<String> {
        let words = tokenize(query);
        if words.is_empty() {
            return Vec::new();
        }

        let mut result: Option<BTreeSet<String>> = None;
        for word in &words {
            let Some(keys) = self.index.get(word) else {
                return Vec::new();
            };
            result = Some(match result {
                None => keys.clone(),
                Some(acc) => acc.intersection(keys).cloned().collect(),
            });
        }

        result.map(|keys| keys.into_iter().collect()).unwrap_or_default()
    }

    fn remove_postings(&mut self, key: &str) {
        self.index.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    fn save(&self) -> KvResult<()> {
        persist_json(&self.index_path, &self.index)
    }
}

/// Similarity search over stored values via character-frequency embeddings.
///
/// The embedding is deliberately simple: normalised a–z counts plus a
/// scaled length feature. It stands in for a real model while exercising
/// the same index shape (key → vector, brute-force cosine scan).
pub struct EmbeddingIndex {
    index_path: PathBuf,
    /// key → embedding of its value
    embeddings: HashMap<String, Vec<f64>>,
}

impl EmbeddingIndex {
    /// Load the index from `data_dir`, starting empty if the file is
    /// missing or unreadable.
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        let index_path = data_dir.as_ref().join(EMBEDDING_FILE);
        let embeddings = fs::read(&index_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            index_path,
            embeddings,
        }
    }

    /// Embed a value and store it under the key.
    pub fn index_value(&mut self, key: &str, value: &str) -> KvResult<()> {
        self.embeddings.insert(key.to_string(), embed(value));
        self.save()
    }

    /// Remove the embedding for a key.
    pub fn remove_key(&mut self, key: &str) -> KvResult<()> {
        self.embeddings.remove(key);
        self.save()
    }

    /// Top-k keys by cosine similarity to the query's embedding.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
        let query_embedding = embed(query);

        let mut scored: Vec<(String, f64)> = self
            .embeddings
            .iter()
            .map(|(key, embedding)| (key.clone(), cosine_similarity(&query_embedding, embedding)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    fn save(&self) -> KvResult<()> {
        persist_json(&self.index_path, &self.embeddings)
    }
}

/// Character-frequency embedding: normalised a–z counts, then `len / 100`.
fn embed(text: &str) -> Vec<f64> {
    let lower = text.to_lowercase();
    let mut counts = [0u32; 26];
    for b in lower.bytes() {
        if b.is_ascii_lowercase() {
            counts[(b - b'a') as usize] += 1;
        }
    }

    let len = text.chars().count().max(1) as f64;
    let mut embedding = Vec::with_capacity(EMBEDDING_DIMS);
    embedding.extend(counts.iter().map(|&c| f64::from(c) / len));
    embedding.push(text.chars().count() as f64 / 100.0);
    embedding
}

/// Cosine similarity; 0 when dimensions differ or either magnitude is 0.
fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Storage engine decorated with both search indexes.
///
/// Mutations go to the engine first; only acknowledged writes reach the
/// indexes. Index search never touches the engine.
pub struct IndexedStore {
    store: KvStore,
    fulltext: Mutex<FullTextIndex>,
    embedding: Mutex<EmbeddingIndex>,
}

impl IndexedStore {
    /// Wrap a store, loading both indexes from the store's data directory.
    pub fn new(store: KvStore) -> Self {
        let fulltext = Mutex::new(FullTextIndex::open(store.data_dir()));
        let embedding = Mutex::new(EmbeddingIndex::open(store.data_dir()));
        Self {
            store,
            fulltext,
            embedding,
        }
    }

    /// The underlying storage engine.
    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Set a key-value pair and refresh both indexes.
    pub fn set(&self, key: &str, value: &str, simulate_failure: bool) -> KvResult<()> {
        self.store.set(key, value, simulate_failure)?;
        self.lock_fulltext().index_value(key, value)?;
        self.lock_embedding().index_value(key, value)?;
        Ok(())
    }

    /// Read the value for a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Delete a key and drop it from both indexes.
    pub fn delete(&self, key: &str, simulate_failure: bool) -> KvResult<bool> {
        let deleted = self.store.delete(key, simulate_failure)?;
        if deleted {
            self.lock_fulltext().remove_key(key)?;
            self.lock_embedding().remove_key(key)?;
        }
        Ok(deleted)
    }

    /// Bulk-set pairs and index each of them.
    pub fn bulk_set(&self, items: &[(String, String)], simulate_failure: bool) -> KvResult<usize> {
        let count = self.store.bulk_set(items, simulate_failure)?;
        let mut fulltext = self.lock_fulltext();
        let mut embedding = self.lock_embedding();
        for (key, value) in items {
            fulltext.index_value(key, value)?;
            embedding.index_value(key, value)?;
        }
        Ok(count)
    }

    /// AND-search over value words.
    pub fn search_text(&self, query: &str) -> Vec<String> {
        self.lock_fulltext().search(query)
    }

    /// Top-k similarity search over value embeddings.
    pub fn search_similar(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
        self.lock_embedding().search(query, top_k)
    }

    fn lock_fulltext(&self) -> MutexGuard<'_, FullTextIndex> {
        self.fulltext.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_embedding(&self) -> MutexGuard<'_, EmbeddingIndex> {
        self.embedding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(tokenize("Hello, World!"), vec!["hello", "world"]);
        assert_eq!(tokenize("a_b c-d"), vec!["a_b", "c", "d"]);
        assert!(tokenize("...").is_empty());
    }

    #[test]
    fn test_fulltext_and_search() {
        let dir = TempDir::new().unwrap();
        let mut index = FullTextIndex::open(dir.path());

        index.index_value("doc1", "the quick brown fox").unwrap();
        index.index_value("doc2", "the lazy brown dog").unwrap();

        assert_eq!(index.search("brown"), vec!["doc1", "doc2"]);
        assert_eq!(index.search("quick brown"), vec!["doc1"]);
        assert!(index.search("brown cat").is_empty());
        assert!(index.search("").is_empty());
    }

    #[test]
    fn test_fulltext_reindex_replaces_postings() {
        let dir = TempDir::new().unwrap();
        let mut index = FullTextIndex::open(dir.path());

        index.index_value("doc", "alpha beta").unwrap();
        index.index_value("doc", "gamma").unwrap();

        assert!(index.search("alpha").is_empty());
        assert_eq!(index.search("gamma"), vec!["doc"]);
    }

    #[test]
    fn test_fulltext_persists_across_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = FullTextIndex::open(dir.path());
            index.index_value("doc", "persisted words").unwrap();
        }

        let index = FullTextIndex::open(dir.path());
        assert_eq!(index.search("persisted"), vec!["doc"]);
    }

    #[test]
    fn test_embed_shape_and_normalisation() {
        let embedding = embed("aa");
        assert_eq!(embedding.len(), EMBEDDING_DIMS);
        assert!((embedding[0] - 1.0).abs() < 1e-9); // 2 a's / len 2
        assert!((embedding[26] - 0.02).abs() < 1e-9); // len 2 / 100
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]);
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_embedding_search_ranks_similar_first() {
        let dir = TempDir::new().unwrap();
        let mut index = EmbeddingIndex::open(dir.path());

        index.index_value("close", "hello world").unwrap();
        index.index_value("far", "zzzzzz qqqq").unwrap();

        let results = index.search("hello there", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "close");
        assert!(results[0].1 > results[1].1);

        let top1 = index.search("hello there", 1);
        assert_eq!(top1.len(), 1);
    }

    #[test]
    fn test_indexed_store_updates_on_mutation() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), false).unwrap();
        let indexed = IndexedStore::new(store);

        indexed.set("k1", "apples and oranges", false).unwrap();
        indexed
            .bulk_set(
                &[("k2".to_string(), "apples only".to_string())],
                false,
            )
            .unwrap();

        assert_eq!(indexed.search_text("apples"), vec!["k1", "k2"]);
        assert_eq!(indexed.search_text("oranges"), vec!["k1"]);

        indexed.delete("k1", false).unwrap();
        assert_eq!(indexed.search_text("apples"), vec!["k2"]);
        assert_eq!(indexed.get("k1"), None);

        let similar = indexed.search_similar("apples", 5);
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].0, "k2");
    }
}
