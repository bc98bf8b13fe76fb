/// Character n-gram TF-IDF vectorizer
///
/// Each document becomes a sparse, L2-normalized vector over the character
/// n-grams (n in `ngram_min..=ngram_max`) that occur in at least `min_df`
/// documents of the batch. Weights use smoothed inverse document frequency:
///
///   idf(t) = ln((1 + n_docs) / (1 + df(t))) + 1
///
/// The vocabulary is sorted before index assignment so the same batch always
/// yields the same matrix.
use rustc_hash::FxHashMap;

/// Sparse row with strictly increasing feature indices
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f64>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn squared_norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum()
    }

    /// Dot product with a dense vector
    pub fn dot_dense(&self, dense: &[f64]) -> f64 {
        self.indices
            .iter()
            .zip(&self.values)
            .map(|(&i, &v)| v * dense[i as usize])
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct TfidfMatrix {
    pub rows: Vec<SparseVector>,
    pub n_features: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CharNgramTfidf {
    ngram_min: usize,
    ngram_max: usize,
    min_df: usize,
}

impl CharNgramTfidf {
    pub fn new(ngram_min: usize, ngram_max: usize, min_df: usize) -> Self {
        let ngram_min = ngram_min.max(1);
        Self {
            ngram_min,
            ngram_max: ngram_max.max(ngram_min),
            min_df: min_df.max(1),
        }
    }

    /// Count the n-grams of one document (whitespace runs folded to one space)
    fn count_ngrams(&self, doc: &str) -> FxHashMap<String, u32> {
        let mut folded = String::with_capacity(doc.len());
        let mut last_space = false;
        for ch in doc.chars() {
            if ch.is_whitespace() {
                if !last_space {
                    folded.push(' ');
                }
                last_space = true;
            } else {
                folded.extend(ch.to_lowercase());
                last_space = false;
            }
        }

        let chars: Vec<char> = folded.chars().collect();
        let mut counts = FxHashMap::default();
        for n in self.ngram_min..=self.ngram_max {
            if chars.len() < n {
                break;
            }
            for window in chars.windows(n) {
                *counts.entry(window.iter().collect::<String>()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn fit_transform(&self, docs: &[String]) -> TfidfMatrix {
        let doc_counts: Vec<FxHashMap<String, u32>> =
            docs.iter().map(|d| self.count_ngrams(d)).collect();

        let mut doc_freq: FxHashMap<&str, usize> = FxHashMap::default();
        for counts in &doc_counts {
            for gram in counts.keys() {
                *doc_freq.entry(gram.as_str()).or_insert(0) += 1;
            }
        }

        let mut vocabulary: Vec<(&str, usize)> = doc_freq
            .into_iter()
            .filter(|&(_, df)| df >= self.min_df)
            .collect();
        vocabulary.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let n_docs = docs.len() as f64;
        let mut index: FxHashMap<&str, (u32, f64)> = FxHashMap::default();
        for (i, &(gram, df)) in vocabulary.iter().enumerate() {
            let idf = ((1.0 + n_docs) / (1.0 + df as f64)).ln() + 1.0;
            index.insert(gram, (i as u32, idf));
        }

        let rows = doc_counts
            .iter()
            .map(|counts| {
                let mut entries: Vec<(u32, f64)> = counts
                    .iter()
                    .filter_map(|(gram, &tf)| {
                        index
                            .get(gram.as_str())
                            .map(|&(i, idf)| (i, f64::from(tf) * idf))
                    })
                    .collect();
                entries.sort_unstable_by_key(|&(i, _)| i);

                let norm = entries.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
                let scale = if norm > 0.0 { 1.0 / norm } else { 0.0 };

                SparseVector {
                    indices: entries.iter().map(|&(i, _)| i).collect(),
                    values: entries.iter().map(|&(_, w)| w * scale).collect(),
                }
            })
            .collect();

        TfidfMatrix {
            rows,
            n_features: vocabulary.len(),
        }
    }
}
