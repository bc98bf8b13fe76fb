use serde::{Deserialize, Serialize};

/// Tunable knobs of the normalize → cluster → signature → regex pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub n_clusters: usize,
    pub base_rule_id: i64,
    pub include_body: bool,
    pub body_max_len: usize,
    pub max_signature_tokens: usize,
    pub min_token_len: usize,
    pub max_token_len: usize,
    pub max_gap: usize,
    pub traversal_lookahead: usize,
    pub max_regex_len: usize,
    pub ngram_min: usize,
    pub ngram_max: usize,
    pub min_df: usize,
    pub kmeans: KMeansConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KMeansConfig {
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            n_init: 4,
            max_iter: 300,
            tolerance: 1e-4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            n_clusters: 10,
            base_rule_id: 200_000,
            include_body: false,
            body_max_len: 160,
            max_signature_tokens: 3,
            min_token_len: 3,
            max_token_len: 48,
            max_gap: 50,
            traversal_lookahead: 200,
            max_regex_len: 700,
            ngram_min: 3,
            ngram_max: 5,
            min_df: 2,
            kmeans: KMeansConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clusters(mut self, n_clusters: usize) -> Self {
        self.n_clusters = n_clusters;
        self
    }

    pub fn with_base_rule_id(mut self, base_rule_id: i64) -> Self {
        self.base_rule_id = base_rule_id;
        self
    }

    pub fn with_body(mut self, include_body: bool) -> Self {
        self.include_body = include_body;
        self
    }

    pub fn with_max_regex_len(mut self, max_regex_len: usize) -> Self {
        self.max_regex_len = max_regex_len;
        self
    }

    pub fn with_max_gap(mut self, max_gap: usize) -> Self {
        self.max_gap = max_gap.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.kmeans.seed = seed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.n_clusters, 10);
        assert_eq!(config.base_rule_id, 200_000);
        assert_eq!(config.body_max_len, 160);
        assert_eq!(config.max_regex_len, 700);
        assert!(!config.include_body);
        assert_eq!(config.kmeans.seed, 42);
    }

    #[test]
    fn test_builder() {
        let config = PipelineConfig::new()
            .with_clusters(4)
            .with_base_rule_id(900_000)
            .with_body(true)
            .with_max_gap(0);

        assert_eq!(config.n_clusters, 4);
        assert_eq!(config.base_rule_id, 900_000);
        assert!(config.include_body);
        assert_eq!(config.max_gap, 1);
    }
}
