/// Batch clustering of normalized requests
///
/// Vectorizes the batch with character n-gram TF-IDF, partitions it with seeded
/// k-means and attaches the plurality label to every non-empty cluster.
use tracing::{debug, warn};

use crate::kmeans::KMeans;
use crate::models::AttackLabel;
use crate::pipeline_config::PipelineConfig;
use crate::tfidf::CharNgramTfidf;

/// Smallest batch worth clustering
pub const MIN_BATCH: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub cluster_id: usize,
    /// Indices into the batch, in batch order
    pub members: Vec<usize>,
    pub label_mode: AttackLabel,
}

/// Most frequent label; ties go to the label seen first
pub fn label_mode<I>(labels: I) -> Option<AttackLabel>
where
    I: IntoIterator<Item = AttackLabel>,
{
    let mut tally: Vec<(AttackLabel, usize)> = Vec::new();
    for label in labels {
        match tally.iter_mut().find(|(l, _)| *l == label) {
            Some((_, count)) => *count += 1,
            None => tally.push((label, 1)),
        }
    }

    let mut best: Option<(AttackLabel, usize)> = None;
    for (label, count) in tally {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label)
}

pub struct ClusterEngine {
    vectorizer: CharNgramTfidf,
    n_clusters: usize,
    config: PipelineConfig,
}

impl ClusterEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            vectorizer: CharNgramTfidf::new(config.ngram_min, config.ngram_max, config.min_df),
            n_clusters: config.n_clusters,
            config: config.clone(),
        }
    }

    /// Group `reprs` (parallel to `labels`) into clusters.
    ///
    /// Returns no clusters when the batch is too small, when the effective k
    /// drops below 2, or when no n-gram survives the document-frequency floor.
    pub fn cluster(&self, reprs: &[String], labels: &[AttackLabel]) -> Vec<Cluster> {
        debug_assert_eq!(reprs.len(), labels.len());

        if reprs.len() < MIN_BATCH {
            debug!("Batch of {} is below the clustering minimum", reprs.len());
            return Vec::new();
        }

        let k = self.n_clusters.min(reprs.len());
        if k < 2 {
            debug!("Effective cluster count {} is below 2, skipping", k);
            return Vec::new();
        }

        let matrix = self.vectorizer.fit_transform(reprs);
        if matrix.n_features == 0 {
            warn!(
                "No n-gram shared by {} of {} requests, skipping clustering",
                self.config.min_df,
                reprs.len()
            );
            return Vec::new();
        }

        let result = KMeans::new(k, self.config.kmeans).fit(&matrix.rows, matrix.n_features);
        debug!(
            "Clustered {} requests into k={} (inertia {:.4}, {} iterations)",
            reprs.len(),
            k,
            result.inertia,
            result.iterations
        );

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
        for (i, &cid) in result.labels.iter().enumerate() {
            members[cid].push(i);
        }

        members
            .into_iter()
            .enumerate()
            .filter_map(|(cluster_id, members)| {
                let mode = label_mode(members.iter().map(|&i| labels[i]))?;
                Some(Cluster {
                    cluster_id,
                    members,
                    label_mode: mode,
                })
            })
            .collect()
    }
}
