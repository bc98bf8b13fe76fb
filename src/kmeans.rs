/// Seeded k-means over sparse TF-IDF rows
///
/// k-means++ seeding followed by Lloyd iterations, restarted `n_init` times from
/// one seeded RNG; the partition with the lowest inertia wins. Ties in the
/// nearest-centroid search go to the lowest centroid index, and a centroid that
/// loses all members keeps its previous position, so a batch of identical
/// points collapses into cluster 0.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::pipeline_config::KMeansConfig;
use crate::tfidf::SparseVector;

/// Distances closer than this count as a tie (rounding in centroid means)
const TIE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Cluster index per input row
    pub labels: Vec<usize>,
    pub inertia: f64,
    pub iterations: usize,
}

pub struct KMeans {
    k: usize,
    config: KMeansConfig,
}

impl KMeans {
    pub fn new(k: usize, config: KMeansConfig) -> Self {
        Self {
            k: k.max(1),
            config,
        }
    }

    pub fn fit(&self, rows: &[SparseVector], n_features: usize) -> KMeansResult {
        if rows.is_empty() {
            return KMeansResult {
                labels: Vec::new(),
                inertia: 0.0,
                iterations: 0,
            };
        }

        let k = self.k.min(rows.len());
        let norms: Vec<f64> = rows.iter().map(SparseVector::squared_norm).collect();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut best: Option<KMeansResult> = None;

        for run in 0..self.config.n_init.max(1) {
            let centroids = init_plus_plus(rows, &norms, n_features, k, &mut rng);
            let result = self.lloyd(rows, &norms, n_features, centroids);
            debug!(
                "k-means run {}: inertia={:.6}, iterations={}",
                run, result.inertia, result.iterations
            );

            let better = best
                .as_ref()
                .map_or(true, |b| result.inertia < b.inertia - f64::EPSILON);
            if better {
                best = Some(result);
            }
        }

        best.unwrap_or(KMeansResult {
            labels: vec![0; rows.len()],
            inertia: 0.0,
            iterations: 0,
        })
    }

    fn lloyd(
        &self,
        rows: &[SparseVector],
        norms: &[f64],
        n_features: usize,
        mut centroids: Vec<Vec<f64>>,
    ) -> KMeansResult {
        let k = centroids.len();
        let mut labels = vec![usize::MAX; rows.len()];
        let mut iterations = 0;

        for _ in 0..self.config.max_iter.max(1) {
            iterations += 1;

            let centroid_norms = squared_norms(&centroids);
            let mut changed = false;
            for (i, row) in rows.iter().enumerate() {
                let label = nearest(row, norms[i], &centroids, &centroid_norms);
                if labels[i] != label {
                    labels[i] = label;
                    changed = true;
                }
            }

            let mut sums = vec![vec![0.0; n_features]; k];
            let mut counts = vec![0usize; k];
            for (row, &label) in rows.iter().zip(&labels) {
                counts[label] += 1;
                for (&idx, &v) in row.indices.iter().zip(&row.values) {
                    sums[label][idx as usize] += v;
                }
            }

            let mut shift = 0.0;
            for c in 0..k {
                if counts[c] == 0 {
                    continue;
                }
                let inv = 1.0 / counts[c] as f64;
                for (old, sum) in centroids[c].iter_mut().zip(&sums[c]) {
                    let new = sum * inv;
                    shift += (new - *old) * (new - *old);
                    *old = new;
                }
            }

            if !changed || shift <= self.config.tolerance {
                break;
            }
        }

        let centroid_norms = squared_norms(&centroids);
        let inertia = rows
            .iter()
            .zip(&labels)
            .enumerate()
            .map(|(i, (row, &label))| {
                squared_distance(row, norms[i], &centroids[label], centroid_norms[label])
            })
            .sum();

        KMeansResult {
            labels,
            inertia,
            iterations,
        }
    }
}

fn squared_distance(row: &SparseVector, row_norm: f64, centroid: &[f64], centroid_norm: f64) -> f64 {
    (row_norm - 2.0 * row.dot_dense(centroid) + centroid_norm).max(0.0)
}

fn squared_norms(centroids: &[Vec<f64>]) -> Vec<f64> {
    centroids
        .iter()
        .map(|c| c.iter().map(|v| v * v).sum())
        .collect()
}

fn nearest(row: &SparseVector, row_norm: f64, centroids: &[Vec<f64>], centroid_norms: &[f64]) -> usize {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(row, row_norm, centroid, centroid_norms[c]);
        if d + TIE_EPSILON < best.1 {
            best = (c, d);
        }
    }
    best.0
}

fn densify(row: &SparseVector, n_features: usize) -> Vec<f64> {
    let mut dense = vec![0.0; n_features];
    for (&i, &v) in row.indices.iter().zip(&row.values) {
        dense[i as usize] = v;
    }
    dense
}

/// k-means++: first centroid uniform, the rest sampled proportional to D²
fn init_plus_plus(
    rows: &[SparseVector],
    norms: &[f64],
    n_features: usize,
    k: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    let first = rng.gen_range(0..rows.len());
    centroids.push(densify(&rows[first], n_features));

    let first_norm = norms[first];
    let mut min_dist: Vec<f64> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| squared_distance(row, norms[i], &centroids[0], first_norm))
        .collect();

    while centroids.len() < k {
        let total: f64 = min_dist.iter().sum();
        let pick = if total <= f64::EPSILON {
            rng.gen_range(0..rows.len())
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = rows.len() - 1;
            for (i, &d) in min_dist.iter().enumerate() {
                if target < d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };

        let centroid = densify(&rows[pick], n_features);
        let centroid_norm = norms[pick];
        for (i, row) in rows.iter().enumerate() {
            let d = squared_distance(row, norms[i], &centroid, centroid_norm);
            if d < min_dist[i] {
                min_dist[i] = d;
            }
        }
        centroids.push(centroid);
    }

    centroids
}
