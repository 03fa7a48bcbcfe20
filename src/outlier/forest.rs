//! Isolation-forest-style ensemble scorer.
//!
//! Anomalies are easier to isolate: a point that random axis-aligned splits
//! separate from the rest in few steps is unusual. Each tree partitions a
//! subsample with random (feature, threshold) splits; the anomaly score is
//! `2^(−E[h] / c(ψ))` where E[h] is the mean path length over trees and
//! c(ψ) the expected path length of an unsuccessful BST search over the
//! subsample size. Scores live in (0, 1): ~0.5 for unremarkable points,
//! toward 1 for isolates.
//!
//! Randomness comes from a splitmix64 generator seeded per model, so the
//! same training data always yields the same forest — replaying a tick is
//! bit-for-bit reproducible, which the engine's idempotence contract
//! depends on.

use crate::outlier::{FeatureVector, ScoringModel, FEATURE_DIM};

const EULER_MASCHERONI: f64 = 0.577_215_664_901_532_9;

// ---------------------------------------------------------------------------
// Deterministic RNG
// ---------------------------------------------------------------------------

/// splitmix64: tiny, fast, and deterministic across platforms.
struct SplitMix64(u64);

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        SplitMix64(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform f64 in [0, 1).
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform index in [0, n).
    fn next_index(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

enum Node {
    Split { feature: usize, threshold: f64, left: usize, right: usize },
    Leaf { size: usize },
}

struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn build(rows: &[FeatureVector], max_depth: usize, rng: &mut SplitMix64) -> Tree {
        let mut tree = Tree { nodes: Vec::new() };
        let indices: Vec<usize> = (0..rows.len()).collect();
        tree.grow(rows, indices, 0, max_depth, rng);
        tree
    }

    /// Recursively grow a subtree, returning its root node index.
    fn grow(
        &mut self,
        rows: &[FeatureVector],
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut SplitMix64,
    ) -> usize {
        if indices.len() <= 1 || depth >= max_depth {
            let id = self.nodes.len();
            self.nodes.push(Node::Leaf { size: indices.len() });
            return id;
        }

        // Features where the subsample actually varies; a constant
        // subsample cannot be split further.
        let splittable: Vec<(usize, f64, f64)> = (0..FEATURE_DIM)
            .filter_map(|f| {
                let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
                for &i in &indices {
                    lo = lo.min(rows[i][f]);
                    hi = hi.max(rows[i][f]);
                }
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();

        if splittable.is_empty() {
            let id = self.nodes.len();
            self.nodes.push(Node::Leaf { size: indices.len() });
            return id;
        }

        let (feature, lo, hi) = splittable[rng.next_index(splittable.len())];
        let threshold = lo + rng.next_f64() * (hi - lo);

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| rows[i][feature] < threshold);

        // Reserve this node's slot before growing children.
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: 0 });
        let left = self.grow(rows, left_idx, depth + 1, max_depth, rng);
        let right = self.grow(rows, right_idx, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split { feature, threshold, left, right };
        id
    }

    /// Path length from the root to the row's leaf, with the leaf's
    /// residual depth estimate added.
    fn path_length(&self, row: &FeatureVector) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split { feature, threshold, left, right } => {
                    depth += 1.0;
                    node = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// c(n): expected path length of an unsuccessful BST search over n points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            let harmonic = (n - 1.0).ln() + EULER_MASCHERONI;
            2.0 * harmonic - 2.0 * (n - 1.0) / n
        }
    }
}

// ---------------------------------------------------------------------------
// Forest
// ---------------------------------------------------------------------------

pub struct IsolationForest {
    n_trees: usize,
    max_subsample: usize,
    seed: u64,
    trees: Vec<Tree>,
    /// c(ψ) for the subsample size actually used in the last fit.
    normalizer: f64,
}

impl IsolationForest {
    pub fn new(n_trees: usize, max_subsample: usize, seed: u64) -> IsolationForest {
        IsolationForest { n_trees, max_subsample, seed, trees: Vec::new(), normalizer: 1.0 }
    }

    fn subsample(&self, rows: &[FeatureVector], rng: &mut SplitMix64) -> Vec<FeatureVector> {
        if rows.len() <= self.max_subsample {
            return rows.to_vec();
        }
        (0..self.max_subsample).map(|_| rows[rng.next_index(rows.len())]).collect()
    }
}

impl ScoringModel for IsolationForest {
    fn fit(&mut self, rows: &[FeatureVector]) {
        if rows.is_empty() {
            self.trees.clear();
            return;
        }
        let psi = rows.len().min(self.max_subsample);
        // ceil(log2(psi)): deeper trees add nothing to isolation depth
        let max_depth = (psi as f64).log2().ceil().max(1.0) as usize;
        self.normalizer = average_path_length(psi).max(1.0);

        let mut rng = SplitMix64::new(self.seed);
        self.trees = (0..self.n_trees)
            .map(|_| {
                let sample = self.subsample(rows, &mut rng);
                Tree::build(&sample, max_depth, &mut rng)
            })
            .collect();
    }

    fn score(&self, row: &FeatureVector) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let mean_path: f64 =
            self.trees.iter().map(|t| t.path_length(row)).sum::<f64>() / self.trees.len() as f64;
        2f64.powf(-mean_path / self.normalizer)
    }

    fn method(&self) -> &'static str {
        "isolation_forest"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
