//! SimHash near-duplicate detection
//!
//! 64-bit SimHash over 3-token shingles. Two documents are near
//! duplicates when the Hamming distance between their hashes is at or
//! below the threshold (default 3). Clustering is union-find over the
//! pairwise near-duplicate relation; each cluster keeps its
//! highest-quality member.

use xxhash_rust::xxh3::xxh3_64;

use super::bm25::tokenize;

/// Default Hamming threshold, roughly 95% similarity.
pub const DEFAULT_THRESHOLD: u32 = 3;

const SHINGLE: usize = 3;

/// Compute the 64-bit SimHash of a text.
#[must_use]
pub fn simhash64(text: &str) -> u64 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0;
    }

    let mut counts = [0i32; 64];
    let mut fold = |hash: u64| {
        for (bit, count) in counts.iter_mut().enumerate() {
            if hash & (1u64 << bit) != 0 {
                *count += 1;
            } else {
                *count -= 1;
            }
        }
    };

    if tokens.len() < SHINGLE {
        fold(xxh3_64(tokens.join(" ").as_bytes()));
    } else {
        for window in tokens.windows(SHINGLE) {
            fold(xxh3_64(window.join(" ").as_bytes()));
        }
    }

    let mut hash = 0u64;
    for (bit, count) in counts.iter().enumerate() {
        if *count > 0 {
            hash |= 1u64 << bit;
        }
    }
    hash
}

/// Hamming distance between two hashes.
#[must_use]
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Union-find over item indices.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Cluster near-duplicates and keep the best representative of each
/// cluster.
///
/// `quality[i]` ranks members within a cluster (higher wins; callers
/// default to content length). Returns representative indices in
/// input order.
#[must_use]
pub fn dedup_keep_best(hashes: &[u64], quality: &[f64], threshold: u32) -> Vec<usize> {
    debug_assert_eq!(hashes.len(), quality.len());
    let n = hashes.len();
    let mut uf = UnionFind::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            if hamming(hashes[i], hashes[j]) <= threshold {
                uf.union(i, j);
            }
        }
    }

    // Best member per cluster root; ties go to the earlier item.
    let mut best: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
    for i in 0..n {
        let root = uf.find(i);
        match best.get(&root) {
            Some(&current) if quality[current] >= quality[i] => {}
            _ => {
                best.insert(root, i);
            }
        }
    }

    let mut keep: Vec<usize> = best.into_values().collect();
    keep.sort_unstable();
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "The quick brown fox jumps over the lazy dog while the \
        sun sets slowly behind the distant mountain range in the evening light";

    #[test]
    fn identical_texts_have_zero_distance() {
        assert_eq!(hamming(simhash64(BASE), simhash64(BASE)), 0);
    }

    #[test]
    fn near_duplicates_are_close() {
        let tweaked = BASE.replace("lazy dog", "lazy dogs");
        let d = hamming(simhash64(BASE), simhash64(&tweaked));
        assert!(d <= 10, "near-duplicate distance was {d}");
    }

    #[test]
    fn unrelated_texts_are_far() {
        let other = "Quarterly financial results exceeded analyst expectations \
            driven by strong subscription revenue and improved operating margins";
        let d = hamming(simhash64(BASE), simhash64(other));
        assert!(d > 10, "unrelated distance was only {d}");
    }

    #[test]
    fn empty_text_hashes_to_zero() {
        assert_eq!(simhash64(""), 0);
        assert_eq!(simhash64("!!!"), 0);
    }

    #[test]
    fn dedup_keeps_highest_quality_per_cluster() {
        let a = simhash64(BASE);
        let b = simhash64(BASE); // exact duplicate
        let c = simhash64("entirely different content about tax law and accounting rules");
        let keep = dedup_keep_best(&[a, b, c], &[10.0, 99.0, 5.0], DEFAULT_THRESHOLD);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn dedup_with_no_duplicates_keeps_all() {
        let hashes: Vec<u64> = [
            "alpha beta gamma delta epsilon zeta eta theta",
            "one two three four five six seven eight nine",
            "red orange yellow green blue indigo violet colors",
        ]
        .iter()
        .map(|t| simhash64(t))
        .collect();
        let quality = vec![1.0; hashes.len()];
        let keep = dedup_keep_best(&hashes, &quality, DEFAULT_THRESHOLD);
        assert_eq!(keep, vec![0, 1, 2]);
    }
}
