//! Feature-vector summaries for a clip.
//!
//! Vectors are de-duplicated and greedily clustered: each vector joins the
//! most similar existing cluster when cosine similarity to its centroid is at
//! least the threshold, otherwise it starts a new cluster.
//!
//! Cluster centroids are later matched against the persistent person gallery
//! with [`best_gallery_match`].

use std::collections::HashSet;

use crate::{FeatureSummary, PersonId};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.90;
/// Gallery match threshold; stricter than in-clip clustering.
pub const DEFAULT_PERSON_MATCH_THRESHOLD: f32 = 0.94;
const MAX_CLUSTERS: usize = 64;

/// Cosine similarity; 0.0 when either vector has zero norm or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Person whose closest stored vector is most similar to `feature`, if that
/// similarity reaches `threshold`.
pub fn best_gallery_match(
    feature: &[f32],
    gallery: &[(PersonId, Vec<f32>)],
    threshold: f32,
) -> Option<PersonId> {
    gallery
        .iter()
        .map(|(person, stored)| (*person, cosine_similarity(feature, stored)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .filter(|(_, sim)| *sim >= threshold)
        .map(|(person, _)| person)
}

struct Cluster {
    sum: Vec<f32>,
    centroid: Vec<f32>,
    members: u32,
}

pub struct FeatureClusters {
    threshold: f32,
    dims: Option<usize>,
    clusters: Vec<Cluster>,
    seen: HashSet<Vec<u32>>,
}

impl FeatureClusters {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            dims: None,
            clusters: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false when the vector was ignored (duplicate, wrong length,
    /// non-finite, zero norm, or cluster limit reached).
    pub fn add(&mut self, feature: &[f32]) -> bool {
        if feature.is_empty() || feature.iter().any(|v| !v.is_finite()) {
            return false;
        }
        if feature.iter().all(|v| *v == 0.0) {
            return false;
        }
        match self.dims {
            Some(d) if d != feature.len() => return false,
            _ => self.dims = Some(feature.len()),
        }
        if !self.seen.insert(feature.iter().map(|v| v.to_bits()).collect()) {
            return false;
        }

        let best = self
            .clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_similarity(&c.centroid, feature)))
            .filter(|(_, sim)| *sim >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((idx, _)) => {
                let cluster = &mut self.clusters[idx];
                cluster.members += 1;
                for (s, v) in cluster.sum.iter_mut().zip(feature) {
                    *s += v;
                }
                let n = cluster.members as f32;
                cluster.centroid = cluster.sum.iter().map(|s| s / n).collect();
                true
            }
            None if self.clusters.len() < MAX_CLUSTERS => {
                self.clusters.push(Cluster {
                    sum: feature.to_vec(),
                    centroid: feature.to_vec(),
                    members: 1,
                });
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn summaries(&self) -> Vec<FeatureSummary> {
        self.clusters
            .iter()
            .map(|c| FeatureSummary {
                centroid: c.centroid.clone(),
                members: c.members,
            })
            .collect()
    }
}

impl Default for FeatureClusters {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn similar_vectors_share_a_cluster() {
        let mut clusters = FeatureClusters::default();
        assert!(clusters.add(&[1.0, 0.0, 0.0]));
        assert!(clusters.add(&[0.98, 0.05, 0.0]));
        assert!(clusters.add(&[0.0, 1.0, 0.0]));
        let summaries = clusters.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].members, 2);
        assert_eq!(summaries[1].members, 1);
        assert!((summaries[0].centroid[0] - 0.99).abs() < 1e-6);
    }

    #[test]
    fn gallery_match_picks_most_similar_person_above_threshold() {
        let gallery = vec![
            (1, vec![1.0, 0.0, 0.0]),
            (2, vec![0.0, 1.0, 0.0]),
            (2, vec![0.9, 0.1, 0.0]),
        ];
        assert_eq!(best_gallery_match(&[0.9, 0.1, 0.0], &gallery, 0.94), Some(2));
        assert_eq!(best_gallery_match(&[1.0, 0.0, 0.0], &gallery, 0.94), Some(1));
        assert_eq!(best_gallery_match(&[0.0, 0.0, 1.0], &gallery, 0.94), None);
        assert_eq!(best_gallery_match(&[1.0, 0.0, 0.0], &[], 0.94), None);
    }

    #[test]
    fn duplicates_and_bad_vectors_are_ignored() {
        let mut clusters = FeatureClusters::default();
        assert!(clusters.add(&[0.5, 0.5]));
        assert!(!clusters.add(&[0.5, 0.5]));
        assert!(!clusters.add(&[0.0, 0.0]));
        assert!(!clusters.add(&[f32::NAN, 1.0]));
        assert!(!clusters.add(&[1.0, 0.0, 0.0]));
        assert_eq!(clusters.summaries()[0].members, 1);
    }
}
