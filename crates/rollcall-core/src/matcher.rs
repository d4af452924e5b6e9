//! Nearest-neighbour search over enrolled embeddings and the acceptance policy.

use crate::types::{Embedding, GalleryEntry, PersonId};

/// Closest enrollment to a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    pub person_id: PersonId,
    pub roll_number: String,
    pub name: String,
    pub distance: f32,
}

/// Strategy for locating the closest enrolled embedding.
///
/// Implementations may scan exactly or consult an approximate index; callers
/// only rely on the returned neighbour being the closest one they can find,
/// with ties resolved deterministically.
pub trait Matcher: Send + Sync {
    fn find_nearest(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Option<Nearest>;
}

/// Exact Euclidean linear scan.
///
/// Equidistant candidates resolve to the lowest person id. Entries whose
/// dimensionality differs from the probe, or whose distance is NaN, are
/// skipped.
pub struct LinearMatcher;

impl Matcher for LinearMatcher {
    fn find_nearest(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Option<Nearest> {
        let mut best: Option<(f32, &GalleryEntry)> = None;

        for entry in gallery {
            if entry.embedding.dim() != probe.dim() {
                tracing::warn!(
                    person = entry.person_id,
                    expected = probe.dim(),
                    actual = entry.embedding.dim(),
                    "skipping enrollment with mismatched dimensionality"
                );
                continue;
            }
            let distance = probe.euclidean_distance(&entry.embedding);
            if distance.is_nan() {
                continue;
            }
            let closer = match best {
                None => true,
                Some((d, prev)) => {
                    distance < d || (distance == d && entry.person_id < prev.person_id)
                }
            };
            if closer {
                best = Some((distance, entry));
            }
        }

        best.map(|(distance, entry)| Nearest {
            person_id: entry.person_id,
            roll_number: entry.roll_number.clone(),
            name: entry.name.clone(),
            distance,
        })
    }
}

/// Outcome of applying the threshold to a nearest-neighbour lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Accepted(Nearest),
    /// No neighbour, or the neighbour was not strictly closer than the threshold.
    Rejected { distance: Option<f32> },
}

/// Acceptance threshold: a neighbour is accepted only when
/// `distance < threshold`.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    threshold: f32,
}

impl MatchPolicy {
    /// Returns `None` unless `threshold` is positive and finite.
    pub fn new(threshold: f32) -> Option<Self> {
        (threshold.is_finite() && threshold > 0.0).then_some(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn decide(&self, nearest: Option<Nearest>) -> MatchDecision {
        match nearest {
            Some(n) if n.distance < self.threshold => MatchDecision::Accepted(n),
            Some(n) => MatchDecision::Rejected {
                distance: Some(n.distance),
            },
            None => MatchDecision::Rejected { distance: None },
        }
    }
}
