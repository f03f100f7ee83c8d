//! Nearest-neighbor matching of a live descriptor against enrolled users.

use crate::types::{Descriptor, MatchOutcome, UserRecord};

/// Strategy for comparing a live descriptor against the enrolled set.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, enrolled: &[UserRecord], threshold: f32) -> MatchOutcome;
}

/// Euclidean nearest-neighbor matcher with an inclusive distance threshold.
///
/// Every enrolled record is visited. On equal minimum distance the record
/// with the lowest index wins. Records whose dimensionality differs from
/// the probe are not comparable and are skipped.
///
/// With duplicate-name records the closest one wins, which need not be the
/// most recent enrollment for that name.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, enrolled: &[UserRecord], threshold: f32) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in enrolled.iter().enumerate() {
            let Some(distance) = probe.distance(&record.descriptor) else {
                tracing::debug!(
                    name = %record.name,
                    probe_dim = probe.dim(),
                    record_dim = record.descriptor.dim(),
                    "skipping record with mismatched dimensionality"
                );
                continue;
            };
            // Strict comparison keeps the first of equal minima; NaN never wins.
            let closer = match best {
                None => !distance.is_nan(),
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance <= threshold => MatchOutcome {
                name: enrolled[idx].name.clone(),
                granted: true,
                distance: Some(distance),
                index: Some(idx),
            },
            Some((idx, distance)) => MatchOutcome::unknown(Some(distance), Some(idx)),
            None => MatchOutcome::unknown(None, None),
        }
    }
}
