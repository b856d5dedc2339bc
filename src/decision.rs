use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::model::LabelMap;

/// Outcome of one verification attempt; a rejection is a normal result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub accepted: bool,
    pub confidence: f32,
    pub predicted_identity_id: Option<String>,
    pub threshold_used: f32,
}

/// Index and probability of the most likely class, lowest index on ties
pub fn best_class(probabilities: &Array1<f32>) -> Option<(usize, f32)> {
    probabilities
        .iter()
        .copied()
        .enumerate()
        .fold(None, |acc, (i, p)| match acc {
            Some((_, best)) if best >= p => acc,
            _ => Some((i, p)),
        })
}

/// Accept iff the top class is the claimed identity and its probability reaches the threshold
pub fn decide(
    probabilities: &Array1<f32>,
    labels: &LabelMap,
    claimed_identity_id: &str,
    threshold: f32,
) -> VerificationResult {
    let Some((index, confidence)) = best_class(probabilities) else {
        return VerificationResult {
            accepted: false,
            confidence: 0.0,
            predicted_identity_id: None,
            threshold_used: threshold,
        };
    };

    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let predicted = labels.identity_of(index).map(str::to_string);
    let accepted = predicted.as_deref() == Some(claimed_identity_id) && confidence >= threshold;

    VerificationResult {
        accepted,
        confidence,
        predicted_identity_id: predicted,
        threshold_used: threshold,
    }
}
