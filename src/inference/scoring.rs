//! Recyclability score
//!
//! Collapses a per-class prediction into a single 0-10 number: the
//! probability-weighted mean of fixed per-material recyclability weights.

use super::predictor::Prediction;
use crate::dataset::{class_index, NUM_CLASSES};

/// Recyclability weight per class, in class-table order
pub const RECYCLING_WEIGHTS: [f32; NUM_CLASSES] = [
    7.5, // cardboard
    8.6, // glass
    8.6, // metal
    7.3, // paper
    2.4, // plastic
    0.0, // trash
];

/// Upper bound of the score
pub const MAX_SCORE: f32 = 10.0;

/// Weight of a class by name
pub fn weight(class: &str) -> Option<f32> {
    class_index(class).map(|i| RECYCLING_WEIGHTS[i])
}

/// `Σ w·p / Σ p`, or 0 when the probabilities sum to 0. Since every
/// probability is in `[0, 1]` the result stays within `[0, MAX_SCORE]`.
pub fn score(prediction: &Prediction) -> f32 {
    let mut weighted = 0.0f32;
    let mut total = 0.0f32;
    for (label, &p) in prediction.probabilities().iter().enumerate() {
        weighted += RECYCLING_WEIGHTS[label] * p;
        total += p;
    }

    if total == 0.0 {
        return 0.0;
    }
    weighted / total
}
